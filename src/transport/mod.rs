//! Persistent connection to the conversation server.
//!
//! A [`Transport`] owns at most one live link at a time. Each link runs in its
//! own task that multiplexes inbound frames, the outbound queue, the heartbeat
//! interval and a shutdown signal. When a link drops without `disconnect()`
//! having been called, the same task retries with exponential backoff.

pub mod bus;
pub mod websocket;

pub use bus::{FailureListeners, HandlerResult, MessageBus, StatusListeners, Subscription};
pub use websocket::{Connector, Frame, Link, WsConnector, CLOSE_NORMAL};

use crate::error::ConnectionError;
use crate::protocol::{self, ClientMessage, Envelope, MessageType};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base endpoint, e.g. `ws://localhost:8000/ws`.
    pub base_url: String,
    /// Generated once per session and appended to `base_url`.
    pub client_id: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub reconnect_base: Duration,
    pub reconnect_max_attempts: u32,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client_id: uuid::Uuid::new_v4().to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.client_id)
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`.
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(10);
    base.saturating_mul(1u32 << exp)
}

enum LinkEnd {
    Shutdown,
    Lost(String),
}

struct Inner {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    bus: MessageBus,
    listeners: StatusListeners,
    failures: FailureListeners,
    status: Mutex<ConnectionStatus>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    intentional: AtomicBool,
    /// Bumped by every `connect()`; a supervisor whose generation is stale
    /// must not touch shared state.
    generation: AtomicU64,
}

/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(config: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                bus: MessageBus::new(),
                listeners: StatusListeners::new(),
                failures: FailureListeners::new(),
                status: Mutex::new(ConnectionStatus::Disconnected),
                outbound: Mutex::new(None),
                shutdown: Mutex::new(None),
                intentional: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn websocket(config: TransportConfig) -> Self {
        Self::new(config, Arc::new(WsConnector::new()))
    }

    pub fn endpoint(&self) -> String {
        self.inner.config.endpoint()
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner
            .status
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Open the connection. Resolves once the link is up; the heartbeat and
    /// reconnect supervision then continue in the background until
    /// [`Transport::disconnect`].
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.intentional.store(false, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let previous = match self.inner.shutdown.lock() {
            Ok(mut slot) => slot.replace(shutdown_tx),
            Err(_) => None,
        };
        if let Some(previous) = previous {
            // Cancel a supervisor still backing off from an earlier run.
            let _ = previous.send(true);
        }

        let (link, outbound_rx) = match self.inner.open(generation).await {
            Ok(opened) => opened,
            Err(e) => {
                self.inner.failed_for(generation, &e);
                return Err(e);
            }
        };

        if self.inner.intentional.load(Ordering::SeqCst) || !self.inner.is_current(generation) {
            let mut sink = link.sink;
            let _ = sink.send(close_frame()).await;
            return Err(ConnectionError::Lost(
                "disconnected while connecting".into(),
            ));
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner
                .supervise(generation, link, outbound_rx, shutdown_rx)
                .await;
        });
        Ok(())
    }

    /// Queue an envelope for sending. Outside `Connected` this only logs.
    pub fn send(&self, envelope: &Envelope) {
        if self.status() != ConnectionStatus::Connected {
            log::warn!(
                "[transport] not connected; dropping outbound {}",
                envelope.kind
            );
            return;
        }
        let text = match protocol::encode_text(envelope) {
            Ok(text) => text,
            Err(e) => {
                log::error!("[transport] {}", e);
                return;
            }
        };
        let queued = match self.inner.outbound.lock() {
            Ok(slot) => slot
                .as_ref()
                .map(|tx| tx.send(Frame::Text(text)).is_ok())
                .unwrap_or(false),
            Err(_) => false,
        };
        if !queued {
            log::warn!("[transport] link closing; dropped {}", envelope.kind);
        }
    }

    pub fn send_message(&self, message: ClientMessage) {
        self.send(&protocol::encode(&message));
    }

    pub fn on_message<F>(&self, kind: MessageType, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(Some(kind), handler)
    }

    pub fn on_any_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(None, handler)
    }

    pub fn on_connection_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionStatus) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(None, handler)
    }

    /// Called when a connection attempt fails and no reconnect will follow:
    /// `connect()` itself failed, or the reconnect cycle gave up.
    pub fn on_connection_failed<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionError) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.failures.subscribe(None, handler)
    }

    /// Close the connection for good: no reconnects, heartbeat stops, the
    /// server sees a normal closure. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let was_intentional = self.inner.intentional.swap(true, Ordering::SeqCst);
        let shutdown = match self.inner.shutdown.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if was_intentional && shutdown.is_none() {
            return;
        }
        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }
        // Invalidate the running supervisor so its teardown leaves state alone.
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.set_status(ConnectionStatus::Disconnected);
        log::info!("[transport] disconnected");
    }
}

fn close_frame() -> Frame {
    Frame::Close {
        code: CLOSE_NORMAL,
        reason: "client disconnect".into(),
    }
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = match self.status.lock() {
            Ok(mut current) => {
                if *current == status {
                    false
                } else {
                    *current = status;
                    true
                }
            }
            Err(_) => false,
        };
        if changed {
            log::debug!("[transport] status -> {}", status.as_str());
            self.listeners.dispatch(&(), &status);
        }
    }

    fn set_status_for(&self, generation: u64, status: ConnectionStatus) {
        if self.is_current(generation) {
            self.set_status(status);
        }
    }

    fn failed_for(&self, generation: u64, err: &ConnectionError) {
        if self.is_current(generation) && !self.intentional.load(Ordering::SeqCst) {
            self.failures.dispatch(&(), err);
        }
    }

    async fn open(
        &self,
        generation: u64,
    ) -> Result<(Link, mpsc::UnboundedReceiver<Frame>), ConnectionError> {
        let url = self.config.endpoint();
        self.set_status_for(generation, ConnectionStatus::Connecting);
        log::info!("[transport] connecting: url={}", url);

        let timeout = self.config.connect_timeout;
        let result = match tokio::time::timeout(timeout, self.connector.connect(&url)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(timeout.as_millis() as u64)),
        };

        match result {
            Ok(link) => {
                let (tx, rx) = mpsc::unbounded_channel();
                if self.is_current(generation) {
                    if let Ok(mut slot) = self.outbound.lock() {
                        *slot = Some(tx);
                    }
                }
                self.set_status_for(generation, ConnectionStatus::Connected);
                log::info!("[transport] connected");
                Ok((link, rx))
            }
            Err(e) => {
                log::warn!("[transport] connect failed: {}", e);
                self.set_status_for(generation, ConnectionStatus::Disconnected);
                Err(e)
            }
        }
    }

    async fn supervise(
        &self,
        generation: u64,
        link: Link,
        outbound_rx: mpsc::UnboundedReceiver<Frame>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut current = Some((link, outbound_rx));
        let mut attempts: u32 = 0;
        loop {
            if let Some((link, outbound_rx)) = current.take() {
                attempts = 0;
                match self.run_link(link, outbound_rx, &mut shutdown_rx).await {
                    LinkEnd::Shutdown => return,
                    LinkEnd::Lost(reason) => {
                        log::warn!("[transport] link lost: {}", reason);
                        if self.is_current(generation) {
                            if let Ok(mut slot) = self.outbound.lock() {
                                *slot = None;
                            }
                        }
                        self.set_status_for(generation, ConnectionStatus::Disconnected);
                    }
                }
            }

            if self.intentional.load(Ordering::SeqCst) || !self.is_current(generation) {
                return;
            }
            attempts += 1;
            if attempts > self.config.reconnect_max_attempts {
                log::error!(
                    "[transport] giving up after {} reconnect attempts",
                    self.config.reconnect_max_attempts
                );
                self.set_status_for(generation, ConnectionStatus::Disconnected);
                let err = ConnectionError::Lost(format!(
                    "gave up after {} reconnect attempts",
                    self.config.reconnect_max_attempts
                ));
                self.failed_for(generation, &err);
                return;
            }
            let delay = reconnect_delay(self.config.reconnect_base, attempts);
            log::info!(
                "[transport] reconnecting in {}ms (attempt {}/{})",
                delay.as_millis(),
                attempts,
                self.config.reconnect_max_attempts
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => return,
            }
            if self.intentional.load(Ordering::SeqCst) || !self.is_current(generation) {
                return;
            }

            let opened = tokio::select! {
                opened = self.open(generation) => opened,
                _ = shutdown_rx.changed() => return,
            };
            match opened {
                Ok(pair) => current = Some(pair),
                Err(e) if e.is_permanent() => {
                    log::error!("[transport] not retrying: {}", e);
                    self.failed_for(generation, &e);
                    return;
                }
                Err(_) => {}
            }
        }
    }

    async fn run_link(
        &self,
        link: Link,
        mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> LinkEnd {
        let Link {
            mut sink,
            mut stream,
        } = link;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate first tick.
        heartbeat.tick().await;
        let mut missed: u32 = 0;

        loop {
            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(Frame::Text(text))) => match protocol::decode(&text) {
                        Ok(envelope) => {
                            if envelope.kind == MessageType::HeartbeatAck {
                                missed = 0;
                            }
                            self.bus.dispatch(&envelope.kind, &envelope);
                        }
                        Err(e) => log::warn!("[transport] dropping inbound frame: {}", e),
                    },
                    Some(Ok(Frame::Binary(bytes))) => {
                        log::debug!("[transport] ignoring {} byte binary frame", bytes.len());
                    }
                    Some(Ok(Frame::Close { code, reason })) => {
                        return LinkEnd::Lost(format!("server closed ({}) {}", code, reason));
                    }
                    Some(Ok(Frame::Control)) => {}
                    Some(Err(e)) => return LinkEnd::Lost(e.to_string()),
                    None => return LinkEnd::Lost("stream ended".into()),
                },
                outbound = outbound_rx.recv() => match outbound {
                    Some(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            return LinkEnd::Lost(e.to_string());
                        }
                    }
                    None => return LinkEnd::Lost("outbound queue closed".into()),
                },
                _ = heartbeat.tick() => {
                    if missed >= self.config.max_missed_heartbeats {
                        return LinkEnd::Lost(format!("no heartbeat_ack for {} intervals", missed));
                    }
                    let envelope = protocol::encode(&ClientMessage::Heartbeat {
                        timestamp: protocol::now_ms(),
                    });
                    match protocol::encode_text(&envelope) {
                        Ok(text) => {
                            if let Err(e) = sink.send(Frame::Text(text)).await {
                                return LinkEnd::Lost(e.to_string());
                            }
                        }
                        Err(e) => log::error!("[transport] {}", e),
                    }
                    missed += 1;
                    log::debug!("[transport] heartbeat (unacked: {})", missed);
                },
                _ = shutdown_rx.changed() => {
                    log::info!("[transport] closing websocket");
                    let _ = sink.send(close_frame()).await;
                    let _ = sink.close().await;
                    return LinkEnd::Shutdown;
                }
            }
        }
    }
}
