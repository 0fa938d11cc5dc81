use crate::error::ConnectionError;
use futures_util::future::{self, BoxFuture};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite};

/// Normal closure, sent on an intentional disconnect.
pub const CLOSE_NORMAL: u16 = 1000;

/// Transport-neutral frame. The protocol only ever sends text; binary frames
/// are surfaced so they can be logged and ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
    /// Ping/pong; answered by the socket layer.
    Control,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ConnectionError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, ConnectionError>> + Send>>;

/// One open bidirectional connection.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens links to an endpoint. Production uses [`WsConnector`]; tests plug in
/// an in-memory implementation.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Link, ConnectionError>>;
}

/// tokio-tungstenite backed connector.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    /// Extra handshake headers (auth tokens and the like).
    pub headers: Vec<(String, String)>,
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

fn build_ws_request(
    url: &str,
    headers: &[(String, String)],
) -> Result<tungstenite::handshake::client::Request, ConnectionError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ConnectionError::InvalidEndpoint(format!("{}: {}", url, e)))?;

    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ConnectionError::InvalidEndpoint(format!("bad header name: {}", e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ConnectionError::InvalidEndpoint(format!("bad header value: {}", e)))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Link, ConnectionError>> {
        let request = build_ws_request(url, &self.headers);
        Box::pin(async move {
            let request = request?;
            let (ws_stream, _) = connect_async(request).await.map_err(|e| {
                if is_permanent_connect_error(&e) {
                    ConnectionError::Unauthorized(e.to_string())
                } else {
                    ConnectionError::Refused(e.to_string())
                }
            })?;
            let (ws_tx, ws_rx) = ws_stream.split();

            let sink = ws_tx
                .sink_map_err(|e| ConnectionError::Lost(e.to_string()))
                .with(|frame: Frame| future::ready(Ok::<_, ConnectionError>(to_ws(frame))));
            let stream = ws_rx.map(|msg| {
                msg.map(from_ws)
                    .map_err(|e| ConnectionError::Lost(e.to_string()))
            });

            Ok(Link {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}

fn is_permanent_connect_error(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Http(resp) => {
            let code = resp.status().as_u16();
            code == 401 || code == 403
        }
        _ => false,
    }
}

fn to_ws(frame: Frame) -> tungstenite::Message {
    match frame {
        Frame::Text(text) => tungstenite::Message::Text(text.into()),
        Frame::Binary(bytes) => tungstenite::Message::Binary(bytes.into()),
        Frame::Close { code, reason } => tungstenite::Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
        Frame::Control => tungstenite::Message::Pong(Vec::<u8>::new().into()),
    }
}

fn from_ws(msg: tungstenite::Message) -> Frame {
    match msg {
        tungstenite::Message::Text(text) => Frame::Text(text.to_string()),
        tungstenite::Message::Binary(bytes) => Frame::Binary(bytes.to_vec()),
        tungstenite::Message::Close(Some(frame)) => Frame::Close {
            code: u16::from(frame.code),
            reason: frame.reason.to_string(),
        },
        // 1005: no status code present.
        tungstenite::Message::Close(None) => Frame::Close {
            code: 1005,
            reason: String::new(),
        },
        _ => Frame::Control,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_extra_headers() {
        let request = build_ws_request(
            "ws://localhost:8000/ws/abc",
            &[("Authorization".into(), "Bearer t".into())],
        )
        .unwrap();
        assert_eq!(request.uri().path(), "/ws/abc");
        assert_eq!(request.headers()["Authorization"], "Bearer t");
    }

    #[test]
    fn bad_endpoint_is_rejected_before_dialing() {
        let err = build_ws_request("not a url", &[]).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidEndpoint(_)));
    }

    #[test]
    fn close_frames_keep_their_code() {
        let ws = to_ws(Frame::Close {
            code: CLOSE_NORMAL,
            reason: "bye".into(),
        });
        match from_ws(ws) {
            Frame::Close { code, reason } => {
                assert_eq!(code, 1000);
                assert_eq!(reason, "bye");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
