//! Publish/subscribe registries for inbound messages and connection status.
//!
//! Subscribing returns a [`Subscription`]; dropping it (or calling
//! [`Subscription::unsubscribe`]) removes the handler, so callers never need
//! to keep the original closure around to unregister it.

use crate::error::ConnectionError;
use crate::protocol::{Envelope, MessageType};
use crate::transport::ConnectionStatus;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

type Handler<T> = Arc<dyn Fn(&T) -> HandlerResult + Send + Sync>;

struct Entry<K, T> {
    id: u64,
    /// `None` matches every key.
    key: Option<K>,
    handler: Handler<T>,
}

struct Inner<K, T> {
    next_id: u64,
    entries: Vec<Entry<K, T>>,
}

pub struct Registry<K, T> {
    inner: Arc<Mutex<Inner<K, T>>>,
}

/// Inbound envelopes keyed by message type.
pub type MessageBus = Registry<MessageType, Envelope>;

/// Connection status transitions.
pub type StatusListeners = Registry<(), ConnectionStatus>;

/// Connection attempts that ended without a link and without a retry pending.
pub type FailureListeners = Registry<(), ConnectionError>;

impl<K, T> Clone for Registry<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, T> Default for Registry<K, T>
where
    K: PartialEq + Send + 'static,
    T: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Registry<K, T>
where
    K: PartialEq + Send + 'static,
    T: 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register `handler` for `key` (or for every key when `None`).
    pub fn subscribe<F>(&self, key: Option<K>, handler: F) -> Subscription
    where
        F: Fn(&T) -> HandlerResult + Send + Sync + 'static,
    {
        let id = match self.inner.lock() {
            Ok(mut inner) => {
                inner.next_id += 1;
                let id = inner.next_id;
                inner.entries.push(Entry {
                    id,
                    key,
                    handler: Arc::new(handler),
                });
                id
            }
            Err(_) => return Subscription::empty(),
        };
        let weak: Weak<Mutex<Inner<K, T>>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    if let Ok(mut inner) = inner.lock() {
                        inner.entries.retain(|e| e.id != id);
                    }
                }
            })),
        }
    }

    /// Invoke every handler registered for `key`, in registration order.
    ///
    /// Handlers are snapshotted first, so a handler may subscribe or
    /// unsubscribe while dispatch is running. A handler that errors or panics
    /// is logged and the rest still run. Returns how many handlers ran.
    pub fn dispatch(&self, key: &K, value: &T) -> usize
    where
        K: std::fmt::Debug,
    {
        let snapshot: Vec<Handler<T>> = match self.inner.lock() {
            Ok(inner) => inner
                .entries
                .iter()
                .filter(|e| e.key.as_ref().map(|k| k == key).unwrap_or(true))
                .map(|e| e.handler.clone())
                .collect(),
            Err(_) => return 0,
        };
        for handler in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| (**handler)(value))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("[bus] handler for {:?} failed: {}", key, e),
                Err(_) => log::error!("[bus] handler for {:?} panicked", key),
            }
        }
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unsubscribe capability returned by [`Registry::subscribe`].
#[must_use = "dropping a Subscription removes the handler"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn empty() -> Self {
        Self { remove: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    /// Keep the handler registered for the registry's whole lifetime.
    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn bus() -> Registry<&'static str, u32> {
        Registry::new()
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = bus();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (a, b, c) = (seen.clone(), seen.clone(), seen.clone());
        let _s1 = bus.subscribe(Some("x"), move |v| {
            a.lock().unwrap().push(("first", *v));
            Ok(())
        });
        let _s2 = bus.subscribe(None, move |v| {
            b.lock().unwrap().push(("any", *v));
            Ok(())
        });
        let _s3 = bus.subscribe(Some("y"), move |v| {
            c.lock().unwrap().push(("other", *v));
            Ok(())
        });
        assert_eq!(bus.dispatch(&"x", &7), 2);
        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("any", 7)]);
    }

    #[test]
    fn failing_handlers_do_not_stop_siblings() {
        let bus = bus();
        let hits = Arc::new(StdMutex::new(0));
        let h = hits.clone();
        let _err = bus.subscribe(Some("x"), |_| Err("boom".into()));
        let _panic = bus.subscribe(Some("x"), |_| panic!("handler bug"));
        let _ok = bus.subscribe(Some("x"), move |_| {
            *h.lock().unwrap() += 1;
            Ok(())
        });
        bus.dispatch(&"x", &1);
        bus.dispatch(&"x", &2);
        assert_eq!(*hits.lock().unwrap(), 2);
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let bus = bus();
        let sub = bus.subscribe(Some("x"), |_| Ok(()));
        assert_eq!(bus.len(), 1);
        drop(sub);
        assert!(bus.is_empty());
        assert_eq!(bus.dispatch(&"x", &1), 0);

        bus.subscribe(Some("x"), |_| Ok(())).detach();
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn unsubscribing_during_dispatch_keeps_other_handlers_intact() {
        let bus = bus();
        let hits = Arc::new(StdMutex::new(Vec::new()));
        let slot: Arc<StdMutex<Option<Subscription>>> = Arc::new(StdMutex::new(None));

        let slot_in = slot.clone();
        let h1 = hits.clone();
        let _first = bus.subscribe(Some("x"), move |_| {
            h1.lock().unwrap().push(1);
            if let Some(sub) = slot_in.lock().unwrap().take() {
                sub.unsubscribe();
            }
            Ok(())
        });
        let h2 = hits.clone();
        let second = bus.subscribe(Some("x"), move |_| {
            h2.lock().unwrap().push(2);
            Ok(())
        });
        *slot.lock().unwrap() = Some(second);
        let h3 = hits.clone();
        let _third = bus.subscribe(Some("x"), move |_| {
            h3.lock().unwrap().push(3);
            Ok(())
        });

        // The snapshot still includes the handler removed mid-dispatch.
        bus.dispatch(&"x", &0);
        assert_eq!(*hits.lock().unwrap(), vec![1, 2, 3]);

        hits.lock().unwrap().clear();
        bus.dispatch(&"x", &0);
        assert_eq!(*hits.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn subscription_outliving_registry_is_harmless() {
        let sub = {
            let bus = bus();
            bus.subscribe(Some("x"), |_| Ok(()))
        };
        sub.unsubscribe();
    }
}
