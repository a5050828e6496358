//! Handler registry and event dispatch.
//!
//! Handlers for one event run in registration order, once per payload
//! tuple. A handler future is polled immediately on the dispatching task:
//! if it completes without suspending it has run atomically with respect
//! to other messages, and only when it suspends (awaits a nested call,
//! sleeps) is it detached onto its own task so dispatch can move on. A
//! failing or panicking handler is logged and never affects its siblings.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::{poll_immediate, FutureExt};
use serde_json::{Map, Value};

use crate::error::ClientError;
use crate::events::{EventKind, Firing, Payload};

/// Future returned by a handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send>>;

/// Callback invoked once per payload of a matching event.
pub type HandlerFn = Arc<dyn Fn(Payload) -> HandlerFuture + Send + Sync>;

struct Registration {
    id: u64,
    predicate: Option<Map<String, Value>>,
    once: bool,
    callback: HandlerFn,
}

impl Registration {
    /// Predicate keys are matched against the raw top-level message data.
    fn matches(&self, data: &Value) -> bool {
        match &self.predicate {
            Some(conditions) => conditions
                .iter()
                .all(|(key, expected)| data.get(key) == Some(expected)),
            None => true,
        }
    }
}

/// All registered handlers, keyed by event.
pub struct Registry {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<EventKind, Vec<Arc<Registration>>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler; returns its id for later removal.
    pub fn add(
        &self,
        kind: EventKind,
        once: bool,
        predicate: Option<Map<String, Value>>,
        callback: HandlerFn,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(Registration {
            id,
            predicate,
            once,
            callback,
        });
        self.handlers
            .lock()
            .expect("handler registry lock poisoned")
            .entry(kind)
            .or_default()
            .push(registration);
        id
    }

    /// Remove a handler by id. Returns whether it was still registered.
    pub fn remove(&self, id: u64) -> bool {
        let mut handlers = self.handlers.lock().expect("handler registry lock poisoned");
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|r| r.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of handlers registered for an event.
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.handlers
            .lock()
            .expect("handler registry lock poisoned")
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Dispatch one event firing to its handlers.
    pub async fn dispatch(&self, firing: &Firing) {
        let snapshot: Vec<Arc<Registration>> = self
            .handlers
            .lock()
            .expect("handler registry lock poisoned")
            .get(&firing.kind)
            .cloned()
            .unwrap_or_default();

        for registration in snapshot {
            if !registration.matches(&firing.data) {
                continue;
            }

            let mut succeeded = true;
            for payload in &firing.payloads {
                succeeded &= run_handler(firing.kind, &registration.callback, payload.clone()).await;
            }

            // One-shot handlers are spent only by a matching message they
            // ran for without error; a failing callback stays registered.
            if registration.once && succeeded {
                self.remove(registration.id);
            }
        }
    }
}

/// Run one handler invocation. The future is polled on the current task
/// first; a suspended handler is detached so dispatch is never blocked by
/// one that awaits. Returns false only on a synchronous error or panic.
async fn run_handler(kind: EventKind, callback: &HandlerFn, payload: Payload) -> bool {
    let mut fut = std::panic::AssertUnwindSafe(callback(payload)).catch_unwind();
    match poll_immediate(&mut fut).await {
        Some(Ok(Ok(()))) => true,
        Some(Ok(Err(err))) => {
            log::error!("Handler for {} failed: {err}", kind.name());
            false
        }
        Some(Err(_)) => {
            log::error!("Handler for {} panicked", kind.name());
            false
        }
        None => {
            tokio::spawn(async move {
                match fut.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        log::error!("Handler for {} failed: {err}", kind.name());
                    }
                    Err(_) => {
                        log::error!("Handler for {} panicked", kind.name());
                    }
                }
            });
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn firing(kind: EventKind, data: Value, payloads: Vec<Payload>) -> Firing {
        Firing {
            kind,
            data,
            payloads,
        }
    }

    fn recording(log: Arc<Mutex<Vec<String>>>, tag: &str) -> HandlerFn {
        let tag = tag.to_string();
        Arc::new(move |_payload| {
            let log = log.clone();
            let tag = tag.clone();
            Box::pin(async move {
                log.lock().unwrap().push(tag);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let registry = Registry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add(EventKind::UserSpoke, false, None, recording(log.clone(), "a"));
        registry.add(EventKind::UserSpoke, false, None, recording(log.clone(), "b"));
        registry.add(EventKind::UserSpoke, false, None, recording(log.clone(), "c"));

        registry
            .dispatch(&firing(EventKind::UserSpoke, json!({}), vec![Payload::None]))
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_later_ones() {
        let registry = Registry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add(
            EventKind::UserSpoke,
            false,
            None,
            Arc::new(|_| {
                Box::pin(async { Err(ClientError::Argument("boom".to_string())) })
            }),
        );
        registry.add(EventKind::UserSpoke, false, None, recording(log.clone(), "after"));

        registry
            .dispatch(&firing(EventKind::UserSpoke, json!({}), vec![Payload::None]))
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn test_once_handler_runs_for_every_payload_of_one_message() {
        let registry = Registry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add(EventKind::UserEntered, true, None, recording(log.clone(), "x"));

        let two_users = firing(
            EventKind::UserEntered,
            json!({}),
            vec![Payload::None, Payload::None],
        );
        registry.dispatch(&two_users).await;
        registry.dispatch(&two_users).await;

        assert_eq!(*log.lock().unwrap(), vec!["x", "x"]);
        assert_eq!(registry.count(EventKind::UserEntered), 0);
    }

    #[tokio::test]
    async fn test_predicate_filters_on_raw_data() {
        let registry = Registry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let predicate: Map<String, Value> =
            json!({"query": "wanted"}).as_object().unwrap().clone();
        registry.add(
            EventKind::SearchCompleted,
            true,
            Some(predicate),
            recording(log.clone(), "hit"),
        );

        registry
            .dispatch(&firing(
                EventKind::SearchCompleted,
                json!({"query": "other"}),
                vec![Payload::None],
            ))
            .await;
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(registry.count(EventKind::SearchCompleted), 1);

        registry
            .dispatch(&firing(
                EventKind::SearchCompleted,
                json!({"query": "wanted"}),
                vec![Payload::None],
            ))
            .await;
        assert_eq!(*log.lock().unwrap(), vec!["hit"]);
        assert_eq!(registry.count(EventKind::SearchCompleted), 0);
    }

    #[tokio::test]
    async fn test_suspended_handler_is_detached() {
        let registry = Registry::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let log = Arc::new(Mutex::new(Vec::new()));
        let slow_log = log.clone();
        let rx = Arc::new(Mutex::new(Some(rx)));
        registry.add(
            EventKind::Heartbeat,
            false,
            None,
            Arc::new(move |_| {
                let log = slow_log.clone();
                let rx = rx.lock().unwrap().take();
                Box::pin(async move {
                    if let Some(rx) = rx {
                        let _ = rx.await;
                    }
                    log.lock().unwrap().push("slow".to_string());
                    Ok(())
                })
            }),
        );
        registry.add(EventKind::Heartbeat, false, None, recording(log.clone(), "fast"));

        registry
            .dispatch(&firing(EventKind::Heartbeat, json!({}), vec![Payload::None]))
            .await;

        // The suspended handler has not run yet; the next one already has.
        assert_eq!(*log.lock().unwrap(), vec!["fast"]);

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if log.lock().unwrap().len() == 2 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn test_remove_by_id() {
        let registry = Registry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = registry.add(EventKind::UserSpoke, false, None, recording(log.clone(), "gone"));
        assert!(registry.remove(id));
        assert!(!registry.remove(id));

        registry
            .dispatch(&firing(EventKind::UserSpoke, json!({}), vec![Payload::None]))
            .await;
        assert!(log.lock().unwrap().is_empty());
    }
}
