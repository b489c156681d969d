//! Routes received subscription payloads to registered request handlers by
//! type. Unknown or malformed notifications produce a `NotificationFailure`
//! event so the backend can see what was dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::event::Event;
use crate::ingest::EventEmitter;
use crate::lifecycle::{ShutdownMonitor, SubscriberCode};

/// Handles one notification request type (e.g. `MQTT_CONFIG_REQUEST`).
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &Value);
}

pub struct NotificationListener {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    handlers: Mutex<HashMap<String, Arc<dyn RequestHandler>>>,
    emitter: EventEmitter,
}

impl NotificationListener {
    pub fn new(emitter: EventEmitter) -> Arc<NotificationListener> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(NotificationListener {
            tx,
            rx: Mutex::new(Some(rx)),
            handlers: Mutex::new(HashMap::new()),
            emitter,
        })
    }

    pub fn push_notification(&self, json: String) {
        if self.tx.send(json).is_err() {
            log::warn!("Notification router is gone, dropping notification");
        }
    }

    /// At most one handler per request type; a duplicate registration is
    /// rejected and the first handler stays.
    pub fn register_request(&self, request_type: &str, handler: Arc<dyn RequestHandler>) -> bool {
        let mut handlers = self.handlers.lock().expect("notification handlers lock poisoned");
        if handlers.contains_key(request_type) {
            log::warn!("Handler already registered for {request_type}");
            return false;
        }
        handlers.insert(request_type.to_owned(), handler);
        true
    }

    pub async fn run(self: Arc<Self>, monitor: Arc<ShutdownMonitor>) {
        let signal = match monitor.register(SubscriberCode::Notify, None) {
            Ok(signal) => signal,
            Err(e) => {
                log::error!("Notification router registration failed: {e}");
                return;
            }
        };

        let mut rx = self
            .rx
            .lock()
            .expect("notification receiver lock poisoned")
            .take()
            .expect("notification router may only run once");

        loop {
            tokio::select! {
                _ = signal.notified() => break,
                received = rx.recv() => {
                    match received {
                        Some(json) => self.route(&json),
                        None => break,
                    }
                }
            }
        }

        // remaining notifications are discarded on shutdown
        let _ = monitor.ready_for_shutdown(SubscriberCode::Notify, None);
        let _ = monitor.unregister(SubscriberCode::Notify, None);
    }

    fn route(&self, json: &str) {
        let request: Value = match serde_json::from_str(json) {
            Ok(request) => request,
            Err(_) => {
                log::error!("Received invalid JSON notification");
                self.emit_failure("Received invalid JSON notification");
                return;
            }
        };

        let request_type = request
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let handler = {
            let handlers = self.handlers.lock().expect("notification handlers lock poisoned");
            handlers.get(&request_type).cloned()
        };

        match handler {
            Some(handler) => handler.handle(&request),
            None => {
                log::error!("No handler for notification type {request_type:?}");
                self.emit_failure(&format!("Request type not found: {request_type}"));
            }
        }
    }

    fn emit_failure(&self, reason: &str) {
        let mut event = Event::new("0.1", "NotificationFailure");
        event.add_field("Error", reason);
        self.emitter.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ingest::StagingQueue;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
    }

    impl RequestHandler for CountingHandler {
        fn handle(&self, _request: &Value) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn listener() -> (Arc<NotificationListener>, Arc<StagingQueue>) {
        let queue = StagingQueue::from_config(&Config::from_value(json!({})));
        let listener = NotificationListener::new(EventEmitter::new(queue.clone()));
        (listener, queue)
    }

    #[test]
    fn duplicate_registration_keeps_first_handler() {
        let (listener, _) = listener();
        let first = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let second = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });

        assert!(listener.register_request("MQTT_CONFIG_REQUEST", first.clone()));
        assert!(!listener.register_request("MQTT_CONFIG_REQUEST", second.clone()));

        listener.route(r#"{"type":"MQTT_CONFIG_REQUEST","message":"{}"}"#);
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_type_emits_notification_failure() {
        let (listener, queue) = listener();
        listener.route(r#"{"type":"NOBODY_HOME","message":"{}"}"#);
        assert_eq!(queue.accepted_count(), 1);
    }

    #[test]
    fn invalid_json_emits_notification_failure() {
        let (listener, queue) = listener();
        listener.route("this is not json");
        assert_eq!(queue.accepted_count(), 1);
    }
}
