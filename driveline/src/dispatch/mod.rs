//! Parallel fan-out of events and cloud notifications to in-process handler
//! plugins, alongside persistence. Handlers register at bootstrap, never
//! after the workers start.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::Value;
use tokio::sync::Notify;

use crate::config::Config;
use crate::event::Event;
use crate::lifecycle::{ShutdownMonitor, SubscriberCode};
use crate::persistence::EventStore;
use crate::upload::UploadHandle;

const DEFAULT_QUEUE_BYTES: usize = 1_000_000;

/// What a handler receives.
#[derive(Debug, Clone)]
pub enum HandlerMessage<'a> {
    Event {
        event_id: &'a str,
        serialized: &'a str,
    },
    Notification {
        domain: &'a str,
        payload: &'a Value,
    },
}

/// An in-process plugin interested in some events and notification domains.
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Called once from the fan-out worker before any message is delivered.
    fn init(&self) {}

    fn subscribed_events(&self) -> Vec<String>;

    fn subscribed_domains(&self) -> Vec<String>;

    /// Event ids the handler needs added to the whitelist beyond the
    /// configured set.
    fn supplementary_events(&self) -> Vec<String> {
        Vec::new()
    }

    fn notify(&self, message: HandlerMessage<'_>) -> Result<()>;
}

#[derive(Default)]
struct DispatchQueue {
    entries: VecDeque<String>,
    bytes: usize,
}

pub struct Dispatcher {
    handlers: Vec<Arc<dyn MessageHandler>>,
    subscriptions: HashMap<String, Vec<usize>>,
    domain_subscriptions: HashMap<String, Vec<usize>>,
    queue: Mutex<DispatchQueue>,
    notify: Notify,
    capacity_bytes: usize,
    direct_alerts: HashSet<String>,
    upload: UploadHandle,
    store: Arc<EventStore>,
}

impl Dispatcher {
    pub fn new(
        handlers: Vec<Arc<dyn MessageHandler>>,
        store: Arc<EventStore>,
        upload: UploadHandle,
        config: &Config,
    ) -> Arc<Dispatcher> {
        let mut subscriptions: HashMap<String, Vec<usize>> = HashMap::new();
        let mut domain_subscriptions: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, handler) in handlers.iter().enumerate() {
            for event_id in handler.subscribed_events() {
                subscriptions.entry(event_id).or_default().push(index);
            }
            for domain in handler.subscribed_domains() {
                domain_subscriptions.entry(domain).or_default().push(index);
            }
        }

        Arc::new(Dispatcher {
            handlers,
            subscriptions,
            domain_subscriptions,
            queue: Mutex::new(DispatchQueue::default()),
            notify: Notify::new(),
            capacity_bytes: config
                .get_i64("dispatch.queueBytes", DEFAULT_QUEUE_BYTES as i64)
                .max(1) as usize,
            direct_alerts: config.get_string_list("mqtt.directAlerts").into_iter().collect(),
            upload,
            store,
        })
    }

    /// Chain entry point: trigger the alert fast path where configured,
    /// enqueue for handler fan-out, and always forward to the store.
    pub fn handle_event(&self, event: &Event, serialized: &str) {
        if self.direct_alerts.contains(&event.event_id) {
            log::warn!("Direct alert for {}", event.event_id);
            self.upload.trigger_alert_upload();
        }

        {
            let mut queue = self.queue.lock().expect("dispatch queue lock poisoned");
            if queue.bytes + serialized.len() > self.capacity_bytes {
                log::error!(
                    "Handler fan-out queue full, dropping notification for {}",
                    event.event_id
                );
            } else {
                queue.bytes += serialized.len();
                queue.entries.push_back(serialized.to_owned());
                self.notify.notify_one();
            }
        }

        self.store.handle_event(event, serialized);
    }

    /// Synchronous notification fan-out; every handler subscribed to the
    /// domain is notified in registration order. A handler failure is logged
    /// and does not abort the fan-out.
    pub fn handle_notification(&self, domain: &str, payload: &Value) {
        let Some(indices) = self.domain_subscriptions.get(domain) else {
            log::debug!("No handler subscribed to notification domain {domain}");
            return;
        };
        for &index in indices {
            let handler = &self.handlers[index];
            if let Err(e) = handler.notify(HandlerMessage::Notification { domain, payload }) {
                log::error!("Handler {} failed on notification: {e}", handler.name());
            }
        }
    }

    pub fn supplementary_events_to_whitelist(&self) -> Vec<String> {
        let mut merged: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for handler in &self.handlers {
            for event_id in handler.supplementary_events() {
                if seen.insert(event_id.clone()) {
                    merged.push(event_id);
                }
            }
        }
        merged
    }

    pub async fn run(self: Arc<Self>, monitor: Arc<ShutdownMonitor>) {
        let signal = match monitor.register(SubscriberCode::Dispatch, None) {
            Ok(signal) => signal,
            Err(e) => {
                log::error!("Dispatcher registration failed: {e}");
                return;
            }
        };

        for handler in &self.handlers {
            handler.init();
        }

        loop {
            tokio::select! {
                _ = signal.notified() => break,
                _ = self.wait_nonempty() => {
                    while let Some(serialized) = self.take() {
                        self.fan_out(&serialized);
                    }
                }
            }
        }

        // drain what is left so no accepted event skips its handlers
        while let Some(serialized) = self.take() {
            self.fan_out(&serialized);
        }

        let _ = monitor.ready_for_shutdown(SubscriberCode::Dispatch, None);
        let _ = monitor.unregister(SubscriberCode::Dispatch, None);
    }

    async fn wait_nonempty(&self) {
        loop {
            let notified = self.notify.notified();
            if !self
                .queue
                .lock()
                .expect("dispatch queue lock poisoned")
                .entries
                .is_empty()
            {
                return;
            }
            notified.await;
        }
    }

    fn take(&self) -> Option<String> {
        let mut queue = self.queue.lock().expect("dispatch queue lock poisoned");
        let entry = queue.entries.pop_front()?;
        queue.bytes -= entry.len();
        Some(entry)
    }

    fn fan_out(&self, serialized: &str) {
        let event = match Event::from_json(serialized) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Skipping malformed event in handler fan-out: {e}");
                return;
            }
        };

        let Some(indices) = self.subscriptions.get(&event.event_id) else {
            return;
        };
        for &index in indices {
            let handler = &self.handlers[index];
            let message = HandlerMessage::Event {
                event_id: &event.event_id,
                serialized,
            };
            if let Err(e) = handler.notify(message) {
                log::error!("Handler {} failed on {}: {e}", handler.name(), event.event_id);
            }
        }
    }
}
