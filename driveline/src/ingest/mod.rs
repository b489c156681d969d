//! Inbound event staging: the byte-bounded FIFO fed by producers, the worker
//! draining it through classification into the filter chain or the direct
//! store path, and the whitelist state recomputed on config reloads.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::event::Event;
use crate::lifecycle::{ShutdownMonitor, SubscriberCode};
use crate::persistence::{EventStore, StoreAccept};
use crate::upload::UploadHandle;

pub mod chain;
pub mod receiver;
pub mod sampling;

use chain::FilterChain;
use sampling::{LogSampler, ResetPolicy};

const DEFAULT_QUEUE_BYTES: usize = 2_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    DroppedShutdown,
    DroppedOverflow,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<String>,
    bytes: usize,
    shutdown: bool,
    in_count: u64,
    out_count: u64,
    overflow_count: u64,
}

/// Bounded FIFO of serialized events between producers and the single drain
/// worker. Producers run in parallel; insertion order is preserved per
/// producer.
pub struct StagingQueue {
    state: Mutex<QueueState>,
    capacity_bytes: usize,
    notify: Notify,
}

impl StagingQueue {
    pub fn from_config(config: &Config) -> Arc<StagingQueue> {
        let capacity = config.get_i64("ingest.queueBytes", DEFAULT_QUEUE_BYTES as i64);
        Arc::new(StagingQueue {
            state: Mutex::new(QueueState::default()),
            capacity_bytes: capacity.max(1) as usize,
            notify: Notify::new(),
        })
    }

    pub fn send(&self, serialized: String) -> SendOutcome {
        let mut state = self.state.lock().expect("staging queue lock poisoned");
        if state.shutdown {
            log::warn!("Ignoring event during shutdown: {serialized}");
            return SendOutcome::DroppedShutdown;
        }

        if state.bytes + serialized.len() > self.capacity_bytes {
            state.overflow_count += 1;
            let overflow = state.overflow_count;
            let (in_count, out_count) = (state.in_count, state.out_count);
            drop(state);

            log::error!("Staging queue overflow, discarding event");
            if overflow == 1 || overflow % 10 == 0 {
                log::warn!(
                    "Staging queue overflow summary: dropped={overflow} in={in_count} out={out_count}"
                );
            }
            return SendOutcome::DroppedOverflow;
        }

        state.bytes += serialized.len();
        state.entries.push_back(serialized);
        state.in_count += 1;
        drop(state);

        self.notify.notify_one();
        SendOutcome::Accepted
    }

    fn take(&self) -> Option<String> {
        let mut state = self.state.lock().expect("staging queue lock poisoned");
        let entry = state.entries.pop_front()?;
        state.bytes -= entry.len();
        state.out_count += 1;
        Some(entry)
    }

    async fn wait_nonempty(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn is_empty(&self) -> bool {
        self.state
            .lock()
            .expect("staging queue lock poisoned")
            .entries
            .is_empty()
    }

    pub fn begin_shutdown(&self) {
        let mut state = self.state.lock().expect("staging queue lock poisoned");
        state.shutdown = true;
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn overflow_count(&self) -> u64 {
        self.state
            .lock()
            .expect("staging queue lock poisoned")
            .overflow_count
    }

    pub fn accepted_count(&self) -> u64 {
        self.state
            .lock()
            .expect("staging queue lock poisoned")
            .in_count
    }
}

/// Clonable handle components use to feed synthetic events into the pipeline.
#[derive(Clone)]
pub struct EventEmitter {
    queue: Arc<StagingQueue>,
}

impl EventEmitter {
    pub fn new(queue: Arc<StagingQueue>) -> EventEmitter {
        EventEmitter { queue }
    }

    pub fn emit(&self, event: Event) {
        self.emit_serialized(event.to_json());
    }

    pub fn emit_serialized(&self, serialized: String) {
        if self.queue.send(serialized) != SendOutcome::Accepted {
            log::debug!("Synthetic event was not accepted by the staging queue");
        }
    }
}

/// Whitelist state: the union of the configured list, the image of the
/// domain→events map, and whatever the dispatcher's handlers declare they
/// need. Classification is plain set membership; an empty union simply
/// whitelists nothing. Recomputed atomically on config reloads under the
/// same mutex the classification read path takes.
pub struct Classifier {
    whitelist: Mutex<HashSet<String>>,
}

impl Classifier {
    pub fn new(config: &Config, supplementary: &[String]) -> Arc<Classifier> {
        let classifier = Arc::new(Classifier {
            whitelist: Mutex::new(HashSet::new()),
        });
        classifier.recompute(config, supplementary);
        classifier
    }

    pub fn recompute(&self, config: &Config, supplementary: &[String]) {
        let mut whitelist: HashSet<String> = config
            .get_string_list("ingest.whitelistedEvents")
            .into_iter()
            .collect();

        if let serde_json::Value::Object(domains) = config.get_json("mqtt.domainEventMap") {
            for (_, events) in domains {
                match events {
                    serde_json::Value::Array(ids) => {
                        whitelist
                            .extend(ids.into_iter().filter_map(|v| v.as_str().map(str::to_owned)));
                    }
                    serde_json::Value::String(id) => {
                        whitelist.insert(id);
                    }
                    _ => log::error!("Invalid domain event map entry"),
                }
            }
        }
        whitelist.extend(supplementary.iter().cloned());

        let mut state = self.whitelist.lock().expect("classifier lock poisoned");
        log::info!("Whitelist recomputed: size={}", whitelist.len());
        *state = whitelist;
    }

    pub fn is_whitelisted(&self, event_id: &str) -> bool {
        self.whitelist
            .lock()
            .expect("classifier lock poisoned")
            .contains(event_id)
    }
}

/// The single worker draining the staging queue.
pub struct IngestProcessor {
    queue: Arc<StagingQueue>,
    classifier: Arc<Classifier>,
    sampler: Mutex<LogSampler>,
    chain: FilterChain,
    store: Arc<EventStore>,
    dispatcher: Arc<Dispatcher>,
    upload: UploadHandle,
    config: Config,
    non_ignite_count: Mutex<u64>,
}

impl IngestProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<StagingQueue>,
        classifier: Arc<Classifier>,
        chain: FilterChain,
        store: Arc<EventStore>,
        dispatcher: Arc<Dispatcher>,
        upload: UploadHandle,
        config: Config,
    ) -> Arc<IngestProcessor> {
        let sampler = Mutex::new(LogSampler::from_config(&config));
        Arc::new(IngestProcessor {
            queue,
            classifier,
            sampler,
            chain,
            store,
            dispatcher,
            upload,
            config,
            non_ignite_count: Mutex::new(0),
        })
    }

    pub async fn run(self: Arc<Self>, monitor: Arc<ShutdownMonitor>) {
        let signal = match monitor.register(SubscriberCode::Ingest, None) {
            Ok(signal) => signal,
            Err(e) => {
                log::error!("Ingest worker registration failed: {e}");
                return;
            }
        };

        let mut config_updates = self.config.subscribe_updates();

        loop {
            tokio::select! {
                _ = signal.notified() => break,
                _ = self.queue.wait_nonempty() => {
                    while let Some(serialized) = self.queue.take() {
                        self.process(serialized);
                    }
                }
                changed = config_updates.changed() => {
                    if changed.is_ok() {
                        self.on_config_updated();
                    }
                }
            }
        }

        // refuse new events, then flush what was already accepted
        self.queue.begin_shutdown();
        while let Some(serialized) = self.queue.take() {
            self.process(serialized);
        }
        let _ = monitor.ready_for_shutdown(SubscriberCode::Ingest, None);
        let _ = monitor.unregister(SubscriberCode::Ingest, None);
    }

    fn on_config_updated(&self) {
        let supplementary = self.dispatcher.supplementary_events_to_whitelist();
        self.classifier.recompute(&self.config, &supplementary);
        let mut sampler = self.sampler.lock().expect("sampler lock poisoned");
        *sampler = LogSampler::from_config(&self.config);
    }

    fn process(&self, serialized: String) {
        let event = match Event::from_json(&serialized) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Dropping malformed event: {e}");
                return;
            }
        };

        if chain::is_ignition_off(&event) {
            let mut sampler = self.sampler.lock().expect("sampler lock poisoned");
            if sampler.reset_policy() == ResetPolicy::IgnitionCycle {
                sampler.reset();
                drop(sampler);
                self.upload.reset_session_log_counters();
            }
        }

        if self.classifier.is_whitelisted(&event.event_id) {
            self.log_critical(&event.event_id, &serialized);
            self.chain.handle(&event, &serialized);
        } else {
            let count = {
                let mut count = self.non_ignite_count.lock().expect("counter lock poisoned");
                *count += 1;
                *count
            };
            if count == 1 || count % 1000 == 0 {
                log::debug!("Non-whitelisted event count: {count}");
            }

            if self.chain.validator().is_valid(event.timestamp) {
                if self.store.handle_non_ignite_event(&event, &serialized) == StoreAccept::Queued
                    && self.store.is_direct_alert(&event.event_id)
                {
                    // a direct alert wakes the alert uploader no matter how
                    // the event itself was classified
                    log::warn!("Direct alert for {}", event.event_id);
                    self.upload.trigger_alert_upload();
                }
            } else {
                log::debug!(
                    "Dropping non-whitelisted {} with invalid timestamp",
                    event.event_id
                );
            }
        }
    }

    fn log_critical(&self, event_id: &str, serialized: &str) {
        let mut sampler = self.sampler.lock().expect("sampler lock poisoned");
        if sampler.should_log_critical(event_id) {
            log::info!("{serialized}");
        } else {
            log::debug!("{serialized}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue_with_capacity(bytes: i64) -> Arc<StagingQueue> {
        StagingQueue::from_config(&Config::from_value(json!({
            "ingest": { "queueBytes": bytes }
        })))
    }

    #[test]
    fn overflow_drops_and_counts() {
        let queue = queue_with_capacity(1024);
        let payload = "x".repeat(20);

        let mut accepted = 0u64;
        for _ in 0..100 {
            if queue.send(payload.clone()) == SendOutcome::Accepted {
                accepted += 1;
            }
        }

        assert!(accepted <= 51);
        assert_eq!(queue.overflow_count(), 100 - accepted);
        assert_eq!(queue.accepted_count(), accepted);
    }

    #[test]
    fn shutdown_refuses_events() {
        let queue = queue_with_capacity(1024);
        queue.begin_shutdown();
        assert_eq!(queue.send("{}".to_owned()), SendOutcome::DroppedShutdown);
    }

    #[test]
    fn fifo_order_is_preserved() {
        let queue = queue_with_capacity(1024);
        queue.send("first".to_owned());
        queue.send("second".to_owned());
        assert_eq!(queue.take().as_deref(), Some("first"));
        assert_eq!(queue.take().as_deref(), Some("second"));
        assert_eq!(queue.take(), None);
    }

    #[test]
    fn classifier_unions_domain_map_and_supplementary() {
        let config = Config::from_value(json!({
            "ingest": { "whitelistedEvents": ["Speed"] },
            "mqtt": { "domainEventMap": {
                "ro": ["RemoteOperationResponse"],
                "dtc": "DongleStatus"
            }}
        }));
        let classifier = Classifier::new(&config, &["EngineRPM".to_owned()]);

        assert!(classifier.is_whitelisted("Speed"));
        assert!(classifier.is_whitelisted("RemoteOperationResponse"));
        assert!(classifier.is_whitelisted("DongleStatus"));
        assert!(classifier.is_whitelisted("EngineRPM"));
        assert!(!classifier.is_whitelisted("Odometer"));
    }

    #[test]
    fn empty_whitelist_classifies_nothing() {
        let config = Config::from_value(json!({}));
        let classifier = Classifier::new(&config, &[]);
        assert!(!classifier.is_whitelisted("Speed"));
        assert!(!classifier.is_whitelisted("Odometer"));
    }

    #[test]
    fn domain_map_whitelists_without_an_explicit_list() {
        let config = Config::from_value(json!({
            "mqtt": { "domainEventMap": { "ro": ["RemoteOperationResponse"] } }
        }));
        let classifier = Classifier::new(&config, &[]);
        assert!(classifier.is_whitelisted("RemoteOperationResponse"));
        assert!(!classifier.is_whitelisted("Speed"));
    }

    async fn processor_with(config_tree: serde_json::Value) -> (Arc<IngestProcessor>, Arc<EventStore>, UploadHandle) {
        use crate::dispatch::Dispatcher;
        use crate::ingest::chain::{
            ActivityState, ChainSink, FilterChain, SessionTracker, TimestampValidator,
        };

        let config = Config::from_value(config_tree);
        let path = std::env::temp_dir().join(format!("driveline-test-{}.db", uuid::Uuid::new_v4()));
        let sqlite = crate::persistence::SqliteStore::open(&path).await.unwrap();
        let store = EventStore::new(sqlite, &config, true);

        let queue = StagingQueue::from_config(&config);
        let upload = UploadHandle::detached();
        let dispatcher = Dispatcher::new(Vec::new(), store.clone(), upload.clone(), &config);
        let classifier = Classifier::new(&config, &dispatcher.supplementary_events_to_whitelist());
        let chain = FilterChain::new(
            TimestampValidator::from_config(&config),
            SessionTracker::new(Arc::new(ActivityState::default())),
            ChainSink::Stream(dispatcher.clone()),
        );
        let processor = IngestProcessor::new(
            queue,
            classifier,
            chain,
            store.clone(),
            dispatcher,
            upload.clone(),
            config,
        );
        (processor, store, upload)
    }

    #[tokio::test]
    async fn empty_whitelist_routes_through_the_non_ignite_path() {
        let (processor, store, _) = processor_with(json!({
            "ingest": { "timestamp": { "minValidMs": 1 } }
        }))
        .await;

        processor.process(
            json!({ "EventID": "Odometer", "Version": "1.0", "Timestamp": 2, "Data": { "v": 140 } })
                .to_string(),
        );
        store.drain().await;

        // persisted, but never eligible for the stream worker
        assert_eq!(store.pending_event_count().await.unwrap(), 1);
        assert!(store.fetch_stream_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_whitelisted_direct_alert_triggers_the_fast_path() {
        let (processor, store, upload) = processor_with(json!({
            "ingest": {
                "whitelistedEvents": ["Speed"],
                "timestamp": { "minValidMs": 1 }
            },
            "mqtt": { "directAlerts": ["CollisionWarning"] }
        }))
        .await;

        processor.process(
            json!({ "EventID": "CollisionWarning", "Version": "1.0", "Timestamp": 5, "Data": { "severity": 3 } })
                .to_string(),
        );
        store.drain().await;

        assert!(upload.take_alert_trigger_for_test());
        assert_eq!(store.pending_alert_count().await.unwrap(), 1);
        assert_eq!(store.pending_event_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_timestamp_direct_alert_does_not_trigger() {
        let (processor, store, upload) = processor_with(json!({
            "ingest": { "timestamp": { "minValidMs": 1000 } },
            "mqtt": { "directAlerts": ["CollisionWarning"] }
        }))
        .await;

        processor.process(
            json!({ "EventID": "CollisionWarning", "Version": "1.0", "Timestamp": 2, "Data": {} })
                .to_string(),
        );
        store.drain().await;

        assert!(!upload.take_alert_trigger_for_test());
        assert_eq!(store.pending_alert_count().await.unwrap(), 0);
    }
}
