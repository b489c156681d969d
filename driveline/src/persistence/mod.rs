//! Durable event queue over SQLite: an in-memory staging buffer drained by a
//! single worker into batched transactional inserts, with purge under size
//! pressure and activation gating in front of everything.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;

use crate::config::Config;
use crate::event::Event;
use crate::lifecycle::{ShutdownMonitor, SubscriberCode};

pub mod sqlite;

pub use sqlite::{EventRow, NewEventRow, SqliteStore, StoreTable};

const DEFAULT_QUEUE_BYTES: usize = 1_000_000;
const DEFAULT_AVG_RECORD_SIZE: usize = 500;
const MAX_EVENTS_PER_TXN: usize = 50;
const DEFAULT_MAX_DB_SIZE: i64 = 50 * 1024 * 1024;
const INSERT_RETRY_LIMIT: u32 = 5;

const ACTIVATED_SETTING: &str = "activated";

/// Which upload paths rows are eligible for.
#[derive(Debug, Clone, Copy)]
pub struct UploadMode {
    stream: bool,
    batch: bool,
}

impl UploadMode {
    pub fn from_config(config: &Config) -> UploadMode {
        match config.get_string("upload.mode", "stream").as_str() {
            "batch" => UploadMode {
                stream: false,
                batch: true,
            },
            "both" => UploadMode {
                stream: true,
                batch: true,
            },
            _ => UploadMode {
                stream: true,
                batch: false,
            },
        }
    }

    pub fn stream_supported(&self) -> bool {
        self.stream
    }

    pub fn batch_supported(&self) -> bool {
        self.batch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAccept {
    Queued,
    /// Refused until the device is activated; the caller may retry later.
    WaitForActivation,
}

#[derive(Default)]
struct StoreQueue {
    entries: VecDeque<(StoreTable, NewEventRow)>,
    bytes: usize,
    purge_requested: bool,
}

pub struct EventStore {
    sqlite: SqliteStore,
    state: Mutex<StoreQueue>,
    notify: Notify,
    queue_capacity: usize,
    avg_record_size: usize,
    max_events_per_txn: usize,
    max_db_size: u64,
    purge_per_event_cap: i64,
    mode: UploadMode,
    direct_alerts: HashSet<String>,
    topic_map: HashMap<String, String>,
    activated: AtomicBool,
    upload_after_activation: bool,
    activation_exceptions: HashSet<String>,
}

impl EventStore {
    pub fn new(sqlite: SqliteStore, config: &Config, activated: bool) -> Arc<EventStore> {
        let mode = UploadMode::from_config(config);

        let mut topic_map = HashMap::new();
        if let serde_json::Value::Object(entries) = config.get_json("mqtt.eventTopicMap") {
            for (event_id, topic) in entries {
                if let Some(topic) = topic.as_str() {
                    topic_map.insert(event_id, topic.to_owned());
                }
            }
        }

        Arc::new(EventStore {
            sqlite,
            state: Mutex::new(StoreQueue::default()),
            notify: Notify::new(),
            queue_capacity: config
                .get_i64("store.queueBytes", DEFAULT_QUEUE_BYTES as i64)
                .max(1) as usize,
            avg_record_size: config
                .get_i64("store.avgRecordSize", DEFAULT_AVG_RECORD_SIZE as i64)
                .max(1) as usize,
            max_events_per_txn: config
                .get_i64("store.maxEventsPerTxn", MAX_EVENTS_PER_TXN as i64)
                .clamp(1, MAX_EVENTS_PER_TXN as i64) as usize,
            max_db_size: config.get_i64("store.maxDbSizeBytes", DEFAULT_MAX_DB_SIZE) as u64,
            purge_per_event_cap: config.get_i64("store.purgePerEventCap", 1000),
            mode,
            direct_alerts: config.get_string_list("mqtt.directAlerts").into_iter().collect(),
            topic_map,
            activated: AtomicBool::new(activated),
            upload_after_activation: config.get_bool("store.uploadAfterActivation", false),
            activation_exceptions: config
                .get_string_list("store.activationExceptionEvents")
                .into_iter()
                .collect(),
        })
    }

    pub fn sqlite(&self) -> &SqliteStore {
        &self.sqlite
    }

    pub fn upload_mode(&self) -> UploadMode {
        self.mode
    }

    pub async fn load_activated(sqlite: &SqliteStore) -> bool {
        matches!(
            sqlite.setting_get(ACTIVATED_SETTING).await,
            Ok(Some(value)) if value == "true"
        )
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    pub async fn set_activated(&self, activated: bool) -> Result<()> {
        self.activated.store(activated, Ordering::Release);
        self.sqlite
            .setting_set(ACTIVATED_SETTING, if activated { "true" } else { "false" })
            .await
    }

    // Ingest entry points
    // ================================================================================

    /// Whitelisted events arriving through the filter chain.
    pub fn handle_event(&self, event: &Event, serialized: &str) -> StoreAccept {
        let (table, row) = self.classify(event, serialized, true);
        self.enqueue(table, row)
    }

    /// Direct insertion path for events outside the whitelist; never eligible
    /// for the stream path.
    pub fn handle_non_ignite_event(&self, event: &Event, serialized: &str) -> StoreAccept {
        let (table, row) = self.classify(event, serialized, false);
        self.enqueue(table, row)
    }

    /// Whether this event id is configured to trigger the alert upload fast
    /// path, regardless of its own classification.
    pub fn is_direct_alert(&self, event_id: &str) -> bool {
        self.direct_alerts.contains(event_id)
    }

    /// Synchronous insertion for low-rate out-of-band control events.
    pub async fn insert_event(&self, serialized: &str) -> Result<()> {
        let event = Event::from_json(serialized)?;
        let (table, row) = self.classify(&event, serialized, true);
        self.sqlite.insert_row(table, &row).await?;
        Ok(())
    }

    /// A supplied alert payload is appended to the alert store so a
    /// subsequent sweep publishes it in row order.
    pub async fn insert_alert(&self, serialized: &str) -> Result<()> {
        let event = Event::from_json(serialized)?;
        let row = NewEventRow {
            event_id: event.event_id.clone(),
            payload: serialized.to_owned(),
            timestamp: event.timestamp,
            stream_support: true,
            batch_support: false,
            topic: None,
        };
        self.sqlite.insert_row(StoreTable::Alerts, &row).await?;
        Ok(())
    }

    fn classify(&self, event: &Event, serialized: &str, whitelisted: bool) -> (StoreTable, NewEventRow) {
        if self.direct_alerts.contains(&event.event_id) {
            let row = NewEventRow {
                event_id: event.event_id.clone(),
                payload: serialized.to_owned(),
                timestamp: event.timestamp,
                stream_support: true,
                batch_support: false,
                topic: None,
            };
            return (StoreTable::Alerts, row);
        }

        let row = NewEventRow {
            event_id: event.event_id.clone(),
            payload: serialized.to_owned(),
            timestamp: event.timestamp,
            stream_support: whitelisted && self.mode.stream_supported(),
            batch_support: self.mode.batch_supported(),
            topic: self.topic_map.get(&event.event_id).cloned(),
        };
        (StoreTable::Events, row)
    }

    fn enqueue(&self, table: StoreTable, row: NewEventRow) -> StoreAccept {
        if !self.is_activated()
            && self.upload_after_activation
            && !self.activation_exceptions.contains(&row.event_id)
        {
            log::debug!("Holding {} until device activation", row.event_id);
            return StoreAccept::WaitForActivation;
        }

        let mut state = self.state.lock().expect("store queue lock poisoned");
        state.bytes += row.size();
        state.entries.push_back((table, row));
        if state.bytes > self.queue_capacity && !state.purge_requested {
            state.purge_requested = true;
            log::warn!(
                "Store queue above high-water mark ({} bytes), purge requested",
                state.bytes
            );
        }
        drop(state);

        self.notify.notify_one();
        StoreAccept::Queued
    }

    // Upload-side operations
    // ================================================================================

    pub async fn fetch_stream_batch(&self, limit: i64) -> Result<Vec<EventRow>> {
        self.sqlite.fetch_stream_batch(StoreTable::Events, limit).await
    }

    pub async fn fetch_alert_batch(&self, limit: i64) -> Result<Vec<EventRow>> {
        self.sqlite.fetch_stream_batch(StoreTable::Alerts, limit).await
    }

    pub async fn assign_mid(&self, table: StoreTable, row_ids: &[i64], mid: i64) -> Result<()> {
        self.sqlite.assign_mid(table, row_ids, mid).await
    }

    pub async fn delete_by_mid(&self, table: StoreTable, mid: i64) -> Result<()> {
        self.sqlite
            .delete_by_mid(table, mid, self.mode.batch_supported())
            .await
    }

    pub async fn clear_all_mids(&self) -> Result<()> {
        self.sqlite.clear_mids(StoreTable::Events).await?;
        self.sqlite.clear_mids(StoreTable::Alerts).await?;
        Ok(())
    }

    pub async fn pending_event_count(&self) -> Result<i64> {
        self.sqlite.count(StoreTable::Events).await
    }

    pub async fn pending_alert_count(&self) -> Result<i64> {
        self.sqlite.count(StoreTable::Alerts).await
    }

    // Worker
    // ================================================================================

    pub async fn run(self: Arc<Self>, monitor: Arc<ShutdownMonitor>) {
        let signal = match monitor.register(SubscriberCode::Store, None) {
            Ok(signal) => signal,
            Err(e) => {
                log::error!("Store worker registration failed: {e}");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = signal.notified() => break,
                _ = self.wait_nonempty() => {
                    self.drain().await;
                    self.maybe_purge().await;
                }
            }
        }

        log::debug!("Store worker draining before shutdown");
        self.drain().await;

        let mut session_end = Event::new("1.0", "SessionStatus");
        session_end.add_field("state", "off");
        session_end.add_field("reason", "shutdown");
        if let Err(e) = self.insert_event(&session_end.to_json()).await {
            log::error!("Unable to record the shutdown session event: {e}");
        }

        let _ = monitor.ready_for_shutdown(SubscriberCode::Store, None);
        let _ = monitor.unregister(SubscriberCode::Store, None);
    }

    async fn wait_nonempty(&self) {
        loop {
            let notified = self.notify.notified();
            if !self
                .state
                .lock()
                .expect("store queue lock poisoned")
                .entries
                .is_empty()
            {
                return;
            }
            notified.await;
        }
    }

    pub(crate) async fn drain(&self) {
        loop {
            let batch = self.take_batch();
            if batch.is_empty() {
                break;
            }
            self.insert_with_retry(batch).await;
        }
    }

    /// Batch size scales with the backlog: `clamp(queue_bytes / avg_record,
    /// 1, configured_max)`.
    fn take_batch(&self) -> Vec<(StoreTable, NewEventRow)> {
        let mut state = self.state.lock().expect("store queue lock poisoned");
        let target = (state.bytes / self.avg_record_size).clamp(1, self.max_events_per_txn);
        let take = target.min(state.entries.len());
        let mut batch = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some((table, row)) = state.entries.pop_front() {
                state.bytes -= row.size();
                batch.push((table, row));
            }
        }
        batch
    }

    /// A failed transaction is rolled back and retried after exponential
    /// backoff with the batch halved each time, floor of one row.
    async fn insert_with_retry(&self, batch: Vec<(StoreTable, NewEventRow)>) {
        let mut groups: HashMap<StoreTable, Vec<NewEventRow>> = HashMap::new();
        for (table, row) in batch {
            groups.entry(table).or_default().push(row);
        }

        for (table, mut rows) in groups {
            let mut attempt = 0;
            while !rows.is_empty() {
                match self.sqlite.insert_rows(table, &rows).await {
                    Ok(()) => break,
                    Err(e) => {
                        attempt += 1;
                        if attempt > INSERT_RETRY_LIMIT {
                            log::error!(
                                "Giving up on inserting {} rows into {table} after {attempt} attempts: {e}",
                                rows.len()
                            );
                            break;
                        }
                        let backoff = Duration::from_millis(250 * (1 << attempt.min(5)));
                        log::warn!(
                            "Insert of {} rows into {table} failed (attempt {attempt}), retrying in {backoff:?}: {e}",
                            rows.len()
                        );
                        tokio::time::sleep(backoff).await;
                        let keep = (rows.len() / 2).max(1);
                        // rows beyond the halved batch go back to the queue front
                        let overflow = rows.split_off(keep);
                        if !overflow.is_empty() {
                            let mut state = self.state.lock().expect("store queue lock poisoned");
                            for row in overflow.into_iter().rev() {
                                state.bytes += row.size();
                                state.entries.push_front((table, row));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Purge never runs concurrently with inserts; this worker owns both.
    async fn maybe_purge(&self) {
        let requested = {
            let mut state = self.state.lock().expect("store queue lock poisoned");
            std::mem::take(&mut state.purge_requested)
        };
        let over_size = self.sqlite.file_size() > self.max_db_size;
        if !requested && !over_size {
            return;
        }

        log::warn!(
            "Running purge cycle (requested={requested}, db_size={})",
            self.sqlite.file_size()
        );
        match self
            .sqlite
            .reduce_granularity(StoreTable::Events, self.purge_per_event_cap)
            .await
        {
            Ok(removed) => log::info!("Granularity reduction removed {removed} rows"),
            Err(e) => log::error!("Granularity reduction failed: {e}"),
        }
        if let Err(e) = self.sqlite.vacuum().await {
            log::error!("VACUUM failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store_with(config: serde_json::Value, activated: bool) -> Arc<EventStore> {
        let path = std::env::temp_dir().join(format!("driveline-test-{}.db", uuid::Uuid::new_v4()));
        let sqlite = SqliteStore::open(&path).await.unwrap();
        EventStore::new(sqlite, &Config::from_value(config), activated)
    }

    fn event(event_id: &str) -> (Event, String) {
        let mut event = Event::new("1.0", event_id);
        event.add_field("v", 1);
        let serialized = event.to_json();
        (event, serialized)
    }

    #[tokio::test]
    async fn whitelisted_events_are_stream_eligible() {
        let store = store_with(json!({}), true).await;
        let (e, s) = event("Speed");
        assert_eq!(store.handle_event(&e, &s), StoreAccept::Queued);
        store.drain().await;

        let batch = store.fetch_stream_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].stream_support);
        assert!(!batch[0].batch_support);
    }

    #[tokio::test]
    async fn non_ignite_events_skip_the_stream_path() {
        let store = store_with(json!({}), true).await;
        let (e, s) = event("Odometer");
        store.handle_non_ignite_event(&e, &s);
        store.drain().await;

        assert_eq!(store.pending_event_count().await.unwrap(), 1);
        assert!(store.fetch_stream_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn direct_alerts_land_in_the_alert_table() {
        let store = store_with(
            json!({ "mqtt": { "directAlerts": ["CollisionWarning"] } }),
            true,
        )
        .await;
        let (e, s) = event("CollisionWarning");
        store.handle_event(&e, &s);
        store.drain().await;

        assert_eq!(store.pending_alert_count().await.unwrap(), 1);
        assert_eq!(store.pending_event_count().await.unwrap(), 0);
        let alerts = store.fetch_alert_batch(10).await.unwrap();
        assert!(!alerts[0].batch_support);
    }

    #[tokio::test]
    async fn activation_gating_holds_unexcepted_events() {
        let store = store_with(
            json!({ "store": {
                "uploadAfterActivation": true,
                "activationExceptionEvents": ["Activation"]
            }}),
            false,
        )
        .await;

        let (e, s) = event("Speed");
        assert_eq!(store.handle_event(&e, &s), StoreAccept::WaitForActivation);

        let (e, s) = event("Activation");
        assert_eq!(store.handle_event(&e, &s), StoreAccept::Queued);

        store.set_activated(true).await.unwrap();
        let (e, s) = event("Speed");
        assert_eq!(store.handle_event(&e, &s), StoreAccept::Queued);
    }

    #[tokio::test]
    async fn activation_flag_is_persisted() {
        let path = std::env::temp_dir().join(format!("driveline-test-{}.db", uuid::Uuid::new_v4()));
        let sqlite = SqliteStore::open(&path).await.unwrap();
        assert!(!EventStore::load_activated(&sqlite).await);

        let store = EventStore::new(sqlite.clone(), &Config::from_value(json!({})), false);
        store.set_activated(true).await.unwrap();
        assert!(EventStore::load_activated(&sqlite).await);
    }

    #[tokio::test]
    async fn batch_mode_events_survive_stream_acknowledgement() {
        let store = store_with(json!({ "upload": { "mode": "both" } }), true).await;
        let (e, s) = event("Speed");
        store.handle_event(&e, &s);
        store.drain().await;

        let batch = store.fetch_stream_batch(10).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
        store.assign_mid(StoreTable::Events, &ids, 3).await.unwrap();
        store.delete_by_mid(StoreTable::Events, 3).await.unwrap();

        // the batch path still owns the row, it is just no longer stream-eligible
        assert_eq!(store.pending_event_count().await.unwrap(), 1);
        assert!(store.fetch_stream_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn synchronous_insert_path() {
        let store = store_with(json!({}), true).await;
        let (_, s) = event("SessionStatus");
        store.insert_event(&s).await.unwrap();
        assert_eq!(store.pending_event_count().await.unwrap(), 1);
    }
}
