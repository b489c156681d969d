//! The upload engine: two concurrent paths (events and alerts) pulling from
//! the durable store and publishing over MQTT, with periodicity, force
//! upload, suspension, and per-topic fan-out.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{watch, Notify};

use crate::config::Config;
use crate::ingest::chain::ActivityGovernor;
use crate::lifecycle::{ShutdownMonitor, ShutdownSignal, SubscriberCode};
use crate::net::topics::qos_from;
use crate::net::{ConnectionState, PublishClaim, TopicSet, TrackedPublisher};
use crate::persistence::{EventRow, EventStore, StoreTable};

pub mod mid;

const MIN_EVENT_UPLOAD_CNT: i64 = 20;
const MAX_EVENT_UPLOAD_CNT: i64 = 175;
const DEFAULT_EVENT_PERIODICITY_SECS: u64 = 60;
const ALERT_SWEEP_LIMIT: i64 = 100;

const ALERT_WORKER_NAME: &str = "alert-uploader";

#[derive(Default)]
struct LogCounters {
    cycle_count: u64,
    uploaded_since_summary: u64,
}

struct UploadShared {
    wake: Notify,
    force_requested: AtomicBool,
    exit_when_done: AtomicBool,
    alert: Notify,
    alert_requested: AtomicBool,
    suspended: watch::Sender<bool>,
    periodicity_secs: AtomicU64,
    log: Mutex<LogCounters>,
}

/// Clonable control surface for the upload workers; safe to call from any
/// component.
#[derive(Clone)]
pub struct UploadHandle {
    shared: Arc<UploadShared>,
}

impl UploadHandle {
    fn new(periodicity_secs: u64) -> UploadHandle {
        let (suspended, _) = watch::channel(false);
        UploadHandle {
            shared: Arc::new(UploadShared {
                wake: Notify::new(),
                force_requested: AtomicBool::new(false),
                exit_when_done: AtomicBool::new(false),
                alert: Notify::new(),
                alert_requested: AtomicBool::new(false),
                suspended,
                periodicity_secs: AtomicU64::new(periodicity_secs),
                log: Mutex::new(LogCounters::default()),
            }),
        }
    }

    /// Handle with no worker behind it yet; requests are recorded until
    /// [`Uploader::new`] attaches the workers at bootstrap.
    pub fn detached() -> UploadHandle {
        UploadHandle::new(DEFAULT_EVENT_PERIODICITY_SECS)
    }

    /// Alert fast path: wakes the alerts worker for a sweep.
    pub fn trigger_alert_upload(&self) {
        self.shared.alert_requested.store(true, Ordering::Release);
        self.shared.alert.notify_one();
    }

    /// Triggers one immediate events cycle; with `exit_when_done` the events
    /// worker stops after that cycle completes.
    pub fn force_upload(&self, exit_when_done: bool) {
        if exit_when_done {
            self.shared.exit_when_done.store(true, Ordering::Release);
        }
        self.shared.force_requested.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    pub fn suspend_upload(&self) {
        self.shared.suspended.send_replace(true);
        self.shared.wake.notify_one();
        self.shared.alert.notify_one();
    }

    pub fn resume_upload(&self) {
        self.shared.suspended.send_replace(false);
    }

    pub fn is_suspended(&self) -> bool {
        *self.shared.suspended.borrow()
    }

    /// Replaces the events interval and wakes the worker so the new value
    /// takes effect immediately.
    pub fn reload_periodicity(&self, secs: u64) {
        self.shared
            .periodicity_secs
            .store(secs.max(1), Ordering::Release);
        self.shared.wake.notify_one();
    }

    pub fn periodicity_secs(&self) -> u64 {
        self.shared.periodicity_secs.load(Ordering::Acquire)
    }

    /// Ignition-cycle reset of the session logging budgets.
    pub fn reset_session_log_counters(&self) {
        let mut log = self.shared.log.lock().expect("upload log lock poisoned");
        *log = LogCounters::default();
    }

    #[cfg(test)]
    pub(crate) fn take_alert_trigger_for_test(&self) -> bool {
        self.shared.alert_requested.swap(false, Ordering::AcqRel)
    }
}

pub struct Uploader {
    handle: UploadHandle,
    store: Arc<EventStore>,
    publisher: TrackedPublisher,
    governor: ActivityGovernor,
    connection: watch::Receiver<ConnectionState>,
    topics: TopicSet,
    config: Config,
}

impl Uploader {
    pub fn new(
        store: Arc<EventStore>,
        publisher: TrackedPublisher,
        governor: ActivityGovernor,
        connection: watch::Receiver<ConnectionState>,
        topics: TopicSet,
        handle: UploadHandle,
        config: Config,
    ) -> Arc<Uploader> {
        let periodicity = config
            .get_i64(
                "upload.eventPeriodicity",
                DEFAULT_EVENT_PERIODICITY_SECS as i64,
            )
            .max(1) as u64;
        handle.reload_periodicity(periodicity);

        Arc::new(Uploader {
            handle,
            store,
            publisher,
            governor,
            connection,
            topics,
            config,
        })
    }

    pub fn handle(&self) -> UploadHandle {
        self.handle.clone()
    }

    fn connection_complete(&self) -> bool {
        *self.connection.borrow() == ConnectionState::Complete
    }

    // Events path
    // ================================================================================

    pub async fn run_events(self: Arc<Self>, monitor: Arc<ShutdownMonitor>) {
        let signal = match monitor.register(SubscriberCode::Upload, None) {
            Ok(signal) => signal,
            Err(e) => {
                log::error!("Events uploader registration failed: {e}");
                return;
            }
        };

        let mut config_updates = self.config.subscribe_updates();
        let shared = &self.handle.shared;

        loop {
            let period = Duration::from_secs(self.handle.periodicity_secs());
            let mut do_upload = false;
            let mut exit_after = false;

            tokio::select! {
                _ = signal.notified() => break,
                _ = tokio::time::sleep(period) => do_upload = true,
                _ = shared.wake.notified() => {
                    if shared.force_requested.swap(false, Ordering::AcqRel) {
                        do_upload = true;
                        exit_after = shared.exit_when_done.swap(false, Ordering::AcqRel);
                    }
                }
                changed = config_updates.changed() => {
                    if changed.is_ok() {
                        let secs = self
                            .config
                            .get_i64("upload.eventPeriodicity", DEFAULT_EVENT_PERIODICITY_SECS as i64)
                            .max(1) as u64;
                        log::info!("Events upload periodicity reloaded: {secs}s");
                        self.handle.reload_periodicity(secs);
                    }
                }
            }

            if self.handle.is_suspended() {
                if !self.park_until_resumed(&signal).await {
                    break;
                }
                continue;
            }

            if !do_upload {
                continue;
            }

            let defer = self.governor.compute_defer_upload();
            if defer > 0 {
                log::debug!("Deferring events upload by {defer}s due to activity");
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = tokio::time::sleep(Duration::from_secs(defer)) => {}
                }
            }

            if !self.connection_complete() {
                log::debug!("Skipping events upload, connection is not complete");
                continue;
            }

            match self.upload_events().await {
                Ok(uploaded) => self.log_cycle(uploaded),
                Err(e) => log::warn!("Events upload cycle failed, rows stay queued: {e}"),
            }

            if exit_after {
                log::info!("Events uploader exiting after forced cycle");
                break;
            }
        }

        let _ = monitor.ready_for_shutdown(SubscriberCode::Upload, None);
        let _ = monitor.unregister(SubscriberCode::Upload, None);
    }

    /// Waits while suspended; false means shutdown arrived first.
    async fn park_until_resumed(&self, signal: &ShutdownSignal) -> bool {
        log::info!("Upload suspended, parking");
        let mut suspended = self.handle.shared.suspended.subscribe();
        while *suspended.borrow_and_update() {
            tokio::select! {
                _ = signal.notified() => return false,
                changed = suspended.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
        log::info!("Upload resumed");
        true
    }

    /// One events cycle: select eligible rows in insertion order, group them
    /// by topic, one publish per topic. Rows stay in place on failure; their
    /// mids are cleared by the next reconnect.
    async fn upload_events(&self) -> Result<usize> {
        let limit = self
            .config
            .get_i64("upload.maxEventUploadCount", MAX_EVENT_UPLOAD_CNT)
            .clamp(MIN_EVENT_UPLOAD_CNT, MAX_EVENT_UPLOAD_CNT);
        let rows = self.store.fetch_stream_batch(limit).await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let qos = qos_from(self.config.get_i64("mqtt.pubTopics.events.qos", 1));
        let event_log_budget = self.config.get_i64("upload.eventLogging", 5).max(0) as usize;

        let mut default_group: Vec<&EventRow> = Vec::new();
        let mut routed: Vec<(String, Vec<&EventRow>)> = Vec::new();
        for row in &rows {
            match &row.topic {
                None => default_group.push(row),
                Some(suffix) => {
                    let topic = self.topics.routed_topic(suffix);
                    match routed.iter_mut().find(|(t, _)| *t == topic) {
                        Some((_, group)) => group.push(row),
                        None => routed.push((topic, vec![row])),
                    }
                }
            }
        }

        let mut uploaded = 0;
        if !default_group.is_empty() {
            uploaded += self
                .publish_group(self.topics.events_topic(), qos, &default_group, event_log_budget)
                .await?;
        }
        for (topic, group) in routed {
            uploaded += self.publish_group(&topic, qos, &group, 0).await?;
        }
        Ok(uploaded)
    }

    async fn publish_group(
        &self,
        topic: &str,
        qos: rumqttc::QoS,
        rows: &[&EventRow],
        log_budget: usize,
    ) -> Result<usize> {
        for row in rows.iter().take(log_budget) {
            log::info!("Uploading {}", row.payload);
        }

        let mut payload = String::with_capacity(rows.iter().map(|r| r.payload.len() + 1).sum());
        payload.push('[');
        for (index, row) in rows.iter().enumerate() {
            if index > 0 {
                payload.push(',');
            }
            payload.push_str(&row.payload);
        }
        payload.push(']');

        let body = self.encode_payload(payload.into_bytes())?;
        let claim = PublishClaim {
            table: StoreTable::Events,
            row_ids: rows.iter().map(|r| r.id).collect(),
        };

        log::debug!("Publishing {} events to {topic}", rows.len());
        self.publisher.publish_tracked(topic, qos, body, claim).await?;
        Ok(rows.len())
    }

    fn encode_payload(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        if !self.config.get_bool("upload.compress", false) {
            return Ok(payload);
        }
        let params = brotli::enc::BrotliEncoderParams {
            quality: 1,
            ..Default::default()
        };
        let mut compressed = Vec::new();
        brotli::BrotliCompress(&mut payload.as_slice(), &mut compressed, &params)?;
        Ok(compressed)
    }

    fn log_cycle(&self, uploaded: usize) {
        let summary_every = self
            .config
            .get_i64("upload.summaryLogIterCount", 10)
            .max(1) as u64;
        let mut log_state = self
            .handle
            .shared
            .log
            .lock()
            .expect("upload log lock poisoned");
        log_state.cycle_count += 1;
        log_state.uploaded_since_summary += uploaded as u64;
        if log_state.cycle_count % summary_every == 0 {
            log::info!(
                "Upload summary: {} events in the last {summary_every} cycles",
                log_state.uploaded_since_summary
            );
            log_state.uploaded_since_summary = 0;
        }
    }

    // Alerts path
    // ================================================================================

    pub async fn run_alerts(self: Arc<Self>, monitor: Arc<ShutdownMonitor>) {
        let signal = match monitor.register(SubscriberCode::Other, Some(ALERT_WORKER_NAME)) {
            Ok(signal) => signal,
            Err(e) => {
                log::error!("Alerts uploader registration failed: {e}");
                return;
            }
        };

        let shared = &self.handle.shared;
        loop {
            tokio::select! {
                _ = signal.notified() => break,
                _ = shared.alert.notified() => {}
            }

            if self.handle.is_suspended() {
                if !self.park_until_resumed(&signal).await {
                    break;
                }
            }

            if !shared.alert_requested.swap(false, Ordering::AcqRel) {
                continue;
            }

            if !self.connection_complete() {
                log::debug!("Alerts pending but connection is not complete");
                continue;
            }

            match self.sweep_alerts().await {
                Ok(0) => log::debug!("No alerts to upload"),
                Ok(published) => log::info!("Published {published} alerts"),
                Err(e) => log::warn!("Alert sweep failed, rows stay queued: {e}"),
            }
        }

        let _ = monitor.ready_for_shutdown(SubscriberCode::Other, Some(ALERT_WORKER_NAME));
        let _ = monitor.unregister(SubscriberCode::Other, Some(ALERT_WORKER_NAME));
    }

    /// With a payload: append it to the alert store, then sweep, so stored
    /// alerts go out in row order. Without one: just sweep.
    pub async fn alert_upload(&self, payload: Option<&str>) -> Result<()> {
        if let Some(payload) = payload {
            self.store.insert_alert(payload).await?;
        }
        self.handle.trigger_alert_upload();
        Ok(())
    }

    /// One alert row per PUBLISH, QoS as configured for alerts.
    async fn sweep_alerts(&self) -> Result<usize> {
        let qos = qos_from(self.config.get_i64("mqtt.pubTopics.alerts.qos", 1));
        let rows = self.store.fetch_alert_batch(ALERT_SWEEP_LIMIT).await?;

        let mut published = 0;
        for row in rows {
            log::info!("Uploading alert {}", row.payload);
            let claim = PublishClaim {
                table: StoreTable::Alerts,
                row_ids: vec![row.id],
            };
            self.publisher
                .publish_tracked(self.topics.alerts_topic(), qos, row.payload.into_bytes(), claim)
                .await?;
            published += 1;
        }
        Ok(published)
    }

    /// Ids configured for immediate upload regardless of classification.
    pub fn is_force_upload_event(&self, event_id: &str) -> bool {
        self.config
            .get_string_list("upload.forceUploadEvents")
            .iter()
            .any(|id| id == event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_records_alert_trigger() {
        let handle = UploadHandle::detached();
        assert!(!handle.take_alert_trigger_for_test());
        handle.trigger_alert_upload();
        assert!(handle.take_alert_trigger_for_test());
        assert!(!handle.take_alert_trigger_for_test());
    }

    #[test]
    fn suspension_flag_round_trip() {
        let handle = UploadHandle::detached();
        assert!(!handle.is_suspended());
        handle.suspend_upload();
        assert!(handle.is_suspended());
        handle.resume_upload();
        assert!(!handle.is_suspended());
    }

    #[test]
    fn periodicity_reload_is_observable() {
        let handle = UploadHandle::detached();
        handle.reload_periodicity(5);
        assert_eq!(handle.periodicity_secs(), 5);
        // zero is clamped so the worker never busy-loops
        handle.reload_periodicity(0);
        assert_eq!(handle.periodicity_secs(), 1);
    }

    #[test]
    fn log_counters_reset() {
        let handle = UploadHandle::detached();
        {
            let mut log = handle.shared.log.lock().unwrap();
            log.cycle_count = 12;
            log.uploaded_since_summary = 99;
        }
        handle.reset_session_log_counters();
        let log = handle.shared.log.lock().unwrap();
        assert_eq!(log.cycle_count, 0);
        assert_eq!(log.uploaded_since_summary, 0);
    }
}
