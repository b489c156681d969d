//! Drives the ingestion pipeline end to end against a real SQLite file:
//! staging queue, classification, filter chain, dispatcher fan-out, and the
//! store worker, finishing with an orderly shutdown.

use std::sync::Arc;
use std::time::Duration;

use driveline::config::Config;
use driveline::dispatch::Dispatcher;
use driveline::ingest::chain::{
    ActivityState, ChainSink, FilterChain, SessionTracker, TimestampValidator,
};
use driveline::ingest::{Classifier, IngestProcessor, SendOutcome, StagingQueue};
use driveline::lifecycle::ShutdownMonitor;
use driveline::persistence::{EventStore, SqliteStore};
use driveline::upload::UploadHandle;

use serde_json::json;

struct Pipeline {
    queue: Arc<StagingQueue>,
    store: Arc<EventStore>,
    monitor: Arc<ShutdownMonitor>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

async fn start_pipeline(config_tree: serde_json::Value) -> Pipeline {
    let config = Config::from_value(config_tree);

    let db_path = std::env::temp_dir().join(format!("driveline-pipe-{}.db", uuid::Uuid::new_v4()));
    let sqlite = SqliteStore::open(&db_path).await.unwrap();
    let store = EventStore::new(sqlite, &config, true);

    let monitor = ShutdownMonitor::new();
    let queue = StagingQueue::from_config(&config);

    let upload = UploadHandle::detached();
    let dispatcher = Dispatcher::new(Vec::new(), store.clone(), upload.clone(), &config);
    let classifier = Classifier::new(&config, &dispatcher.supplementary_events_to_whitelist());

    let activity = Arc::new(ActivityState::default());
    let chain = FilterChain::new(
        TimestampValidator::from_config(&config),
        SessionTracker::new(activity),
        ChainSink::Stream(dispatcher.clone()),
    );

    let processor = IngestProcessor::new(
        queue.clone(),
        classifier,
        chain,
        store.clone(),
        dispatcher.clone(),
        upload,
        config.clone(),
    );

    let workers = vec![
        tokio::spawn(store.clone().run(monitor.clone())),
        tokio::spawn(processor.run(monitor.clone())),
        tokio::spawn(dispatcher.run(monitor.clone())),
    ];

    Pipeline {
        queue,
        store,
        monitor,
        workers,
    }
}

impl Pipeline {
    async fn finish(self) -> Arc<EventStore> {
        self.monitor
            .begin_shutdown(Some(Duration::from_secs(5)))
            .await;
        for worker in self.workers {
            worker.await.unwrap();
        }
        self.store
    }
}

fn config_tree() -> serde_json::Value {
    json!({
        "ingest": {
            "whitelistedEvents": ["Speed"],
            "timestamp": { "minValidMs": 1 }
        },
        "mqtt": { "directAlerts": ["CollisionWarning"] }
    })
}

async fn wait_for<F, Fut>(mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn whitelisted_event_is_persisted_stream_eligible() {
    let pipeline = start_pipeline(config_tree()).await;

    let accepted = pipeline.queue.send(
        json!({ "EventID": "Speed", "Version": "1.0", "Timestamp": 1, "Data": { "v": 70 } })
            .to_string(),
    );
    assert_eq!(accepted, SendOutcome::Accepted);

    let store = pipeline.store.clone();
    wait_for(|| {
        let store = store.clone();
        async move { store.pending_event_count().await.unwrap() == 1 }
    })
    .await;

    let rows = pipeline.store.fetch_stream_batch(10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event_id, "Speed");
    assert!(rows[0].stream_support);

    pipeline.finish().await;
}

#[tokio::test]
async fn non_whitelisted_event_skips_the_stream_path() {
    let pipeline = start_pipeline(config_tree()).await;

    pipeline.queue.send(
        json!({ "EventID": "Odometer", "Version": "1.0", "Timestamp": 2, "Data": { "v": 140 } })
            .to_string(),
    );

    let store = pipeline.store.clone();
    wait_for(|| {
        let store = store.clone();
        async move { store.pending_event_count().await.unwrap() == 1 }
    })
    .await;

    // persisted, but the stream worker will never pick it up
    assert!(pipeline.store.fetch_stream_batch(10).await.unwrap().is_empty());

    pipeline.finish().await;
}

#[tokio::test]
async fn empty_whitelist_still_uses_the_non_ignite_path() {
    // no whitelist configured at all: classification is plain set
    // membership, so every event takes the direct-store path
    let pipeline = start_pipeline(json!({
        "ingest": { "timestamp": { "minValidMs": 1 } }
    }))
    .await;

    pipeline.queue.send(
        json!({ "EventID": "Odometer", "Version": "1.0", "Timestamp": 2, "Data": { "v": 140 } })
            .to_string(),
    );

    let store = pipeline.store.clone();
    wait_for(|| {
        let store = store.clone();
        async move { store.pending_event_count().await.unwrap() == 1 }
    })
    .await;

    // the stream worker must never pick this row up
    assert!(pipeline.store.fetch_stream_batch(10).await.unwrap().is_empty());

    pipeline.finish().await;
}

#[tokio::test]
async fn invalid_timestamp_is_dropped() {
    let pipeline = start_pipeline(config_tree()).await;

    // non-whitelisted with a timestamp far in the future
    pipeline.queue.send(
        json!({ "EventID": "Odometer", "Version": "1.0", "Timestamp": 9_999_999_999_999i64, "Data": {} })
            .to_string(),
    );
    // whitelisted with a pre-epoch timestamp
    pipeline.queue.send(
        json!({ "EventID": "Speed", "Version": "1.0", "Timestamp": 0, "Data": {} }).to_string(),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pipeline.store.pending_event_count().await.unwrap(), 0);

    pipeline.finish().await;
}

#[tokio::test]
async fn direct_alert_lands_in_the_alert_store() {
    let pipeline = start_pipeline(json!({
        "ingest": {
            "whitelistedEvents": ["CollisionWarning"],
            "timestamp": { "minValidMs": 1 }
        },
        "mqtt": { "directAlerts": ["CollisionWarning"] }
    }))
    .await;

    pipeline.queue.send(
        json!({ "EventID": "CollisionWarning", "Version": "1.0", "Timestamp": 5, "Data": { "severity": 3 } })
            .to_string(),
    );

    let store = pipeline.store.clone();
    wait_for(|| {
        let store = store.clone();
        async move { store.pending_alert_count().await.unwrap() == 1 }
    })
    .await;
    assert_eq!(pipeline.store.pending_event_count().await.unwrap(), 0);

    pipeline.finish().await;
}

#[tokio::test]
async fn shutdown_drains_and_writes_the_session_end_marker() {
    let pipeline = start_pipeline(config_tree()).await;

    for index in 0..5 {
        pipeline.queue.send(
            json!({ "EventID": "Speed", "Version": "1.0", "Timestamp": 10 + index, "Data": {} })
                .to_string(),
        );
    }

    let store = pipeline.store.clone();
    wait_for(|| {
        let store = store.clone();
        async move { store.pending_event_count().await.unwrap() >= 5 }
    })
    .await;

    let store = pipeline.finish().await;

    // the worker appended a terminal SessionStatus row while draining
    let rows = store.fetch_stream_batch(50).await.unwrap();
    assert!(rows.iter().any(|row| row.event_id == "SessionStatus"));
    assert_eq!(rows.iter().filter(|row| row.event_id == "Speed").count(), 5);
}
