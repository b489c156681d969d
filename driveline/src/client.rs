//! The process-wide context: builds every component once, moves handles into
//! their workers, and exposes the blocking public API.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use crate::bus::{
    BusAddress, ConfigRequestHandler, DeviceIdRequestHandler, MessageBus, MessageType,
};
use crate::config::Config;
use crate::dispatch::{Dispatcher, MessageHandler};
use crate::event::Event;
use crate::ingest::chain::{
    ActivityGovernor, ActivityState, ChainSink, FilterChain, SessionTracker, TimestampValidator,
};
use crate::ingest::receiver::EventReceiver;
use crate::ingest::{Classifier, EventEmitter, IngestProcessor, SendOutcome, StagingQueue};
use crate::lifecycle::ShutdownMonitor;
use crate::net::{ConnectionState, MqttConnection};
use crate::notify::{NotificationListener, RequestHandler};
use crate::persistence::{EventStore, SqliteStore};
use crate::upload::mid::MidTracker;
use crate::upload::{UploadHandle, Uploader};

const DEFAULT_SHUTDOWN_BUCKET_DEADLINE: Duration = Duration::from_secs(10);

/// Settings-store keys carrying dotted-path config overrides; other keys are
/// internal state (activation flag, persisted software version).
const CONFIG_OVERRIDE_PREFIX: &str = "config.";

pub struct ClientBuilder {
    config_path: PathBuf,
    handlers: Vec<Arc<dyn MessageHandler>>,
    request_handlers: Vec<(String, Arc<dyn RequestHandler>)>,
    start_ingestion_suspended: bool,
}

impl ClientBuilder {
    pub fn new(config_path: impl Into<PathBuf>) -> ClientBuilder {
        ClientBuilder {
            config_path: config_path.into(),
            handlers: Vec::new(),
            request_handlers: Vec::new(),
            start_ingestion_suspended: false,
        }
    }

    /// In-process plugin handlers; registered before any worker starts.
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> ClientBuilder {
        self.handlers.push(handler);
        self
    }

    pub fn with_request_handler(
        mut self,
        request_type: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> ClientBuilder {
        self.request_handlers
            .push((request_type.to_owned(), handler));
        self
    }

    /// Gate ingestion until the embedder calls [`Client::resume_ingestion`].
    pub fn with_ingestion_suspended(mut self) -> ClientBuilder {
        self.start_ingestion_suspended = true;
        self
    }

    pub fn build(self) -> Result<Client> {
        Client::start(self)
    }
}

pub struct Client {
    runtime: Runtime,
    monitor: Arc<ShutdownMonitor>,
    config: Config,
    queue: Arc<StagingQueue>,
    emitter: EventEmitter,
    store: Arc<EventStore>,
    receiver: Arc<EventReceiver>,
    upload: UploadHandle,
    uploader: Arc<Uploader>,
    mqtt: Arc<MqttConnection>,
    device_id: String,
    bus_address: BusAddress,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_done: AtomicBool,
}

impl Client {
    fn start(builder: ClientBuilder) -> Result<Client> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .context("Unable to build the tokio runtime")?;

        let config = Config::load(&builder.config_path)?;

        let db_path = config.get_string("store.dbPath", "driveline.db");
        let sqlite = runtime.block_on(SqliteStore::open(Path::new(&db_path)))?;

        // Persisted overrides apply before anything else reads the tree.
        let mut applied = 0;
        for (key, value) in runtime.block_on(sqlite.settings_all())? {
            if let Some(dotted) = key.strip_prefix(CONFIG_OVERRIDE_PREFIX) {
                config.apply_override(dotted, &value);
                applied += 1;
            }
        }
        if applied > 0 {
            log::info!("Applied {applied} persisted config overrides");
        }

        let device_id = config.get_string("device.id", "");
        if device_id.is_empty() {
            bail!("Fatal: device.id is not configured");
        }

        let activated = runtime.block_on(EventStore::load_activated(&sqlite));
        let store = EventStore::new(sqlite, &config, activated);

        let monitor = ShutdownMonitor::new();
        let queue = StagingQueue::from_config(&config);
        let emitter = EventEmitter::new(queue.clone());

        let upload = UploadHandle::detached();
        let dispatcher = Dispatcher::new(builder.handlers, store.clone(), upload.clone(), &config);

        let classifier = Classifier::new(&config, &dispatcher.supplementary_events_to_whitelist());

        let activity = Arc::new(ActivityState::default());
        let governor = ActivityGovernor::new(activity.clone(), &config);
        let validator = TimestampValidator::from_config(&config);
        let sink = if store.upload_mode().stream_supported() {
            ChainSink::Stream(dispatcher.clone())
        } else {
            ChainSink::StoreAndForward(store.clone())
        };
        let chain = FilterChain::new(validator, SessionTracker::new(activity), sink);

        let processor = IngestProcessor::new(
            queue.clone(),
            classifier,
            chain,
            store.clone(),
            dispatcher.clone(),
            upload.clone(),
            config.clone(),
        );

        let notifications = NotificationListener::new(emitter.clone());
        for (request_type, handler) in builder.request_handlers {
            notifications.register_request(&request_type, handler);
        }

        let mid = MidTracker::new(store.clone());
        let mqtt = MqttConnection::create(
            &config,
            &device_id,
            mid.clone(),
            store.clone(),
            notifications.clone(),
            dispatcher.clone(),
            emitter.clone(),
            upload.clone(),
        )?;

        let uploader = Uploader::new(
            store.clone(),
            mqtt.publisher(),
            governor,
            mqtt.state_receiver(),
            mqtt.topics().clone(),
            upload.clone(),
            config.clone(),
        );

        let receiver = EventReceiver::new(queue.clone(), &config, builder.start_ingestion_suspended);

        let bus_address = BusAddress::from_config(&config);
        let mut bus = MessageBus::new(bus_address.clone(), emitter.clone());
        bus.subscribe(MessageType::Event, receiver.clone());
        bus.subscribe(
            MessageType::GetConfig,
            Arc::new(ConfigRequestHandler::new(config.clone())),
        );
        bus.subscribe(
            MessageType::GetDeviceId,
            Arc::new(DeviceIdRequestHandler::new(device_id.clone())),
        );
        let bus = Arc::new(bus);

        let tasks = vec![
            runtime.spawn(store.clone().run(monitor.clone())),
            runtime.spawn(processor.run(monitor.clone())),
            runtime.spawn(dispatcher.run(monitor.clone())),
            runtime.spawn(notifications.run(monitor.clone())),
            runtime.spawn(mid.run(monitor.clone())),
            runtime.spawn(mqtt.clone().run(monitor.clone())),
            runtime.spawn(uploader.clone().run_events(monitor.clone())),
            runtime.spawn(uploader.clone().run_alerts(monitor.clone())),
            runtime.spawn({
                let bus = bus.clone();
                let monitor = monitor.clone();
                async move {
                    if let Err(e) = bus.serve(monitor).await {
                        log::error!("Control bus failed: {e}");
                    }
                }
            }),
        ];

        log::info!("Telemetry client started for device {device_id}");

        Ok(Client {
            runtime,
            monitor,
            config,
            queue,
            emitter,
            store,
            receiver,
            upload,
            uploader,
            mqtt,
            device_id,
            bus_address,
            tasks: Mutex::new(tasks),
            shutdown_done: AtomicBool::new(false),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn bus_address(&self) -> &BusAddress {
        &self.bus_address
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Hands an event straight to the staging queue, same path as events
    /// arriving over the control socket.
    pub fn send_event(&self, event: &Event) -> SendOutcome {
        self.queue.send(event.to_json())
    }

    pub fn emitter(&self) -> EventEmitter {
        self.emitter.clone()
    }

    pub fn pending_event_count(&self) -> Result<i64> {
        self.runtime.block_on(self.store.pending_event_count())
    }

    pub fn pending_alert_count(&self) -> Result<i64> {
        self.runtime.block_on(self.store.pending_alert_count())
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.mqtt.state_receiver().borrow()
    }

    pub fn force_upload(&self, exit_when_done: bool) {
        self.upload.force_upload(exit_when_done);
    }

    /// Publishes a specific alert (appended to the store first) or sweeps the
    /// stored ones.
    pub fn alert_upload(&self, payload: Option<&str>) -> Result<()> {
        self.runtime.block_on(self.uploader.alert_upload(payload))
    }

    pub fn suspend_upload(&self) {
        self.upload.suspend_upload();
    }

    pub fn resume_upload(&self) {
        self.upload.resume_upload();
    }

    pub fn suspend_ingestion(&self) {
        self.receiver.suspend();
    }

    pub fn resume_ingestion(&self) {
        self.receiver.resume();
    }

    pub fn set_activated(&self, activated: bool) -> Result<()> {
        self.runtime.block_on(self.store.set_activated(activated))
    }

    /// Re-reads the config file and notifies every component that derives
    /// state from it.
    pub fn reload_config(&self) -> Result<()> {
        self.config.reload()
    }

    /// Applies and persists a runtime override so it survives restarts.
    pub fn apply_config_override(&self, dotted_key: &str, value: &str) -> Result<()> {
        self.config.apply_override(dotted_key, value);
        let setting_key = format!("{CONFIG_OVERRIDE_PREFIX}{dotted_key}");
        self.runtime
            .block_on(self.store.sqlite().setting_set(&setting_key, value))?;
        self.config.notify_updated();
        Ok(())
    }

    /// Orderly shutdown: drives the two-phase notification order, then joins
    /// the workers. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::AcqRel) {
            return;
        }

        log::info!("Beginning orderly shutdown");
        self.runtime.block_on(async {
            self.mqtt.stop_client().await;
            self.monitor
                .begin_shutdown(Some(DEFAULT_SHUTDOWN_BUCKET_DEADLINE))
                .await;
        });

        let tasks = std::mem::take(&mut *self.tasks.lock().expect("task list lock poisoned"));
        self.runtime.block_on(async {
            for task in tasks {
                match tokio::time::timeout(Duration::from_secs(5), task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::error!("Worker task failed: {e}"),
                    Err(_) => log::warn!("Worker did not finish within the join timeout"),
                }
            }
        });
        log::info!("Shutdown complete");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}
