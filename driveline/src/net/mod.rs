//! MQTT session lifecycle: connect with refreshed credentials, subscribe to
//! the cloud-to-device topics, reconcile publish acknowledgements, and
//! broadcast connection-state transitions to the rest of the device.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, ConnectionError, Event as MqttEvent, MqttOptions,
    Outgoing, Packet, Publish, SubscribeFilter, SubscribeReasonCode, TlsConfiguration, Transport,
};
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::event::Event;
use crate::ingest::EventEmitter;
use crate::lifecycle::{ShutdownMonitor, ShutdownSignal, SubscriberCode};
use crate::notify::NotificationListener;
use crate::persistence::{EventStore, StoreTable};
use crate::upload::UploadHandle;

pub mod publisher;
pub mod token;
pub mod topics;

pub use publisher::{PublishClaim, TrackedPublisher};
pub use token::TokenClient;
pub use topics::TopicSet;

/// Domain under which connection-state changes are fanned out to handlers.
pub const CONNECTION_STATE_DOMAIN: &str = "MQTTConnectionState";

const DISPLAY_VERSION_SETTING: &str = "display_version";
const SELF_HEAL_BACKOFF: Duration = Duration::from_secs(5);

/// Connection progress, broadcast exactly once per change. Transitions are
/// monotonic within one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    SubscriptionsPending,
    Complete,
    TearingDown,
}

impl ConnectionState {
    pub fn code(self) -> i64 {
        match self {
            ConnectionState::NotConnected => 0,
            ConnectionState::SubscriptionsPending => 1,
            ConnectionState::Complete => 2,
            ConnectionState::TearingDown => 3,
        }
    }
}

struct SessionCounters {
    expected_subacks: usize,
    acked_subacks: usize,
    pubacks_logged: i64,
    complete_announced: bool,
}

impl SessionCounters {
    fn reset(&mut self) {
        self.expected_subacks = 0;
        self.acked_subacks = 0;
        self.pubacks_logged = 0;
        self.complete_announced = false;
    }
}

pub struct MqttConnection {
    topics: TopicSet,
    username: String,
    static_password: Option<String>,
    sw_version: String,
    puback_log_max: i64,
    state_tx: watch::Sender<ConnectionState>,
    eventloop: Mutex<Option<rumqttc::EventLoop>>,
    publisher: TrackedPublisher,
    mid: Arc<crate::upload::mid::MidTracker>,
    store: Arc<EventStore>,
    notifications: Arc<NotificationListener>,
    dispatcher: Arc<Dispatcher>,
    emitter: EventEmitter,
    upload: UploadHandle,
    token: Option<Arc<TokenClient>>,
    stop: CancellationToken,
}

impl MqttConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        config: &Config,
        device_id: &str,
        mid: Arc<crate::upload::mid::MidTracker>,
        store: Arc<EventStore>,
        notifications: Arc<NotificationListener>,
        dispatcher: Arc<Dispatcher>,
        emitter: EventEmitter,
        upload: UploadHandle,
    ) -> Result<Arc<MqttConnection>> {
        let host = config.get_string("mqtt.host", "localhost");
        let port = config.get_i64("mqtt.port", 8883) as u16;
        let keep_alive = config.get_i64("mqtt.keepalive", 60).max(5) as u64;

        let mut options = MqttOptions::new(device_id, host, port);
        options.set_keep_alive(Duration::from_secs(keep_alive));
        options.set_clean_session(true);
        if config.get_bool("mqtt.ssl.useTls", true) {
            options.set_transport(Transport::Tls(TlsConfiguration::Native));
        }
        let max_inflight = config.get_i64("mqtt.maxInflightMessages", 10).clamp(1, 100);
        options.set_inflight(max_inflight as u16);

        let static_username = config.get_string("mqtt.username", "");
        let static_password = config.get_string("mqtt.password", "");
        let (username, static_password) = if !static_username.is_empty() && !static_password.is_empty()
        {
            (static_username, Some(static_password))
        } else {
            let prefix = config.get_string("mqtt.usernamePrefix", "");
            (format!("{prefix}{device_id}"), None)
        };

        let token = TokenClient::from_config(config);
        if static_password.is_none() && token.is_none() {
            anyhow::bail!(
                "No MQTT credentials: configure mqtt.username/mqtt.password or auth.tokenUrl"
            );
        }

        let (client, eventloop) = AsyncClient::new(options, 10);
        let publisher = TrackedPublisher::new(client);
        let (state_tx, _) = watch::channel(ConnectionState::NotConnected);

        Ok(Arc::new(MqttConnection {
            topics: TopicSet::from_config(config, device_id),
            username,
            static_password,
            sw_version: config.get_string("device.swVersion", ""),
            puback_log_max: config.get_i64("mqtt.pubackLogCount", -1),
            state_tx,
            eventloop: Mutex::new(Some(eventloop)),
            publisher,
            mid,
            store,
            notifications,
            dispatcher,
            emitter,
            upload,
            token,
            stop: CancellationToken::new(),
        }))
    }

    pub fn publisher(&self) -> TrackedPublisher {
        self.publisher.clone()
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Graceful stop outside the shutdown path: broadcasts the teardown
    /// state, disconnects, and wakes any waiters.
    pub async fn stop_client(&self) {
        log::info!("Stopping the MQTT client");
        self.broadcast(ConnectionState::TearingDown);
        self.stop.cancel();
        let _ = self.publisher.client().disconnect().await;
    }

    pub async fn run(self: Arc<Self>, monitor: Arc<ShutdownMonitor>) {
        let signal = match monitor.register(SubscriberCode::Mqtt, None) {
            Ok(signal) => signal,
            Err(e) => {
                log::error!("MQTT worker registration failed: {e}");
                return;
            }
        };

        let mut eventloop = self
            .eventloop
            .lock()
            .expect("eventloop lock poisoned")
            .take()
            .expect("MQTT worker may only run once");

        match self.resolve_password(&signal).await {
            Some(password) => {
                eventloop
                    .mqtt_options
                    .set_credentials(self.username.clone(), password);
            }
            None => {
                log::info!("MQTT startup interrupted before credentials were available");
                self.broadcast(ConnectionState::TearingDown);
                let _ = monitor.ready_for_shutdown(SubscriberCode::Mqtt, None);
                let _ = monitor.unregister(SubscriberCode::Mqtt, None);
                return;
            }
        }

        let mut session = SessionCounters {
            expected_subacks: 0,
            acked_subacks: 0,
            pubacks_logged: 0,
            complete_announced: false,
        };
        let mut stopping = false;

        loop {
            tokio::select! {
                _ = signal.notified(), if !stopping => {
                    stopping = true;
                    self.broadcast(ConnectionState::TearingDown);
                    let _ = self.publisher.client().disconnect().await;
                }
                _ = self.stop.cancelled(), if !stopping => {
                    stopping = true;
                }
                polled = eventloop.poll() => {
                    match polled {
                        Ok(MqttEvent::Incoming(packet)) => {
                            self.process_incoming(packet, &mut session).await;
                        }
                        Ok(MqttEvent::Outgoing(outgoing)) => {
                            if self.process_outgoing(outgoing).await {
                                break;
                            }
                        }
                        Err(e) => {
                            if stopping {
                                log::debug!("MQTT error while stopping: {e:?}");
                                break;
                            }
                            self.on_connection_error(e, &mut eventloop, &signal).await;
                            if signal.is_notified() || self.stop.is_cancelled() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.publisher.clear_claims().await;
        let _ = monitor.ready_for_shutdown(SubscriberCode::Mqtt, None);
        let _ = monitor.unregister(SubscriberCode::Mqtt, None);
    }

    /// Static password when configured, otherwise a token from the token
    /// manager fetched with exponential backoff.
    async fn resolve_password(&self, signal: &ShutdownSignal) -> Option<String> {
        if let Some(password) = &self.static_password {
            return Some(password.clone());
        }
        let token = self.token.as_ref().expect("checked at construction");
        token.token_with_backoff(signal, &self.stop).await
    }

    async fn process_incoming(&self, packet: Packet, session: &mut SessionCounters) {
        log::trace!("Received = {packet:?}");
        match packet {
            Packet::ConnAck(ack) => self.on_connack(ack, session).await,
            Packet::SubAck(ack) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| *code == SubscribeReasonCode::Failure)
                {
                    log::warn!("Broker rejected some topic subscriptions");
                }
                session.acked_subacks += ack.return_codes.len();
                log::info!(
                    "Subscriptions acknowledged {}/{}",
                    session.acked_subacks,
                    session.expected_subacks
                );
                if session.expected_subacks > 0
                    && session.acked_subacks >= session.expected_subacks
                    && !session.complete_announced
                {
                    session.complete_announced = true;
                    self.broadcast(ConnectionState::Complete);
                    // one alerts sweep as soon as the session is usable
                    self.upload.trigger_alert_upload();
                }
            }
            Packet::PubAck(ack) => {
                self.log_puback(ack.pkid, session);
                self.mid.process_published_mid(ack.pkid);
            }
            Packet::Publish(publish) => self.on_publish(publish),
            _ => {}
        }
    }

    async fn on_connack(&self, ack: ConnAck, session: &mut SessionCounters) {
        if ack.code != ConnectReturnCode::Success {
            // refusals surface through the poll error path
            log::error!("CONNACK with unexpected code {:?}", ack.code);
            return;
        }

        session.reset();
        self.broadcast(ConnectionState::SubscriptionsPending);

        log::debug!("Resetting publish bookkeeping after (re)connect");
        self.mid.init_mid().await;

        let subscriptions = self.topics.subscriptions();
        session.expected_subacks = subscriptions.len();
        let filters: Vec<SubscribeFilter> = subscriptions
            .into_iter()
            .map(|(path, qos)| SubscribeFilter { path, qos })
            .collect();
        for filter in &filters {
            log::info!("Subscribing to {}", filter.path);
        }
        if let Err(e) = self.publisher.client().subscribe_many(filters).await {
            log::error!("Unable to queue topic subscriptions: {e}");
        }

        self.check_firmware_version().await;
    }

    /// The first N publish acknowledgements per session are logged loudly;
    /// alert acknowledgements always are.
    fn log_puback(&self, pkid: u16, session: &mut SessionCounters) {
        if self.mid.get_table_of_published_mid(pkid) == Some(StoreTable::Alerts) {
            log::info!("PUBACK mid[{pkid}] (alert)");
        } else if self.puback_log_max < 0 || session.pubacks_logged < self.puback_log_max {
            session.pubacks_logged += 1;
            log::info!("PUBACK mid[{pkid}]");
        } else {
            log::debug!("PUBACK mid[{pkid}]");
        }
    }

    fn on_publish(&self, publish: Publish) {
        let payload = String::from_utf8_lossy(&publish.payload).into_owned();
        log::info!("Incoming publish on {} ({} bytes)", publish.topic, payload.len());

        if serde_json::from_str::<serde_json::Value>(&payload).is_err() {
            log::error!("Incoming publish payload is not valid JSON, ignoring");
            return;
        }

        let mut event = Event::new("1.0", "MQTTConfig");
        event.add_field("payload", payload.clone());

        let wrapped = json!({
            "type": "MQTT_CONFIG_REQUEST",
            "message": payload,
            "topic": publish.topic,
        });
        self.notifications.push_notification(wrapped.to_string());
        self.emitter.emit(event);
    }

    /// Returns true when the loop should end.
    async fn process_outgoing(&self, outgoing: Outgoing) -> bool {
        log::trace!("Sending = {outgoing:?}");
        match outgoing {
            Outgoing::Publish(pkid) => {
                match self.publisher.pop_claim().await {
                    Some(claim) => {
                        if let Err(e) = self
                            .store
                            .assign_mid(claim.table, &claim.row_ids, pkid as i64)
                            .await
                        {
                            log::error!("Unable to stamp rows for mid {pkid}: {e}");
                        }
                        self.mid.set_mid_table(pkid, claim.table);
                    }
                    None => log::debug!("Outgoing publish {pkid} without a claim"),
                }
                false
            }
            Outgoing::Disconnect => {
                log::debug!("Disconnect packet sent, MQTT loop ending");
                true
            }
            _ => false,
        }
    }

    async fn on_connection_error(
        &self,
        error: ConnectionError,
        eventloop: &mut rumqttc::EventLoop,
        signal: &ShutdownSignal,
    ) {
        self.broadcast(ConnectionState::NotConnected);

        if let ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized,
        ) = &error
        {
            log::warn!("Broker rejected the credentials ({error:?}), refreshing the token");
            if let Some(token) = &self.token {
                token.invalidate();
                if let Some(fresh) = token.token_with_backoff(signal, &self.stop).await {
                    eventloop
                        .mqtt_options
                        .set_credentials(self.username.clone(), fresh);
                }
            }
            return;
        }

        log::debug!("Error in MQTT: {error:?}, backing off before the next attempt");
        tokio::select! {
            _ = signal.notified() => {}
            _ = tokio::time::sleep(SELF_HEAL_BACKOFF) => {}
        }
    }

    /// Emits a `FirmwareVersion` event when the persisted version differs
    /// from the running software version.
    async fn check_firmware_version(&self) {
        if self.sw_version.is_empty() {
            return;
        }
        let persisted = self
            .store
            .sqlite()
            .setting_get(DISPLAY_VERSION_SETTING)
            .await
            .unwrap_or(None)
            .unwrap_or_default();

        if persisted != self.sw_version {
            log::info!(
                "Software version changed ({persisted:?} -> {:?})",
                self.sw_version
            );
            let mut event = Event::new("1.0", "FirmwareVersion");
            event.add_field("value", self.sw_version.clone());
            self.emitter.emit(event);
            if let Err(e) = self
                .store
                .sqlite()
                .setting_set(DISPLAY_VERSION_SETTING, &self.sw_version)
                .await
            {
                log::error!("Unable to persist the software version: {e}");
            }
        }
    }

    fn broadcast(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            log::info!("MQTT connection state: {state:?}");
            self.dispatcher
                .handle_notification(CONNECTION_STATE_DOMAIN, &json!({ "status": state.code() }));
        } else {
            log::debug!("State {state:?} broadcast already, not sending again");
        }
    }
}
