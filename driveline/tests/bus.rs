//! Exercises the control socket end to end: a producer-side sender framed
//! over a unix socket, the bus reactor, and the request/response handlers.

use std::sync::Arc;
use std::time::Duration;

use driveline::bus::sender::EventSender;
use driveline::bus::{
    BusAddress, ConfigRequestHandler, DeviceIdRequestHandler, MessageBus, MessageType,
};
use driveline::config::Config;
use driveline::ingest::{EventEmitter, StagingQueue};
use driveline::ingest::receiver::EventReceiver;
use driveline::lifecycle::ShutdownMonitor;
use driveline::Event;

use serde_json::json;

fn test_config(socket: &std::path::Path) -> Config {
    Config::from_value(json!({
        "bus": { "socketPath": socket.to_string_lossy() },
        "mqtt": { "host": "broker.example" },
        "device": { "id": "HU123" },
    }))
}

async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn producer_events_reach_the_staging_queue() {
    let socket = std::env::temp_dir().join(format!("driveline-bus-{}.sock", uuid::Uuid::new_v4()));
    let config = test_config(&socket);

    let queue = StagingQueue::from_config(&config);
    let receiver = EventReceiver::new(queue.clone(), &config, false);

    let address = BusAddress::from_config(&config);
    let mut bus = MessageBus::new(address.clone(), EventEmitter::new(queue.clone()));
    bus.subscribe(MessageType::Event, receiver);

    let monitor = ShutdownMonitor::new();
    let server = tokio::spawn(Arc::new(bus).serve(monitor.clone()));

    wait_until(|| socket.exists()).await;

    let sender = EventSender::connect(&address).await.unwrap();
    let mut event = Event::new("1.0", "Speed");
    event.add_field("v", 70);
    sender.send_event(&event).await.unwrap();

    wait_until(|| queue.accepted_count() == 1).await;

    monitor.begin_shutdown(Some(Duration::from_secs(2))).await;
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn config_and_device_id_requests_are_answered() {
    let socket = std::env::temp_dir().join(format!("driveline-bus-{}.sock", uuid::Uuid::new_v4()));
    let config = test_config(&socket);

    let queue = StagingQueue::from_config(&config);
    let address = BusAddress::from_config(&config);
    let mut bus = MessageBus::new(address.clone(), EventEmitter::new(queue));
    bus.subscribe(
        MessageType::GetConfig,
        Arc::new(ConfigRequestHandler::new(config.clone())),
    );
    bus.subscribe(
        MessageType::GetDeviceId,
        Arc::new(DeviceIdRequestHandler::new("HU123".to_owned())),
    );

    let monitor = ShutdownMonitor::new();
    let server = tokio::spawn(Arc::new(bus).serve(monitor.clone()));
    wait_until(|| socket.exists()).await;

    let sender = EventSender::connect(&address).await.unwrap();
    assert_eq!(sender.get_config("mqtt.host").await.unwrap(), "broker.example");
    assert_eq!(sender.get_device_id().await.unwrap(), "HU123");
    // a key that resolves to nothing yields an empty string value
    assert_eq!(sender.get_config("no.such.key").await.unwrap(), "");

    monitor.begin_shutdown(Some(Duration::from_secs(2))).await;
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn reply_required_without_handler_gets_an_empty_reply() {
    let socket = std::env::temp_dir().join(format!("driveline-bus-{}.sock", uuid::Uuid::new_v4()));
    let config = test_config(&socket);

    let queue = StagingQueue::from_config(&config);
    let address = BusAddress::from_config(&config);
    // no GetDeviceId subscriber registered on purpose
    let bus = MessageBus::new(address.clone(), EventEmitter::new(queue));

    let monitor = ShutdownMonitor::new();
    let server = tokio::spawn(Arc::new(bus).serve(monitor.clone()));
    wait_until(|| socket.exists()).await;

    let sender = EventSender::connect(&address).await.unwrap();
    assert_eq!(sender.get_device_id().await.unwrap(), "");

    monitor.begin_shutdown(Some(Duration::from_secs(2))).await;
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_emits_the_lifecycle_event() {
    let socket = std::env::temp_dir().join(format!("driveline-bus-{}.sock", uuid::Uuid::new_v4()));
    let config = test_config(&socket);

    let queue = StagingQueue::from_config(&config);
    let address = BusAddress::from_config(&config);
    let bus = MessageBus::new(address, EventEmitter::new(queue.clone()));

    let monitor = ShutdownMonitor::new();
    let server = tokio::spawn(Arc::new(bus).serve(monitor.clone()));
    wait_until(|| socket.exists()).await;

    monitor.begin_shutdown(Some(Duration::from_secs(2))).await;
    server.await.unwrap().unwrap();

    // the reactor announced the shutdown into the pipeline on its way out
    assert_eq!(queue.accepted_count(), 1);
    assert!(!socket.exists());
}
