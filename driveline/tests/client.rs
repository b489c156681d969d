//! Boots the full client from a config file, feeds it events both in-process
//! and over the control socket, and shuts it down in order. The broker is
//! unreachable on purpose; everything up to the upload hop must still work.

use std::time::Duration;

use driveline::bus::sender::EventSender;
use driveline::{ClientBuilder, ConnectionState, Event, SendOutcome};

use serde_json::json;

fn write_config(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir();
    let db_path = dir.join(format!("driveline-client-{tag}.db"));
    let socket = dir.join(format!("driveline-client-{tag}.sock"));
    let config_path = dir.join(format!("driveline-client-{tag}.json"));

    let config = json!({
        "device": { "id": "HU-TEST-1", "swVersion": "2.5.1" },
        "store": { "dbPath": db_path.to_string_lossy() },
        "bus": { "socketPath": socket.to_string_lossy() },
        "mqtt": {
            "host": "127.0.0.1",
            "port": 1,
            "ssl": { "useTls": false },
            "username": "device",
            "password": "secret"
        },
        "ingest": {
            "whitelistedEvents": ["Speed"],
            "timestamp": { "minValidMs": 1 }
        },
        "upload": { "eventPeriodicity": 3600 }
    });
    std::fs::write(&config_path, config.to_string()).unwrap();
    config_path
}

fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("condition not reached within 5s");
}

#[test]
fn client_boots_ingests_and_shuts_down() {
    let tag = uuid::Uuid::new_v4().to_string();
    let config_path = write_config(&tag);

    let client = ClientBuilder::new(&config_path).build().unwrap();
    assert_eq!(client.device_id(), "HU-TEST-1");
    assert_ne!(client.connection_state(), ConnectionState::Complete);

    // in-process path
    let mut event = Event::new("1.0", "Speed");
    event.add_field("v", 70);
    assert_eq!(client.send_event(&event), SendOutcome::Accepted);
    wait_until(|| client.pending_event_count().unwrap() >= 1);

    // socket path, plus the request/response types
    let bus_address = client.bus_address().clone();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let sender = EventSender::connect(&bus_address).await.unwrap();
        assert_eq!(sender.get_device_id().await.unwrap(), "HU-TEST-1");
        assert_eq!(
            sender.get_config("upload.eventPeriodicity").await.unwrap(),
            "3600"
        );

        let mut event = Event::new("1.0", "Odometer");
        event.add_field("v", 140);
        sender.send_event(&event).await.unwrap();
    });
    wait_until(|| client.pending_event_count().unwrap() >= 2);

    // runtime overrides persist through the settings store
    client
        .apply_config_override("upload.eventPeriodicity", "120")
        .unwrap();
    assert_eq!(client.config().get_i64("upload.eventPeriodicity", 0), 120);

    client.shutdown();
}

#[test]
fn overrides_and_activation_survive_restart() {
    let tag = uuid::Uuid::new_v4().to_string();
    let config_path = write_config(&tag);

    {
        let client = ClientBuilder::new(&config_path).build().unwrap();
        client.set_activated(true).unwrap();
        client
            .apply_config_override("upload.eventPeriodicity", "120")
            .unwrap();
        client.shutdown();
    }

    // same database file, fresh process: the persisted override is applied
    // before any component reads the tree
    let client = ClientBuilder::new(&config_path).build().unwrap();
    assert_eq!(client.config().get_i64("upload.eventPeriodicity", 0), 120);
    client.shutdown();
}
