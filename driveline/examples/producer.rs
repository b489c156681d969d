//! Sends a burst of sample events to a running client over the control
//! socket, then queries it back for its device identity.

use driveline::bus::sender::EventSender;
use driveline::bus::BusAddress;
use driveline::Event;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let socket = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/driveline.sock".to_owned());

    let sender = EventSender::connect(&BusAddress::Unix(socket.into())).await?;
    println!("connected to device {}", sender.get_device_id().await?);

    for step in 0..10 {
        let mut event = Event::new("1.0", "Speed");
        event.add_field("v", 60 + step);
        sender.send_event(&event).await?;
    }
    println!("sent 10 events");

    Ok(())
}
