//! Framed control socket shared by the client and its co-resident producers.
//!
//! The server accepts up to [`MAX_CLIENTS`] concurrent connections and routes
//! each inbound frame to every subscriber registered for its message type, in
//! registration order. A frame that requires a reply and finds no handler is
//! answered with an empty reply so the producer never blocks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::config::Config;
use crate::event::Event;
use crate::ingest::EventEmitter;
use crate::lifecycle::{ShutdownMonitor, SubscriberCode};

pub mod frame;
pub mod sender;

pub use frame::{Frame, FrameError, MessageType, MAX_PAYLOAD_LEN};

/// Upper bound on concurrently connected producer sockets.
pub const MAX_CLIENTS: usize = 30;

const DEFAULT_SOCKET_PATH: &str = "/tmp/driveline.sock";

/// Where the bus listens; unix-domain by default, TCP when configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusAddress {
    Unix(PathBuf),
    Tcp(String, u16),
}

impl BusAddress {
    pub fn from_config(config: &Config) -> BusAddress {
        let host = config.get_string("bus.host", "");
        if !host.is_empty() {
            let port = config.get_i64("bus.port", 5150) as u16;
            return BusAddress::Tcp(host, port);
        }
        BusAddress::Unix(PathBuf::from(
            config.get_string("bus.socketPath", DEFAULT_SOCKET_PATH),
        ))
    }
}

/// A component interested in one message type on the bus. Returning a payload
/// answers the frame when the producer asked for a reply.
#[async_trait]
pub trait BusSubscriber: Send + Sync {
    async fn handle(&self, message: &Frame) -> Option<Vec<u8>>;
}

pub struct MessageBus {
    address: BusAddress,
    subscribers: Vec<(MessageType, Arc<dyn BusSubscriber>)>,
    emitter: EventEmitter,
}

impl MessageBus {
    pub fn new(address: BusAddress, emitter: EventEmitter) -> MessageBus {
        MessageBus {
            address,
            subscribers: Vec::new(),
            emitter,
        }
    }

    /// Registration happens at bootstrap, before `serve` starts; handlers are
    /// invoked in this order.
    pub fn subscribe(&mut self, msg_type: MessageType, handler: Arc<dyn BusSubscriber>) {
        log::debug!("Bus subscriber added for {msg_type:?}");
        self.subscribers.push((msg_type, handler));
    }

    /// Runs the accept loop until shutdown is notified. Partially read frames
    /// on open sockets are discarded when their connection tasks observe the
    /// shutdown signal.
    pub async fn serve(self: Arc<Self>, monitor: Arc<ShutdownMonitor>) -> Result<()> {
        let signal = monitor
            .register(SubscriberCode::Bus, None)
            .map_err(|e| anyhow::anyhow!("bus registration failed: {e}"))?;

        let listener = self.bind().await?;
        log::info!("Control bus listening on {:?}", self.address);

        let active = Arc::new(AtomicUsize::new(0));

        loop {
            tokio::select! {
                _ = signal.notified() => {
                    log::debug!("Bus reactor observed shutdown");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok(stream) => self.clone().start_connection(stream, &active, &signal),
                        Err(e) => log::error!("Bus accept failed: {e}"),
                    }
                }
            }
        }

        self.emitter.emit(Event::new("1.0", "shutDownInitiated"));
        if let BusAddress::Unix(path) = &self.address {
            let _ = std::fs::remove_file(path);
        }

        let _ = monitor.ready_for_shutdown(SubscriberCode::Bus, None);
        let _ = monitor.unregister(SubscriberCode::Bus, None);
        Ok(())
    }

    async fn bind(&self) -> Result<BusListener> {
        match &self.address {
            BusAddress::Unix(path) => {
                // Stale socket files from a previous run would fail the bind.
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)
                    .with_context(|| format!("Unable to bind control socket {path:?}"))?;
                Ok(BusListener::Unix(listener))
            }
            BusAddress::Tcp(host, port) => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .with_context(|| format!("Unable to bind control socket {host}:{port}"))?;
                Ok(BusListener::Tcp(listener))
            }
        }
    }

    fn start_connection(
        self: Arc<Self>,
        mut stream: BoxedStream,
        active: &Arc<AtomicUsize>,
        signal: &crate::lifecycle::ShutdownSignal,
    ) {
        if active.load(Ordering::Acquire) >= MAX_CLIENTS {
            log::warn!("Refusing producer connection: {MAX_CLIENTS} clients already connected");
            return;
        }
        active.fetch_add(1, Ordering::AcqRel);

        let active = active.clone();
        let signal = signal.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = signal.notified() => break,
                    frame = frame::read_frame(&mut stream) => frame,
                };

                match frame {
                    Ok(frame) => {
                        if let Err(e) = self.dispatch(&frame, &mut stream).await {
                            log::error!("Bus reply failed: {e}");
                            break;
                        }
                    }
                    Err(FrameError::Closed) => break,
                    Err(e) => {
                        log::warn!("Dropping producer connection: {e}");
                        break;
                    }
                }
            }
            active.fetch_sub(1, Ordering::AcqRel);
        });
    }

    async fn dispatch(&self, frame: &Frame, stream: &mut BoxedStream) -> Result<(), FrameError> {
        log::trace!(
            "Bus message type={:?} seq={} len={}",
            frame.msg_type,
            frame.seqnum,
            frame.payload.len()
        );

        let mut reply: Option<Vec<u8>> = None;
        let mut handled = false;
        for (msg_type, handler) in &self.subscribers {
            if *msg_type == frame.msg_type {
                handled = true;
                let response = handler.handle(frame).await;
                if reply.is_none() {
                    reply = response;
                }
            }
        }

        if !handled {
            log::trace!("No handler for bus message type {:?}", frame.msg_type);
        }

        if frame.reply_required {
            frame::write_reply(stream, frame, reply.as_deref().unwrap_or_default()).await?;
        }
        Ok(())
    }
}

enum BusListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl BusListener {
    async fn accept(&self) -> std::io::Result<BoxedStream> {
        match self {
            BusListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            BusListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

pub(crate) trait BusStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl BusStream for UnixStream {}
impl BusStream for TcpStream {}
pub(crate) type BoxedStream = Box<dyn BusStream>;

/// Answers `GET_CONFIG` frames with the string value at the requested dotted
/// path.
pub struct ConfigRequestHandler {
    config: Config,
}

impl ConfigRequestHandler {
    pub fn new(config: Config) -> ConfigRequestHandler {
        ConfigRequestHandler { config }
    }
}

#[async_trait]
impl BusSubscriber for ConfigRequestHandler {
    async fn handle(&self, message: &Frame) -> Option<Vec<u8>> {
        let key = message.payload_str();
        let value = match self.config.get_json(key.as_ref()) {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Some(value.into_bytes())
    }
}

/// Answers `GET_DEVICEID` frames with the device identity.
pub struct DeviceIdRequestHandler {
    device_id: String,
}

impl DeviceIdRequestHandler {
    pub fn new(device_id: String) -> DeviceIdRequestHandler {
        DeviceIdRequestHandler { device_id }
    }
}

#[async_trait]
impl BusSubscriber for DeviceIdRequestHandler {
    async fn handle(&self, _message: &Frame) -> Option<Vec<u8>> {
        Some(self.device_id.clone().into_bytes())
    }
}
