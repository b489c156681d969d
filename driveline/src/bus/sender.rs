//! Producer-side client for the control socket. Co-resident event producers
//! link this to hand events to the pipeline and to query the client over the
//! request/response types.

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{bail, Context, Result};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;

use super::frame::{self, Frame, MessageType};
use super::{BoxedStream, BusAddress};
use crate::event::Event;

pub struct EventSender {
    stream: Mutex<BoxedStream>,
    seqnum: AtomicU32,
}

impl EventSender {
    pub async fn connect(address: &BusAddress) -> Result<EventSender> {
        let stream: BoxedStream = match address {
            BusAddress::Unix(path) => Box::new(
                UnixStream::connect(path)
                    .await
                    .with_context(|| format!("Unable to connect to control socket {path:?}"))?,
            ),
            BusAddress::Tcp(host, port) => Box::new(
                TcpStream::connect((host.as_str(), *port))
                    .await
                    .with_context(|| format!("Unable to connect to control socket {host}:{port}"))?,
            ),
        };

        Ok(EventSender {
            stream: Mutex::new(stream),
            seqnum: AtomicU32::new(1),
        })
    }

    pub async fn send_event(&self, event: &Event) -> Result<()> {
        self.send_serialized(&event.to_json()).await
    }

    pub async fn send_serialized(&self, serialized: &str) -> Result<()> {
        let frame = Frame {
            msg_type: MessageType::Event,
            reply_required: false,
            seqnum: self.next_seqnum(),
            reply_to: 0,
            payload: serialized.as_bytes().to_vec(),
        };
        let mut stream = self.stream.lock().await;
        frame::write_frame(&mut *stream, &frame).await?;
        Ok(())
    }

    pub async fn get_config(&self, dotted_key: &str) -> Result<String> {
        let reply = self
            .request(MessageType::GetConfig, dotted_key.as_bytes())
            .await?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    pub async fn get_device_id(&self) -> Result<String> {
        let reply = self.request(MessageType::GetDeviceId, &[]).await?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    async fn request(&self, msg_type: MessageType, payload: &[u8]) -> Result<Vec<u8>> {
        let seqnum = self.next_seqnum();
        let frame = Frame {
            msg_type,
            reply_required: true,
            seqnum,
            reply_to: 0,
            payload: payload.to_vec(),
        };

        let mut stream = self.stream.lock().await;
        frame::write_frame(&mut *stream, &frame).await?;
        let reply = frame::read_frame(&mut *stream).await?;
        if reply.seqnum != seqnum {
            bail!(
                "Control socket reply out of sequence: expected {seqnum}, got {}",
                reply.seqnum
            );
        }
        Ok(reply.payload)
    }

    fn next_seqnum(&self) -> u32 {
        self.seqnum.fetch_add(1, Ordering::Relaxed)
    }
}
