//! Bus subscriber feeding inbound producer events into the staging queue.
//! While ingestion is suspended (init, teardown) events are dropped, but any
//! attachments they reference are removed from the staging area first.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{BusSubscriber, Frame};
use crate::config::Config;
use crate::event::Event;
use crate::ingest::StagingQueue;

pub struct EventReceiver {
    queue: Arc<StagingQueue>,
    suspended: AtomicBool,
    attachment_dir: PathBuf,
}

impl EventReceiver {
    pub fn new(queue: Arc<StagingQueue>, config: &Config, suspended: bool) -> Arc<EventReceiver> {
        Arc::new(EventReceiver {
            queue,
            suspended: AtomicBool::new(suspended),
            attachment_dir: PathBuf::from(config.get_string("ingest.attachmentPath", "/tmp")),
        })
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    fn discard(&self, serialized: &str) {
        log::debug!("Ingestion suspended, ignoring event: {serialized}");
        let event = match Event::from_json(serialized) {
            Ok(event) => event,
            Err(_) => return,
        };
        for attachment in event.attachments.iter().flatten() {
            let path = self.attachment_dir.join(attachment);
            if let Err(e) = std::fs::remove_file(&path) {
                log::debug!("Unable to remove rejected attachment {path:?}: {e}");
            }
        }
    }
}

#[async_trait]
impl BusSubscriber for EventReceiver {
    async fn handle(&self, message: &Frame) -> Option<Vec<u8>> {
        let serialized = message.payload_str();
        if self.is_suspended() {
            self.discard(&serialized);
        } else {
            self.queue.send(serialized.into_owned());
        }
        None
    }
}
