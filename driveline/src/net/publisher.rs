//! Publish-id tracking. The MQTT library assigns packet ids inside its event
//! loop, so each tracked publish pushes a claim describing the rows it
//! carries; the event loop pops claims as it observes outgoing publishes.
//! The claim queue is locked across the publish enqueue, which makes claim
//! order equal packet-id assignment order.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, QoS};
use tokio::sync::Mutex;

use crate::persistence::StoreTable;

#[derive(Debug, Clone, PartialEq)]
pub struct PublishClaim {
    pub table: StoreTable,
    pub row_ids: Vec<i64>,
}

#[derive(Clone)]
pub struct TrackedPublisher {
    client: AsyncClient,
    pending: Arc<Mutex<VecDeque<PublishClaim>>>,
}

impl TrackedPublisher {
    pub fn new(client: AsyncClient) -> TrackedPublisher {
        TrackedPublisher {
            client,
            pending: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    /// Publishes a payload whose acknowledgement settles the given rows. The
    /// claim is withdrawn again if the publish never reaches the request
    /// queue.
    pub async fn publish_tracked(
        &self,
        topic: &str,
        qos: QoS,
        payload: Vec<u8>,
        claim: PublishClaim,
    ) -> Result<()> {
        let mut pending = self.pending.lock().await;
        pending.push_back(claim);

        match self.client.publish(topic, qos, false, payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                pending.pop_back();
                Err(e).context("MQTT publish was not accepted")
            }
        }
    }

    /// Called by the event loop when it sees an outgoing publish; yields the
    /// oldest claim, which corresponds to the packet id just assigned.
    pub(crate) async fn pop_claim(&self) -> Option<PublishClaim> {
        self.pending.lock().await.pop_front()
    }

    /// Claims whose publishes never left (connection torn down between
    /// enqueue and processing) must not leak into the next session.
    pub(crate) async fn clear_claims(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            log::debug!("Discarding {} unprocessed publish claims", pending.len());
            pending.clear();
        }
    }
}
