//! Bookkeeping for in-flight publishes: maps each publish id to the table
//! whose rows it claimed and reconciles PUBACKs into row deletions. A PUBACK
//! may arrive before the ingress side registers the mapping; the
//! published-but-unclaimed set makes the two operations commute.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::lifecycle::{ShutdownMonitor, SubscriberCode};
use crate::persistence::{EventStore, StoreTable};

#[derive(Default)]
struct MidState {
    table_by_mid: HashMap<u16, StoreTable>,
    published_unclaimed: HashSet<u16>,
}

pub struct MidTracker {
    state: Mutex<MidState>,
    delete_tx: mpsc::UnboundedSender<(u16, StoreTable)>,
    delete_rx: Mutex<Option<mpsc::UnboundedReceiver<(u16, StoreTable)>>>,
    store: Arc<EventStore>,
}

impl MidTracker {
    pub fn new(store: Arc<EventStore>) -> Arc<MidTracker> {
        let (delete_tx, delete_rx) = mpsc::unbounded_channel();
        Arc::new(MidTracker {
            state: Mutex::new(MidState::default()),
            delete_tx,
            delete_rx: Mutex::new(Some(delete_rx)),
            store,
        })
    }

    /// Run on every (re)connect: schedules deletes for acknowledgements that
    /// raced ahead of their mapping, empties both in-memory structures, and
    /// zeroes the mid column of every row so nothing stays locked out of the
    /// next upload cycle.
    pub async fn init_mid(&self) {
        {
            let mut state = self.state.lock().expect("mid state lock poisoned");
            log::info!(
                "Resetting publish bookkeeping: {} mapped, {} unclaimed",
                state.table_by_mid.len(),
                state.published_unclaimed.len()
            );

            let acked: Vec<u16> = state.published_unclaimed.iter().copied().collect();
            for mid in acked {
                if let Some(table) = state.table_by_mid.get(&mid).copied() {
                    log::info!("Clearing acknowledged mid {mid} from {table}");
                    self.schedule_delete(mid, table);
                }
            }

            state.published_unclaimed.clear();
            state.table_by_mid.clear();
        }

        if let Err(e) = self.store.clear_all_mids().await {
            log::error!("Unable to reset mids in the store: {e}");
        }
    }

    /// Records that publish `mid` claims rows in `table`. If the PUBACK beat
    /// us here, the delete is scheduled right away and no mapping is kept.
    pub fn set_mid_table(&self, mid: u16, table: StoreTable) {
        let mut state = self.state.lock().expect("mid state lock poisoned");
        if state.published_unclaimed.remove(&mid) {
            log::debug!("PUBACK for {mid} arrived before its mapping, deleting now");
            self.schedule_delete(mid, table);
        } else {
            state.table_by_mid.insert(mid, table);
        }
    }

    /// Called from the publish acknowledgement path; never blocks on I/O.
    pub fn process_published_mid(&self, mid: u16) {
        let mut state = self.state.lock().expect("mid state lock poisoned");
        if let Some(table) = state.table_by_mid.remove(&mid) {
            self.schedule_delete(mid, table);
        } else {
            state.published_unclaimed.insert(mid);
        }
    }

    pub fn get_table_of_published_mid(&self, mid: u16) -> Option<StoreTable> {
        self.state
            .lock()
            .expect("mid state lock poisoned")
            .table_by_mid
            .get(&mid)
            .copied()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        let state = self.state.lock().expect("mid state lock poisoned");
        state.table_by_mid.is_empty() && state.published_unclaimed.is_empty()
    }

    fn schedule_delete(&self, mid: u16, table: StoreTable) {
        if self.delete_tx.send((mid, table)).is_err() {
            log::error!("Mid deleter is gone, cannot settle mid {mid} in {table}");
        }
    }

    /// Deleter worker: drains scheduled deletions into the store so the
    /// acknowledgement path never touches the database.
    pub async fn run(self: Arc<Self>, monitor: Arc<ShutdownMonitor>) {
        let signal = match monitor.register(SubscriberCode::MidTracker, None) {
            Ok(signal) => signal,
            Err(e) => {
                log::error!("Mid deleter registration failed: {e}");
                return;
            }
        };

        let mut delete_rx = self
            .delete_rx
            .lock()
            .expect("mid deleter receiver lock poisoned")
            .take()
            .expect("mid deleter may only run once");

        loop {
            tokio::select! {
                _ = signal.notified() => break,
                received = delete_rx.recv() => {
                    match received {
                        Some((mid, table)) => self.delete(mid, table).await,
                        None => break,
                    }
                }
            }
        }

        // settle whatever is already scheduled before acking
        while let Ok((mid, table)) = delete_rx.try_recv() {
            self.delete(mid, table).await;
        }

        let _ = monitor.ready_for_shutdown(SubscriberCode::MidTracker, None);
        let _ = monitor.unregister(SubscriberCode::MidTracker, None);
    }

    async fn delete(&self, mid: u16, table: StoreTable) {
        log::debug!("Deleting rows for mid {mid} from {table}");
        if let Err(e) = self.store.delete_by_mid(table, mid as i64).await {
            log::error!("Unable to delete rows for mid {mid} from {table}: {e}");
        }
    }
}
