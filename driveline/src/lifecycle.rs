use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Shutdown subscribers known ahead of time, one per component worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriberCode {
    Bus,
    Ingest,
    Store,
    Dispatch,
    Mqtt,
    Upload,
    MidTracker,
    Notify,
    /// Ad-hoc subscribers, keyed by name.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriberState {
    Subscribed,
    Notified,
    ShutdownCompleted,
}

/// Handed to a registered worker; resolves when the worker is asked to shut
/// down. The worker finishes its in-flight unit of work and then calls
/// [`ShutdownMonitor::ready_for_shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub async fn notified(&self) {
        self.token.cancelled().await;
    }

    pub fn is_notified(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("subscriber is already registered")]
    Duplicate,
    #[error("subscriber is not registered")]
    Absent,
    #[error("registration is closed once shutdown has begun")]
    ShutdownInProgress,
    #[error("ad-hoc subscribers must provide a name")]
    MissingName,
}

struct Registration {
    token: CancellationToken,
    state: SubscriberState,
}

#[derive(Default)]
struct Inner {
    registered: HashMap<SubscriberCode, Registration>,
    named: HashMap<String, Registration>,
    shutdown_begun: bool,
}

/// Process-wide lifecycle authority: an orderly, ordered, observed shutdown
/// across registered subscribers with two-phase acknowledgement.
///
/// `begin_shutdown` walks the notification order bucket by bucket, cancelling
/// each subscriber's token and waiting until everyone in the bucket reports
/// `ready_for_shutdown` (or the bucket deadline passes). Ad-hoc subscribers
/// are driven as a final bucket.
pub struct ShutdownMonitor {
    inner: Mutex<Inner>,
    state_changed: Notify,
    order: BTreeMap<u8, Vec<SubscriberCode>>,
}

impl ShutdownMonitor {
    pub fn new() -> Arc<ShutdownMonitor> {
        Arc::new(ShutdownMonitor {
            inner: Mutex::new(Inner::default()),
            state_changed: Notify::new(),
            order: default_notification_order(),
        })
    }

    pub fn with_order(order: BTreeMap<u8, Vec<SubscriberCode>>) -> Arc<ShutdownMonitor> {
        Arc::new(ShutdownMonitor {
            inner: Mutex::new(Inner::default()),
            state_changed: Notify::new(),
            order,
        })
    }

    pub fn register(
        &self,
        code: SubscriberCode,
        name: Option<&str>,
    ) -> Result<ShutdownSignal, LifecycleError> {
        let mut inner = self.inner.lock().expect("lifecycle lock poisoned");
        if inner.shutdown_begun {
            return Err(LifecycleError::ShutdownInProgress);
        }

        let token = CancellationToken::new();
        let registration = Registration {
            token: token.clone(),
            state: SubscriberState::Subscribed,
        };

        if code == SubscriberCode::Other {
            let name = name.ok_or(LifecycleError::MissingName)?;
            if inner.named.contains_key(name) {
                return Err(LifecycleError::Duplicate);
            }
            inner.named.insert(name.to_owned(), registration);
        } else {
            if inner.registered.contains_key(&code) {
                return Err(LifecycleError::Duplicate);
            }
            inner.registered.insert(code, registration);
        }

        log::debug!("Registered shutdown subscriber {code:?} ({name:?})");
        Ok(ShutdownSignal { token })
    }

    pub fn unregister(&self, code: SubscriberCode, name: Option<&str>) -> Result<(), LifecycleError> {
        let mut inner = self.inner.lock().expect("lifecycle lock poisoned");
        let removed = if code == SubscriberCode::Other {
            let name = name.ok_or(LifecycleError::MissingName)?;
            inner.named.remove(name).is_some()
        } else {
            inner.registered.remove(&code).is_some()
        };
        drop(inner);

        if removed {
            self.state_changed.notify_one();
            Ok(())
        } else {
            Err(LifecycleError::Absent)
        }
    }

    /// Second phase of the handshake: the subscriber has finished its
    /// in-flight work and may be left behind.
    pub fn ready_for_shutdown(
        &self,
        code: SubscriberCode,
        name: Option<&str>,
    ) -> Result<(), LifecycleError> {
        let mut inner = self.inner.lock().expect("lifecycle lock poisoned");
        let registration = if code == SubscriberCode::Other {
            let name = name.ok_or(LifecycleError::MissingName)?;
            inner.named.get_mut(name)
        } else {
            inner.registered.get_mut(&code)
        };

        match registration {
            Some(registration) => {
                registration.state = SubscriberState::ShutdownCompleted;
                drop(inner);
                log::debug!("Shutdown completed by {code:?} ({name:?})");
                self.state_changed.notify_one();
                Ok(())
            }
            None => Err(LifecycleError::Absent),
        }
    }

    /// Drives the two-phase shutdown. Returns once every subscriber has
    /// acknowledged or its bucket deadline expired. Calling it again after it
    /// has begun is a no-op.
    pub async fn begin_shutdown(&self, bucket_deadline: Option<Duration>) {
        {
            let mut inner = self.inner.lock().expect("lifecycle lock poisoned");
            if inner.shutdown_begun {
                return;
            }
            inner.shutdown_begun = true;
        }

        for (priority, bucket) in &self.order {
            log::info!("Shutdown: notifying priority {priority} bucket {bucket:?}");
            self.notify_bucket(bucket);
            self.await_bucket(bucket, bucket_deadline).await;
        }

        // Ad-hoc subscribers form the final bucket.
        let names: Vec<String> = {
            let mut inner = self.inner.lock().expect("lifecycle lock poisoned");
            for registration in inner.named.values_mut() {
                if registration.state == SubscriberState::Subscribed {
                    registration.state = SubscriberState::Notified;
                    registration.token.cancel();
                }
            }
            inner.named.keys().cloned().collect()
        };
        if !names.is_empty() {
            log::info!("Shutdown: notifying ad-hoc subscribers {names:?}");
            self.await_named(bucket_deadline).await;
        }

        log::info!("Shutdown notification sequence finished");
    }

    fn notify_bucket(&self, bucket: &[SubscriberCode]) {
        let mut inner = self.inner.lock().expect("lifecycle lock poisoned");
        for code in bucket {
            if let Some(registration) = inner.registered.get_mut(code) {
                if registration.state == SubscriberState::Subscribed {
                    registration.state = SubscriberState::Notified;
                    registration.token.cancel();
                }
            }
        }
    }

    async fn await_bucket(&self, bucket: &[SubscriberCode], deadline: Option<Duration>) {
        let all_done = |inner: &Inner| {
            bucket.iter().all(|code| {
                inner
                    .registered
                    .get(code)
                    .map(|r| r.state == SubscriberState::ShutdownCompleted)
                    .unwrap_or(true)
            })
        };
        if !self.wait_until(all_done, deadline).await {
            let inner = self.inner.lock().expect("lifecycle lock poisoned");
            for code in bucket {
                if let Some(r) = inner.registered.get(code) {
                    if r.state != SubscriberState::ShutdownCompleted {
                        log::warn!("Subscriber {code:?} did not acknowledge shutdown in time; proceeding");
                    }
                }
            }
        }
    }

    async fn await_named(&self, deadline: Option<Duration>) {
        let all_done = |inner: &Inner| {
            inner
                .named
                .values()
                .all(|r| r.state == SubscriberState::ShutdownCompleted)
        };
        if !self.wait_until(all_done, deadline).await {
            let inner = self.inner.lock().expect("lifecycle lock poisoned");
            for (name, r) in &inner.named {
                if r.state != SubscriberState::ShutdownCompleted {
                    log::warn!("Subscriber {name:?} did not acknowledge shutdown in time; proceeding");
                }
            }
        }
    }

    /// Returns false if the deadline expired before the predicate held.
    async fn wait_until(&self, predicate: impl Fn(&Inner) -> bool, deadline: Option<Duration>) -> bool {
        let wait = async {
            loop {
                let notified = self.state_changed.notified();
                {
                    let inner = self.inner.lock().expect("lifecycle lock poisoned");
                    if predicate(&inner) {
                        return;
                    }
                }
                notified.await;
            }
        };
        match deadline {
            Some(deadline) => tokio::time::timeout(deadline, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }
}

/// Buckets are drained in ascending priority. The store goes last so earlier
/// components can still flush into it.
fn default_notification_order() -> BTreeMap<u8, Vec<SubscriberCode>> {
    BTreeMap::from([
        (1, vec![SubscriberCode::Bus, SubscriberCode::Ingest]),
        (2, vec![SubscriberCode::Dispatch, SubscriberCode::Notify]),
        (3, vec![SubscriberCode::Upload, SubscriberCode::Mqtt]),
        (4, vec![SubscriberCode::MidTracker]),
        (5, vec![SubscriberCode::Store]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_codes_are_rejected() {
        let monitor = ShutdownMonitor::new();
        monitor.register(SubscriberCode::Store, None).unwrap();
        assert_eq!(
            monitor.register(SubscriberCode::Store, None).unwrap_err(),
            LifecycleError::Duplicate
        );

        monitor
            .register(SubscriberCode::Other, Some("worker-a"))
            .unwrap();
        assert_eq!(
            monitor
                .register(SubscriberCode::Other, Some("worker-a"))
                .unwrap_err(),
            LifecycleError::Duplicate
        );
        assert_eq!(
            monitor.register(SubscriberCode::Other, None).unwrap_err(),
            LifecycleError::MissingName
        );
    }

    #[tokio::test]
    async fn two_phase_acknowledgement() {
        let monitor = ShutdownMonitor::new();
        let signal = monitor.register(SubscriberCode::Ingest, None).unwrap();

        let worker = tokio::spawn({
            let monitor = monitor.clone();
            async move {
                signal.notified().await;
                monitor
                    .ready_for_shutdown(SubscriberCode::Ingest, None)
                    .unwrap();
            }
        });

        monitor.begin_shutdown(Some(Duration::from_secs(5))).await;
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn deadline_bypasses_unresponsive_subscriber() {
        let monitor = ShutdownMonitor::new();
        let _held = monitor.register(SubscriberCode::Upload, None).unwrap();

        let started = std::time::Instant::now();
        monitor.begin_shutdown(Some(Duration::from_millis(50))).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn registration_rejected_after_shutdown() {
        let monitor = ShutdownMonitor::new();
        monitor.begin_shutdown(Some(Duration::from_millis(10))).await;
        assert_eq!(
            monitor.register(SubscriberCode::Bus, None).unwrap_err(),
            LifecycleError::ShutdownInProgress
        );
    }

    #[tokio::test]
    async fn begin_shutdown_is_idempotent() {
        let monitor = ShutdownMonitor::new();
        let signal = monitor.register(SubscriberCode::Notify, None).unwrap();
        monitor
            .ready_for_shutdown(SubscriberCode::Notify, None)
            .unwrap();
        monitor.begin_shutdown(Some(Duration::from_millis(50))).await;
        monitor.begin_shutdown(Some(Duration::from_millis(50))).await;
        assert!(signal.is_notified());
    }

    #[tokio::test]
    async fn buckets_complete_in_ascending_priority() {
        let order = BTreeMap::from([
            (1, vec![SubscriberCode::Bus]),
            (2, vec![SubscriberCode::Store]),
        ]);
        let monitor = ShutdownMonitor::with_order(order);
        let bus_signal = monitor.register(SubscriberCode::Bus, None).unwrap();
        let store_signal = monitor.register(SubscriberCode::Store, None).unwrap();

        let observer = tokio::spawn({
            let monitor = monitor.clone();
            async move {
                bus_signal.notified().await;
                // The store must not be notified until the bus has acked.
                assert!(!store_signal.is_notified());
                monitor.ready_for_shutdown(SubscriberCode::Bus, None).unwrap();
                store_signal.notified().await;
                monitor
                    .ready_for_shutdown(SubscriberCode::Store, None)
                    .unwrap();
            }
        });

        monitor.begin_shutdown(Some(Duration::from_secs(5))).await;
        observer.await.unwrap();
    }
}
