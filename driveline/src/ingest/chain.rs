//! The linear filter chain behind the staging queue: timestamp validation,
//! the activity/delay governor, session tracking, and the terminal sink. The
//! chain compiles to a straight call sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::event::Event;
use crate::persistence::EventStore;

const SESSION_STATUS_EVENT: &str = "SessionStatus";
const IGNITION_STATUS_EVENT: &str = "IgnStatus";
const STATE_FIELD: &str = "state";
const STATE_ON: &str = "on";
const STATE_OFF: &str = "off";

/// Accepts timestamps within `[min_valid, now + skew]`.
///
/// The predicate is pure so the non-whitelisted ingest path can reuse it
/// without running the chain.
#[derive(Debug, Clone)]
pub struct TimestampValidator {
    min_valid_ms: i64,
    max_skew_ms: i64,
}

impl TimestampValidator {
    pub fn from_config(config: &Config) -> TimestampValidator {
        TimestampValidator {
            // 2010-01-01; any producer clock before this is unset.
            min_valid_ms: config.get_i64("ingest.timestamp.minValidMs", 1_262_304_000_000),
            max_skew_ms: config.get_i64("ingest.timestamp.maxSkewMs", 5 * 60 * 1000),
        }
    }

    pub fn is_valid(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.min_valid_ms
            && timestamp_ms <= Utc::now().timestamp_millis() + self.max_skew_ms
    }
}

/// Session flag shared between the tracker (writer) and the governor and
/// uploader (readers).
#[derive(Debug, Default)]
pub struct ActivityState {
    session_in_progress: AtomicBool,
}

impl ActivityState {
    pub fn is_session_in_progress(&self) -> bool {
        self.session_in_progress.load(Ordering::Acquire)
    }

    fn set_session_in_progress(&self, value: bool) {
        self.session_in_progress.store(value, Ordering::Release);
    }
}

/// Computes how long the uploader should defer its next cycle based on
/// current activity.
#[derive(Clone)]
pub struct ActivityGovernor {
    state: Arc<ActivityState>,
    active_defer_secs: u64,
}

impl ActivityGovernor {
    pub fn new(state: Arc<ActivityState>, config: &Config) -> ActivityGovernor {
        ActivityGovernor {
            state,
            active_defer_secs: config.get_i64("upload.deferUploadSecs", 0).max(0) as u64,
        }
    }

    pub fn compute_defer_upload(&self) -> u64 {
        if self.state.is_session_in_progress() {
            self.active_defer_secs
        } else {
            0
        }
    }
}

/// Flips the session flag on `SessionStatus` events.
pub struct SessionTracker {
    state: Arc<ActivityState>,
}

impl SessionTracker {
    pub fn new(state: Arc<ActivityState>) -> SessionTracker {
        SessionTracker { state }
    }

    pub fn observe(&self, event: &Event) {
        if event.event_id != SESSION_STATUS_EVENT {
            return;
        }
        match event.data_str(STATE_FIELD) {
            Some(STATE_ON) => self.state.set_session_in_progress(true),
            Some(STATE_OFF) => self.state.set_session_in_progress(false),
            other => log::debug!("SessionStatus with unrecognized state {other:?}"),
        }
    }

    pub fn is_session_in_progress(&self) -> bool {
        self.state.is_session_in_progress()
    }
}

/// Terminal link of the chain. In stream mode events pass through the
/// dispatcher, which fans out to in-process handlers and forwards to the
/// store; in store-and-forward mode they go straight to the store.
pub enum ChainSink {
    Stream(Arc<Dispatcher>),
    StoreAndForward(Arc<EventStore>),
}

pub struct FilterChain {
    validator: TimestampValidator,
    tracker: SessionTracker,
    sink: ChainSink,
}

impl FilterChain {
    pub fn new(validator: TimestampValidator, tracker: SessionTracker, sink: ChainSink) -> FilterChain {
        FilterChain {
            validator,
            tracker,
            sink,
        }
    }

    pub fn validator(&self) -> &TimestampValidator {
        &self.validator
    }

    pub fn handle(&self, event: &Event, serialized: &str) {
        if !self.validator.is_valid(event.timestamp) {
            log::debug!(
                "Dropping {} with out-of-range timestamp {}",
                event.event_id,
                event.timestamp
            );
            return;
        }

        self.tracker.observe(event);

        match &self.sink {
            ChainSink::Stream(dispatcher) => dispatcher.handle_event(event, serialized),
            ChainSink::StoreAndForward(store) => {
                store.handle_event(event, serialized);
            }
        }
    }
}

/// `IgnStatus: off` marks the end of an ignition cycle; the log samplers key
/// their reset off it.
pub fn is_ignition_off(event: &Event) -> bool {
    event.event_id == IGNITION_STATUS_EVENT && event.data_str(STATE_FIELD) == Some(STATE_OFF)
}
