//! Per-event-id sampling of critical-level inflow logging. Every event id may
//! be logged in full a configured number of times per cycle; overflow drops to
//! debug level. Alert ids bypass sampling entirely.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::config::Config;

/// `-1` means unlimited, `0` suppresses critical logging.
pub const UNLIMITED: i64 = -1;
const MAX_CONFIGURED_COUNT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPolicy {
    IgnitionCycle,
    PowerCycle,
}

pub struct LogSampler {
    per_event: HashMap<String, i64>,
    default_count: i64,
    alerts: HashSet<String>,
    reset_policy: ResetPolicy,
    logged: HashMap<String, i64>,
}

impl LogSampler {
    pub fn from_config(config: &Config) -> LogSampler {
        let mut per_event = HashMap::new();
        if let Value::Array(entries) = config.get_json("logging.inflow.criticalEventCounts") {
            for entry in entries {
                if let Value::Object(map) = entry {
                    for (event_id, count) in map {
                        if let Some(count) = count.as_i64() {
                            per_event.insert(event_id, clamp_count(count));
                        }
                    }
                }
            }
        }

        let default_count = clamp_count(config.get_i64("logging.inflow.defaultCount", UNLIMITED));
        let alerts = config.get_string_list("mqtt.directAlerts").into_iter().collect();
        let reset_policy = match config.get_i64("logging.counterReset", 0) {
            1 => ResetPolicy::PowerCycle,
            _ => ResetPolicy::IgnitionCycle,
        };

        LogSampler {
            per_event,
            default_count,
            alerts,
            reset_policy,
            logged: HashMap::new(),
        }
    }

    /// Decides whether this occurrence is logged at critical level, counting
    /// it against the event's budget.
    pub fn should_log_critical(&mut self, event_id: &str) -> bool {
        if self.alerts.contains(event_id) {
            return true;
        }

        let max = *self.per_event.get(event_id).unwrap_or(&self.default_count);
        match max {
            UNLIMITED => true,
            0 => false,
            max => {
                let logged = self.logged.entry(event_id.to_owned()).or_insert(0);
                if *logged < max {
                    *logged += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.logged.clear();
    }

    pub fn reset_policy(&self) -> ResetPolicy {
        self.reset_policy
    }
}

fn clamp_count(count: i64) -> i64 {
    count.clamp(UNLIMITED, MAX_CONFIGURED_COUNT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sampler(tree: Value) -> LogSampler {
        LogSampler::from_config(&Config::from_value(tree))
    }

    #[test]
    fn configured_count_limits_critical_logging() {
        let mut sampler = sampler(json!({
            "logging": { "inflow": {
                "criticalEventCounts": [ { "Speed": 2 } ],
                "defaultCount": 0
            }}
        }));

        assert!(sampler.should_log_critical("Speed"));
        assert!(sampler.should_log_critical("Speed"));
        assert!(!sampler.should_log_critical("Speed"));
        // Unlisted ids fall back to the default, here 0 = suppressed.
        assert!(!sampler.should_log_critical("Odometer"));
    }

    #[test]
    fn negative_one_means_unlimited() {
        let mut sampler = sampler(json!({
            "logging": { "inflow": { "defaultCount": -1 } }
        }));
        for _ in 0..1000 {
            assert!(sampler.should_log_critical("Anything"));
        }
    }

    #[test]
    fn counts_are_clamped_into_range() {
        let mut sampler = sampler(json!({
            "logging": { "inflow": {
                "criticalEventCounts": [ { "Speed": 100000 }, { "Gear": -7 } ],
                "defaultCount": 3
            }}
        }));
        for _ in 0..MAX_CONFIGURED_COUNT {
            assert!(sampler.should_log_critical("Speed"));
        }
        assert!(!sampler.should_log_critical("Speed"));
        // Below -1 clamps to unlimited.
        for _ in 0..200 {
            assert!(sampler.should_log_critical("Gear"));
        }
    }

    #[test]
    fn alerts_bypass_sampling() {
        let mut sampler = sampler(json!({
            "logging": { "inflow": { "defaultCount": 0 } },
            "mqtt": { "directAlerts": ["CollisionWarning"] }
        }));
        for _ in 0..10 {
            assert!(sampler.should_log_critical("CollisionWarning"));
        }
    }

    #[test]
    fn reset_restores_budgets() {
        let mut sampler = sampler(json!({
            "logging": { "inflow": { "defaultCount": 1 } }
        }));
        assert!(sampler.should_log_critical("Speed"));
        assert!(!sampler.should_log_critical("Speed"));
        sampler.reset();
        assert!(sampler.should_log_critical("Speed"));
    }
}
