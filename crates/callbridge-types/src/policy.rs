//! Call admission policy.

use serde::{Deserialize, Serialize};

/// Limits that bound how often calls may be placed and reports submitted.
///
/// Loaded from the `[policy]` section of the server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallPolicy {
    /// Maximum calls placed system-wide within any trailing hour.
    pub max_calls_per_hour: usize,
    /// Maximum calls placed system-wide within any trailing minute.
    pub max_calls_per_minute: usize,
    /// Minimum time between two calls of the same session, in milliseconds.
    pub session_cooldown_ms: u64,
    /// Maximum calls a single session may place over its lifetime.
    pub max_calls_per_session: u32,
    /// Report submissions allowed per caller identity per intake window.
    pub intake_max_requests: u32,
    /// Length of the intake rate-limit window, in milliseconds.
    pub intake_window_ms: u64,
    /// Interval of the rate-limit bucket sweep, in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            max_calls_per_hour: 10,
            max_calls_per_minute: 3,
            session_cooldown_ms: 30_000,
            max_calls_per_session: 1,
            intake_max_requests: 3,
            intake_window_ms: 60_000,
            sweep_interval_ms: 60_000,
        }
    }
}
