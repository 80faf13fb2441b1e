//! Fixed-window request limiter for the report intake.

use crate::{lock_or_recover, unix_millis};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Outcome of a single rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Unix milliseconds at which the current window closes.
    pub reset_time_ms: u64,
    pub limit: u32,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, rounded up and never below one.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        crate::millis_to_retry_secs(self.reset_time_ms.saturating_sub(now_ms))
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_time_ms: u64,
}

/// In-memory rate limiter state.
///
/// Counts are kept per `"{identifier}:{bucket}"` where the bucket is
/// `now / window`, so every identifier shares the same window boundaries.
#[derive(Clone, Debug, Default)]
pub struct RateLimiter {
    state: Arc<Mutex<HashMap<String, Window>>>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks and records one request for `identifier`.
    pub fn check_rate_limit(
        &self,
        identifier: &str,
        max_requests: u32,
        window: Duration,
    ) -> RateLimitDecision {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self.check_rate_limit_at(identifier, max_requests, window_ms, unix_millis())
    }

    /// Same as [`check_rate_limit`](Self::check_rate_limit) against an explicit clock.
    pub fn check_rate_limit_at(
        &self,
        identifier: &str,
        max_requests: u32,
        window_ms: u64,
        now_ms: u64,
    ) -> RateLimitDecision {
        let window_ms = window_ms.max(1);
        let bucket = now_ms / window_ms;
        let key = format!("{}:{}", identifier, bucket);
        let reset_time_ms = bucket.saturating_add(1).saturating_mul(window_ms);

        let mut state = lock_or_recover(&self.state, "rate limiter");
        let entry = state.entry(key).or_insert(Window {
            count: 0,
            reset_time_ms,
        });

        if entry.count < max_requests {
            entry.count += 1;
            RateLimitDecision {
                allowed: true,
                remaining: max_requests - entry.count,
                reset_time_ms: entry.reset_time_ms,
                limit: max_requests,
            }
        } else {
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_time_ms: entry.reset_time_ms,
                limit: max_requests,
            }
        }
    }

    /// Drops every window whose reset time has passed. Returns how many were removed.
    pub fn sweep_expired(&self, now_ms: u64) -> usize {
        sweep(&self.state, now_ms)
    }

    /// Number of tracked windows.
    pub fn tracked(&self) -> usize {
        lock_or_recover(&self.state, "rate limiter").len()
    }

    /// Starts the periodic sweeper. Returns `false` if one is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_sweeper(&self, interval: Duration) -> bool {
        let mut sweeper = lock_or_recover(&self.sweeper, "rate limiter sweeper");
        if sweeper.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let state = Arc::clone(&self.state);
        let interval = interval.max(Duration::from_millis(1));
        *sweeper = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                let removed = sweep(&state, unix_millis());
                if removed > 0 {
                    tracing::debug!(removed, "swept expired rate-limit windows");
                }
            }
        }));
        tracing::info!(interval_ms = interval.as_millis() as u64, "rate-limit sweeper started");
        true
    }

    /// Stops the sweeper. Returns `false` if none was running.
    pub fn stop_sweeper(&self) -> bool {
        let handle = lock_or_recover(&self.sweeper, "rate limiter sweeper").take();
        match handle {
            Some(handle) => {
                handle.abort();
                tracing::info!("rate-limit sweeper stopped");
                true
            }
            None => false,
        }
    }

    pub fn sweeper_running(&self) -> bool {
        lock_or_recover(&self.sweeper, "rate limiter sweeper")
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

fn sweep(state: &Mutex<HashMap<String, Window>>, now_ms: u64) -> usize {
    let mut state = lock_or_recover(state, "rate limiter");
    let before = state.len();
    state.retain(|_, window| window.reset_time_ms > now_ms);
    before - state.len()
}
