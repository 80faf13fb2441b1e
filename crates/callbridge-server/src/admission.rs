//! Call admission rules.
//!
//! Rules are evaluated in a fixed order and the first failing rule decides
//! the rejection:
//!
//! 1. the session already has an active call
//! 2. the session already has a call being placed
//! 3. the global hourly quota is used up
//! 4. the global per-minute quota is used up
//! 5. the session is still cooling down from its last call
//! 6. the session has used up its call allowance

use crate::lock_or_recover;
use callbridge_types::CallPolicy;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;

pub const HOUR_MS: u64 = 60 * 60 * 1000;
pub const MINUTE_MS: u64 = 60 * 1000;

/// Why a call was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionRejection {
    #[error("Call already active")]
    CallActive,
    #[error("Call already initiated")]
    CallInitiated,
    #[error("Hourly call limit exceeded")]
    HourlyLimit { retry_after_ms: u64 },
    #[error("Minute call limit exceeded")]
    MinuteLimit { retry_after_ms: u64 },
    #[error("Call cooldown period active")]
    Cooldown { retry_after_ms: u64 },
    #[error("Session call limit exceeded")]
    SessionLimit,
}

impl AdmissionRejection {
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::HourlyLimit { retry_after_ms }
            | Self::MinuteLimit { retry_after_ms }
            | Self::Cooldown { retry_after_ms } => Some(*retry_after_ms),
            Self::CallActive | Self::CallInitiated | Self::SessionLimit => None,
        }
    }

    /// `true` for rejections caused by a call already in progress.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::CallActive | Self::CallInitiated)
    }
}

/// Serializable answer to "may this session place a call now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<Result<(), AdmissionRejection>> for AdmissionDecision {
    fn from(result: Result<(), AdmissionRejection>) -> Self {
        match result {
            Ok(()) => Self {
                allowed: true,
                reason: None,
                retry_after_ms: None,
            },
            Err(rejection) => Self {
                allowed: false,
                reason: Some(rejection.to_string()),
                retry_after_ms: rejection.retry_after_ms(),
            },
        }
    }
}

/// The per-session facts the rules look at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCallRecord {
    pub is_active: bool,
    pub call_initiated: bool,
    pub last_call_at_ms: Option<u64>,
    pub call_count: u32,
}

/// Global call ledger plus the policy it is checked against.
#[derive(Debug)]
pub struct AdmissionControl {
    policy: CallPolicy,
    calls: Mutex<VecDeque<u64>>,
}

impl AdmissionControl {
    pub fn new(policy: CallPolicy) -> Self {
        Self {
            policy,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn policy(&self) -> &CallPolicy {
        &self.policy
    }

    /// Evaluates the rules without recording anything.
    pub fn evaluate(
        &self,
        session: &SessionCallRecord,
        now_ms: u64,
    ) -> Result<(), AdmissionRejection> {
        let calls = lock_or_recover(&self.calls, "admission ledger");
        evaluate_rules(&self.policy, session, &calls, now_ms)
    }

    /// Evaluates the rules and, if they pass, records a call at `now_ms`.
    ///
    /// The ledger lock is held from check to record.
    pub fn check_and_record(
        &self,
        session: &SessionCallRecord,
        now_ms: u64,
    ) -> Result<(), AdmissionRejection> {
        let mut calls = lock_or_recover(&self.calls, "admission ledger");
        prune(&mut calls, now_ms);
        evaluate_rules(&self.policy, session, &calls, now_ms)?;
        calls.push_back(now_ms);
        Ok(())
    }

    /// Records a call without checking the rules.
    pub fn record_call(&self, now_ms: u64) {
        let mut calls = lock_or_recover(&self.calls, "admission ledger");
        prune(&mut calls, now_ms);
        calls.push_back(now_ms);
    }

    /// Calls recorded within the last `window_ms`.
    pub fn calls_within(&self, window_ms: u64, now_ms: u64) -> usize {
        let calls = lock_or_recover(&self.calls, "admission ledger");
        in_window(&calls, window_ms, now_ms).count()
    }
}

fn prune(calls: &mut VecDeque<u64>, now_ms: u64) {
    while calls
        .front()
        .is_some_and(|&at| now_ms.saturating_sub(at) >= HOUR_MS)
    {
        calls.pop_front();
    }
}

fn in_window(
    calls: &VecDeque<u64>,
    window_ms: u64,
    now_ms: u64,
) -> impl Iterator<Item = u64> + '_ {
    calls
        .iter()
        .copied()
        .filter(move |&at| now_ms.saturating_sub(at) < window_ms)
}

/// Time until the oldest in-window call leaves the window.
fn window_retry(calls: &VecDeque<u64>, window_ms: u64, now_ms: u64) -> u64 {
    in_window(calls, window_ms, now_ms)
        .min()
        .map(|oldest| (oldest + window_ms).saturating_sub(now_ms))
        .unwrap_or(window_ms)
}

pub fn evaluate_rules(
    policy: &CallPolicy,
    session: &SessionCallRecord,
    calls: &VecDeque<u64>,
    now_ms: u64,
) -> Result<(), AdmissionRejection> {
    if session.is_active {
        return Err(AdmissionRejection::CallActive);
    }
    if session.call_initiated {
        return Err(AdmissionRejection::CallInitiated);
    }

    if in_window(calls, HOUR_MS, now_ms).count() >= policy.max_calls_per_hour {
        return Err(AdmissionRejection::HourlyLimit {
            retry_after_ms: window_retry(calls, HOUR_MS, now_ms),
        });
    }
    if in_window(calls, MINUTE_MS, now_ms).count() >= policy.max_calls_per_minute {
        return Err(AdmissionRejection::MinuteLimit {
            retry_after_ms: window_retry(calls, MINUTE_MS, now_ms),
        });
    }

    if let Some(last) = session.last_call_at_ms {
        let elapsed = now_ms.saturating_sub(last);
        if elapsed < policy.session_cooldown_ms {
            return Err(AdmissionRejection::Cooldown {
                retry_after_ms: policy.session_cooldown_ms - elapsed,
            });
        }
    }

    if session.call_count >= policy.max_calls_per_session {
        return Err(AdmissionRejection::SessionLimit);
    }

    Ok(())
}
