//! # Failure and Retry Policy
//!
//! Each resource runs a small state machine:
//!
//! `Idle -> Requested -> { Success | Retrying | Abandoned } -> Idle`
//!
//! The worker drives it: `begin_cycle` on a trigger, `record_failure` on
//! every failed attempt, `complete` on a 200 or 304. The cycle id moves
//! forward on every begin, so a response tagged with an older id is
//! recognised as late and discarded.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::configs::PsychConfig;
use crate::retrieve::FetchMode;

/// First delay of the exponential backoff.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Upper bound of the exponential backoff.
pub const BACKOFF_CAP: Duration = Duration::from_millis(600_000);

/// Position of a resource in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourcePhase {
    /// No cycle running.
    #[default]
    Idle,
    /// First attempt in flight.
    Requested,
    /// A failed attempt is waiting for its retry.
    Retrying,
    /// The last cycle ended with a 200 or 304.
    Success,
    /// The last cycle ran out of attempts or time.
    Abandoned,
}

/// How a finished cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// 200 parsed and mapped.
    Updated,
    /// 304, nothing to do.
    NotModified,
    /// Retry budget exhausted.
    Abandoned,
    /// Dropped by a panic shutdown.
    Cancelled,
}

/// Decision after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Re-issue after `delay`.
    Retry {
        /// Wait before the next attempt.
        delay: Duration,
    },
    /// Give up on this cycle.
    Abandon,
}

/// # Retry Policy
///
/// `retry_count` is the total number of attempts per cycle, the first one
/// included. A zero `retry_delay` selects exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per cycle.
    pub retry_count: u32,
    /// Fixed wait between attempts; zero for backoff.
    pub retry_delay: Duration,
    /// Cycle age after which no further attempt starts.
    pub retry_timeout: Duration,
}

impl RetryPolicy {
    /// The policy of a configuration.
    pub fn from_config(config: &PsychConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            retry_timeout: Duration::from_millis(config.retry_timeout_ms),
        }
    }

    /// Wait before the attempt following `failures` failed ones.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if !self.retry_delay.is_zero() {
            return self.retry_delay;
        }
        let shift = failures.saturating_sub(1).min(20);
        BACKOFF_BASE.saturating_mul(1 << shift).min(BACKOFF_CAP)
    }

    /// # After Failure
    ///
    /// `failures` counts the failed attempts of this cycle so far, `elapsed`
    /// is the time since the cycle began.
    pub fn after_failure(&self, failures: u32, elapsed: Duration) -> Verdict {
        if failures >= self.retry_count || elapsed >= self.retry_timeout {
            return Verdict::Abandon;
        }
        Verdict::Retry {
            delay: self.delay_for(failures),
        }
    }
}

/// Per-resource cycle bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ResourceState {
    /// Current phase.
    pub phase: ResourcePhase,
    /// Id of the current or last cycle.
    pub cycle: u64,
    /// Attempts issued in the current cycle.
    pub attempts: u32,
    /// Failed attempts in the current cycle.
    pub consecutive_failures: u32,
    /// Monotonic start of the current cycle.
    pub cycle_started: Option<Instant>,
    /// Wall-clock start of the current cycle.
    pub cycle_started_at: Option<DateTime<Utc>>,
    /// Wall-clock end of the last cycle.
    pub last_completed_at: Option<DateTime<Utc>>,
    /// How the last cycle ended.
    pub last_outcome: Option<CycleOutcome>,
    /// Content modification time of the last parsed 200.
    pub last_modified: Option<DateTime<Utc>>,
    /// Error text of the last failed attempt.
    pub last_error: Option<String>,
    /// Mode of the current or last cycle.
    pub mode: Option<FetchMode>,
}

impl ResourceState {
    /// True while a cycle has an attempt outstanding or pending.
    pub fn is_busy(&self) -> bool {
        matches!(self.phase, ResourcePhase::Requested | ResourcePhase::Retrying)
    }

    /// Time the running cycle has been outstanding.
    pub fn outstanding(&self, now: Instant) -> Option<Duration> {
        if !self.is_busy() {
            return None;
        }
        self.cycle_started.map(|start| now.saturating_duration_since(start))
    }

    /// Starts cycle `cycle` and returns its id. Ids come from a counter that
    /// outlives the resource, so a re-added resource never reuses one.
    pub fn begin_cycle(&mut self, cycle: u64, mode: FetchMode, now: Instant, wall: DateTime<Utc>) -> u64 {
        self.cycle = cycle;
        self.phase = ResourcePhase::Requested;
        self.attempts = 0;
        self.consecutive_failures = 0;
        self.cycle_started = Some(now);
        self.cycle_started_at = Some(wall);
        self.last_error = None;
        self.mode = Some(mode);
        self.cycle
    }

    /// True when `cycle` is the live cycle of this resource.
    pub fn accepts(&self, cycle: u64) -> bool {
        self.is_busy() && self.cycle == cycle
    }

    /// Records one failed attempt and asks the policy what comes next.
    pub fn record_failure(&mut self, policy: &RetryPolicy, error: String, now: Instant) -> Verdict {
        self.consecutive_failures += 1;
        self.last_error = Some(error);
        let elapsed = self
            .cycle_started
            .map_or(Duration::ZERO, |start| now.saturating_duration_since(start));
        let verdict = policy.after_failure(self.consecutive_failures, elapsed);
        if let Verdict::Retry { .. } = verdict {
            self.phase = ResourcePhase::Retrying;
        }
        verdict
    }

    /// Closes the cycle.
    pub fn complete(&mut self, outcome: CycleOutcome, wall: DateTime<Utc>) {
        self.phase = match outcome {
            CycleOutcome::Updated | CycleOutcome::NotModified => ResourcePhase::Success,
            CycleOutcome::Abandoned | CycleOutcome::Cancelled => ResourcePhase::Abandoned,
        };
        self.last_outcome = Some(outcome);
        self.last_completed_at = Some(wall);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(count: u32, delay_ms: u64, timeout_ms: u64) -> RetryPolicy {
        RetryPolicy {
            retry_count: count,
            retry_delay: Duration::from_millis(delay_ms),
            retry_timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn test_count_bounds_attempts() {
        let p = policy(3, 1000, 60_000);
        assert_eq!(p.after_failure(1, Duration::ZERO), Verdict::Retry { delay: Duration::from_secs(1) });
        assert_eq!(p.after_failure(2, Duration::from_secs(1)), Verdict::Retry { delay: Duration::from_secs(1) });
        assert_eq!(p.after_failure(3, Duration::from_secs(2)), Verdict::Abandon);
    }

    #[test]
    fn test_timeout_bounds_attempts() {
        let p = policy(10, 1000, 2500);
        assert!(matches!(p.after_failure(2, Duration::from_millis(2400)), Verdict::Retry { .. }));
        assert_eq!(p.after_failure(3, Duration::from_millis(2500)), Verdict::Abandon);
    }

    #[test]
    fn test_zero_delay_backs_off() {
        let p = policy(30, 0, u64::MAX);
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(4), Duration::from_secs(8));
        assert_eq!(p.delay_for(25), BACKOFF_CAP);
    }

    #[test]
    fn test_state_machine() {
        let p = policy(2, 500, 60_000);
        let now = Instant::now();
        let mut state = ResourceState::default();
        assert!(!state.is_busy());

        let first = state.begin_cycle(1, FetchMode::Conditional, now, Utc::now());
        assert!(state.accepts(first));
        assert_eq!(state.phase, ResourcePhase::Requested);

        let verdict = state.record_failure(&p, "503".to_string(), now);
        assert!(matches!(verdict, Verdict::Retry { .. }));
        assert_eq!(state.phase, ResourcePhase::Retrying);
        assert_eq!(state.record_failure(&p, "503".to_string(), now), Verdict::Abandon);

        state.complete(CycleOutcome::Abandoned, Utc::now());
        assert!(!state.accepts(first));
        assert_eq!(state.phase, ResourcePhase::Abandoned);

        let second = state.begin_cycle(7, FetchMode::Full, now, Utc::now());
        assert_eq!(second, 7);
        assert_eq!(state.consecutive_failures, 0);
        assert!(!state.accepts(first));
    }

    #[test]
    fn test_readded_resource_rejects_old_cycle() {
        let now = Instant::now();
        let mut retired = ResourceState::default();
        let old = retired.begin_cycle(3, FetchMode::Full, now, Utc::now());

        let mut readded = ResourceState::default();
        readded.begin_cycle(4, FetchMode::Full, now, Utc::now());
        assert!(!readded.accepts(old));
        assert!(readded.accepts(4));
    }
}
