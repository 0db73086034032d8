//! Retry bookkeeping for a single probe.
//!
//! ```text
//! INIT --begin--> ATTEMPTING --succeed--> SUCCESS
//!                     |   ^
//!                 fail|   |begin
//!                     v   |
//!                  RETRY_WAIT
//!                     |
//!          (attempts spent / abort)
//!                     v
//!                 EXHAUSTED
//! ```

use std::time::{Duration, Instant};

use crate::config::RetryPolicy;
use crate::error::ErrorKind;
use crate::models::ProbeStatus;

/// Where a probe currently is in its retry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Init,
    Attempting,
    /// Waiting the given delay before the next attempt.
    RetryWait(Duration),
    Success,
    Exhausted,
}

impl RetryPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryPhase::Success | RetryPhase::Exhausted)
    }
}

/// Attempt counter and last error for one probe. Never reset.
#[derive(Debug, Clone)]
pub struct RetryState {
    phase: RetryPhase,
    attempt: u32,
    last_error: Option<ErrorKind>,
    started_at: Instant,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            phase: RetryPhase::Init,
            attempt: 0,
            last_error: None,
            started_at: Instant::now(),
        }
    }

    pub fn phase(&self) -> RetryPhase {
        self.phase
    }

    /// Attempts started so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Enter `Attempting`. Returns the 1-based attempt number.
    pub fn begin_attempt(&mut self) -> u32 {
        debug_assert!(
            matches!(self.phase, RetryPhase::Init | RetryPhase::RetryWait(_)),
            "begin_attempt from {:?}",
            self.phase
        );
        self.attempt += 1;
        self.phase = RetryPhase::Attempting;
        self.attempt
    }

    /// The current attempt produced a terminal response.
    pub fn succeed(&mut self) {
        self.phase = RetryPhase::Success;
    }

    /// The current attempt failed transiently. Moves to `RetryWait` with a
    /// sampled backoff, or to `Exhausted` once the attempt budget is spent.
    pub fn fail(&mut self, kind: ErrorKind, policy: &RetryPolicy) -> RetryPhase {
        self.last_error = Some(kind);
        self.phase = if self.attempt >= policy.max_attempts {
            RetryPhase::Exhausted
        } else {
            RetryPhase::RetryWait(policy.sample_delay(self.attempt))
        };
        self.phase
    }

    /// Stop without further attempts (cancellation, permit timeout, bad URL).
    pub fn abort(&mut self, kind: ErrorKind) {
        // An abort after a real attempt keeps that attempt's error.
        if self.last_error.is_none() {
            self.last_error = Some(kind);
        }
        self.phase = RetryPhase::Exhausted;
    }

    /// Outcome class for an exhausted probe: `Timeout` if the last failure
    /// was a timeout, `Error` otherwise.
    pub fn exhausted_status(&self) -> ProbeStatus {
        match self.last_error {
            Some(ErrorKind::Timeout) => ProbeStatus::Timeout,
            _ => ProbeStatus::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(10),
            Duration::from_millis(35),
        )
    }

    #[test]
    fn starts_in_init() {
        let state = RetryState::new();
        assert_eq!(state.phase(), RetryPhase::Init);
        assert_eq!(state.attempt(), 0);
        assert!(state.last_error().is_none());
    }

    #[test]
    fn success_on_first_attempt() {
        let mut state = RetryState::new();
        assert_eq!(state.begin_attempt(), 1);
        state.succeed();
        assert_eq!(state.phase(), RetryPhase::Success);
        assert!(state.phase().is_terminal());
    }

    #[test]
    fn always_failing_uses_exactly_max_attempts() {
        let policy = policy(4);
        let mut state = RetryState::new();
        let mut waits = Vec::new();
        loop {
            state.begin_attempt();
            match state.fail(ErrorKind::Status(503), &policy) {
                RetryPhase::RetryWait(d) => waits.push(d),
                RetryPhase::Exhausted => break,
                other => panic!("unexpected phase {other:?}"),
            }
        }
        assert_eq!(state.attempt(), 4);
        assert_eq!(waits.len(), 3);
        for pair in waits.windows(2) {
            assert!(pair[0] <= pair[1], "{waits:?}");
        }
        assert!(waits.iter().all(|d| *d <= Duration::from_millis(35)));
        assert_eq!(state.exhausted_status(), ProbeStatus::Error);
    }

    #[test]
    fn single_attempt_budget_never_waits() {
        let mut state = RetryState::new();
        state.begin_attempt();
        assert_eq!(
            state.fail(ErrorKind::Network, &policy(1)),
            RetryPhase::Exhausted
        );
    }

    #[test]
    fn timeout_dominates_when_last() {
        let policy = policy(2);
        let mut state = RetryState::new();
        state.begin_attempt();
        state.fail(ErrorKind::Status(500), &policy);
        state.begin_attempt();
        state.fail(ErrorKind::Timeout, &policy);
        assert_eq!(state.exhausted_status(), ProbeStatus::Timeout);
    }

    #[test]
    fn recovery_after_transient_failure() {
        let policy = policy(3);
        let mut state = RetryState::new();
        state.begin_attempt();
        assert!(matches!(
            state.fail(ErrorKind::Network, &policy),
            RetryPhase::RetryWait(_)
        ));
        state.begin_attempt();
        state.succeed();
        assert_eq!(state.attempt(), 2);
        assert_eq!(state.last_error(), Some(ErrorKind::Network));
    }

    #[test]
    fn abort_before_any_attempt_records_reason() {
        let mut state = RetryState::new();
        state.abort(ErrorKind::Cancelled);
        assert_eq!(state.phase(), RetryPhase::Exhausted);
        assert_eq!(state.last_error(), Some(ErrorKind::Cancelled));
        assert_eq!(state.attempt(), 0);
    }

    #[test]
    fn abort_during_wait_keeps_site_error() {
        let policy = policy(3);
        let mut state = RetryState::new();
        state.begin_attempt();
        state.fail(ErrorKind::Timeout, &policy);
        state.abort(ErrorKind::Cancelled);
        assert_eq!(state.last_error(), Some(ErrorKind::Timeout));
        assert_eq!(state.exhausted_status(), ProbeStatus::Timeout);
    }
}
