use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;

use crate::error::AppError;
use crate::limiter::DEFAULT_PER_DOMAIN_LIMIT;
use crate::matcher::MatchPolicy;

/// Retry configuration with capped exponential backoff.
///
/// Delay before attempt `n + 1` is `base_delay * 2^(n - 1)` plus a random
/// jitter in `[0, base_delay)`, capped at `max_delay`. Keeping the jitter
/// below `base_delay` makes successive delays non-decreasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per probe, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Deterministic part of the wait after failed attempt `attempt` (1-indexed).
    pub fn backoff_base(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        std::cmp::min(self.base_delay.saturating_mul(1u32 << exp), self.max_delay)
    }

    /// Wait after failed attempt `attempt` with an explicit jitter sample.
    ///
    /// `jitter` is clamped below `base_delay`.
    pub fn delay_for_attempt(&self, attempt: u32, jitter: Duration) -> Duration {
        let jitter = if self.base_delay.is_zero() {
            Duration::ZERO
        } else {
            std::cmp::min(jitter, self.base_delay - Duration::from_nanos(1))
        };
        let exp = attempt.saturating_sub(1).min(31);
        let raw = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .saturating_add(jitter);
        std::cmp::min(raw, self.max_delay)
    }

    /// Wait after failed attempt `attempt` with a random jitter.
    pub fn sample_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let jitter = if base_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..base_ms))
        };
        self.delay_for_attempt(attempt, jitter)
    }
}

/// Uniform random delay applied before each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterRange {
    pub min: Duration,
    pub max: Duration,
}

impl JitterRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

impl Default for JitterRange {
    fn default() -> Self {
        Self::new(Duration::from_millis(80), Duration::from_millis(250))
    }
}

/// Runtime settings consumed by the probing engine.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Global cap on simultaneously running probes.
    pub concurrency: usize,
    /// Cap on simultaneous requests to one domain.
    pub per_domain_limit: usize,
    pub attempt_timeout: Duration,
    /// Optional bound on waiting for a domain permit.
    pub task_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub jitter: JitterRange,
    pub policy: MatchPolicy,
    /// Lowercased site names to keep; `None` keeps the whole catalog.
    pub only: Option<HashSet<String>>,
    pub match_timeout: Duration,
    pub max_scan_bytes: usize,
    /// Proxy URL handed to the transport untouched.
    pub proxy: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: 32,
            per_domain_limit: DEFAULT_PER_DOMAIN_LIMIT,
            attempt_timeout: Duration::from_secs(10),
            task_timeout: None,
            retry: RetryPolicy::default(),
            jitter: JitterRange::default(),
            policy: MatchPolicy::default(),
            only: None,
            match_timeout: Duration::from_millis(250),
            max_scan_bytes: 2 * 1024 * 1024,
            proxy: None,
        }
    }
}

impl ScanConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_per_domain_limit(mut self, limit: usize) -> Self {
        self.per_domain_limit = limit;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterRange) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_policy(mut self, policy: MatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Restrict the run to the named sites (case-insensitive).
    pub fn with_only<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: HashSet<String> = names
            .into_iter()
            .map(|n| n.as_ref().trim().to_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        self.only = if names.is_empty() { None } else { Some(names) };
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_match_timeout(mut self, timeout: Duration) -> Self {
        self.match_timeout = timeout;
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.concurrency == 0 {
            return Err(AppError::ConfigError(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.per_domain_limit == 0 {
            return Err(AppError::ConfigError(
                "per-domain limit must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::ConfigError(
                "max attempts must be at least 1".into(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(AppError::ConfigError(format!(
                "base backoff {:?} exceeds max backoff {:?}",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        if self.jitter.min > self.jitter.max {
            return Err(AppError::ConfigError(format!(
                "jitter min {:?} exceeds jitter max {:?}",
                self.jitter.min, self.jitter.max
            )));
        }
        if self.attempt_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "attempt timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
