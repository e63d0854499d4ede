//! Retry policy and per-(task, stage) retry budgets.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::domain::{FailureClass, Stage};

/// Exponential backoff with jitter.
///
/// delay = min(base_delay * multiplier^(attempts - 1), max_delay), then scaled
/// by a random factor in `[1 - jitter, 1]` so concurrently failing tasks do not
/// retry in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound of any single delay.
    pub max_delay: Duration,

    /// Fraction of the delay that may be shaved off at random (0.0 = none).
    pub jitter: f64,
}

impl RetryPolicy {
    /// 2s base, doubling, capped at 2 minutes, 20% jitter.
    pub fn default_v1() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(120),
            jitter: 0.2,
        }
    }

    /// Deterministic part of the delay.
    ///
    /// Example with base_delay=2s, multiplier=2.0:
    /// - attempt 1 (first failure): 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        if !delay_secs.is_finite() || delay_secs >= max_secs {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay_secs.max(0.0))
        }
    }

    /// Delay before the next retry, jittered with the given RNG.
    pub fn next_delay_with<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        let capped = self.backoff(attempts);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return capped;
        }
        let factor = 1.0 - jitter * rng.gen_range(0.0..1.0);
        capped.mul_f64(factor)
    }

    pub fn next_delay(&self, attempts: u32) -> Duration {
        self.next_delay_with(attempts, &mut rand::thread_rng())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_v1()
    }
}

/// Attempt limits for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Maximum calls for the stage, including the first.
    pub max_attempts: u32,

    /// Optional caps per failure class (e.g. give up after 2 timeouts even if
    /// `max_attempts` would allow more).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub class_limits: BTreeMap<FailureClass, u32>,
}

impl BudgetLimits {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            class_limits: BTreeMap::new(),
        }
    }

    pub fn with_class_limit(mut self, class: FailureClass, limit: u32) -> Self {
        self.class_limits.insert(class, limit);
        self
    }
}

/// Retry bookkeeping for one (task, stage) pair.
///
/// Created when the stage first executes, dropped when the stage succeeds or
/// the task terminates. Owned by the task's pipeline driver only.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    stage: Stage,
    limits: BudgetLimits,
    attempts: u32,
    failures_by_class: BTreeMap<FailureClass, u32>,
    next_eligible_at: Option<DateTime<Utc>>,
}

impl RetryBudget {
    pub fn new(stage: Stage, limits: BudgetLimits) -> Self {
        Self {
            stage,
            limits,
            attempts: 0,
            failures_by_class: BTreeMap::new(),
            next_eligible_at: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Attempts made so far (including rejected-by-breaker attempts).
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.limits.max_attempts
    }

    pub fn next_eligible_at(&self) -> Option<DateTime<Utc>> {
        self.next_eligible_at
    }

    /// Begin an attempt; returns its 1-indexed number.
    pub fn start_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.next_eligible_at = None;
        self.attempts
    }

    pub fn record_failure(&mut self, class: FailureClass) {
        *self.failures_by_class.entry(class).or_insert(0) += 1;
    }

    pub fn failures(&self, class: FailureClass) -> u32 {
        self.failures_by_class.get(&class).copied().unwrap_or(0)
    }

    /// Why no further attempt is allowed, or `None` if one is.
    pub fn exhausted(&self) -> Option<String> {
        if self.attempts >= self.limits.max_attempts {
            return Some(format!(
                "{} retry budget exhausted: {}/{} attempts",
                self.stage, self.attempts, self.limits.max_attempts
            ));
        }
        self.limits
            .class_limits
            .iter()
            .find(|&(class, &limit)| self.failures(*class) >= limit)
            .map(|(class, limit)| {
                format!(
                    "{} retry budget exhausted: {} {:?} failures (limit {})",
                    self.stage,
                    self.failures(*class),
                    class,
                    limit
                )
            })
    }

    pub fn schedule(&mut self, at: DateTime<Utc>) {
        self.next_eligible_at = Some(at);
    }
}
