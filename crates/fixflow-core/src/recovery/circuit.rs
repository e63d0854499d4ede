//! Circuit breakers, one per capability.
//!
//! A breaker is shared by every task calling the same capability. Mutation
//! goes through a single write lock; [`CircuitBreaker::snapshot`] takes the
//! read side so status queries never contend with each other.
//!
//! Time is read from `tokio::time::Instant`, so tests can pause and advance it.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected without invoking the capability.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing.
    pub open_duration: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// How a permitted call went, from the breaker's point of view.
///
/// A permanent failure is the capability answering correctly that the task
/// cannot be done; it says nothing bad about the capability's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallHealth {
    Healthy,
    Failed,
}

/// Returned instead of a permit while the breaker rejects calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub state: CircuitState,
    /// Time until the breaker will admit a probe (zero while a probe is in flight).
    pub open_for: Duration,
}

/// Consistent point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub capability: &'static str,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time since the last recorded failure.
    pub since_last_failure: Option<Duration>,
    /// Remaining open window, if open.
    pub open_for: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    open_until: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    capability: &'static str,
    settings: BreakerSettings,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    pub fn new(capability: &'static str, settings: BreakerSettings) -> Self {
        Self {
            capability,
            settings,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                open_until: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn capability(&self) -> &'static str {
        self.capability
    }

    pub fn settings(&self) -> BreakerSettings {
        self.settings
    }

    /// Ask to make a call. The permit must be resolved with
    /// [`CallPermit::record`]; dropping it unrecorded frees a half-open probe slot.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, Rejected> {
        let now = Instant::now();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.state {
            CircuitState::Closed => Ok(self.permit(false)),
            CircuitState::Open => match inner.open_until {
                Some(until) if until > now => Err(Rejected {
                    state: CircuitState::Open,
                    open_for: until - now,
                }),
                _ => {
                    debug!(capability = self.capability, "circuit half-open, admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.open_until = None;
                    inner.probe_in_flight = true;
                    Ok(self.permit(true))
                }
            },
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Rejected {
                        state: CircuitState::HalfOpen,
                        open_for: Duration::ZERO,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(self.permit(true))
                }
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Remaining open window, `None` unless open.
    pub fn open_for(&self) -> Option<Duration> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        match (inner.state, inner.open_until) {
            (CircuitState::Open, Some(until)) => {
                Some(until.saturating_duration_since(Instant::now()))
            }
            _ => None,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        CircuitSnapshot {
            capability: self.capability,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            since_last_failure: inner.last_failure.map(|at| now.saturating_duration_since(at)),
            open_for: match inner.state {
                CircuitState::Open => inner.open_until.map(|u| u.saturating_duration_since(now)),
                _ => None,
            },
        }
    }

    fn permit(self: &Arc<Self>, probe: bool) -> CallPermit {
        CallPermit {
            breaker: Arc::clone(self),
            probe,
            recorded: false,
        }
    }

    fn record(&self, probe: bool, health: CallHealth) {
        let now = Instant::now();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if probe {
            inner.probe_in_flight = false;
            match health {
                CallHealth::Healthy => {
                    debug!(capability = self.capability, "probe succeeded, circuit closed");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                }
                CallHealth::Failed => {
                    inner.consecutive_failures += 1;
                    inner.last_failure = Some(now);
                    self.open(&mut inner, now);
                }
            }
            return;
        }

        match health {
            CallHealth::Healthy => {
                if inner.state == CircuitState::Closed {
                    inner.consecutive_failures = 0;
                }
            }
            CallHealth::Failed => {
                inner.consecutive_failures += 1;
                inner.last_failure = Some(now);
                if inner.state == CircuitState::Closed
                    && inner.consecutive_failures >= self.settings.failure_threshold
                {
                    self.open(&mut inner, now);
                }
            }
        }
    }

    fn open(&self, inner: &mut Inner, now: Instant) {
        warn!(
            capability = self.capability,
            failures = inner.consecutive_failures,
            open_secs = self.settings.open_duration.as_secs_f64(),
            "circuit opened"
        );
        inner.state = CircuitState::Open;
        inner.open_until = Some(super::instant_after(now, self.settings.open_duration));
    }

    fn release_probe(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.probe_in_flight = false;
    }
}

/// Permission to make one call through a breaker.
#[derive(Debug)]
#[must_use = "a permit must be resolved with `record`"]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    recorded: bool,
}

impl CallPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record(mut self, health: CallHealth) {
        self.recorded = true;
        self.breaker.record(self.probe, health);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.recorded && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// The four capability breakers.
#[derive(Debug, Clone)]
pub struct BreakerSet {
    breakers: [Arc<CircuitBreaker>; 4],
}

impl BreakerSet {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            breakers: Stage::ALL
                .map(|stage| Arc::new(CircuitBreaker::new(stage.capability(), settings))),
        }
    }

    pub fn get(&self, stage: Stage) -> &Arc<CircuitBreaker> {
        &self.breakers[stage_index(stage)]
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.breakers.iter().map(|b| b.snapshot()).collect()
    }
}

fn stage_index(stage: Stage) -> usize {
    match stage {
        Stage::Analyze => 0,
        Stage::Resolve => 1,
        Stage::Review => 2,
        Stage::Integrate => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, open_secs: u64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "resolver",
            BreakerSettings {
                failure_threshold: threshold,
                open_duration: Duration::from_secs(open_secs),
            },
        ))
    }

    fn fail(b: &Arc<CircuitBreaker>) {
        b.try_acquire().unwrap().record(CallHealth::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_consecutive_failures() {
        let b = breaker(3, 10);
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Open);

        let rejected = b.try_acquire().unwrap_err();
        assert_eq!(rejected.state, CircuitState::Open);
        assert_eq!(rejected.open_for, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_open_window_still_opens() {
        let b = breaker(1, u64::MAX);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.try_acquire().unwrap_err().state, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_counter() {
        let b = breaker(3, 10);
        fail(&b);
        fail(&b);
        b.try_acquire().unwrap().record(CallHealth::Healthy);
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_a_single_probe() {
        let b = breaker(1, 5);
        fail(&b);
        tokio::time::advance(Duration::from_secs(5)).await;

        let probe = b.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(b.try_acquire().unwrap_err().state, CircuitState::HalfOpen);

        probe.record(CallHealth::Healthy);
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(!b.try_acquire().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_with_fresh_window() {
        let b = breaker(1, 5);
        fail(&b);
        tokio::time::advance(Duration::from_secs(6)).await;

        b.try_acquire().unwrap().record(CallHealth::Failed);
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.open_for(), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_frees_the_slot() {
        let b = breaker(1, 1);
        fail(&b);
        tokio::time::advance(Duration::from_secs(1)).await;

        drop(b.try_acquire().unwrap());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_set_has_one_breaker_per_capability() {
        let set = BreakerSet::new(BreakerSettings {
            failure_threshold: 1,
            open_duration: Duration::from_secs(60),
        });
        fail(set.get(Stage::Review));

        let snapshots = set.snapshots();
        assert_eq!(snapshots.len(), 4);
        assert_eq!(set.get(Stage::Review).state(), CircuitState::Open);
        assert_eq!(set.get(Stage::Resolve).state(), CircuitState::Closed);
        assert_eq!(set.get(Stage::Review).capability(), "reviewer");
    }
}
