//! Failure recovery: retry policy, retry budgets, circuit breakers.
//!
//! The orchestrator is the only caller. Nothing below the orchestrator retries.

use std::time::Duration;

use tokio::time::Instant;

pub mod circuit;
pub mod retry;

pub use circuit::{
    BreakerSet, BreakerSettings, CallHealth, CallPermit, CircuitBreaker, CircuitSnapshot,
    CircuitState, Rejected,
};
pub use retry::{BudgetLimits, RetryBudget, RetryPolicy};

/// Used in place of a deadline that would not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `now + after`, clamped to [`FAR_FUTURE`] when the sum overflows.
pub(crate) fn instant_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_durations_do_not_overflow() {
        let now = Instant::now();
        let at = instant_after(now, Duration::from_secs(u64::MAX));
        assert_eq!(at, now + FAR_FUTURE);
        assert_eq!(instant_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
    }
}
