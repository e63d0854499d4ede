//! Decision model: what the pipeline driver does after a stage attempt.
//!
//! The driver reduces every attempt to an [`Observation`] (outcome tag plus
//! the payload's gate) and asks a [`Decider`] for the next [`Decision`].
//! Each decision maps to exactly one [`PipelineEvent`].

use std::time::Duration;

use super::outcome::Failure;
use super::state::{PipelineEvent, Stage};
use crate::recovery::{RetryBudget, RetryPolicy};

/// What the last attempt looked like, as far as the state machine cares.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Success, payload lets the pipeline proceed.
    Passed,
    /// Success, payload stops the pipeline (infeasible analysis, blocking review).
    Halted(String),
    Transient(Failure),
    Permanent(String),
}

/// Inputs the decider may look at besides the observation.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub stage: Stage,
    /// Budget of the current stage, already charged with this attempt.
    pub budget: &'a RetryBudget,
    /// Review -> Resolve loops still allowed.
    pub revisions_left: u32,
    /// Remaining open window of the stage's circuit breaker, if open.
    pub breaker_open_for: Option<Duration>,
}

/// The next action for a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Move to the next stage.
    Advance,

    /// Stop and hand the task to a human.
    Halt { reason: String },

    /// Send the change back to the resolver.
    Revise { reason: String },

    /// Run the same stage again after `delay`.
    Retry { delay: Duration, reason: String },

    /// Transient failure, but the budget is spent.
    GiveUp { reason: String },

    /// The capability said retrying cannot help.
    Fail { reason: String },
}

impl Decision {
    pub fn event(&self) -> PipelineEvent {
        match self {
            Decision::Advance => PipelineEvent::Advanced,
            Decision::Halt { .. } => PipelineEvent::Halted,
            Decision::Revise { .. } => PipelineEvent::RevisionRequested,
            Decision::Retry { .. } => PipelineEvent::RetryScheduled,
            Decision::GiveUp { .. } => PipelineEvent::RetriesExhausted,
            Decision::Fail { .. } => PipelineEvent::PermanentFailure,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Decision::Advance => None,
            Decision::Halt { reason }
            | Decision::Revise { reason }
            | Decision::Retry { reason, .. }
            | Decision::GiveUp { reason }
            | Decision::Fail { reason } => Some(reason),
        }
    }
}

/// Trait for deciding the next action based on a stage observation.
///
/// Deciders are pure functions: given the current bookkeeping and the
/// observation, they return the next action without side effects. Executing
/// the decision (history append, sleeping, persisting) is the driver's job.
pub trait Decider: Send + Sync {
    fn decide(&self, ctx: &DecisionContext<'_>, observation: &Observation) -> Decision;
}

/// Default decider.
///
/// - Passed → Advance
/// - Halted at Review with revision rounds left → Revise, otherwise Halt
/// - Permanent → Fail, regardless of remaining budget
/// - Transient → Retry while the budget allows, GiveUp after
///
/// Retry delays come from the [`RetryPolicy`] and are stretched to cover the
/// breaker's open window so the retry is not rejected on arrival.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn default_v1() -> Self {
        Self::new(RetryPolicy::default_v1())
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, ctx: &DecisionContext<'_>, observation: &Observation) -> Decision {
        match observation {
            Observation::Passed => Decision::Advance,
            Observation::Halted(reason) => {
                if ctx.stage == Stage::Review && ctx.revisions_left > 0 {
                    Decision::Revise {
                        reason: format!(
                            "{reason} ({} revision round(s) left)",
                            ctx.revisions_left
                        ),
                    }
                } else {
                    Decision::Halt {
                        reason: reason.clone(),
                    }
                }
            }
            Observation::Permanent(reason) => Decision::Fail {
                reason: reason.clone(),
            },
            Observation::Transient(failure) => {
                if let Some(exhausted) = ctx.budget.exhausted() {
                    return Decision::GiveUp {
                        reason: format!("{failure}; {exhausted}"),
                    };
                }
                let backoff = self.retry_policy.next_delay(ctx.budget.attempts());
                let delay = match ctx.breaker_open_for {
                    Some(open_for) => backoff.max(open_for),
                    None => backoff,
                };
                Decision::Retry {
                    delay,
                    reason: format!(
                        "{failure}; retry {}/{} after {:?}",
                        ctx.budget.attempts() + 1,
                        ctx.budget.max_attempts(),
                        delay
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FailureClass;
    use crate::recovery::BudgetLimits;
    use rstest::rstest;

    fn no_jitter() -> DefaultDecider {
        DefaultDecider::new(RetryPolicy {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: 0.0,
        })
    }

    fn budget_after(attempts: u32, max: u32) -> RetryBudget {
        let mut budget = RetryBudget::new(Stage::Resolve, BudgetLimits::new(max));
        for _ in 0..attempts {
            budget.start_attempt();
        }
        budget
    }

    fn ctx<'a>(stage: Stage, budget: &'a RetryBudget, revisions_left: u32) -> DecisionContext<'a> {
        DecisionContext {
            stage,
            budget,
            revisions_left,
            breaker_open_for: None,
        }
    }

    #[rstest]
    #[case(Stage::Analyze, 0, PipelineEvent::Halted)]
    #[case(Stage::Review, 0, PipelineEvent::Halted)]
    #[case(Stage::Review, 1, PipelineEvent::RevisionRequested)]
    fn halted_payload_revises_only_at_review(
        #[case] stage: Stage,
        #[case] revisions_left: u32,
        #[case] expected: PipelineEvent,
    ) {
        let budget = budget_after(1, 3);
        let decision = no_jitter().decide(
            &ctx(stage, &budget, revisions_left),
            &Observation::Halted("blocked".to_string()),
        );
        assert_eq!(decision.event(), expected);
    }

    #[test]
    fn permanent_failure_is_never_retried() {
        let budget = budget_after(1, 10);
        let decision = no_jitter().decide(
            &ctx(Stage::Integrate, &budget, 0),
            &Observation::Permanent("repository archived".to_string()),
        );
        assert_eq!(
            decision,
            Decision::Fail {
                reason: "repository archived".to_string()
            }
        );
    }

    #[test]
    fn transient_failure_retries_until_budget_is_spent() {
        let decider = no_jitter();
        let failure = Failure::new(FailureClass::RateLimited, "429");

        let budget = budget_after(2, 3);
        match decider.decide(&ctx(Stage::Resolve, &budget, 0), &Observation::Transient(failure.clone())) {
            Decision::Retry { delay, reason } => {
                assert_eq!(delay, Duration::from_millis(200));
                assert!(reason.contains("retry 3/3"));
            }
            other => panic!("expected retry, got {other:?}"),
        }

        let budget = budget_after(3, 3);
        let decision = decider.decide(&ctx(Stage::Resolve, &budget, 0), &Observation::Transient(failure));
        assert_eq!(decision.event(), PipelineEvent::RetriesExhausted);
    }

    #[test]
    fn retry_waits_out_an_open_breaker() {
        let budget = budget_after(1, 3);
        let context = DecisionContext {
            breaker_open_for: Some(Duration::from_secs(3)),
            ..ctx(Stage::Analyze, &budget, 0)
        };
        let decision = no_jitter().decide(
            &context,
            &Observation::Transient(Failure::new(FailureClass::CircuitOpen, "open")),
        );
        assert!(matches!(decision, Decision::Retry { delay, .. } if delay == Duration::from_secs(3)));
    }
}
