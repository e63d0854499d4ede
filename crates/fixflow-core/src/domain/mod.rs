//! Domain model (IDs, specs, stage results, records, decisions, ...).
//!
//! 状態遷移の規則（`state::next_state`）と履歴（`task::TaskRecord`）はここだけに置き、
//! app 層はそれを呼ぶだけにします。

pub mod decision;
pub mod errors;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod spec;
pub mod state;
pub mod task;
pub mod workspace;

pub use decision::{Decider, Decision, DecisionContext, DefaultDecider, Observation};
pub use errors::{ErrorKind, OrchestratorError};
pub use events::TransitionRecord;
pub use ids::{Id, IdMarker, LeaseId, ParseIdError, TaskId};
pub use outcome::{
    AnalysisOutcome, ChangeSet, Failure, FailureClass, Feasibility, Gate, Gated,
    IntegrationReference, OutcomeKind, ReviewVerdict, StageResult,
};
pub use spec::{Priority, SourceRef, TaskSpec};
pub use state::{PipelineEvent, Stage, TaskState, TransitionError, next_state};
pub use task::{StageEntry, TaskRecord, TaskResult, Transition};
pub use workspace::{Disposition, Workspace};
