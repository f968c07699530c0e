use thiserror::Error;

use crate::runtime::job::JobId;
use crate::runtime::task::TaskId;

/// Error taxonomy of the engine.
///
/// `TargetNotFound` and `FlowEvaluation` are internal invariant violations:
/// fatal for the affected job only, raised before any mutation is applied.
/// Resource scarcity is never an error and has no variant here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("task {task} not found in job {job}")]
    TaskNotFound { job: JobId, task: TaskId },

    #[error("flow target '{target}' of task {initiator} could not be resolved")]
    TargetNotFound { initiator: TaskId, target: String },

    #[error("task {task} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        task: TaskId,
        from: crate::runtime::task::TaskStatus,
        to: crate::runtime::task::TaskStatus,
    },

    #[error("flow script of task {task} failed: {reason}")]
    FlowEvaluation { task: TaskId, reason: String },

    #[error("invalid cron expression '{expr}': {reason}")]
    CronInvalid { expr: String, reason: String },

    #[error("selection constraint evaluation failed: {0}")]
    ConstraintEvaluation(String),

    #[error("invalid job definition: {0}")]
    Definition(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
