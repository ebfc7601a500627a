use crate::types::{RunId, StepId, WorkflowId};

/// Errors that stop a workflow run as a whole
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The dependency graph is not acyclic
    #[error("workflow contains a cycle among steps: {}", .steps.join(", "))]
    CycleDetected { steps: Vec<String> },

    /// A node references a step type nothing is registered for
    #[error("step '{step}' has type '{step_type}' with no registered executor")]
    MissingExecutor { step: String, step_type: String },

    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    #[error("run {0} is not active")]
    RunNotActive(RunId),

    /// One run per workflow at a time: runs share the workflow's step records
    #[error("workflow {workflow} already has run {run} in progress")]
    RunInProgress { workflow: WorkflowId, run: RunId },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Structural errors are detected before any step is dispatched
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::CycleDetected { .. } | Self::MissingExecutor { .. }
        )
    }
}

/// Job transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job queue is unavailable")]
    Unavailable,

    #[error("step {0} already has a job in flight")]
    AlreadyInFlight(StepId),

    #[error("job for step {0} was dropped before completion")]
    JobDropped(StepId),
}
