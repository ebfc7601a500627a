use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event in a run's event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events emitted while a workflow runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        workflow_id: WorkflowId,
        project_id: ProjectId,
    },
    RunSucceeded {
        duration_ms: u64,
    },
    RunFailed {
        error: String,
        failed_step: Option<String>,
        duration_ms: u64,
    },
    RunCancelled {
        reason: String,
    },

    // Step lifecycle events
    StepScheduled {
        step_id: StepId,
        step_name: String,
        layer: usize,
    },
    StepSucceeded {
        step_id: StepId,
        step_name: String,
        duration_ms: u64,
        attempts: u32,
    },
    StepFailed {
        step_id: StepId,
        step_name: String,
        error: String,
        failure_kind: Option<FailureKind>,
    },
    StepBlocked {
        step_id: StepId,
        step_name: String,
        blocked_by: String,
    },

    // Input assembly
    OutputCollision {
        consumer: String,
        key: String,
        kept_from: String,
        dropped_from: String,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run, oldest first
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;

    /// Write out anything still buffered
    async fn flush(&self) -> anyhow::Result<()>;
}
