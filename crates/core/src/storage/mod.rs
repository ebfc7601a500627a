pub mod event_log;
pub mod workflow_store;

pub use event_log::JsonlEventLog;
pub use workflow_store::RedbWorkflowStore;

use crate::types::{
    RunId, RunReport, Step, StepId, StepStatus, TaskResult, WorkflowDefinition, WorkflowId,
};
use crate::workflow::sort::PlanEntry;
use anyhow::Result;

/// Persistence of workflows, step records and run reports
pub trait WorkflowStore: Send + Sync {
    /// Save an authored workflow, replacing any previous version.
    ///
    /// Step ids must be unique within the workflow; they are scoped to it.
    fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()>;

    /// Fetch a workflow with all of its steps and edges
    fn load_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowDefinition>>;

    /// Return every step of a workflow to `pending`, clearing previous results
    fn reset_steps(&self, workflow_id: &WorkflowId) -> Result<()>;

    /// Persist the flattened execution plan onto the steps
    fn assign_sort(&self, workflow_id: &WorkflowId, plan: &[PlanEntry]) -> Result<()>;

    fn get_step(&self, workflow_id: &WorkflowId, step_id: &StepId) -> Result<Option<Step>>;

    fn set_step_status(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        status: StepStatus,
    ) -> Result<()>;

    /// Write a finished attempt onto its step record
    fn update_step_result(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        result: &TaskResult,
    ) -> Result<()>;

    fn index_run(&self, run: &RunReport) -> Result<()>;

    fn get_run(&self, run_id: &RunId) -> Result<Option<RunReport>>;

    /// All runs, most recent first
    fn list_runs(&self) -> Result<Vec<RunReport>>;
}
