use super::WorkflowStore;
use crate::types::{
    Edge, ProjectId, RunId, RunReport, Step, StepId, StepStatus, TaskResult, WorkflowDefinition,
    WorkflowId,
};
use crate::workflow::sort::PlanEntry;
use anyhow::{Context, Result};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

const WORKFLOWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");
const STEPS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("steps");
const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Step rows are keyed by workflow so node ids only need to be unique within one
fn step_key(workflow_id: &WorkflowId, step_id: &StepId) -> String {
    format!("{}/{}", workflow_id, step_id)
}

/// Workflow row: steps are stored separately and referenced by id
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkflowRecord {
    id: WorkflowId,
    project_id: ProjectId,
    name: String,
    step_ids: Vec<StepId>,
    edges: Vec<Edge>,
}

/// Workflow and run storage using redb
#[derive(Clone)]
pub struct RedbWorkflowStore {
    db: Arc<Database>,
}

impl RedbWorkflowStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("Failed to open workflows table")?;
            write_txn
                .open_table(STEPS_TABLE)
                .context("Failed to open steps table")?;
            write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open runs table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn read_workflow_record(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(WORKFLOWS_TABLE)
            .context("Failed to open table")?;

        let value = table
            .get(workflow_id.0.as_str())
            .context("Failed to get workflow")?;

        match value {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize workflow")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Apply `update` to each listed step inside a single write transaction
    fn modify_steps<F>(
        &self,
        workflow_id: &WorkflowId,
        step_ids: &[StepId],
        mut update: F,
    ) -> Result<()>
    where
        F: FnMut(&mut Step),
    {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(STEPS_TABLE)
                .context("Failed to open table")?;

            for step_id in step_ids {
                let key = step_key(workflow_id, step_id);
                let mut step: Step = {
                    let guard = table
                        .get(key.as_str())
                        .context("Failed to get step")?
                        .with_context(|| format!("Step {} not found", step_id))?;
                    serde_json::from_slice(guard.value()).context("Failed to deserialize step")?
                };

                update(&mut step);

                let value = serde_json::to_vec(&step).context("Failed to serialize step")?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .context("Failed to insert step")?;
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn step_ids_of(&self, workflow_id: &WorkflowId) -> Result<Vec<StepId>> {
        let record = self
            .read_workflow_record(workflow_id)?
            .with_context(|| format!("Workflow {} not found", workflow_id))?;
        Ok(record.step_ids)
    }
}

impl WorkflowStore for RedbWorkflowStore {
    fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        let mut seen = HashSet::new();
        if let Some(dup) = workflow.steps.iter().find(|s| !seen.insert(&s.id)) {
            anyhow::bail!("Duplicate step id {} in workflow {}", dup.id, workflow.id);
        }

        let previous = self.read_workflow_record(&workflow.id)?;

        let record = WorkflowRecord {
            id: workflow.id.clone(),
            project_id: workflow.project_id.clone(),
            name: workflow.name.clone(),
            step_ids: workflow.steps.iter().map(|s| s.id.clone()).collect(),
            edges: workflow.edges.clone(),
        };

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut steps = write_txn
                .open_table(STEPS_TABLE)
                .context("Failed to open table")?;

            if let Some(previous) = previous {
                for stale in previous
                    .step_ids
                    .iter()
                    .filter(|id| !record.step_ids.contains(id))
                {
                    steps
                        .remove(step_key(&workflow.id, stale).as_str())
                        .context("Failed to remove step")?;
                }
            }

            for step in &workflow.steps {
                let mut step = step.clone();
                step.workflow_id = workflow.id.clone();
                let value = serde_json::to_vec(&step).context("Failed to serialize step")?;
                steps
                    .insert(step_key(&workflow.id, &step.id).as_str(), value.as_slice())
                    .context("Failed to insert step")?;
            }

            let mut workflows = write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("Failed to open table")?;
            let value = serde_json::to_vec(&record).context("Failed to serialize workflow")?;
            workflows
                .insert(workflow.id.0.as_str(), value.as_slice())
                .context("Failed to insert workflow")?;
        }
        write_txn.commit().context("Failed to commit")?;

        tracing::info!(
            "Saved workflow {} ({} steps, {} edges)",
            workflow.id,
            workflow.steps.len(),
            workflow.edges.len()
        );

        Ok(())
    }

    fn load_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowDefinition>> {
        let Some(record) = self.read_workflow_record(workflow_id)? else {
            return Ok(None);
        };

        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(STEPS_TABLE)
            .context("Failed to open table")?;

        let mut steps = Vec::with_capacity(record.step_ids.len());
        for step_id in &record.step_ids {
            let guard = table
                .get(step_key(workflow_id, step_id).as_str())
                .context("Failed to get step")?
                .with_context(|| format!("Step {} missing for workflow {}", step_id, workflow_id))?;
            let step: Step =
                serde_json::from_slice(guard.value()).context("Failed to deserialize step")?;
            steps.push(step);
        }

        Ok(Some(WorkflowDefinition {
            id: record.id,
            project_id: record.project_id,
            name: record.name,
            steps,
            edges: record.edges,
        }))
    }

    fn reset_steps(&self, workflow_id: &WorkflowId) -> Result<()> {
        let step_ids = self.step_ids_of(workflow_id)?;
        self.modify_steps(workflow_id, &step_ids, Step::reset)
    }

    fn assign_sort(&self, workflow_id: &WorkflowId, plan: &[PlanEntry]) -> Result<()> {
        let sorts: HashMap<&str, u32> = plan.iter().map(|e| (e.name.as_str(), e.sort)).collect();
        let step_ids = self.step_ids_of(workflow_id)?;

        self.modify_steps(workflow_id, &step_ids, |step| {
            step.sort = sorts.get(step.name.as_str()).copied();
        })
    }

    fn get_step(&self, workflow_id: &WorkflowId, step_id: &StepId) -> Result<Option<Step>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(STEPS_TABLE)
            .context("Failed to open table")?;

        let key = step_key(workflow_id, step_id);
        match table.get(key.as_str()).context("Failed to get step")? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).context("Failed to deserialize step")?,
            )),
            None => Ok(None),
        }
    }

    fn set_step_status(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        status: StepStatus,
    ) -> Result<()> {
        self.modify_steps(workflow_id, std::slice::from_ref(step_id), |step| {
            step.status = status;
            if status == StepStatus::Running {
                step.started_at = Some(Utc::now());
            }
        })
    }

    fn update_step_result(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        result: &TaskResult,
    ) -> Result<()> {
        self.modify_steps(workflow_id, std::slice::from_ref(step_id), |step| {
            step.status = result.status();
            step.started_at = Some(result.started_at);
            step.finished_at = Some(result.finished_at);
            step.output = result.data.clone();
            step.error = result.error.clone();
        })
    }

    fn index_run(&self, run: &RunReport) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open table")?;

            let key = run.id.to_string();
            let value = serde_json::to_vec(run).context("Failed to serialize run")?;

            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert run")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<RunReport>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let key = run_id.to_string();
        let value = table.get(key.as_str()).context("Failed to get run")?;

        match value {
            Some(guard) => {
                let run = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize run")?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    fn list_runs(&self) -> Result<Vec<RunReport>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let mut runs = Vec::new();
        for item in table.iter().context("Failed to iterate runs")? {
            let (_key, value) = item.context("Failed to read item")?;
            let run: RunReport =
                serde_json::from_slice(value.value()).context("Failed to deserialize run")?;
            runs.push(run);
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        Ok(runs)
    }
}
