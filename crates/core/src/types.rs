use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow step
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for the project owning a workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Built-in step type tags. The set is open: any string with a registered
/// executor is a valid step type.
pub mod step_types {
    pub const START: &str = "start";
    pub const DOCUMENT: &str = "document";
    pub const CHUNKER: &str = "chunker";
    pub const QUESTION: &str = "question";
    pub const DATASET: &str = "dataset";
    pub const END: &str = "end";
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Status of a workflow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Never dispatched because an ancestor failed or the run was cancelled
    Blocked,
}

/// A single node of a workflow graph, as authored and as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    /// Unique within the workflow; used as the graph key
    pub name: String,
    pub workflow_id: WorkflowId,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub sort: Option<u32>,
    #[serde(default)]
    pub input: Value,
    #[serde(default = "default_step_status")]
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_step_status() -> StepStatus {
    StepStatus::Pending
}

impl Step {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        workflow_id: WorkflowId,
        step_type: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            id: StepId::new(id),
            name: name.into(),
            workflow_id,
            step_type: step_type.into(),
            sort: None,
            input,
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
        }
    }

    /// Per-step timeout override, read from `input.timeout_secs`
    pub fn timeout_secs(&self) -> Option<u64> {
        self.input.get("timeout_secs").and_then(Value::as_u64)
    }

    /// Per-step retry policy, read from `input.retry`
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.input
            .get("retry")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Clear everything a previous execution wrote onto this record
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.started_at = None;
        self.finished_at = None;
        self.output = None;
        self.error = None;
    }
}

/// Directed dependency: `source` must succeed before `target` may run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// A saved workflow: the node list and edge list produced by the authoring canvas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub project_id: ProjectId,
    pub name: String,
    pub steps: Vec<Step>,
    pub edges: Vec<Edge>,
}

/// Retry policy for a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_backoff_ms() -> u64 {
    500
}

/// Why a step attempt did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The executor returned an error or reported failure
    Task,
    Timeout,
    Panic,
    MissingExecutor,
    /// The job transport could not accept or complete the job
    Infra,
}

/// Outcome of one step execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub step_id: StepId,
    pub step_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_attempts() -> u32 {
    1
}

impl TaskResult {
    pub fn succeeded(step: &Step, started_at: DateTime<Utc>, data: Option<Value>) -> Self {
        Self {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            success: true,
            data,
            error: None,
            failure_kind: None,
            started_at,
            finished_at: Utc::now(),
            attempts: 1,
        }
    }

    pub fn failed(
        step: &Step,
        started_at: DateTime<Utc>,
        kind: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            success: false,
            data: None,
            error: Some(error.into()),
            failure_kind: Some(kind),
            started_at,
            finished_at: Utc::now(),
            attempts: 1,
        }
    }

    pub fn status(&self) -> StepStatus {
        if self.success {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        }
    }
}

/// Per-step view of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub id: StepId,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: String,
    pub layer: Option<usize>,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
}

impl StepRun {
    pub fn pending(step: &Step) -> Self {
        Self {
            id: step.id.clone(),
            name: step.name.clone(),
            step_type: step.step_type.clone(),
            layer: None,
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            attempts: 0,
            error: None,
            failure_kind: None,
        }
    }

    pub fn apply(&mut self, result: &TaskResult) {
        self.status = result.status();
        self.started_at = Some(result.started_at);
        self.finished_at = Some(result.finished_at);
        self.attempts = result.attempts;
        self.error = result.error.clone();
        self.failure_kind = result.failure_kind;
    }
}

/// Identity of the step that made a run fail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedStep {
    pub id: StepId,
    pub name: String,
    pub error: Option<String>,
}

/// Two producers offered the same output key to one consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCollision {
    pub consumer: String,
    pub key: String,
    pub kept_from: String,
    pub dropped_from: String,
}

/// A specific execution of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub project_id: ProjectId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub layers: Vec<Vec<String>>,
    pub steps: Vec<StepRun>,
    pub first_failure: Option<FailedStep>,
    pub structural_error: Option<String>,
    pub collisions: Vec<OutputCollision>,
    /// Set when the run was aborted by an error outside any step
    #[serde(default)]
    pub error: Option<String>,
}

impl RunReport {
    pub fn new(id: RunId, workflow: &WorkflowDefinition) -> Self {
        Self {
            id,
            workflow_id: workflow.id.clone(),
            project_id: workflow.project_id.clone(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            layers: Vec::new(),
            steps: workflow.steps.iter().map(StepRun::pending).collect(),
            first_failure: None,
            structural_error: None,
            collisions: Vec::new(),
            error: None,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepRun> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepRun> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// Step statuses keyed by name
    pub fn statuses(&self) -> HashMap<String, StepStatus> {
        self.steps
            .iter()
            .map(|s| (s.name.clone(), s.status))
            .collect()
    }
}
