use crate::types::{step_types, ProjectId, Step, WorkflowId};
use anyhow::Result;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Everything an executor gets to see for one step execution
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub step: Step,
    /// Merged `data` of the step's direct dependencies
    pub inputs: Map<String, Value>,
    pub workflow_id: WorkflowId,
    pub project_id: ProjectId,
}

impl TaskContext {
    /// Look up a setting on the step's own input first, then on the merged inputs
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.step.input.get(key).or_else(|| self.inputs.get(key))
    }
}

/// What an executor reports when it finishes without erroring
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success { data: Option<Value> },
    Failure { error: String },
}

impl TaskOutcome {
    pub fn success(data: Value) -> Self {
        Self::Success { data: Some(data) }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }
}

/// The work behind one step type
///
/// Executors hold no scheduler state. Anything they need arrives through the
/// context; anything they produce leaves through the outcome. Returning `Err` is
/// treated the same as `TaskOutcome::Failure`.
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutcome>;
}

/// Step type -> executor, populated at startup
#[derive(Clone, Default)]
pub struct TaskRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the structural `start` and `end` executors
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(step_types::START, Arc::new(StartTask));
        registry.register(step_types::END, Arc::new(EndTask));
        registry
    }

    /// Register an executor, returning the one it replaced
    pub fn register(
        &mut self,
        step_type: impl Into<String>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Option<Arc<dyn TaskExecutor>> {
        let step_type = step_type.into();
        tracing::debug!("Registering executor for step type '{}'", step_type);
        self.executors.insert(step_type, executor)
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(step_type).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.executors.contains_key(step_type)
    }

    /// Registered step types, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("types", &self.types())
            .finish()
    }
}

/// Entry anchor. Passes its own input through as output.
pub struct StartTask;

#[async_trait::async_trait]
impl TaskExecutor for StartTask {
    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutcome> {
        let data = match &ctx.step.input {
            Value::Null => None,
            input => Some(input.clone()),
        };
        Ok(TaskOutcome::Success { data })
    }
}

/// Exit anchor. Passes the merged upstream outputs through.
pub struct EndTask;

#[async_trait::async_trait]
impl TaskExecutor for EndTask {
    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutcome> {
        let data = if ctx.inputs.is_empty() {
            None
        } else {
            Some(Value::Object(ctx.inputs.clone()))
        };
        Ok(TaskOutcome::Success { data })
    }
}
