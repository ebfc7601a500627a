use super::graph::{build_graph, StepGraph};
use super::queue::{JobHandle, JobTransport, StepJob};
use super::registry::{TaskContext, TaskRegistry};
use super::sort;
use crate::error::WorkflowError;
use crate::events::{Event, EventLog, EventType};
use crate::storage::WorkflowStore;
use crate::types::{
    FailedStep, FailureKind, OutputCollision, RunId, RunReport, RunStatus, StepStatus,
    TaskResult, WorkflowDefinition, WorkflowId,
};
use chrono::Utc;
use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// Drives one workflow run through its topological layers
pub struct WorkflowOrchestrator {
    store: Arc<dyn WorkflowStore>,
    event_log: Arc<dyn EventLog>,
    transport: Arc<dyn JobTransport>,
    registry: Arc<TaskRegistry>,
    // Track active runs for cancellation
    active_runs: Arc<RwLock<HashMap<RunId, ActiveRun>>>,
}

/// A run in progress. At most one per workflow.
struct ActiveRun {
    workflow_id: WorkflowId,
    cancel: watch::Sender<bool>,
}

/// Mutable state of one run, local to `drive`
struct RunState<'a> {
    report: &'a mut RunReport,
    /// Successful outputs by step name
    outputs: HashMap<String, Option<Value>>,
}

impl RunState<'_> {
    fn status(&self, name: &str) -> StepStatus {
        self.report
            .step(name)
            .map(|s| s.status)
            .unwrap_or(StepStatus::Pending)
    }
}

impl WorkflowOrchestrator {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        event_log: Arc<dyn EventLog>,
        transport: Arc<dyn JobTransport>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            store,
            event_log,
            transport,
            registry,
            active_runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Execute a stored workflow under a fresh run id
    pub async fn execute(&self, workflow_id: &WorkflowId) -> Result<RunReport, WorkflowError> {
        self.execute_run(RunId::new(), workflow_id).await
    }

    /// Execute a stored workflow under the given run id.
    ///
    /// Structural problems (cycles, step types without an executor) are returned
    /// as errors and no step is dispatched; the failed run is still recorded. Step
    /// failures are not errors: they are reported in the returned `RunReport`.
    /// A workflow that already has a run in progress is rejected with
    /// `RunInProgress`.
    pub async fn execute_run(
        &self,
        run_id: RunId,
        workflow_id: &WorkflowId,
    ) -> Result<RunReport, WorkflowError> {
        let workflow = self
            .store
            .load_workflow(workflow_id)?
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.clone()))?;

        let cancel_rx = self.reserve(run_id, workflow_id).await?;

        tracing::info!("Starting workflow run: run_id={}, workflow={}", run_id, workflow_id);

        let result = self.run(run_id, &workflow, cancel_rx).await;

        self.release(run_id).await;
        result
    }

    /// Validate a stored workflow and execute it in the background.
    ///
    /// The run is indexed before this returns, so it can be queried right away.
    pub async fn submit(self: &Arc<Self>, workflow_id: &WorkflowId) -> Result<RunId, WorkflowError> {
        let workflow = self
            .store
            .load_workflow(workflow_id)?
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.clone()))?;
        self.plan(&workflow)?;

        let run_id = RunId::new();
        let cancel_rx = self.reserve(run_id, workflow_id).await?;
        if let Err(e) = self.store.index_run(&RunReport::new(run_id, &workflow)) {
            self.release(run_id).await;
            return Err(e.into());
        }

        tracing::info!("Submitted workflow run: run_id={}, workflow={}", run_id, workflow_id);

        let orchestrator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run(run_id, &workflow, cancel_rx).await {
                tracing::error!("Workflow run {} ended with error: {}", run_id, e);
            }
            orchestrator.release(run_id).await;
        });

        Ok(run_id)
    }

    /// Register a run as active, unless its workflow already has one
    async fn reserve(
        &self,
        run_id: RunId,
        workflow_id: &WorkflowId,
    ) -> Result<watch::Receiver<bool>, WorkflowError> {
        let mut active_runs = self.active_runs.write().await;

        if let Some((run, _)) = active_runs
            .iter()
            .find(|(_, active)| &active.workflow_id == workflow_id)
        {
            return Err(WorkflowError::RunInProgress {
                workflow: workflow_id.clone(),
                run: *run,
            });
        }

        let (cancel, cancel_rx) = watch::channel(false);
        active_runs.insert(
            run_id,
            ActiveRun {
                workflow_id: workflow_id.clone(),
                cancel,
            },
        );
        Ok(cancel_rx)
    }

    async fn release(&self, run_id: RunId) {
        self.active_runs.write().await.remove(&run_id);
    }

    /// Drive the run to a final report. Errors outside any step still leave a
    /// finished run record behind.
    async fn run(
        &self,
        run_id: RunId,
        workflow: &WorkflowDefinition,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<RunReport, WorkflowError> {
        let mut report = RunReport::new(run_id, workflow);
        let result = self.drive(&mut report, workflow, cancel_rx).await;

        if let Err(e) = &result {
            if !e.is_structural() {
                self.abort(&mut report, e).await;
            }
        }

        if let Err(e) = self.event_log.flush().await {
            tracing::error!("Failed to flush events for run {}: {:#}", run_id, e);
        }

        result.map(|()| report)
    }

    async fn drive(
        &self,
        report: &mut RunReport,
        workflow: &WorkflowDefinition,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<(), WorkflowError> {
        let run_id = report.id;
        self.store.index_run(report)?;
        self.emit(
            run_id,
            EventType::RunStarted {
                workflow_id: workflow.id.clone(),
                project_id: workflow.project_id.clone(),
            },
        )
        .await;

        let (graph, layers) = match self.plan(workflow) {
            Ok(plan) => plan,
            Err(e) => {
                self.finish_structural(report, &e).await?;
                return Err(e);
            }
        };

        self.store.reset_steps(&workflow.id)?;
        self.store.assign_sort(&workflow.id, &sort::flatten(&layers))?;

        for (idx, layer) in layers.iter().enumerate() {
            for name in layer {
                if let Some(step) = report.step_mut(name) {
                    step.layer = Some(idx);
                }
            }
        }
        report.layers = layers.clone();

        let mut state = RunState {
            report: &mut *report,
            outputs: HashMap::new(),
        };
        let mut cancelled = false;

        for (idx, layer) in layers.iter().enumerate() {
            if *cancel_rx.borrow() {
                tracing::warn!("Workflow run cancelled: run_id={}", run_id);
                cancelled = true;
                break;
            }

            self.run_layer(&graph, workflow, idx, layer, &mut state).await?;
        }

        if cancelled {
            for step in report.steps.iter_mut().filter(|s| s.status == StepStatus::Pending) {
                step.status = StepStatus::Blocked;
                self.store
                    .set_step_status(&workflow.id, &step.id, StepStatus::Blocked)?;
            }
            report.status = RunStatus::Cancelled;
        } else if report.steps.iter().all(|s| s.status == StepStatus::Succeeded) {
            report.status = RunStatus::Succeeded;
        } else {
            report.status = RunStatus::Failed;
        }

        let finished_at = Utc::now();
        report.finished_at = Some(finished_at);
        let duration_ms = (finished_at - report.started_at).num_milliseconds().max(0) as u64;

        match report.status {
            RunStatus::Succeeded => {
                tracing::info!("Workflow run succeeded: run_id={}", run_id);
                self.emit(run_id, EventType::RunSucceeded { duration_ms }).await;
            }
            RunStatus::Cancelled => {
                self.emit(
                    run_id,
                    EventType::RunCancelled {
                        reason: "Cancellation requested".to_string(),
                    },
                )
                .await;
            }
            _ => {
                let failed_step = report.first_failure.as_ref().map(|f| f.name.clone());
                tracing::error!(
                    "Workflow run failed: run_id={}, first failing step={}",
                    run_id,
                    failed_step.as_deref().unwrap_or("-")
                );
                self.emit(
                    run_id,
                    EventType::RunFailed {
                        error: report
                            .first_failure
                            .as_ref()
                            .and_then(|f| f.error.clone())
                            .unwrap_or_else(|| "Step failed".to_string()),
                        failed_step,
                        duration_ms,
                    },
                )
                .await;
            }
        }

        self.store.index_run(report)?;

        Ok(())
    }

    /// Dispatch every ready step of one layer and wait for all of them.
    ///
    /// Results are recorded in step name order once the whole layer is done, so
    /// the first failure does not depend on which job finished or failed first.
    async fn run_layer(
        &self,
        graph: &StepGraph,
        workflow: &WorkflowDefinition,
        layer_idx: usize,
        layer: &[String],
        state: &mut RunState<'_>,
    ) -> Result<(), WorkflowError> {
        let mut dispatched: Vec<JobHandle> = Vec::new();
        let mut finished: Vec<TaskResult> = Vec::new();

        for name in layer {
            let Some(step) = graph.step(name) else {
                continue;
            };

            if state.status(name) != StepStatus::Pending {
                continue;
            }

            let ready = graph
                .dependencies_of(name)
                .all(|dep| state.status(dep) == StepStatus::Succeeded);
            if !ready {
                // Only reachable if an ancestor's blocking was missed
                self.block(graph, &workflow.id, name, "unsatisfied dependency", state)
                    .await?;
                continue;
            }

            let (inputs, collisions) = merge_inputs(name, graph, &state.outputs);
            for collision in collisions {
                tracing::warn!(
                    "Output key '{}' for step {} offered by both {} and {}; keeping {}",
                    collision.key,
                    collision.consumer,
                    collision.kept_from,
                    collision.dropped_from,
                    collision.kept_from
                );
                self.emit(
                    state.report.id,
                    EventType::OutputCollision {
                        consumer: collision.consumer.clone(),
                        key: collision.key.clone(),
                        kept_from: collision.kept_from.clone(),
                        dropped_from: collision.dropped_from.clone(),
                    },
                )
                .await;
                state.report.collisions.push(collision);
            }

            let job = StepJob::new(TaskContext {
                step: step.clone(),
                inputs,
                workflow_id: workflow.id.clone(),
                project_id: workflow.project_id.clone(),
            });

            self.emit(
                state.report.id,
                EventType::StepScheduled {
                    step_id: step.id.clone(),
                    step_name: step.name.clone(),
                    layer: layer_idx,
                },
            )
            .await;

            match self.transport.enqueue(job).await {
                Ok(handle) => {
                    if let Some(run) = state.report.step_mut(name) {
                        run.status = StepStatus::Running;
                    }
                    dispatched.push(handle);
                }
                Err(e) => {
                    tracing::error!("Failed to enqueue step {}: {}", name, e);
                    let result = TaskResult::failed(step, Utc::now(), FailureKind::Infra, e.to_string());
                    self.store.update_step_result(&workflow.id, &step.id, &result)?;
                    finished.push(result);
                }
            }
        }

        // Barrier: the next layer starts only after every job of this one finished
        let results = join_all(dispatched.into_iter().map(|handle| async move {
            let step_id = handle.step_id().clone();
            (step_id, handle.wait().await)
        }))
        .await;

        for (step_id, outcome) in results {
            let Some(step) = graph.steps.values().find(|s| s.id == step_id) else {
                continue;
            };

            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Lost job for step {}: {}", step.name, e);
                    let result =
                        TaskResult::failed(step, Utc::now(), FailureKind::Infra, e.to_string());
                    self.store.update_step_result(&workflow.id, &step.id, &result)?;
                    result
                }
            };
            finished.push(result);
        }

        finished.sort_by(|a, b| a.step_name.cmp(&b.step_name));
        for result in finished {
            self.record(graph, &workflow.id, result, state).await?;
        }

        Ok(())
    }

    /// Apply a finished step's result to the run and unlock or block its dependents
    async fn record(
        &self,
        graph: &StepGraph,
        workflow_id: &WorkflowId,
        result: TaskResult,
        state: &mut RunState<'_>,
    ) -> Result<(), WorkflowError> {
        let run_id = state.report.id;
        let name = result.step_name.clone();

        if let Some(run) = state.report.step_mut(&name) {
            run.apply(&result);
        }

        if result.success {
            let duration_ms = (result.finished_at - result.started_at)
                .num_milliseconds()
                .max(0) as u64;
            self.emit(
                run_id,
                EventType::StepSucceeded {
                    step_id: result.step_id.clone(),
                    step_name: name.clone(),
                    duration_ms,
                    attempts: result.attempts,
                },
            )
            .await;
            state.outputs.insert(name, result.data);
            return Ok(());
        }

        let error = result.error.clone().unwrap_or_else(|| "Unknown error".to_string());
        tracing::warn!("Step {} failed: {}", name, error);
        self.emit(
            run_id,
            EventType::StepFailed {
                step_id: result.step_id.clone(),
                step_name: name.clone(),
                error: error.clone(),
                failure_kind: result.failure_kind,
            },
        )
        .await;

        if state.report.first_failure.is_none() {
            state.report.first_failure = Some(FailedStep {
                id: result.step_id.clone(),
                name: name.clone(),
                error: Some(error),
            });
        }

        self.block(graph, workflow_id, &name, &name, state).await
    }

    /// Mark every pending transitive dependent of `name` as blocked
    async fn block(
        &self,
        graph: &StepGraph,
        workflow_id: &WorkflowId,
        name: &str,
        blocked_by: &str,
        state: &mut RunState<'_>,
    ) -> Result<(), WorkflowError> {
        let mut targets = graph.transitive_dependents(name);
        if state.status(name) == StepStatus::Pending {
            targets.insert(name.to_string());
        }

        for target in targets {
            if state.status(&target) != StepStatus::Pending {
                continue;
            }
            let Some(step) = graph.step(&target) else {
                continue;
            };

            if let Some(run) = state.report.step_mut(&target) {
                run.status = StepStatus::Blocked;
            }
            self.store
                .set_step_status(workflow_id, &step.id, StepStatus::Blocked)?;

            tracing::info!("Blocking step {}: upstream {} did not succeed", target, blocked_by);
            self.emit(
                state.report.id,
                EventType::StepBlocked {
                    step_id: step.id.clone(),
                    step_name: target.clone(),
                    blocked_by: blocked_by.to_string(),
                },
            )
            .await;
        }

        Ok(())
    }

    /// Build the step graph and its layered order.
    ///
    /// Fails on cycles and on step types with no registered executor, which is
    /// everything that would stop a run before its first step.
    pub fn plan(
        &self,
        workflow: &WorkflowDefinition,
    ) -> Result<(StepGraph, Vec<Vec<String>>), WorkflowError> {
        let graph = build_graph(&workflow.steps, &workflow.edges, None);
        let layers = sort::layered(&graph)?;
        self.check_executors(&graph)?;
        Ok((graph, layers))
    }

    /// Every step type must have an executor before anything runs
    fn check_executors(&self, graph: &StepGraph) -> Result<(), WorkflowError> {
        match graph
            .steps
            .values()
            .find(|step| !self.registry.contains(&step.step_type))
        {
            Some(step) => Err(WorkflowError::MissingExecutor {
                step: step.name.clone(),
                step_type: step.step_type.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn finish_structural(
        &self,
        report: &mut RunReport,
        error: &WorkflowError,
    ) -> Result<(), WorkflowError> {
        tracing::error!("Workflow run {} rejected: {}", report.id, error);

        let failed_step = match error {
            WorkflowError::MissingExecutor { step, .. } => Some(step.clone()),
            WorkflowError::CycleDetected { steps } => steps.first().cloned(),
            _ => None,
        };

        report.status = RunStatus::Failed;
        report.structural_error = Some(error.to_string());
        report.first_failure = failed_step.as_ref().and_then(|name| {
            report.step(name).map(|s| FailedStep {
                id: s.id.clone(),
                name: s.name.clone(),
                error: Some(error.to_string()),
            })
        });
        report.finished_at = Some(Utc::now());

        self.emit(
            report.id,
            EventType::RunFailed {
                error: error.to_string(),
                failed_step,
                duration_ms: 0,
            },
        )
        .await;

        self.store.index_run(report)?;
        Ok(())
    }

    /// Close out a run stopped by an error outside any step
    async fn abort(&self, report: &mut RunReport, error: &WorkflowError) {
        tracing::error!("Workflow run {} aborted: {}", report.id, error);

        let finished_at = Utc::now();
        report.status = RunStatus::Failed;
        report.error = Some(error.to_string());
        report.finished_at = Some(finished_at);

        self.emit(
            report.id,
            EventType::RunFailed {
                error: error.to_string(),
                failed_step: report.first_failure.as_ref().map(|f| f.name.clone()),
                duration_ms: (finished_at - report.started_at).num_milliseconds().max(0) as u64,
            },
        )
        .await;

        if let Err(e) = self.store.index_run(report) {
            tracing::error!("Failed to record aborted run {}: {:#}", report.id, e);
        }
    }

    async fn emit(&self, run_id: RunId, event_type: EventType) {
        if let Err(e) = self.event_log.append(Event::new(run_id, event_type)).await {
            tracing::error!("Failed to append event for run {}: {:#}", run_id, e);
        }
    }

    pub async fn is_active(&self, run_id: &RunId) -> bool {
        self.active_runs.read().await.contains_key(run_id)
    }

    /// Ask a running workflow to stop at its next layer barrier
    pub async fn cancel(&self, run_id: RunId) -> Result<(), WorkflowError> {
        let active_runs = self.active_runs.read().await;

        match active_runs.get(&run_id) {
            Some(active) => {
                active.cancel.send(true).ok();
                tracing::info!("Cancellation signal sent for run {}", run_id);
                Ok(())
            }
            None => Err(WorkflowError::RunNotActive(run_id)),
        }
    }
}

/// Assemble a step's inputs from the outputs of its direct dependencies.
///
/// Object outputs contribute their fields; any other output is placed under the
/// producer's name. Producers are visited in name order and the first one keeps
/// a contested key; every contested key is returned as a collision.
pub fn merge_inputs(
    consumer: &str,
    graph: &StepGraph,
    outputs: &HashMap<String, Option<Value>>,
) -> (Map<String, Value>, Vec<OutputCollision>) {
    let mut inputs = Map::new();
    let mut owners: HashMap<String, String> = HashMap::new();
    let mut collisions = Vec::new();

    for producer in graph.dependencies_of(consumer) {
        let Some(Some(data)) = outputs.get(producer) else {
            continue;
        };

        let fields: Vec<(String, Value)> = match data {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            other => vec![(producer.clone(), other.clone())],
        };

        for (key, value) in fields {
            match owners.get(&key) {
                Some(owner) => collisions.push(OutputCollision {
                    consumer: consumer.to_string(),
                    key,
                    kept_from: owner.clone(),
                    dropped_from: producer.clone(),
                }),
                None => {
                    owners.insert(key.clone(), producer.clone());
                    inputs.insert(key, value);
                }
            }
        }
    }

    (inputs, collisions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Edge, Step, WorkflowId};
    use serde_json::json;

    fn graph(names: &[&str], edges: &[(&str, &str)]) -> StepGraph {
        let steps: Vec<Step> = names
            .iter()
            .map(|n| Step::new(*n, *n, WorkflowId::new("wf"), "start", json!({})))
            .collect();
        let edges: Vec<Edge> = edges.iter().map(|(s, t)| Edge::new(*s, *t)).collect();
        build_graph(&steps, &edges, None)
    }

    #[test]
    fn test_merge_unions_producer_fields() {
        let graph = graph(&["a", "b", "c"], &[("a", "c"), ("b", "c")]);
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), Some(json!({ "chunks": [1] })));
        outputs.insert("b".to_string(), Some(json!({ "questions": [2] })));

        let (inputs, collisions) = merge_inputs("c", &graph, &outputs);

        assert_eq!(inputs["chunks"], json!([1]));
        assert_eq!(inputs["questions"], json!([2]));
        assert!(collisions.is_empty());
    }

    #[test]
    fn test_merge_flags_collision_and_keeps_first_producer() {
        let graph = graph(&["b", "a", "c"], &[("b", "c"), ("a", "c")]);
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), Some(json!({ "items": "from-a" })));
        outputs.insert("b".to_string(), Some(json!({ "items": "from-b" })));

        let (inputs, collisions) = merge_inputs("c", &graph, &outputs);

        assert_eq!(inputs["items"], "from-a");
        assert_eq!(
            collisions,
            vec![OutputCollision {
                consumer: "c".to_string(),
                key: "items".to_string(),
                kept_from: "a".to_string(),
                dropped_from: "b".to_string(),
            }]
        );
    }

    #[test]
    fn test_merge_keys_scalar_output_by_producer() {
        let graph = graph(&["a", "b"], &[("a", "b")]);
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), Some(json!(42)));

        let (inputs, _) = merge_inputs("b", &graph, &outputs);
        assert_eq!(inputs["a"], 42);
    }

    #[test]
    fn test_merge_skips_producers_without_data() {
        let graph = graph(&["a", "b"], &[("a", "b")]);
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), None);

        let (inputs, collisions) = merge_inputs("b", &graph, &outputs);
        assert!(inputs.is_empty());
        assert!(collisions.is_empty());
    }

    mod runs {
        use super::super::*;
        use crate::config::{ExecutionConfig, QueueConfig};
        use crate::error::QueueError;
        use crate::storage::{JsonlEventLog, RedbWorkflowStore};
        use crate::types::{step_types, Edge, ProjectId, Step, StepId};
        use crate::workflow::sort::PlanEntry;
        use crate::workflow::queue::WorkflowQueue;
        use crate::workflow::registry::{TaskExecutor, TaskOutcome};
        use anyhow::Result;
        use serde_json::json;
        use std::collections::HashSet;
        use std::sync::Mutex;
        use tempfile::TempDir;
        use tokio::sync::Notify;

        const PIPELINE: [&str; 6] = ["start", "document", "chunker", "question", "dataset", "end"];

        /// Succeeds with `{<step name>: true}` unless the step is listed in `fail`
        #[derive(Default)]
        struct Scripted {
            fail: HashSet<String>,
            calls: Mutex<Vec<String>>,
        }

        impl Scripted {
            fn failing(names: &[&str]) -> Arc<Self> {
                Arc::new(Self {
                    fail: names.iter().map(|n| n.to_string()).collect(),
                    calls: Mutex::new(Vec::new()),
                })
            }

            fn calls(&self) -> Vec<String> {
                self.calls.lock().unwrap().clone()
            }
        }

        #[async_trait::async_trait]
        impl TaskExecutor for Scripted {
            async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutcome> {
                self.calls.lock().unwrap().push(ctx.step.name.clone());
                if self.fail.contains(&ctx.step.name) {
                    return Ok(TaskOutcome::failure(format!("{} exploded", ctx.step.name)));
                }
                let mut data = ctx.inputs.clone();
                data.insert(ctx.step.name.clone(), json!(true));
                Ok(TaskOutcome::success(Value::Object(data)))
            }
        }

        /// Transport whose broker is unreachable
        struct DownTransport;

        #[async_trait::async_trait]
        impl JobTransport for DownTransport {
            async fn enqueue(&self, _job: StepJob) -> Result<JobHandle, QueueError> {
                Err(QueueError::Unavailable)
            }

            async fn check_connectivity(&self) -> bool {
                false
            }
        }

        struct Harness {
            _dir: TempDir,
            store: Arc<RedbWorkflowStore>,
            event_log: Arc<JsonlEventLog>,
            queue: Arc<WorkflowQueue>,
            orchestrator: Arc<WorkflowOrchestrator>,
        }

        impl Harness {
            fn new(registry: TaskRegistry) -> Self {
                let dir = TempDir::new().unwrap();
                let store = Arc::new(RedbWorkflowStore::new(dir.path().join("runs.redb")).unwrap());
                let event_log = Arc::new(JsonlEventLog::new(dir.path().join("events")).unwrap());
                let registry = Arc::new(registry);
                let queue = Arc::new(WorkflowQueue::start(
                    &QueueConfig::default(),
                    &ExecutionConfig::default(),
                    registry.clone(),
                    store.clone(),
                ));
                let orchestrator = Arc::new(WorkflowOrchestrator::new(
                    store.clone(),
                    event_log.clone(),
                    queue.clone(),
                    registry,
                ));
                Self {
                    _dir: dir,
                    store,
                    event_log,
                    queue,
                    orchestrator,
                }
            }

            fn with_transport(registry: TaskRegistry, transport: Arc<dyn JobTransport>) -> Self {
                let mut harness = Self::new(registry.clone());
                harness.orchestrator = Arc::new(WorkflowOrchestrator::new(
                    harness.store.clone(),
                    harness.event_log.clone(),
                    transport,
                    Arc::new(registry),
                ));
                harness
            }

            fn save(&self, steps: &[(&str, &str)], edges: &[(&str, &str)]) -> WorkflowId {
                let wf = WorkflowId::new("wf-test");
                let definition = WorkflowDefinition {
                    id: wf.clone(),
                    project_id: ProjectId::new("proj"),
                    name: "test".to_string(),
                    steps: steps
                        .iter()
                        .map(|(name, step_type)| {
                            Step::new(format!("id-{}", name), *name, wf.clone(), *step_type, json!({}))
                        })
                        .collect(),
                    edges: edges.iter().map(|(s, t)| Edge::new(*s, *t)).collect(),
                };
                self.store.save_workflow(&definition).unwrap();
                wf
            }

            fn save_pipeline(&self) -> WorkflowId {
                let steps: Vec<(&str, &str)> = PIPELINE.iter().map(|n| (*n, *n)).collect();
                let edges: Vec<(&str, &str)> = PIPELINE.windows(2).map(|w| (w[0], w[1])).collect();
                self.save(&steps, &edges)
            }

            fn stored_status(&self, name: &str) -> StepStatus {
                self.store
                    .get_step(&WorkflowId::new("wf-test"), &StepId::new(format!("id-{}", name)))
                    .unwrap()
                    .unwrap()
                    .status
            }
        }

        fn registry_with(task: Arc<Scripted>, types: &[&str]) -> TaskRegistry {
            let mut registry = TaskRegistry::with_builtins();
            for t in types {
                registry.register(*t, task.clone());
            }
            registry
        }

        fn pipeline_registry(task: Arc<Scripted>) -> TaskRegistry {
            registry_with(
                task,
                &[
                    step_types::DOCUMENT,
                    step_types::CHUNKER,
                    step_types::QUESTION,
                    step_types::DATASET,
                ],
            )
        }

        #[tokio::test]
        async fn test_pipeline_succeeds() {
            let task = Arc::new(Scripted::default());
            let harness = Harness::new(pipeline_registry(task.clone()));
            let wf = harness.save_pipeline();

            let report = harness.orchestrator.execute(&wf).await.unwrap();

            assert_eq!(report.status, RunStatus::Succeeded);
            let expected: Vec<Vec<String>> = PIPELINE.iter().map(|n| vec![n.to_string()]).collect();
            assert_eq!(report.layers, expected);
            assert!(report.first_failure.is_none());
            assert_eq!(task.calls(), vec!["document", "chunker", "question", "dataset"]);

            for (idx, name) in PIPELINE.iter().enumerate() {
                assert_eq!(harness.stored_status(name), StepStatus::Succeeded);
                let step = harness
                    .store
                    .get_step(&wf, &StepId::new(format!("id-{}", name)))
                    .unwrap()
                    .unwrap();
                assert_eq!(step.sort, Some(idx as u32));
            }

            // Outputs thread forward: `end` sees every upstream marker
            let stored = harness.store.get_run(&report.id).unwrap().unwrap();
            assert_eq!(stored.status, RunStatus::Succeeded);
            let end = harness
                .store
                .get_step(&wf, &StepId::new("id-end"))
                .unwrap()
                .unwrap();
            assert_eq!(
                end.output,
                Some(json!({ "document": true, "chunker": true, "question": true, "dataset": true }))
            );

            harness.queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_failed_step_blocks_descendants() {
            let task = Scripted::failing(&["chunker"]);
            let harness = Harness::new(pipeline_registry(task.clone()));
            let wf = harness.save_pipeline();

            let report = harness.orchestrator.execute(&wf).await.unwrap();

            assert_eq!(report.status, RunStatus::Failed);
            let failure = report.first_failure.clone().unwrap();
            assert_eq!(failure.name, "chunker");
            assert_eq!(failure.id, StepId::new("id-chunker"));

            let statuses = report.statuses();
            assert_eq!(statuses["start"], StepStatus::Succeeded);
            assert_eq!(statuses["document"], StepStatus::Succeeded);
            assert_eq!(statuses["chunker"], StepStatus::Failed);
            for name in ["question", "dataset", "end"] {
                assert_eq!(statuses[name], StepStatus::Blocked);
                assert_eq!(harness.stored_status(name), StepStatus::Blocked);
            }

            // Nothing downstream of the failure was ever dispatched
            assert_eq!(task.calls(), vec!["document", "chunker"]);

            let events = harness.event_log.get_run_events(report.id).await.unwrap();
            let blocked = events
                .iter()
                .filter(|e| matches!(e.event_type, EventType::StepBlocked { .. }))
                .count();
            assert_eq!(blocked, 3);
            assert!(events
                .iter()
                .any(|e| matches!(&e.event_type, EventType::RunFailed { failed_step: Some(s), .. } if s == "chunker")));

            harness.queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_independent_branch_keeps_running() {
            let task = Scripted::failing(&["a"]);
            let harness = Harness::new(registry_with(task.clone(), &["work"]));
            let wf = harness.save(
                &[("a", "work"), ("b", "work"), ("c", "work"), ("d", "work"), ("e", "work")],
                &[("a", "c"), ("b", "c"), ("b", "d"), ("d", "e")],
            );

            let report = harness.orchestrator.execute(&wf).await.unwrap();

            let statuses = report.statuses();
            assert_eq!(statuses["a"], StepStatus::Failed);
            assert_eq!(statuses["b"], StepStatus::Succeeded);
            assert_eq!(statuses["c"], StepStatus::Blocked);
            assert_eq!(statuses["d"], StepStatus::Succeeded);
            assert_eq!(statuses["e"], StepStatus::Succeeded);
            assert_eq!(report.status, RunStatus::Failed);
            assert!(!task.calls().contains(&"c".to_string()));

            harness.queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_cycle_is_structural() {
            let task = Arc::new(Scripted::default());
            let harness = Harness::new(registry_with(task.clone(), &["work"]));
            let wf = harness.save(
                &[("start", "start"), ("x", "work"), ("y", "work")],
                &[("start", "x"), ("x", "y"), ("y", "x")],
            );

            let err = harness.orchestrator.execute(&wf).await.unwrap_err();

            match &err {
                WorkflowError::CycleDetected { steps } => assert_eq!(steps, &vec!["x", "y"]),
                other => panic!("expected cycle, got {:?}", other),
            }
            assert!(err.is_structural());
            assert!(task.calls().is_empty());
            assert_eq!(harness.stored_status("start"), StepStatus::Pending);

            let runs = harness.store.list_runs().unwrap();
            assert_eq!(runs.len(), 1);
            assert_eq!(runs[0].status, RunStatus::Failed);
            assert!(runs[0].structural_error.as_ref().unwrap().contains("cycle"));

            harness.queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_self_loop_is_structural() {
            let harness = Harness::new(TaskRegistry::with_builtins());
            let wf = harness.save(&[("x", "start")], &[("x", "x")]);

            let err = harness.orchestrator.execute(&wf).await.unwrap_err();
            assert!(matches!(err, WorkflowError::CycleDetected { .. }));

            harness.queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_unregistered_type_is_structural() {
            let harness = Harness::new(TaskRegistry::with_builtins());
            let wf = harness.save(
                &[("start", "start"), ("gen", "question"), ("end", "end")],
                &[("start", "gen"), ("gen", "end")],
            );

            let err = harness.orchestrator.execute(&wf).await.unwrap_err();

            match err {
                WorkflowError::MissingExecutor { step, step_type } => {
                    assert_eq!(step, "gen");
                    assert_eq!(step_type, "question");
                }
                other => panic!("expected missing executor, got {:?}", other),
            }
            assert_eq!(harness.stored_status("start"), StepStatus::Pending);

            harness.queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_unknown_edge_endpoint_is_ignored() {
            let harness = Harness::new(TaskRegistry::with_builtins());
            let wf = harness.save(
                &[("start", "start"), ("end", "end")],
                &[("start", "end"), ("phantom", "end")],
            );

            let report = harness.orchestrator.execute(&wf).await.unwrap();

            assert_eq!(report.status, RunStatus::Succeeded);
            assert_eq!(report.layers, vec![vec!["start"], vec!["end"]]);

            harness.queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_unavailable_transport_is_infra_failure() {
            let harness = Harness::with_transport(TaskRegistry::with_builtins(), Arc::new(DownTransport));
            let wf = harness.save(&[("start", "start"), ("end", "end")], &[("start", "end")]);

            let report = harness.orchestrator.execute(&wf).await.unwrap();

            assert_eq!(report.status, RunStatus::Failed);
            let start = report.step("start").unwrap();
            assert_eq!(start.status, StepStatus::Failed);
            assert_eq!(start.failure_kind, Some(FailureKind::Infra));
            assert_eq!(report.step("end").unwrap().status, StepStatus::Blocked);
            assert_eq!(harness.stored_status("start"), StepStatus::Failed);

            harness.queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_collision_is_recorded() {
            let task = Arc::new(Scripted::default());
            let harness = Harness::new(registry_with(task, &["work"]));
            // Both branches forward `start`'s marker, so `join` sees it twice
            let wf = harness.save(
                &[("start", "work"), ("left", "work"), ("right", "work"), ("join", "work")],
                &[("start", "left"), ("start", "right"), ("left", "join"), ("right", "join")],
            );

            let report = harness.orchestrator.execute(&wf).await.unwrap();

            assert_eq!(report.status, RunStatus::Succeeded);
            assert_eq!(
                report.collisions,
                vec![OutputCollision {
                    consumer: "join".to_string(),
                    key: "start".to_string(),
                    kept_from: "left".to_string(),
                    dropped_from: "right".to_string(),
                }]
            );

            harness.queue.shutdown().await;
        }

        /// Waits for a release signal before succeeding
        struct Held {
            started: Notify,
            release: Notify,
        }

        #[async_trait::async_trait]
        impl TaskExecutor for Held {
            async fn execute(&self, _ctx: &TaskContext) -> Result<TaskOutcome> {
                self.started.notify_one();
                self.release.notified().await;
                Ok(TaskOutcome::Success { data: None })
            }
        }

        #[tokio::test]
        async fn test_cancel_stops_at_next_barrier() {
            let held = Arc::new(Held {
                started: Notify::new(),
                release: Notify::new(),
            });
            let mut registry = TaskRegistry::with_builtins();
            registry.register("held", held.clone());
            let harness = Harness::new(registry);
            let wf = harness.save(
                &[("start", "start"), ("slow", "held"), ("end", "end")],
                &[("start", "slow"), ("slow", "end")],
            );

            let run_id = RunId::new();
            let orchestrator = harness.orchestrator.clone();
            let wf_id = wf.clone();
            let run = tokio::spawn(async move { orchestrator.execute_run(run_id, &wf_id).await });

            held.started.notified().await;
            assert!(harness.orchestrator.is_active(&run_id).await);
            harness.orchestrator.cancel(run_id).await.unwrap();
            held.release.notify_one();

            let report = run.await.unwrap().unwrap();
            assert_eq!(report.status, RunStatus::Cancelled);
            assert_eq!(report.step("slow").unwrap().status, StepStatus::Succeeded);
            assert_eq!(report.step("end").unwrap().status, StepStatus::Blocked);

            assert!(!harness.orchestrator.is_active(&run_id).await);
            assert!(matches!(
                harness.orchestrator.cancel(run_id).await,
                Err(WorkflowError::RunNotActive(_))
            ));

            harness.queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_submit_runs_in_background() {
            let task = Arc::new(Scripted::default());
            let harness = Harness::new(pipeline_registry(task));
            let wf = harness.save_pipeline();

            let run_id = harness.orchestrator.submit(&wf).await.unwrap();
            assert!(harness.store.get_run(&run_id).unwrap().is_some());

            let mut status = RunStatus::Running;
            for _ in 0..100 {
                status = harness.store.get_run(&run_id).unwrap().unwrap().status;
                if status != RunStatus::Running {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            assert_eq!(status, RunStatus::Succeeded);

            harness.queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_submit_rejects_structural_errors() {
            let harness = Harness::new(TaskRegistry::with_builtins());
            let wf = harness.save(&[("start", "start"), ("gen", "question")], &[("start", "gen")]);

            let err = harness.orchestrator.submit(&wf).await.unwrap_err();
            assert!(err.is_structural());
            assert!(harness.store.list_runs().unwrap().is_empty());

            harness.queue.shutdown().await;
        }

        fn held_harness() -> (Arc<Held>, Harness, WorkflowId) {
            let held = Arc::new(Held {
                started: Notify::new(),
                release: Notify::new(),
            });
            let mut registry = TaskRegistry::with_builtins();
            registry.register("held", held.clone());
            let harness = Harness::new(registry);
            let wf = harness.save(
                &[("start", "start"), ("slow", "held"), ("end", "end")],
                &[("start", "slow"), ("slow", "end")],
            );
            (held, harness, wf)
        }

        #[tokio::test]
        async fn test_second_run_of_same_workflow_is_rejected() {
            let (held, harness, wf) = held_harness();

            let run_id = RunId::new();
            let orchestrator = harness.orchestrator.clone();
            let wf_id = wf.clone();
            let first = tokio::spawn(async move { orchestrator.execute_run(run_id, &wf_id).await });
            held.started.notified().await;

            match harness.orchestrator.execute(&wf).await {
                Err(WorkflowError::RunInProgress { workflow, run }) => {
                    assert_eq!(workflow, wf);
                    assert_eq!(run, run_id);
                }
                other => panic!("expected run in progress, got {:?}", other),
            }
            assert!(matches!(
                harness.orchestrator.submit(&wf).await,
                Err(WorkflowError::RunInProgress { .. })
            ));

            // The rejected attempts left the live run and its step records alone
            assert_eq!(harness.store.list_runs().unwrap().len(), 1);
            assert_eq!(harness.stored_status("start"), StepStatus::Succeeded);
            assert_eq!(harness.stored_status("slow"), StepStatus::Running);

            held.release.notify_one();
            let report = first.await.unwrap().unwrap();
            assert_eq!(report.status, RunStatus::Succeeded);

            // Free again once the first run finished
            let again = tokio::spawn({
                let orchestrator = harness.orchestrator.clone();
                let wf = wf.clone();
                async move { orchestrator.execute(&wf).await }
            });
            held.started.notified().await;
            held.release.notify_one();
            assert_eq!(again.await.unwrap().unwrap().status, RunStatus::Succeeded);

            harness.queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_run_events_are_on_disk_when_run_ends() {
            let task = Arc::new(Scripted::default());
            let harness = Harness::new(pipeline_registry(task));
            let wf = harness.save_pipeline();

            let report = harness.orchestrator.execute(&wf).await.unwrap();

            // A separate reader only sees what was written out
            let reader = JsonlEventLog::new(harness._dir.path().join("events")).unwrap();
            let events = reader.get_run_events(report.id).await.unwrap();
            assert!(matches!(events[0].event_type, EventType::RunStarted { .. }));
            assert!(events
                .iter()
                .any(|e| matches!(e.event_type, EventType::RunSucceeded { .. })));

            harness.queue.shutdown().await;
        }

        /// Store whose step resets always fail
        struct BrokenResets {
            inner: Arc<RedbWorkflowStore>,
        }

        impl WorkflowStore for BrokenResets {
            fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
                self.inner.save_workflow(workflow)
            }

            fn load_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowDefinition>> {
                self.inner.load_workflow(workflow_id)
            }

            fn reset_steps(&self, _workflow_id: &WorkflowId) -> Result<()> {
                anyhow::bail!("disk full")
            }

            fn assign_sort(&self, workflow_id: &WorkflowId, plan: &[PlanEntry]) -> Result<()> {
                self.inner.assign_sort(workflow_id, plan)
            }

            fn get_step(&self, workflow_id: &WorkflowId, step_id: &StepId) -> Result<Option<Step>> {
                self.inner.get_step(workflow_id, step_id)
            }

            fn set_step_status(
                &self,
                workflow_id: &WorkflowId,
                step_id: &StepId,
                status: StepStatus,
            ) -> Result<()> {
                self.inner.set_step_status(workflow_id, step_id, status)
            }

            fn update_step_result(
                &self,
                workflow_id: &WorkflowId,
                step_id: &StepId,
                result: &TaskResult,
            ) -> Result<()> {
                self.inner.update_step_result(workflow_id, step_id, result)
            }

            fn index_run(&self, report: &RunReport) -> Result<()> {
                self.inner.index_run(report)
            }

            fn get_run(&self, run_id: &RunId) -> Result<Option<RunReport>> {
                self.inner.get_run(run_id)
            }

            fn list_runs(&self) -> Result<Vec<RunReport>> {
                self.inner.list_runs()
            }
        }

        #[tokio::test]
        async fn test_store_failure_finishes_run_as_failed() {
            let harness = Harness::new(TaskRegistry::with_builtins());
            let wf = harness.save(&[("start", "start"), ("end", "end")], &[("start", "end")]);
            let orchestrator = WorkflowOrchestrator::new(
                Arc::new(BrokenResets {
                    inner: harness.store.clone(),
                }),
                harness.event_log.clone(),
                harness.queue.clone(),
                Arc::new(TaskRegistry::with_builtins()),
            );

            let err = orchestrator.execute(&wf).await.unwrap_err();
            assert!(matches!(err, WorkflowError::Storage(_)));

            let runs = harness.store.list_runs().unwrap();
            assert_eq!(runs.len(), 1);
            assert_eq!(runs[0].status, RunStatus::Failed);
            assert!(runs[0].finished_at.is_some());
            assert!(runs[0].error.as_ref().unwrap().contains("disk full"));
            assert!(runs[0].structural_error.is_none());

            let events = harness.event_log.get_run_events(runs[0].id).await.unwrap();
            assert!(events
                .iter()
                .any(|e| matches!(e.event_type, EventType::RunFailed { .. })));

            // Nothing is left registered for the workflow
            assert!(!orchestrator.is_active(&runs[0].id).await);

            harness.queue.shutdown().await;
        }

        /// Refuses one step by name and forwards the rest to a real queue
        struct Refusing {
            inner: Arc<WorkflowQueue>,
            refuse: &'static str,
        }

        #[async_trait::async_trait]
        impl JobTransport for Refusing {
            async fn enqueue(&self, job: StepJob) -> Result<JobHandle, QueueError> {
                if job.context.step.name == self.refuse {
                    return Err(QueueError::Unavailable);
                }
                self.inner.enqueue(job).await
            }

            async fn check_connectivity(&self) -> bool {
                true
            }
        }

        #[tokio::test]
        async fn test_first_failure_follows_name_order_within_layer() {
            let task = Scripted::failing(&["a"]);
            let registry = registry_with(task, &["work"]);
            let mut harness = Harness::new(registry.clone());
            harness.orchestrator = Arc::new(WorkflowOrchestrator::new(
                harness.store.clone(),
                harness.event_log.clone(),
                Arc::new(Refusing {
                    inner: harness.queue.clone(),
                    refuse: "b",
                }),
                Arc::new(registry),
            ));
            let wf = harness.save(&[("a", "work"), ("b", "work")], &[]);

            let report = harness.orchestrator.execute(&wf).await.unwrap();

            assert_eq!(report.status, RunStatus::Failed);
            assert_eq!(report.first_failure.as_ref().unwrap().name, "a");
            assert_eq!(report.step("b").unwrap().failure_kind, Some(FailureKind::Infra));
            assert_eq!(report.step("b").unwrap().status, StepStatus::Failed);

            harness.queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_unknown_workflow() {
            let harness = Harness::new(TaskRegistry::with_builtins());

            let err = harness
                .orchestrator
                .execute(&WorkflowId::new("missing"))
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::WorkflowNotFound(_)));

            harness.queue.shutdown().await;
        }
    }
}
