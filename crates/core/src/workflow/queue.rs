//! Job queue between the orchestrator and step execution.
//!
//! [`JobTransport`] is the capability the orchestrator depends on: enqueue a job,
//! wait for its result through the returned handle, and check connectivity before
//! accepting work. [`WorkflowQueue`] is the in-process implementation: a bounded
//! tokio channel drained by a fixed pool of worker tasks.
//!
//! Workers own the write-back of a job's `TaskResult` onto the step record. Only
//! one job per workflow step may be queued or running at a time, so no two
//! workers ever write the same record concurrently.

use super::registry::{TaskContext, TaskRegistry};
use super::step_executor::StepExecutor;
use crate::config::{ExecutionConfig, QueueConfig};
use crate::error::QueueError;
use crate::storage::WorkflowStore;
use crate::types::{StepId, StepStatus, TaskResult, WorkflowId};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// One unit of work: a step plus its resolved inputs
#[derive(Debug, Clone)]
pub struct StepJob {
    pub context: TaskContext,
}

impl StepJob {
    pub fn new(context: TaskContext) -> Self {
        Self { context }
    }

    pub fn step_id(&self) -> &StepId {
        &self.context.step.id
    }

    fn key(&self) -> InFlightKey {
        (self.context.workflow_id.clone(), self.context.step.id.clone())
    }
}

/// Step ids are only unique within their workflow
type InFlightKey = (WorkflowId, StepId);

/// Completion handle returned by `enqueue`
#[derive(Debug)]
pub struct JobHandle {
    step_id: StepId,
    receiver: oneshot::Receiver<TaskResult>,
}

impl JobHandle {
    pub fn new(step_id: StepId, receiver: oneshot::Receiver<TaskResult>) -> Self {
        Self { step_id, receiver }
    }

    pub fn step_id(&self) -> &StepId {
        &self.step_id
    }

    /// Wait for the job's result
    pub async fn wait(self) -> Result<TaskResult, QueueError> {
        self.receiver
            .await
            .map_err(|_| QueueError::JobDropped(self.step_id))
    }
}

/// Queue/broker capability used by the orchestrator
#[async_trait::async_trait]
pub trait JobTransport: Send + Sync {
    /// Schedule a job. Returns once the job is accepted, not when it completes.
    async fn enqueue(&self, job: StepJob) -> Result<JobHandle, QueueError>;

    /// Whether the transport can currently accept jobs
    async fn check_connectivity(&self) -> bool;
}

struct QueuedJob {
    job: StepJob,
    reply: oneshot::Sender<TaskResult>,
}

/// In-process workflow queue backed by a worker pool
pub struct WorkflowQueue {
    sender: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    in_flight: Arc<Mutex<HashSet<InFlightKey>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    concurrency: usize,
}

impl WorkflowQueue {
    /// Start the worker pool. Each call creates an independent pool; the process
    /// is expected to start one at boot and call `shutdown` before exiting.
    pub fn start(
        config: &QueueConfig,
        execution: &ExecutionConfig,
        registry: Arc<TaskRegistry>,
        store: Arc<dyn WorkflowStore>,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let executor = Arc::new(StepExecutor::new(registry, execution));

        let workers = (0..concurrency)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    receiver: receiver.clone(),
                    executor: executor.clone(),
                    store: store.clone(),
                    in_flight: in_flight.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        tracing::info!("Workflow queue started with {} worker(s)", concurrency);

        Self {
            sender: Mutex::new(Some(sender)),
            in_flight,
            workers: Mutex::new(workers),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Number of jobs currently queued or running
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Stop accepting jobs, let workers drain what is queued, and wait for them
    pub async fn shutdown(&self) {
        if self.sender.lock().await.take().is_none() {
            return;
        }

        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("Queue worker ended abnormally: {}", e);
            }
        }

        tracing::info!("Workflow queue stopped");
    }
}

#[async_trait::async_trait]
impl JobTransport for WorkflowQueue {
    async fn enqueue(&self, job: StepJob) -> Result<JobHandle, QueueError> {
        let sender = self
            .sender
            .lock()
            .await
            .clone()
            .ok_or(QueueError::Unavailable)?;

        let step_id = job.step_id().clone();
        let key = job.key();
        if !self.in_flight.lock().await.insert(key.clone()) {
            return Err(QueueError::AlreadyInFlight(step_id));
        }

        let (reply, receiver) = oneshot::channel();
        if sender.send(QueuedJob { job, reply }).await.is_err() {
            self.in_flight.lock().await.remove(&key);
            return Err(QueueError::Unavailable);
        }

        tracing::debug!("Enqueued job for step {}", step_id);

        Ok(JobHandle::new(step_id, receiver))
    }

    async fn check_connectivity(&self) -> bool {
        self.sender
            .lock()
            .await
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }
}

struct Worker {
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    executor: Arc<StepExecutor>,
    store: Arc<dyn WorkflowStore>,
    in_flight: Arc<Mutex<HashSet<InFlightKey>>>,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = {
                let mut receiver = self.receiver.lock().await;
                receiver.recv().await
            };

            let Some(QueuedJob { job, reply }) = next else {
                break;
            };

            let result = self.process(&job).await;

            self.in_flight.lock().await.remove(&job.key());

            // The orchestrator may have stopped waiting; the record is already written
            let _ = reply.send(result);
        }

        tracing::debug!("Queue worker {} exiting", self.id);
    }

    async fn process(&self, job: &StepJob) -> TaskResult {
        let step = &job.context.step;
        tracing::debug!("Worker {} picked up step {}", self.id, step.name);

        let workflow_id = &job.context.workflow_id;
        if let Err(e) = self
            .store
            .set_step_status(workflow_id, &step.id, StepStatus::Running)
        {
            tracing::error!("Failed to mark step {} running: {:#}", step.name, e);
        }

        let result = self.executor.execute(&job.context).await;

        if let Err(e) = self.store.update_step_result(workflow_id, &step.id, &result) {
            tracing::error!("Failed to persist result of step {}: {:#}", step.name, e);
        }

        result
    }
}
