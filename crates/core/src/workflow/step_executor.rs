use super::registry::{TaskContext, TaskExecutor, TaskOutcome, TaskRegistry};
use crate::config::ExecutionConfig;
use crate::types::{FailureKind, TaskResult};
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Runs one step through its registered executor with timeout and retry handling.
///
/// Never returns an error: executor errors, reported failures, panics, timeouts
/// and missing executors all come back as a failed `TaskResult`.
pub struct StepExecutor {
    registry: Arc<TaskRegistry>,
    default_timeout: Option<Duration>,
}

impl StepExecutor {
    pub fn new(registry: Arc<TaskRegistry>, config: &ExecutionConfig) -> Self {
        Self {
            registry,
            default_timeout: config.step_timeout(),
        }
    }

    /// Execute a step, retrying only when its input carries a retry policy
    pub async fn execute(&self, ctx: &TaskContext) -> TaskResult {
        let step = &ctx.step;
        let started_at = Utc::now();

        let Some(executor) = self.registry.get(&step.step_type) else {
            tracing::warn!(
                "No executor registered for step {} (type '{}')",
                step.name,
                step.step_type
            );
            return TaskResult::failed(
                step,
                started_at,
                FailureKind::MissingExecutor,
                format!("No executor registered for step type '{}'", step.step_type),
            );
        };

        let policy = step.retry_policy();
        let max_attempts = policy.map(|p| p.max_attempts.max(1)).unwrap_or(1);
        let mut attempt = 1;

        loop {
            tracing::info!(
                "Executing step {} (attempt {}) for workflow {}",
                step.name,
                attempt,
                ctx.workflow_id
            );

            let (kind, error) = match self.attempt(executor.as_ref(), ctx).await {
                Ok(data) => {
                    let mut result = TaskResult::succeeded(step, started_at, data);
                    result.attempts = attempt;
                    return result;
                }
                Err(failure) => failure,
            };

            if attempt < max_attempts {
                let backoff_ms = policy.map(|p| p.backoff_ms).unwrap_or(0);
                let backoff =
                    Duration::from_millis(backoff_ms.saturating_mul(1 << (attempt - 1).min(16)));

                tracing::info!(
                    "Retrying step {} after {:?} (attempt {}): {}",
                    step.name,
                    backoff,
                    attempt + 1,
                    error
                );

                tokio::time::sleep(backoff).await;
                attempt += 1;
                continue;
            }

            tracing::warn!("Step {} failed after {} attempt(s): {}", step.name, attempt, error);

            let mut result = TaskResult::failed(step, started_at, kind, error);
            result.attempts = attempt;
            return result;
        }
    }

    async fn attempt(
        &self,
        executor: &dyn TaskExecutor,
        ctx: &TaskContext,
    ) -> Result<Option<Value>, (FailureKind, String)> {
        let limit = ctx
            .step
            .timeout_secs()
            .map(Duration::from_secs)
            .or(self.default_timeout);

        let run = AssertUnwindSafe(executor.execute(ctx)).catch_unwind();

        let outcome = match limit {
            Some(limit) => match timeout(limit, run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!("Step {} timed out", ctx.step.name);
                    return Err((
                        FailureKind::Timeout,
                        format!("Step timed out after {} ms", limit.as_millis()),
                    ));
                }
            },
            None => run.await,
        };

        match outcome {
            Ok(Ok(TaskOutcome::Success { data })) => Ok(data),
            Ok(Ok(TaskOutcome::Failure { error })) => Err((FailureKind::Task, error)),
            Ok(Err(e)) => Err((FailureKind::Task, format!("{:#}", e))),
            Err(panic) => Err((FailureKind::Panic, panic_message(panic))),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("Executor panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("Executor panicked: {}", msg)
    } else {
        "Executor panicked".to_string()
    }
}
