use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker pool settings for the workflow queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of workers pulling jobs
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Jobs that may wait in the channel before `enqueue` applies backpressure
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_concurrency() -> usize {
    2
}

fn default_capacity() -> usize {
    256
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            capacity: default_capacity(),
        }
    }
}

/// Step execution settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Applied to steps that do not set `timeout_secs` in their input
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
}

impl ExecutionConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }
}
