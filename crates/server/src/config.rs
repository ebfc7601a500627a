use anyhow::{Context, Result};
use dsflow_core::config::{ExecutionConfig, QueueConfig};
use dsflow_core::storage::{JsonlEventLog, RedbWorkflowStore};
use dsflow_core::tasks::{register_dataset_tasks, ModelClient, TasksConfig};
use dsflow_core::workflow::{TaskRegistry, WorkflowOrchestrator, WorkflowQueue};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub tasks: TasksConfig,

    #[serde(default)]
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_index_file() -> String {
    "workflows.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            event_log_dir: default_event_log_dir(),
            index_file: default_index_file(),
        }
    }
}

/// Chat-completions endpoint used by the question and dataset steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_base_url")]
    pub base_url: String,

    #[serde(default = "default_model_name")]
    pub name: String,

    /// Usually supplied through `DSFLOW_MODEL_API_KEY` instead
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_model_temperature")]
    pub temperature: f32,

    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_model_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_model_name() -> String {
    "llama3.1".to_string()
}

fn default_model_temperature() -> f32 {
    0.7
}

fn default_model_timeout_secs() -> u64 {
    120
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_model_base_url(),
            name: default_model_name(),
            api_key: None,
            temperature: default_model_temperature(),
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the event log path
    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    /// Get the workflow store file path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }

    /// Root of the per-project document directories
    pub fn documents_path(&self) -> PathBuf {
        self.data_dir.join(&self.tasks.documents_dir)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RedbWorkflowStore>,
    pub event_log: Arc<JsonlEventLog>,
    pub queue: Arc<WorkflowQueue>,
    pub orchestrator: Arc<WorkflowOrchestrator>,
}

impl AppState {
    /// Open storage and start the worker pool. Must run inside the tokio runtime.
    pub fn new(config: &ServerConfig, model: Arc<dyn ModelClient>) -> Result<Self> {
        let event_log = Arc::new(
            JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
        );

        let store = Arc::new(
            RedbWorkflowStore::new(config.index_path())
                .context("Failed to create workflow store")?,
        );

        let mut tasks = config.tasks.clone();
        tasks.documents_dir = config.documents_path();
        let mut registry = TaskRegistry::with_builtins();
        register_dataset_tasks(&mut registry, &tasks, model);
        let registry = Arc::new(registry);
        tracing::info!("Registered step types: {}", registry.types().join(", "));

        let queue = Arc::new(WorkflowQueue::start(
            &config.queue,
            &config.execution,
            registry.clone(),
            store.clone(),
        ));

        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            store.clone(),
            event_log.clone(),
            queue.clone(),
            registry,
        ));

        Ok(Self {
            store,
            event_log,
            queue,
            orchestrator,
        })
    }
}
