//! Executors for the dataset pipeline step types

pub mod chunker;
pub mod document;
pub mod generation;

pub use chunker::ChunkerTask;
pub use document::DocumentTask;
pub use generation::{DatasetTask, ModelClient, QuestionTask};

use crate::types::step_types;
use crate::workflow::TaskRegistry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Defaults for the dataset executors; a step's own input overrides them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Each project's documents live in `<documents_dir>/<project_id>`. The
    /// server resolves a relative path against its data directory.
    #[serde(default = "default_documents_dir")]
    pub documents_dir: PathBuf,

    /// Target chunk length in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters shared between neighbouring chunks
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    #[serde(default = "default_questions_per_chunk")]
    pub questions_per_chunk: usize,
}

fn default_documents_dir() -> PathBuf {
    PathBuf::from("documents")
}

fn default_chunk_size() -> usize {
    1500
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_questions_per_chunk() -> usize {
    3
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            documents_dir: default_documents_dir(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            questions_per_chunk: default_questions_per_chunk(),
        }
    }
}

/// Register the document, chunker, question and dataset executors
pub fn register_dataset_tasks(
    registry: &mut TaskRegistry,
    config: &TasksConfig,
    model: Arc<dyn ModelClient>,
) {
    registry.register(
        step_types::DOCUMENT,
        Arc::new(DocumentTask::new(config.documents_dir.clone())),
    );
    registry.register(
        step_types::CHUNKER,
        Arc::new(ChunkerTask::new(config.chunk_size, config.chunk_overlap)),
    );
    registry.register(
        step_types::QUESTION,
        Arc::new(QuestionTask::new(model.clone(), config.questions_per_chunk)),
    );
    registry.register(step_types::DATASET, Arc::new(DatasetTask::new(model)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Silent;

    #[async_trait]
    impl ModelClient for Silent {
        async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    #[test]
    fn test_registers_pipeline_types() {
        let mut registry = TaskRegistry::with_builtins();
        register_dataset_tasks(&mut registry, &TasksConfig::default(), Arc::new(Silent));

        assert_eq!(
            registry.types(),
            vec!["chunker", "dataset", "document", "end", "question", "start"]
        );
    }

    #[test]
    fn test_config_defaults() {
        let config: TasksConfig = serde_json::from_str(r#"{"chunk_size": 800}"#).unwrap();
        assert_eq!(config.chunk_size, 800);
        assert_eq!(config.chunk_overlap, 200);
        assert_eq!(config.questions_per_chunk, 3);
    }
}
