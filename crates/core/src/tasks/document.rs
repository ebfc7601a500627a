use crate::workflow::{TaskContext, TaskExecutor, TaskOutcome};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};

/// Extensions picked up when a step loads a whole project directory
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "csv", "json", "jsonl", "html", "htm", "xml", "rst",
];

/// Loads a project's source documents as text
pub struct DocumentTask {
    root: PathBuf,
}

impl DocumentTask {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Names requested by the step, or every file in the project directory
    async fn requested(&self, ctx: &TaskContext, dir: &Path) -> Result<Vec<String>, String> {
        match ctx.setting("files") {
            Some(Value::Array(files)) => files
                .iter()
                .map(|f| {
                    f.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| format!("invalid file entry: {}", f))
                })
                .collect(),
            Some(other) => Err(format!("'files' must be a list, got {}", other)),
            None => list_files(dir).await.map_err(|e| format!("{:#}", e)),
        }
    }
}

fn is_contained(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn is_text_document(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| TEXT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

async fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read document directory {}", dir.display()))?;

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() && is_text_document(&entry.path()) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

#[async_trait::async_trait]
impl TaskExecutor for DocumentTask {
    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutcome> {
        if !is_contained(&ctx.project_id.0) {
            return Ok(TaskOutcome::failure(format!(
                "invalid project id: {}",
                ctx.project_id
            )));
        }
        let dir = self.root.join(&ctx.project_id.0);

        let names = match self.requested(ctx, &dir).await {
            Ok(names) => names,
            Err(e) => return Ok(TaskOutcome::failure(e)),
        };
        if names.is_empty() {
            return Ok(TaskOutcome::failure("no documents to load"));
        }

        let dir = tokio::fs::canonicalize(&dir)
            .await
            .with_context(|| format!("Failed to resolve document directory {}", dir.display()))?;

        let mut documents = Vec::with_capacity(names.len());
        for name in names {
            if !is_contained(&name) {
                return Ok(TaskOutcome::failure(format!(
                    "document path escapes the project directory: {}",
                    name
                )));
            }

            // Symlinks are followed, so check where the file actually lives
            let path = tokio::fs::canonicalize(dir.join(&name))
                .await
                .with_context(|| format!("Failed to resolve document {}", name))?;
            if !path.starts_with(&dir) {
                return Ok(TaskOutcome::failure(format!(
                    "document path escapes the project directory: {}",
                    name
                )));
            }

            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read document {}", path.display()))?;
            let Ok(text) = String::from_utf8(bytes) else {
                return Ok(TaskOutcome::failure(format!("document is not UTF-8 text: {}", name)));
            };
            tracing::debug!("Loaded document {} ({} bytes)", name, text.len());
            documents.push(json!({ "name": name, "text": text }));
        }

        Ok(TaskOutcome::success(json!({ "documents": documents })))
    }
}
