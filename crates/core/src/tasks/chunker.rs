use crate::workflow::{TaskContext, TaskExecutor, TaskOutcome};
use anyhow::Result;
use serde_json::{json, Value};

/// Splits loaded documents into overlapping chunks
pub struct ChunkerTask {
    chunk_size: usize,
    overlap: usize,
}

impl ChunkerTask {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size,
            overlap,
        }
    }

    fn sizes(&self, ctx: &TaskContext) -> Result<(usize, usize), String> {
        let chunk_size = usize_setting(ctx, "chunk_size").unwrap_or(self.chunk_size);
        let overlap = usize_setting(ctx, "overlap").unwrap_or(self.overlap);

        if chunk_size == 0 {
            return Err("chunk_size must be positive".to_string());
        }
        if overlap >= chunk_size {
            return Err(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                overlap, chunk_size
            ));
        }
        Ok((chunk_size, overlap))
    }
}

fn usize_setting(ctx: &TaskContext, key: &str) -> Option<usize> {
    ctx.step
        .input
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
}

/// Split `text` into windows of at most `chunk_size` characters.
///
/// A window that would cut the text ends early at the last paragraph break,
/// sentence end or whitespace in its back half. Consecutive windows share
/// `overlap` characters. Empty windows are skipped.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let mut end = (start + chunk_size).min(chars.len());
        if end < chars.len() {
            end = boundary(&chars, start, end);
        }

        let chunk: String = chars[start..end].iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        if end >= chars.len() {
            break;
        }
        start = if end - start > overlap { end - overlap } else { end };
    }

    chunks
}

fn boundary(chars: &[char], start: usize, end: usize) -> usize {
    let floor = start + (end - start) / 2;
    let window = || (floor..end).rev();

    let paragraph = window().find(|&i| i > start && chars[i] == '\n' && chars[i - 1] == '\n');
    let sentence = || {
        window().find(|&i| {
            matches!(chars[i], '.' | '!' | '?' | '\n')
                && chars.get(i + 1).is_some_and(|c| c.is_whitespace())
        })
    };
    let word = || window().find(|&i| chars[i].is_whitespace());

    paragraph
        .or_else(sentence)
        .or_else(word)
        .map(|i| i + 1)
        .unwrap_or(end)
}

#[async_trait::async_trait]
impl TaskExecutor for ChunkerTask {
    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutcome> {
        let (chunk_size, overlap) = match self.sizes(ctx) {
            Ok(sizes) => sizes,
            Err(e) => return Ok(TaskOutcome::failure(e)),
        };

        let Some(documents) = ctx.setting("documents").and_then(Value::as_array) else {
            return Ok(TaskOutcome::failure("no documents to chunk"));
        };

        let mut chunks = Vec::new();
        for document in documents {
            let name = document["name"].as_str().unwrap_or("document");
            let Some(text) = document["text"].as_str() else {
                return Ok(TaskOutcome::failure(format!("document {} has no text", name)));
            };

            for (index, chunk) in split_text(text, chunk_size, overlap).into_iter().enumerate() {
                chunks.push(json!({
                    "id": format!("{}#{}", name, index),
                    "document": name,
                    "index": index,
                    "text": chunk,
                }));
            }
        }

        tracing::info!(
            "Split {} documents into {} chunks (size={}, overlap={})",
            documents.len(),
            chunks.len(),
            chunk_size,
            overlap
        );

        Ok(TaskOutcome::success(json!({ "chunks": chunks })))
    }
}
