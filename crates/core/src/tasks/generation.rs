use crate::workflow::{TaskContext, TaskExecutor, TaskOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Text completion backend used by the question and dataset steps
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Asks the model for questions about each chunk
pub struct QuestionTask {
    client: Arc<dyn ModelClient>,
    per_chunk: usize,
}

impl QuestionTask {
    pub fn new(client: Arc<dyn ModelClient>, per_chunk: usize) -> Self {
        Self { client, per_chunk }
    }
}

fn question_prompt(text: &str, count: usize) -> String {
    format!(
        "Write {count} distinct questions that can be answered from the passage below. \
         Put each question on its own line and write nothing else.\n\nPassage:\n{text}"
    )
}

fn answer_prompt(question: &str, context: &str) -> String {
    format!(
        "Answer the question using only the passage below.\n\n\
         Passage:\n{context}\n\nQuestion: {question}\nAnswer:"
    )
}

/// One question per non-empty line, with list markers removed
fn parse_questions(reply: &str, limit: usize) -> Vec<String> {
    reply
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .trim_start_matches(['.', ')', '-', '*'])
                .trim()
        })
        .filter(|line| !line.is_empty())
        .take(limit)
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl TaskExecutor for QuestionTask {
    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutcome> {
        let Some(chunks) = ctx.setting("chunks").and_then(Value::as_array) else {
            return Ok(TaskOutcome::failure("no chunks to generate questions from"));
        };
        let per_chunk = ctx
            .step
            .input
            .get("questions_per_chunk")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(self.per_chunk);

        let mut questions = Vec::new();
        for chunk in chunks {
            let chunk_id = chunk["id"].as_str().unwrap_or_default();
            let text = chunk["text"].as_str().unwrap_or_default();
            if text.is_empty() {
                continue;
            }

            let reply = self
                .client
                .complete(&question_prompt(text, per_chunk))
                .await
                .with_context(|| format!("Question generation failed for chunk {}", chunk_id))?;

            for question in parse_questions(&reply, per_chunk) {
                questions.push(json!({
                    "chunk_id": chunk_id,
                    "question": question,
                    "context": text,
                }));
            }
        }

        tracing::info!(
            "Generated {} questions from {} chunks",
            questions.len(),
            chunks.len()
        );

        Ok(TaskOutcome::success(json!({ "questions": questions })))
    }
}

/// Answers every question and emits Alpaca-style records
pub struct DatasetTask {
    client: Arc<dyn ModelClient>,
}

impl DatasetTask {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TaskExecutor for DatasetTask {
    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutcome> {
        let Some(questions) = ctx.setting("questions").and_then(Value::as_array) else {
            return Ok(TaskOutcome::failure("no questions to answer"));
        };

        let mut dataset = Vec::with_capacity(questions.len());
        for entry in questions {
            let Some(question) = entry["question"].as_str() else {
                continue;
            };
            let context = entry["context"].as_str().unwrap_or_default();

            let answer = self
                .client
                .complete(&answer_prompt(question, context))
                .await
                .with_context(|| format!("Answer generation failed for '{}'", question))?;

            dataset.push(json!({
                "instruction": question,
                "input": "",
                "output": answer.trim(),
                "chunk_id": entry["chunk_id"],
            }));
        }

        Ok(TaskOutcome::success(json!({ "dataset": dataset })))
    }
}
