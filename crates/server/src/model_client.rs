use crate::config::ModelConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use dsflow_core::tasks::ModelClient;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client for any endpoint speaking the OpenAI chat-completions API
pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.name.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
        })
    }
}

fn first_content(response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .context("Model returned no content")
}

#[async_trait]
impl ModelClient for OpenAiCompatibleClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        tracing::debug!("Sending chat completion request to {}", self.base_url);

        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("Failed to reach model endpoint")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Model endpoint returned {}: {}", status, body);
        }

        let completion: ChatResponse = response
            .json()
            .await
            .context("Failed to decode chat completion")?;

        first_content(completion)
    }
}
