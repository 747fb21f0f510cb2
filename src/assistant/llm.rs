//! Completion model seam and an OpenAI-compatible chat client.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::AssistantConfig;

#[async_trait]
pub trait CompletionModel: Send + Sync {
    /// One system + user turn, returning the assistant text.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Client for `/v1/chat/completions` style endpoints (Groq by default).
pub struct ChatCompletionsClient {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl ChatCompletionsClient {
    pub fn new(config: &AssistantConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[async_trait]
impl CompletionModel for ChatCompletionsClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(anyhow!("assistant API key is not configured (set GROQ_API_KEY)"));
        }

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: prompt },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let started = Instant::now();
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, body = %body, "completion endpoint returned an error");
            return Err(anyhow!("completion endpoint returned HTTP {status}"));
        }

        let parsed: ChatResponse = response.json().await.context("malformed completion response")?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("empty completion response"))?;

        tracing::debug!(model = %self.model, elapsed_ms = started.elapsed().as_millis() as u64, "completion received");
        Ok(text.trim().to_string())
    }
}
