//! OpenAI-compatible chat-completions client

use super::{ChatClient, ContentPart};
use crate::config::LlmConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct OpenAiChatClient {
    http_client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum RequestMessage<'a> {
    System { content: &'a str },
    User { content: Vec<ContentPart> },
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<RequestMessage<'a>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl OpenAiChatClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build chat HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
        })
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn complete(&self, system: &str, content: Vec<ContentPart>) -> Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .context("No API key configured for the chat-completion service")?;

        let start = Instant::now();
        let parts = content.len();
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                RequestMessage::System { content: system },
                RequestMessage::User { content },
            ],
        };

        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!(url = %url, model = %self.model, parts = parts, "Sending chat completion");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .context("Chat completion request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Chat completion service error (HTTP {}): {}", status, body);
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .context("Invalid chat completion response")?;

        let answer = chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .context("Chat completion returned no answer")?;

        info!(
            model = %self.model,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Chat completion finished"
        );
        Ok(answer)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
