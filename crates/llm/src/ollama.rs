use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::json;

use crate::{
    ChatCompletionService, ChatTurn, EmbeddingService, LabelExtractionService, ModelSelection,
    label_extraction_turns, strip_reasoning,
};

/// Client for a local Ollama server (`/api/embeddings`, `/api/chat`).
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    models: ModelSelection,
}

impl OllamaClient {
    pub fn new(base_url: &str, models: ModelSelection, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building ollama http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            models,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn chat_model(&self, model: &str, turns: &[ChatTurn], temperature: f32) -> Result<String> {
        let endpoint = format!("{}/api/chat", self.base_url);
        let payload = json!({
            "model": model,
            "messages": turns,
            "stream": false,
            "options": { "temperature": temperature }
        });

        let response = self
            .client
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("ollama unavailable at {}", self.base_url))?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("ollama chat error ({status}): {body}");
        }

        body.get("message")
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(|content| strip_reasoning(content).to_string())
            .with_context(|| format!("ollama response missing text: {body}"))
    }
}

#[async_trait]
impl EmbeddingService for OllamaClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let endpoint = format!("{}/api/embeddings", self.base_url);
        let payload = json!({
            "model": self.models.embedding,
            "prompt": text,
        });

        let response = self
            .client
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("ollama unavailable at {}", self.base_url))?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("ollama embeddings error ({status}): {body}");
        }

        let embedding: Vec<f32> = body
            .get("embedding")
            .and_then(|value| value.as_array())
            .context("ollama response missing embedding")?
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<_>>()
            .context("ollama embedding contains a non-numeric component")?;
        if embedding.is_empty() {
            bail!("ollama returned an empty embedding");
        }
        Ok(embedding)
    }
}

#[async_trait]
impl LabelExtractionService for OllamaClient {
    async fn extract_topics(&self, text: &str, vocabulary: &[String]) -> Result<String> {
        let turns = label_extraction_turns(text, vocabulary);
        self.chat_model(&self.models.label, &turns, 0.0).await
    }
}

#[async_trait]
impl ChatCompletionService for OllamaClient {
    async fn reply(&self, history: &[ChatTurn]) -> Result<String> {
        self.chat_model(&self.models.chat, history, 0.7).await
    }
}
