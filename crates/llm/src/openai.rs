use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::json;

use crate::{
    ChatCompletionService, ChatTurn, EmbeddingService, LabelExtractionService, ModelSelection,
    label_extraction_turns, strip_reasoning,
};

/// Client for OpenAI-compatible APIs (`/embeddings`, `/chat/completions`)
/// authenticated with a bearer key.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    models: ModelSelection,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        models: ModelSelection,
        timeout: Duration,
    ) -> Result<Self> {
        if api_key.trim().is_empty() {
            bail!("api key for {base_url} is empty");
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building openai http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            models,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, path: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
        let endpoint = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .header("X-Title", "convograph")
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("request to {endpoint} failed"))?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("{path} error ({status}): {body}");
        }
        Ok(body)
    }

    async fn chat_model(&self, model: &str, turns: &[ChatTurn], temperature: f32) -> Result<String> {
        let body = self
            .post(
                "/chat/completions",
                json!({
                    "model": model,
                    "messages": turns,
                    "temperature": temperature,
                }),
            )
            .await?;

        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(|content| strip_reasoning(content).to_string())
            .with_context(|| format!("chat completion missing content: {body}"))
    }
}

#[async_trait]
impl EmbeddingService for OpenAiCompatClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = self
            .post(
                "/embeddings",
                json!({
                    "model": self.models.embedding,
                    "input": [text],
                }),
            )
            .await?;

        let embedding: Vec<f32> = body
            .get("data")
            .and_then(|data| data.get(0))
            .and_then(|item| item.get("embedding"))
            .and_then(|value| value.as_array())
            .context("no embedding data received")?
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<_>>()
            .context("embedding contains a non-numeric component")?;
        if embedding.is_empty() {
            bail!("no embedding data received");
        }
        Ok(embedding)
    }
}

#[async_trait]
impl LabelExtractionService for OpenAiCompatClient {
    async fn extract_topics(&self, text: &str, vocabulary: &[String]) -> Result<String> {
        let turns = label_extraction_turns(text, vocabulary);
        self.chat_model(&self.models.label, &turns, 0.0).await
    }
}

#[async_trait]
impl ChatCompletionService for OpenAiCompatClient {
    async fn reply(&self, history: &[ChatTurn]) -> Result<String> {
        self.chat_model(&self.models.chat, history, 0.7).await
    }
}
