use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::debug;

use crate::{
    ChatCompletionService, ChatTurn, EmbeddingService, LabelExtractionService, ModelSelection,
    OllamaClient, OpenAiCompatClient, Provider,
};

/// Everything needed to build the configured provider's client.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: Provider,
    pub models: ModelSelection,
    pub ollama_base_url: String,
    pub openai_base_url: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
enum Backend {
    Ollama(OllamaClient),
    OpenAi(OpenAiCompatClient),
}

/// Dispatches every collaborator call to the provider chosen at startup.
#[derive(Debug, Clone)]
pub struct LlmRouter {
    provider: Provider,
    backend: Backend,
}

impl LlmRouter {
    pub fn from_settings(settings: &LlmSettings) -> Result<Self> {
        let backend = match settings.provider {
            Provider::Ollama => Backend::Ollama(OllamaClient::new(
                &settings.ollama_base_url,
                settings.models.clone(),
                settings.request_timeout,
            )?),
            Provider::OpenAi => {
                let Some(api_key) = settings.api_key.as_deref() else {
                    bail!("provider openai selected but no api key is configured (OPENAI_API_KEY)");
                };
                Backend::OpenAi(OpenAiCompatClient::new(
                    &settings.openai_base_url,
                    api_key,
                    settings.models.clone(),
                    settings.request_timeout,
                )?)
            }
        };
        debug!(provider = settings.provider.label(), "llm router ready");
        Ok(Self {
            provider: settings.provider,
            backend,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn base_url(&self) -> &str {
        match &self.backend {
            Backend::Ollama(client) => client.base_url(),
            Backend::OpenAi(client) => client.base_url(),
        }
    }
}

#[async_trait]
impl EmbeddingService for LlmRouter {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match &self.backend {
            Backend::Ollama(client) => client.embed(text).await,
            Backend::OpenAi(client) => client.embed(text).await,
        }
    }
}

#[async_trait]
impl LabelExtractionService for LlmRouter {
    async fn extract_topics(&self, text: &str, vocabulary: &[String]) -> Result<String> {
        match &self.backend {
            Backend::Ollama(client) => client.extract_topics(text, vocabulary).await,
            Backend::OpenAi(client) => client.extract_topics(text, vocabulary).await,
        }
    }
}

#[async_trait]
impl ChatCompletionService for LlmRouter {
    async fn reply(&self, history: &[ChatTurn]) -> Result<String> {
        match &self.backend {
            Backend::Ollama(client) => client.reply(history).await,
            Backend::OpenAi(client) => client.reply(history).await,
        }
    }
}
