//! Collaborator services consumed around the conversation graph: text
//! embeddings, topic-label extraction and chat completion.
//!
//! Every call returns `Err` on transport, status or decoding failure; the
//! caller decides how to degrade.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod ollama;
mod openai;
mod router;

pub use ollama::OllamaClient;
pub use openai::OpenAiCompatClient;
pub use router::{LlmRouter, LlmSettings};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Ollama,
    /// Any OpenAI-compatible endpoint (OpenAI itself, OpenRouter, ...).
    #[serde(alias = "openrouter")]
    OpenAi,
}

impl Provider {
    pub fn label(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Model names per task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub chat: String,
    pub embedding: String,
    pub label: String,
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[async_trait]
pub trait LabelExtractionService: Send + Sync {
    /// Raw label text for `text`; normalization against `vocabulary` is the
    /// caller's job.
    async fn extract_topics(&self, text: &str, vocabulary: &[String]) -> Result<String>;
}

#[async_trait]
pub trait ChatCompletionService: Send + Sync {
    async fn reply(&self, history: &[ChatTurn]) -> Result<String>;
}

/// Conversation sent to the label model for one message.
pub fn label_extraction_turns(text: &str, vocabulary: &[String]) -> Vec<ChatTurn> {
    let instructions = format!(
        "You label shop-assistant chat messages with topics.\n\
         Allowed topics: {}.\n\
         Reply with the matching topics exactly as written, separated by commas, \
         and nothing else. If no topic applies, reply with: no tag",
        vocabulary.join(", ")
    );
    vec![ChatTurn::system(instructions), ChatTurn::user(text)]
}

/// Drop `<think>...</think>` reasoning blocks some local models emit before
/// their answer.
pub(crate) fn strip_reasoning(reply: &str) -> &str {
    match reply.rfind("</think>") {
        Some(end) => reply[end + "</think>".len()..].trim(),
        None => reply.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_prompt_lists_vocabulary_and_sentinel() {
        let vocab = vec!["Áo".to_string(), "Giày".to_string()];
        let turns = label_extraction_turns("Tôi muốn mua áo", &vocab);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, ChatRole::System);
        assert!(turns[0].content.contains("Áo, Giày"));
        assert!(turns[0].content.contains("no tag"));
        assert_eq!(turns[1], ChatTurn::user("Tôi muốn mua áo"));
    }

    #[test]
    fn reasoning_blocks_are_stripped() {
        assert_eq!(strip_reasoning("<think>hmm</think>\n Áo, Giày "), "Áo, Giày");
        assert_eq!(strip_reasoning("  Áo "), "Áo");
    }

    #[test]
    fn provider_accepts_openrouter_alias() {
        let provider: Provider = serde_json::from_str("\"openrouter\"").unwrap();
        assert_eq!(provider, Provider::OpenAi);
        assert_eq!(serde_json::to_string(&Provider::OpenAi).unwrap(), "\"openai\"");
        assert_eq!(Provider::default().label(), "ollama");
    }

    #[test]
    fn chat_turns_serialize_with_lowercase_roles() {
        let json = serde_json::to_value(ChatTurn::assistant("xin chào")).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"], "xin chào");
    }
}
