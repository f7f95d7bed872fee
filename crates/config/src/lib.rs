use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

// ── Enumerated settings ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Ollama,
    /// OpenAI or any compatible endpoint such as OpenRouter.
    #[serde(alias = "openrouter")]
    OpenAi,
}

/// Where ingested messages are persisted.
///
/// | Backend  | Behaviour                                                    |
/// |----------|--------------------------------------------------------------|
/// | `redb`   | Durable graph database file at `graph.path`.                 |
/// | `memory` | Process-local graph; nothing survives exit.                  |
/// | `jsonl`  | No graph; one JSON line per message at `graph.jsonl_path`.   |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphBackend {
    #[default]
    Redb,
    Memory,
    Jsonl,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphScope {
    /// Each message belongs to the configured user and links only to that
    /// user's messages.
    #[default]
    User,
    /// Single-tenant graph: no owner, every message is a candidate.
    Global,
}

impl GraphScope {
    pub fn default_threshold(self) -> f64 {
        match self {
            Self::User => 0.5,
            Self::Global => 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMerge {
    /// Every qualifying comparison adds a new edge.
    #[default]
    Append,
    /// At most one edge per message pair; repeats update it.
    Pair,
}

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Convograph".to_string(),
            system_prompt: "You are a helpful and friendly chatbot.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Stable owner id.  Empty means "generate one on first run".
    pub id: String,
    pub display_name: String,
    pub language: String,
    pub tone: String,
    pub addressing: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            display_name: "guest".to_string(),
            language: "vi".to_string(),
            tone: "friendly".to_string(),
            addressing: "bạn".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub chat_model: String,
    pub embedding_model: String,
    /// Model used to extract topic labels; usually the chat model.
    pub label_model: String,
    /// Overridden at runtime by `OLLAMA_BASE_URL` when set.
    pub ollama_base_url: String,
    pub openai_base_url: String,
    /// Only read from `OPENAI_API_KEY`; never written back to disk.
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Ollama,
            chat_model: "llama3.1:8b".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            label_model: "llama3.1:8b".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_key: None,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub backend: GraphBackend,
    /// redb database file.  Overridden by `CONVOGRAPH_GRAPH_PATH`.
    pub path: String,
    pub jsonl_path: String,
    /// Also append every message to `jsonl_path` when a graph backend is used.
    pub mirror_jsonl: bool,
    pub scope: GraphScope,
    /// Similarity an edge must strictly exceed.  Unset means 0.5 for user
    /// scope and 0.7 for global scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    pub link_merge: LinkMerge,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            backend: GraphBackend::Redb,
            path: ".convograph/graph.redb".to_string(),
            jsonl_path: ".convograph/graph_nodes.jsonl".to_string(),
            mirror_jsonl: false,
            scope: GraphScope::User,
            threshold: None,
            link_merge: LinkMerge::Append,
        }
    }
}

impl GraphConfig {
    pub fn effective_threshold(&self) -> f64 {
        self.threshold
            .unwrap_or_else(|| self.scope.default_threshold())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// Closed list of canonical topic names, in preference order.
    pub vocabulary: Vec<String>,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            vocabulary: [
                "Áo",
                "Quần",
                "Váy",
                "Giày",
                "Túi xách",
                "Phụ kiện",
                "Kích cỡ",
                "Khuyến mãi",
                "Giảm giá",
                "Giao hàng",
                "Đổi trả",
                "Thanh toán",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// Directory for daily-rolling log files.  Empty logs to stderr only.
    pub log_dir: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub user: UserConfig,
    pub llm: LlmConfig,
    pub graph: GraphConfig,
    pub topics: TopicsConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Read `path` (a missing file yields defaults) and apply environment
    /// overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?;
        }
        config.apply_env_overrides_from(|key| env::var(key).ok());
        Ok(config)
    }

    /// Apply `OLLAMA_BASE_URL`, `OPENAI_API_KEY` and `CONVOGRAPH_GRAPH_PATH`
    /// as resolved by `lookup`.  Empty values are ignored.
    pub fn apply_env_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = non_empty("OLLAMA_BASE_URL") {
            self.llm.ollama_base_url = url;
        }
        if let Some(key) = non_empty("OPENAI_API_KEY") {
            self.llm.openai_api_key = Some(key);
        }
        if let Some(path) = non_empty("CONVOGRAPH_GRAPH_PATH") {
            self.graph.path = path;
        }
    }

    /// Set `[user].id` in the file at `path`, creating the file if needed.
    ///
    /// Only that key changes; every other value stays as the file has it, so
    /// environment overrides applied to a loaded config never reach disk.
    /// Comments are not preserved.
    pub fn persist_user_id(path: impl AsRef<Path>, id: &str) -> Result<()> {
        let path = path.as_ref();
        let mut document = match fs::read_to_string(path) {
            Ok(raw) => raw
                .parse::<toml::Table>()
                .with_context(|| format!("parsing config file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => toml::Table::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading config file {}", path.display()));
            }
        };

        let user = document
            .entry("user")
            .or_insert(toml::Value::Table(toml::Table::new()));
        let Some(user) = user.as_table_mut() else {
            bail!("`user` in {} is not a table", path.display());
        };
        user.insert("id".to_string(), toml::Value::String(id.to_string()));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(&document)?)?;
        Ok(())
    }

    /// Startup checks; any failure is fatal before the store is opened.
    pub fn validate(&self) -> Result<()> {
        if !self
            .topics
            .vocabulary
            .iter()
            .any(|name| !name.trim().is_empty())
        {
            bail!("topics.vocabulary must contain at least one topic");
        }

        let threshold = self.graph.effective_threshold();
        if !threshold.is_finite() || !(-1.0..=1.0).contains(&threshold) {
            bail!("graph.threshold must be within [-1, 1], got {threshold}");
        }

        if self.llm.provider == LlmProvider::OpenAi
            && self
                .llm
                .openai_api_key
                .as_deref()
                .is_none_or(|key| key.trim().is_empty())
        {
            bail!("llm.provider = \"openai\" requires OPENAI_API_KEY");
        }

        if self.llm.request_timeout_secs == 0 {
            bail!("llm.request_timeout_secs must be greater than zero");
        }

        match self.graph.backend {
            GraphBackend::Redb if self.graph.path.trim().is_empty() => {
                bail!("graph.path must be set for the redb backend");
            }
            GraphBackend::Jsonl if self.graph.jsonl_path.trim().is_empty() => {
                bail!("graph.jsonl_path must be set for the jsonl backend");
            }
            _ => {}
        }
        if self.graph.mirror_jsonl && self.graph.jsonl_path.trim().is_empty() {
            bail!("graph.mirror_jsonl requires graph.jsonl_path");
        }

        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ── Defaults ───────────────────────────────────────────────────────────

    #[test]
    fn defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.name, "Convograph");
        assert_eq!(cfg.agent.system_prompt, "You are a helpful and friendly chatbot.");
        assert!(cfg.user.id.is_empty());
        assert_eq!(cfg.user.language, "vi");
        assert_eq!(cfg.llm.provider, LlmProvider::Ollama);
        assert_eq!(cfg.llm.ollama_base_url, "http://localhost:11434");
        assert_eq!(cfg.llm.request_timeout_secs, 30);
        assert_eq!(cfg.graph.backend, GraphBackend::Redb);
        assert_eq!(cfg.graph.scope, GraphScope::User);
        assert_eq!(cfg.graph.link_merge, LinkMerge::Append);
        assert!(!cfg.graph.mirror_jsonl);
        assert!(cfg.topics.vocabulary.contains(&"Áo".to_string()));
        assert_eq!(cfg.telemetry.log_level, "info");
        assert!(cfg.telemetry.log_dir.is_empty());
    }

    #[test]
    fn threshold_defaults_follow_scope() {
        let mut graph = GraphConfig::default();
        assert_eq!(graph.effective_threshold(), 0.5);
        graph.scope = GraphScope::Global;
        assert_eq!(graph.effective_threshold(), 0.7);
        graph.threshold = Some(0.42);
        assert_eq!(graph.effective_threshold(), 0.42);
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.agent.name, "Convograph");
        assert_eq!(cfg.graph.backend, GraphBackend::Redb);
    }

    #[test]
    fn load_from_valid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.toml");
        fs::write(
            &path,
            r#"
[agent]
name = "ShopBot"

[user]
id = "u-42"
display_name = "Lan"
addressing = "chị"

[llm]
provider = "openrouter"
chat_model = "openai/gpt-4o-mini"
embedding_model = "text-embedding-3-small"
openai_base_url = "https://openrouter.ai/api/v1"

[graph]
backend = "jsonl"
scope = "global"
threshold = 0.8
link_merge = "pair"
mirror_jsonl = true

[topics]
vocabulary = ["Áo", "Giày"]
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.agent.name, "ShopBot");
        assert_eq!(cfg.user.id, "u-42");
        assert_eq!(cfg.user.addressing, "chị");
        assert_eq!(cfg.user.language, "vi");
        assert_eq!(cfg.llm.provider, LlmProvider::OpenAi);
        assert_eq!(cfg.llm.chat_model, "openai/gpt-4o-mini");
        assert_eq!(cfg.llm.openai_base_url, "https://openrouter.ai/api/v1");
        assert_eq!(cfg.graph.backend, GraphBackend::Jsonl);
        assert_eq!(cfg.graph.scope, GraphScope::Global);
        assert_eq!(cfg.graph.effective_threshold(), 0.8);
        assert_eq!(cfg.graph.link_merge, LinkMerge::Pair);
        assert!(cfg.graph.mirror_jsonl);
        assert_eq!(cfg.topics.vocabulary, vec!["Áo", "Giày"]);
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let shipped: AppConfig =
            toml::from_str(include_str!("../../../config/default.toml")).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(shipped.agent.system_prompt, defaults.agent.system_prompt);
        assert_eq!(shipped.llm.chat_model, defaults.llm.chat_model);
        assert_eq!(shipped.graph.path, defaults.graph.path);
        assert_eq!(shipped.graph.threshold, None);
        assert_eq!(shipped.topics.vocabulary, defaults.topics.vocabulary);
        shipped.validate().unwrap();
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad-backend.toml");
        fs::write(&path, "[graph]\nbackend = \"neo4j\"\n").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    // ── persist_user_id ────────────────────────────────────────────────────

    #[test]
    fn persist_user_id_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        AppConfig::persist_user_id(&path, "u-1").unwrap();

        let loaded: AppConfig = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.user.id, "u-1");
        assert_eq!(loaded.graph.path, AppConfig::default().graph.path);
    }

    #[test]
    fn persist_user_id_leaves_env_overrides_out_of_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[graph]\npath = \"real.redb\"\nthreshold = 0.65\n\n[user]\ndisplay_name = \"Lan\"\n",
        )
        .unwrap();

        let mut cfg: AppConfig = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        cfg.apply_env_overrides_from(lookup(&[
            ("CONVOGRAPH_GRAPH_PATH", "/tmp/throwaway.redb"),
            ("OLLAMA_BASE_URL", "http://gpu-box:11434"),
            ("OPENAI_API_KEY", "sk-secret"),
        ]));
        assert_eq!(cfg.graph.path, "/tmp/throwaway.redb");

        AppConfig::persist_user_id(&path, "u-9").unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("throwaway"));
        assert!(!raw.contains("gpu-box"));
        assert!(!raw.contains("sk-secret"));
        let saved: AppConfig = toml::from_str(&raw).unwrap();
        assert_eq!(saved.graph.path, "real.redb");
        assert_eq!(saved.graph.threshold, Some(0.65));
        assert_eq!(saved.user.display_name, "Lan");
        assert_eq!(saved.user.id, "u-9");
    }

    #[test]
    fn persist_user_id_rejects_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "user = \"not a table\"\n").unwrap();
        assert!(AppConfig::persist_user_id(&path, "u-1").is_err());

        fs::write(&path, "[graph\n").unwrap();
        assert!(AppConfig::persist_user_id(&path, "u-1").is_err());
    }

    #[test]
    fn api_key_is_never_serialized() {
        let mut cfg = AppConfig::default();
        cfg.llm.openai_api_key = Some("sk-secret".to_string());
        let rendered = toml::to_string_pretty(&cfg).unwrap();
        assert!(!rendered.contains("sk-secret"));
    }

    #[test]
    fn unset_threshold_is_not_written() {
        let rendered = toml::to_string_pretty(&AppConfig::default()).unwrap();
        assert!(!rendered.contains("threshold"));
    }

    // ── Env overrides ──────────────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides_from(lookup(&[
            ("OLLAMA_BASE_URL", "http://gpu-box:11434"),
            ("OPENAI_API_KEY", "sk-env"),
            ("CONVOGRAPH_GRAPH_PATH", "/var/lib/convograph/graph.redb"),
        ]));
        assert_eq!(cfg.llm.ollama_base_url, "http://gpu-box:11434");
        assert_eq!(cfg.llm.openai_api_key.as_deref(), Some("sk-env"));
        assert_eq!(cfg.graph.path, "/var/lib/convograph/graph.redb");
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides_from(lookup(&[("OLLAMA_BASE_URL", "  "), ("OPENAI_API_KEY", "")]));
        assert_eq!(cfg.llm.ollama_base_url, "http://localhost:11434");
        assert_eq!(cfg.llm.openai_api_key, None);
    }

    // ── validate ───────────────────────────────────────────────────────────

    #[test]
    fn default_config_is_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_vocabulary_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.topics.vocabulary = vec!["  ".to_string()];
        assert!(cfg.validate().unwrap_err().to_string().contains("vocabulary"));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.graph.threshold = Some(1.5);
        assert!(cfg.validate().is_err());
        cfg.graph.threshold = Some(f64::NAN);
        assert!(cfg.validate().is_err());
        cfg.graph.threshold = Some(-1.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn openai_requires_api_key() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = LlmProvider::OpenAi;
        assert!(cfg.validate().unwrap_err().to_string().contains("OPENAI_API_KEY"));
        cfg.llm.openai_api_key = Some("sk-test".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn jsonl_backend_needs_a_path() {
        let mut cfg = AppConfig::default();
        cfg.graph.backend = GraphBackend::Jsonl;
        cfg.graph.jsonl_path = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn enum_labels_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&GraphBackend::Jsonl).unwrap(), "\"jsonl\"");
        assert_eq!(serde_json::to_string(&GraphScope::Global).unwrap(), "\"global\"");
        assert_eq!(serde_json::to_string(&LinkMerge::Pair).unwrap(), "\"pair\"");
        assert_eq!(serde_json::to_string(&LlmProvider::OpenAi).unwrap(), "\"openai\"");
    }
}
