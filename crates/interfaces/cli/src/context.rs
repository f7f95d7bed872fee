use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use convograph_config::{AppConfig, GraphBackend, GraphScope, LinkMerge, LlmProvider};
use convograph_llm::{LlmRouter, LlmSettings, ModelSelection, Provider};
use convograph_memory::{
    GraphStore, IdentityGenerator, InMemoryGraphStore, IngestionPipeline, LinkMergePolicy,
    MessageLog, NewUser, PipelineConfig, RandomIds, RedbGraphStore, ScopeMode, TopicNormalizer,
    TopicVocabulary, UserId, UserPreferences,
};

use crate::recorder::{Recorder, Sink};

pub(crate) fn scope_mode(scope: GraphScope) -> ScopeMode {
    match scope {
        GraphScope::User => ScopeMode::User,
        GraphScope::Global => ScopeMode::Global,
    }
}

pub(crate) fn merge_policy(merge: LinkMerge) -> LinkMergePolicy {
    match merge {
        LinkMerge::Append => LinkMergePolicy::Append,
        LinkMerge::Pair => LinkMergePolicy::Pair,
    }
}

pub(crate) fn provider(provider: LlmProvider) -> Provider {
    match provider {
        LlmProvider::Ollama => Provider::Ollama,
        LlmProvider::OpenAi => Provider::OpenAi,
    }
}

pub(crate) fn llm_settings(config: &AppConfig) -> LlmSettings {
    LlmSettings {
        provider: provider(config.llm.provider),
        models: ModelSelection {
            chat: config.llm.chat_model.clone(),
            embedding: config.llm.embedding_model.clone(),
            label: config.llm.label_model.clone(),
        },
        ollama_base_url: config.llm.ollama_base_url.clone(),
        openai_base_url: config.llm.openai_base_url.clone(),
        api_key: config.llm.openai_api_key.clone(),
        request_timeout: Duration::from_secs(config.llm.request_timeout_secs),
    }
}

pub(crate) fn pipeline_config(config: &AppConfig) -> PipelineConfig {
    PipelineConfig::new(scope_mode(config.graph.scope))
        .with_threshold(config.graph.effective_threshold())
}

pub(crate) fn vocabulary(config: &AppConfig) -> TopicVocabulary {
    TopicVocabulary::new(config.topics.vocabulary.iter().map(String::as_str))
}

/// Open the configured graph backend.  `None` for the jsonl backend.
pub(crate) fn open_store(config: &AppConfig) -> Result<Option<Arc<dyn GraphStore>>> {
    let policy = merge_policy(config.graph.link_merge);
    let store: Arc<dyn GraphStore> = match config.graph.backend {
        GraphBackend::Redb => Arc::new(
            RedbGraphStore::open(&config.graph.path, policy)
                .with_context(|| format!("opening graph store at {}", config.graph.path))?,
        ),
        GraphBackend::Memory => Arc::new(InMemoryGraphStore::new(policy)),
        GraphBackend::Jsonl => return Ok(None),
    };
    Ok(Some(store))
}

/// Assign and persist a user id the first time a user-scoped deployment runs.
pub(crate) fn ensure_user_id(config: &mut AppConfig, config_path: &Path) -> Result<()> {
    if config.graph.scope != GraphScope::User || !config.user.id.trim().is_empty() {
        return Ok(());
    }
    let id = RandomIds.next_id();
    AppConfig::persist_user_id(config_path, &id)
        .with_context(|| format!("saving generated user id to {}", config_path.display()))?;
    config.user.id = id;
    info!(user_id = %config.user.id, "generated user id");
    Ok(())
}

pub(crate) fn owner(config: &AppConfig) -> Option<UserId> {
    match config.graph.scope {
        GraphScope::User => Some(UserId::new(config.user.id.trim())),
        GraphScope::Global => None,
    }
}

fn new_user(config: &AppConfig, id: UserId) -> NewUser {
    NewUser {
        id,
        display_name: config.user.display_name.clone(),
        preferences: UserPreferences {
            language: config.user.language.clone(),
            tone: config.user.tone.clone(),
            addressing: config.user.addressing.clone(),
        },
        at: Utc::now(),
    }
}

/// Everything a chat or ingest command needs, built from validated config.
pub(crate) struct AppContext {
    pub config: AppConfig,
    pub store: Option<Arc<dyn GraphStore>>,
    pub llm: Arc<LlmRouter>,
    pub recorder: Recorder,
}

impl AppContext {
    pub fn build(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let llm = Arc::new(LlmRouter::from_settings(&llm_settings(&config))?);
        let store = open_store(&config)?;
        let owner = owner(&config);

        if let (Some(store), Some(id)) = (&store, &owner) {
            store
                .ensure_user(&new_user(&config, id.clone()))
                .context("registering configured user")?;
        }

        let jsonl = MessageLog::new(&config.graph.jsonl_path);
        let sink = match &store {
            Some(store) => Sink::Graph {
                pipeline: Arc::new(IngestionPipeline::new(
                    Arc::clone(store),
                    vocabulary(&config),
                    pipeline_config(&config),
                )),
                mirror: config.graph.mirror_jsonl.then_some(jsonl),
            },
            None => Sink::Jsonl {
                log: jsonl,
                normalizer: TopicNormalizer::new(vocabulary(&config)),
            },
        };

        let recorder = Recorder::new(
            llm.clone(),
            llm.clone(),
            config.topics.vocabulary.clone(),
            owner,
            sink,
        );

        Ok(Self {
            config,
            store,
            llm,
            recorder,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn enum_mapping_follows_config() {
        assert_eq!(scope_mode(GraphScope::Global), ScopeMode::Global);
        assert_eq!(merge_policy(LinkMerge::Pair), LinkMergePolicy::Pair);
        assert_eq!(provider(LlmProvider::OpenAi), Provider::OpenAi);
    }

    #[test]
    fn pipeline_threshold_uses_scope_default_unless_set() {
        let mut config = AppConfig::default();
        assert_eq!(pipeline_config(&config).threshold, 0.5);
        config.graph.scope = GraphScope::Global;
        assert_eq!(pipeline_config(&config).threshold, 0.7);
        config.graph.threshold = Some(0.9);
        let pipeline = pipeline_config(&config);
        assert_eq!(pipeline.threshold, 0.9);
        assert_eq!(pipeline.scope, ScopeMode::Global);
    }

    #[test]
    fn user_id_is_generated_once_and_saved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config/default.toml");
        let mut config = AppConfig::default();

        ensure_user_id(&mut config, &path).unwrap();
        let generated = config.user.id.clone();
        assert_eq!(generated.len(), 32);

        let reloaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.user.id, generated);

        ensure_user_id(&mut config, &path).unwrap();
        assert_eq!(config.user.id, generated);
    }

    #[test]
    fn saving_user_id_keeps_file_values_over_env_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("default.toml");
        std::fs::write(&path, "[graph]\npath = \"real.redb\"\n").unwrap();

        let mut config = AppConfig::load_from(&path).unwrap();
        config.apply_env_overrides_from(|key| {
            (key == "CONVOGRAPH_GRAPH_PATH").then(|| "/tmp/throwaway.redb".to_string())
        });
        ensure_user_id(&mut config, &path).unwrap();
        assert_eq!(config.graph.path, "/tmp/throwaway.redb");

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("real.redb"));
        assert!(!raw.contains("throwaway"));
        assert!(raw.contains(&config.user.id));
    }

    #[test]
    fn global_scope_needs_no_user_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("default.toml");
        let mut config = AppConfig::default();
        config.graph.scope = GraphScope::Global;

        ensure_user_id(&mut config, &path).unwrap();
        assert!(config.user.id.is_empty());
        assert!(!path.exists());
        assert_eq!(owner(&config), None);
    }

    #[test]
    fn jsonl_backend_opens_no_store() {
        let mut config = AppConfig::default();
        config.graph.backend = GraphBackend::Jsonl;
        assert!(open_store(&config).unwrap().is_none());
    }

    #[test]
    fn build_registers_configured_user() {
        let mut config = AppConfig::default();
        config.graph.backend = GraphBackend::Memory;
        config.user.id = "u-1".to_string();
        config.user.addressing = "chị".to_string();

        let ctx = AppContext::build(config).unwrap();
        let store = ctx.store.expect("memory backend has a store");
        let user = store.user(&UserId::new("u-1")).unwrap().unwrap();
        assert_eq!(user.preferences.addressing, "chị");
        assert_eq!(user.display_name, "guest");
    }
}
