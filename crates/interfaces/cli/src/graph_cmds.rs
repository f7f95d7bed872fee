use std::sync::Arc;

use anyhow::{Context, Result, bail};

use convograph_config::{AppConfig, GraphBackend};
use convograph_llm::{EmbeddingService, LlmRouter};
use convograph_memory::{GraphStats, GraphStore, MessageId, MessageLog, schema::truncate_str};

use crate::context::{self, llm_settings};

pub(crate) fn print_stats(stats: &GraphStats) {
    println!("── graph stats ──────────────────────────────────────");
    println!("  users:            {}", stats.users);
    println!("  messages:         {}", stats.messages);
    println!("  topics:           {}", stats.topics);
    println!("  owns:             {}", stats.ownership_links);
    println!("  belongs_to:       {}", stats.topic_links);
    println!("  contextual_links: {}", stats.contextual_links);
}

fn require_store(config: &AppConfig) -> Result<Arc<dyn GraphStore>> {
    match context::open_store(config)? {
        Some(store) => Ok(store),
        None => bail!(
            "graph.backend = \"jsonl\" keeps no graph; inspect {} instead",
            config.graph.jsonl_path
        ),
    }
}

pub(crate) fn run_graph_stats(config: &AppConfig, json: bool) -> Result<()> {
    if config.graph.backend == GraphBackend::Jsonl {
        let records = MessageLog::new(&config.graph.jsonl_path).load()?;
        println!("── message log ──────────────────────────────────────");
        println!("  path:     {}", config.graph.jsonl_path);
        println!("  messages: {}", records.len());
        if let Some(last) = records.last().and_then(|record| record.occurred_at()) {
            println!("  last:     {}", last.format("%Y-%m-%d %H:%M:%S"));
        }
        return Ok(());
    }

    let stats = require_store(config)?.stats()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_stats(&stats);
    }
    Ok(())
}

pub(crate) fn run_graph_show(config: &AppConfig, id: &str) -> Result<()> {
    let store = require_store(config)?;
    let id = MessageId::new(id.trim());
    let message = store
        .message(&id)?
        .with_context(|| format!("no message with id {id}"))?;

    println!("── message {} ──────────────────────────────", id.short());
    println!("  id:        {}", message.id);
    println!("  sender:    {}", message.sender);
    println!("  timestamp: {}", message.timestamp.to_rfc3339());
    println!(
        "  owner:     {}",
        message.owner.as_ref().map_or("(none)", |owner| owner.as_str())
    );
    println!("  embedding: {} dims", message.embedding.len());
    println!("  content:   {}", truncate_str(&message.content, 200));

    let topics = store.message_topics(&id)?;
    if topics.is_empty() {
        println!("  topics:    (none)");
    } else {
        println!("  topics:    {}", topics.join(", "));
    }

    let links = store.contextual_links(&id)?;
    println!();
    println!("── contextual links ({}) ─────────────────────────", links.len());
    for link in &links {
        let Some(other) = link.other_end(&id) else {
            continue;
        };
        let preview = store
            .message(other)?
            .map(|m| truncate_str(&m.content, 60).to_string())
            .unwrap_or_default();
        println!(
            "  {:.3}  {}  {}  {preview}",
            link.similarity,
            other.short(),
            link.timestamp.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

pub(crate) fn run_graph_topics(config: &AppConfig) -> Result<()> {
    let store = require_store(config)?;
    let topics = store.topics()?;
    println!("── topics ───────────────────────────────────────────");
    if topics.is_empty() {
        println!("  (none yet)");
    }
    for topic in &topics {
        println!(
            "  {:<14} {}  created {}",
            topic.name,
            topic.id.short(),
            topic.created_at.format("%Y-%m-%d")
        );
    }
    Ok(())
}

pub(crate) async fn run_doctor(config: &AppConfig, probe: bool) -> Result<()> {
    println!("convograph doctor");
    match config.validate() {
        Ok(()) => println!("- config: ok"),
        Err(err) => println!("- config: invalid ({err})"),
    }
    println!("- provider: {}", context::provider(config.llm.provider).label());
    println!("- chat model: {}", config.llm.chat_model);
    println!("- embedding model: {}", config.llm.embedding_model);
    println!("- label model: {}", config.llm.label_model);
    println!(
        "- openai key: {}",
        if config.llm.openai_api_key.is_some() { "set" } else { "unset" }
    );
    println!("- backend: {:?}", config.graph.backend);
    match config.graph.backend {
        GraphBackend::Redb => println!("- graph path: {}", config.graph.path),
        GraphBackend::Memory => println!("- graph path: (in-memory, not persisted)"),
        GraphBackend::Jsonl => {}
    }
    if config.graph.backend == GraphBackend::Jsonl || config.graph.mirror_jsonl {
        println!("- message log: {}", config.graph.jsonl_path);
    }
    println!("- scope: {:?}", config.graph.scope);
    println!("- threshold: {}", config.graph.effective_threshold());
    println!("- link merge: {:?}", config.graph.link_merge);
    let vocabulary = context::vocabulary(config);
    if vocabulary.is_empty() {
        println!("- vocabulary: empty (no message will be tagged)");
    } else {
        println!("- vocabulary: {} topics", vocabulary.len());
    }
    if !config.user.id.is_empty() {
        println!("- user id: {}", config.user.id);
    }

    match context::open_store(config) {
        Ok(Some(store)) => match store.stats() {
            Ok(stats) => println!(
                "- graph: {} users, {} messages, {} topics, {} contextual links",
                stats.users, stats.messages, stats.topics, stats.contextual_links
            ),
            Err(err) => println!("- graph: unreadable ({err})"),
        },
        Ok(None) => match MessageLog::new(&config.graph.jsonl_path).load() {
            Ok(records) => println!("- message log entries: {}", records.len()),
            Err(err) => println!("- message log: unreadable ({err})"),
        },
        Err(err) => println!("- graph: unavailable ({err:#})"),
    }

    if probe {
        match LlmRouter::from_settings(&llm_settings(config)) {
            Ok(router) => match router.embed("ping").await {
                Ok(embedding) => println!(
                    "- embedding probe: ok ({} dims from {})",
                    embedding.len(),
                    router.base_url()
                ),
                Err(err) => println!("- embedding probe: failed ({err:#})"),
            },
            Err(err) => println!("- embedding probe: skipped ({err})"),
        }
    }
    Ok(())
}
