use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use convograph_llm::{EmbeddingService, LabelExtractionService};
use convograph_memory::{
    IdentityGenerator, IngestReport, IngestRequest, IngestionPipeline, MessageId, MessageLog,
    MessageLogRecord, RandomIds, Sender, TopicExtraction, TopicNormalizer, UserId,
};

/// Where recorded turns end up.
pub(crate) enum Sink {
    Graph {
        pipeline: Arc<IngestionPipeline>,
        /// Flat-file copy of every committed message.
        mirror: Option<MessageLog>,
    },
    Jsonl {
        log: MessageLog,
        normalizer: TopicNormalizer,
    },
}

#[derive(Debug)]
pub(crate) enum Recorded {
    Graph(IngestReport),
    Logged {
        message_id: MessageId,
        topics: TopicExtraction,
    },
}

impl Recorded {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Graph(report) => &report.message_id,
            Self::Logged { message_id, .. } => message_id,
        }
    }
}

/// Runs the collaborators for one chat turn, degrading when they fail, and
/// hands the result to the configured sink.
pub(crate) struct Recorder {
    embedder: Arc<dyn EmbeddingService>,
    labeler: Arc<dyn LabelExtractionService>,
    vocabulary: Vec<String>,
    owner: Option<UserId>,
    sink: Sink,
}

impl Recorder {
    pub fn new(
        embedder: Arc<dyn EmbeddingService>,
        labeler: Arc<dyn LabelExtractionService>,
        vocabulary: Vec<String>,
        owner: Option<UserId>,
        sink: Sink,
    ) -> Self {
        Self {
            embedder,
            labeler,
            vocabulary,
            owner,
            sink,
        }
    }

    pub async fn record(&self, sender: Sender, content: &str) -> Result<Recorded> {
        self.record_with_topics(sender, content, None).await
    }

    /// Record one turn.  `raw_topics` bypasses label extraction when given.
    pub async fn record_with_topics(
        &self,
        sender: Sender,
        content: &str,
        raw_topics: Option<&str>,
    ) -> Result<Recorded> {
        let embedding = match self.embedder.embed(content).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!(error = %err, "embedding failed; storing message without embedding");
                Vec::new()
            }
        };

        let raw_topic_text = match raw_topics {
            Some(raw) => raw.to_string(),
            None => match self.labeler.extract_topics(content, &self.vocabulary).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(error = %err, "topic extraction failed; storing message without topics");
                    String::new()
                }
            },
        };

        let now = Utc::now();
        match &self.sink {
            Sink::Graph { pipeline, mirror } => {
                let request = IngestRequest {
                    sender,
                    content: content.to_string(),
                    owner_id: self.owner.clone(),
                    embedding: embedding.clone(),
                    raw_topic_text,
                };
                let pipeline = Arc::clone(pipeline);
                let report = tokio::task::spawn_blocking(move || pipeline.ingest_at(request, now))
                    .await
                    .context("ingestion task failed")??;

                if let Some(log) = mirror {
                    let record = MessageLogRecord {
                        message_id: report.message_id.clone(),
                        timestamp: now.timestamp(),
                        sender,
                        content: content.to_string(),
                        embedding,
                        topics: topics_field(&report.topics),
                    };
                    if let Err(err) = log.append(&record).await {
                        warn!(
                            message_id = %report.message_id,
                            error = %err,
                            path = %log.path().display(),
                            "message log mirror append failed"
                        );
                    }
                }
                Ok(Recorded::Graph(report))
            }
            Sink::Jsonl { log, normalizer } => {
                let topics = normalizer.normalize(&raw_topic_text);
                let message_id = MessageId::new(RandomIds.next_id());
                let record = MessageLogRecord {
                    message_id: message_id.clone(),
                    timestamp: now.timestamp(),
                    sender,
                    content: content.to_string(),
                    embedding,
                    topics: topics_field(&topics),
                };
                log.append(&record)
                    .await
                    .with_context(|| format!("appending to {}", log.path().display()))?;
                info!(message_id = %message_id, sender = %sender, "message logged");
                Ok(Recorded::Logged { message_id, topics })
            }
        }
    }
}

fn topics_field(topics: &TopicExtraction) -> Option<Vec<String>> {
    (!topics.is_empty()).then(|| topics.topics().to_vec())
}
