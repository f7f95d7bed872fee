//! Per-message ingestion: one unit of work that records the message, its
//! ownership, its topics and its similarity edges.
//!
//! Collaborator output (embedding, raw label text) is computed by the caller
//! before [`IngestionPipeline::ingest`] runs.  An empty embedding is a valid
//! degraded input: the node is still stored, it just never links.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{GraphError, IngestError, IngestStage};
use crate::identity::{IdentityGenerator, RandomIds};
use crate::schema::{LinkId, Message, MessageId, Sender, TopicId, UserId};
use crate::similarity::cosine_similarity;
use crate::store::{CandidateScope, GraphStore, NewContextualLink, TopicUpsert, UnitOfWork};
use crate::topics::{TopicExtraction, TopicNormalizer, TopicVocabulary};

/// Default threshold for owner-scoped deployments.
pub const DEFAULT_USER_THRESHOLD: f64 = 0.5;
/// Default threshold for single-tenant deployments.
pub const DEFAULT_GLOBAL_THRESHOLD: f64 = 0.7;

/// Deployment-wide candidate scope, fixed when the pipeline is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeMode {
    /// Messages are owned by a user and only link to that user's messages.
    #[default]
    #[serde(alias = "user_scoped")]
    User,
    /// Messages carry no owner and link to any prior message.
    Global,
}

impl ScopeMode {
    pub fn default_threshold(self) -> f64 {
        match self {
            Self::User => DEFAULT_USER_THRESHOLD,
            Self::Global => DEFAULT_GLOBAL_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub scope: ScopeMode,
    /// An edge is created only when similarity is strictly greater.
    pub threshold: f64,
}

impl PipelineConfig {
    pub fn new(scope: ScopeMode) -> Self {
        Self {
            scope,
            threshold: scope.default_threshold(),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new(ScopeMode::User)
    }
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub sender: Sender,
    pub content: String,
    /// Required by user-scoped pipelines, ignored by global ones.
    pub owner_id: Option<UserId>,
    /// Empty when the embedding collaborator failed.
    pub embedding: Vec<f32>,
    /// Raw label-extraction output; empty when that collaborator failed.
    pub raw_topic_text: String,
}

/// Advisory counters for one committed message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub message_id: MessageId,
    pub topics: TopicExtraction,
    pub edges_created: usize,
    pub candidates_scanned: usize,
    pub topic_failures: usize,
    pub edge_failures: usize,
}

/// Lifecycle of one message, traced at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageState {
    Pending,
    Embedded,
    Degraded,
    Persisted,
    TopicLinked,
    SimilarityEvaluated,
    Committed,
    Aborted,
}

fn trace_state(message_id: &MessageId, state: MessageState) {
    debug!(message_id = %message_id, state = ?state, "ingest state");
}

pub struct IngestionPipeline {
    store: Arc<dyn GraphStore>,
    normalizer: TopicNormalizer,
    ids: Arc<dyn IdentityGenerator>,
    config: PipelineConfig,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn GraphStore>,
        vocabulary: TopicVocabulary,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            normalizer: TopicNormalizer::new(vocabulary),
            ids: Arc::new(RandomIds),
            config,
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdentityGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn ingest(&self, request: IngestRequest) -> Result<IngestReport, IngestError> {
        self.ingest_at(request, Utc::now())
    }

    /// Ingest with an explicit clock value used for the message timestamp,
    /// the owner's last-active time, new topics and new edges.
    pub fn ingest_at(
        &self,
        request: IngestRequest,
        now: DateTime<Utc>,
    ) -> Result<IngestReport, IngestError> {
        let IngestRequest {
            sender,
            content,
            owner_id,
            embedding,
            raw_topic_text,
        } = request;

        let (owner, scope) = match self.config.scope {
            ScopeMode::User => {
                let owner = owner_id.ok_or(IngestError::MissingOwner)?;
                let scope = CandidateScope::SameOwner(owner.clone());
                (Some(owner), scope)
            }
            ScopeMode::Global => (None, CandidateScope::Global),
        };

        let message_id = MessageId::new(self.ids.next_id());
        trace_state(&message_id, MessageState::Pending);
        trace_state(
            &message_id,
            if embedding.is_empty() {
                MessageState::Degraded
            } else {
                MessageState::Embedded
            },
        );

        let topics = self.normalizer.normalize(&raw_topic_text);
        let message = Message {
            id: message_id.clone(),
            owner: owner.clone(),
            timestamp: now,
            sender,
            content,
            embedding,
            topics: topics.topics().to_vec(),
        };

        let mut uow = self.store.begin().map_err(|source| {
            warn!(message_id = %message_id, error = %source, "could not open unit of work");
            IngestError::Persistence {
                stage: IngestStage::Begin,
                source,
            }
        })?;

        if let Err(source) = uow.create_message_node(&message) {
            return Err(abort(uow, &message_id, IngestStage::CreateMessage, source));
        }
        if let Some(owner) = &owner {
            if let Err(source) = uow.link_ownership(owner, &message_id) {
                return Err(abort(uow, &message_id, IngestStage::LinkOwnership, source));
            }
            if sender == Sender::Human {
                if let Err(source) = uow.update_last_active(owner, now) {
                    return Err(abort(uow, &message_id, IngestStage::UpdateLastActive, source));
                }
            }
        }
        trace_state(&message_id, MessageState::Persisted);

        let mut topic_failures = 0;
        for name in topics.topics() {
            let upsert = TopicUpsert {
                id_if_new: TopicId::new(self.ids.next_id()),
                name: name.clone(),
                created_at: now,
            };
            let linked = match uow.upsert_topic(&upsert) {
                Ok(_) => uow.link_message_topic(&message_id, name),
                Err(err) => Err(err),
            };
            if let Err(err) = linked {
                topic_failures += 1;
                warn!(message_id = %message_id, topic = %name, error = %err, "topic link skipped");
            }
        }
        trace_state(&message_id, MessageState::TopicLinked);

        let candidates = match uow.fetch_similarity_candidates(&message_id, &scope) {
            Ok(candidates) => candidates,
            Err(source) => {
                return Err(abort(uow, &message_id, IngestStage::FetchCandidates, source));
            }
        };

        let mut edges_created = 0;
        let mut edge_failures = 0;
        for candidate in &candidates {
            let similarity = cosine_similarity(&message.embedding, &candidate.embedding);
            if similarity <= self.config.threshold {
                continue;
            }
            let link = NewContextualLink {
                id: LinkId::new(self.ids.next_id()),
                source: message_id.clone(),
                target: candidate.id.clone(),
                similarity,
                timestamp: now,
            };
            match uow.create_similarity_edge(&link) {
                Ok(_) => edges_created += 1,
                Err(err) => {
                    edge_failures += 1;
                    warn!(
                        message_id = %message_id,
                        candidate = %candidate.id,
                        similarity,
                        error = %err,
                        "similarity edge skipped"
                    );
                }
            }
        }
        trace_state(&message_id, MessageState::SimilarityEvaluated);

        if let Err(source) = uow.commit() {
            trace_state(&message_id, MessageState::Aborted);
            warn!(message_id = %message_id, error = %source, "commit failed");
            return Err(IngestError::Persistence {
                stage: IngestStage::Commit,
                source,
            });
        }
        trace_state(&message_id, MessageState::Committed);

        info!(
            message_id = %message_id,
            sender = %sender,
            topics = topics.topics().len(),
            edges_created,
            candidates_scanned = candidates.len(),
            "message ingested"
        );

        Ok(IngestReport {
            message_id,
            topics,
            edges_created,
            candidates_scanned: candidates.len(),
            topic_failures,
            edge_failures,
        })
    }
}

fn abort(
    uow: Box<dyn UnitOfWork + '_>,
    message_id: &MessageId,
    stage: IngestStage,
    source: GraphError,
) -> IngestError {
    trace_state(message_id, MessageState::Aborted);
    warn!(message_id = %message_id, stage = %stage, error = %source, "ingestion aborted");
    if let Err(err) = uow.rollback() {
        warn!(message_id = %message_id, error = %err, "rollback failed");
    }
    IngestError::Persistence { stage, source }
}
