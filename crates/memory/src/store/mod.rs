//! Persistence boundary for the conversation graph.
//!
//! A [`GraphStore`] hands out one [`UnitOfWork`] per ingested message.  All
//! writes made through a unit of work become visible together on
//! [`UnitOfWork::commit`]; [`UnitOfWork::rollback`] (or dropping the unit of
//! work uncommitted) discards them.  Whether a failed operation aborts the
//! whole unit of work is the caller's decision: the store only reports it.
//!
//! # Graph shape
//!
//! | Relationship      | Direction           | Cardinality                      |
//! |-------------------|---------------------|----------------------------------|
//! | `OWNS`            | User → Message      | one per message (user-scoped)    |
//! | `BELONGS_TO`      | Message → Topic     | one per (message, topic) pair    |
//! | `CONTEXTUAL_LINK` | Message ↔ Message   | see [`LinkMergePolicy`]          |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};
use crate::schema::{
    ContextualLink, LinkId, Message, MessageId, Topic, TopicId, User, UserId, UserPreferences,
};

mod in_memory;
mod redb_store;

pub use in_memory::InMemoryGraphStore;
pub use redb_store::RedbGraphStore;

/// How `create_similarity_edge` treats a pair that is already linked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMergePolicy {
    /// Every call adds a new edge.  Re-linking the same pair multiplies edges.
    #[default]
    Append,
    /// One edge per unordered pair; a repeat call overwrites its similarity
    /// and timestamp and keeps the first edge id.
    Pair,
}

/// Which prior messages are compared against a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateScope {
    SameOwner(UserId),
    Global,
}

/// Request to create a user when no user with `id` exists yet.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: UserId,
    pub display_name: String,
    pub preferences: UserPreferences,
    pub at: DateTime<Utc>,
}

/// Request to find-or-create a topic by canonical name.
#[derive(Debug, Clone)]
pub struct TopicUpsert {
    /// Used only if the topic does not exist yet.
    pub id_if_new: TopicId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertedTopic {
    pub topic: Topic,
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct NewContextualLink {
    pub id: LinkId,
    pub source: MessageId,
    pub target: MessageId,
    pub similarity: f64,
    pub timestamp: DateTime<Utc>,
}

impl NewContextualLink {
    pub(crate) fn into_link(self) -> ContextualLink {
        ContextualLink {
            id: self.id,
            source: self.source,
            target: self.target,
            similarity: self.similarity,
            timestamp: self.timestamp,
        }
    }
}

/// A prior message eligible for similarity comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityCandidate {
    pub id: MessageId,
    pub embedding: Vec<f32>,
    pub content: String,
}

impl From<&Message> for SimilarityCandidate {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            embedding: message.embedding.clone(),
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub users: usize,
    pub messages: usize,
    pub topics: usize,
    pub ownership_links: usize,
    pub topic_links: usize,
    pub contextual_links: usize,
}

/// Operations available inside one atomic unit of work.
pub trait UnitOfWork {
    fn create_message_node(&mut self, message: &Message) -> GraphResult<()>;

    fn link_ownership(&mut self, owner: &UserId, message: &MessageId) -> GraphResult<()>;

    fn update_last_active(&mut self, owner: &UserId, at: DateTime<Utc>) -> GraphResult<()>;

    fn upsert_topic(&mut self, request: &TopicUpsert) -> GraphResult<UpsertedTopic>;

    /// Idempotent: re-asserting an existing association is a no-op.
    fn link_message_topic(&mut self, message: &MessageId, topic: &str) -> GraphResult<()>;

    /// Every message in `scope` except `message` itself.
    fn fetch_similarity_candidates(
        &mut self,
        message: &MessageId,
        scope: &CandidateScope,
    ) -> GraphResult<Vec<SimilarityCandidate>>;

    fn create_similarity_edge(&mut self, link: &NewContextualLink) -> GraphResult<ContextualLink>;

    fn commit(self: Box<Self>) -> GraphResult<()>;

    fn rollback(self: Box<Self>) -> GraphResult<()>;
}

/// A transactional conversation graph shared by any number of sessions.
pub trait GraphStore: Send + Sync {
    /// Open a unit of work.  Blocks while another unit of work on the same
    /// store is open.
    fn begin(&self) -> GraphResult<Box<dyn UnitOfWork + '_>>;

    /// Create the user unless one with the same id exists; returns the stored
    /// record either way.
    fn ensure_user(&self, user: &NewUser) -> GraphResult<User>;

    fn user(&self, id: &UserId) -> GraphResult<Option<User>>;

    fn message(&self, id: &MessageId) -> GraphResult<Option<Message>>;

    /// Topic names linked to `id` via `BELONGS_TO`.
    fn message_topics(&self, id: &MessageId) -> GraphResult<Vec<String>>;

    /// All `CONTEXTUAL_LINK` edges touching `id`.
    fn contextual_links(&self, id: &MessageId) -> GraphResult<Vec<ContextualLink>>;

    fn topics(&self) -> GraphResult<Vec<Topic>>;

    fn stats(&self) -> GraphResult<GraphStats>;
}

pub(crate) fn validate_message(message: &Message) -> GraphResult<()> {
    if message.id.as_str().trim().is_empty() {
        return Err(GraphError::InvalidRequest("message id is empty".to_string()));
    }
    if message.embedding.iter().any(|v| !v.is_finite()) {
        return Err(GraphError::InvalidRequest(format!(
            "message {} has a non-finite embedding component",
            message.id
        )));
    }
    Ok(())
}

pub(crate) fn validate_link(link: &NewContextualLink) -> GraphResult<()> {
    if link.source == link.target {
        return Err(GraphError::InvalidRequest(format!(
            "self-link on message {}",
            link.source
        )));
    }
    if !link.similarity.is_finite() {
        return Err(GraphError::InvalidRequest(format!(
            "non-finite similarity between {} and {}",
            link.source, link.target
        )));
    }
    Ok(())
}

pub(crate) fn validate_topic_name(name: &str) -> GraphResult<()> {
    if name.trim().is_empty() {
        return Err(GraphError::InvalidRequest("topic name is empty".to_string()));
    }
    Ok(())
}
