use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{
    CandidateScope, GraphStats, GraphStore, LinkMergePolicy, NewContextualLink, NewUser,
    SimilarityCandidate, TopicUpsert, UnitOfWork, UpsertedTopic, validate_link, validate_message,
    validate_topic_name,
};
use crate::error::{GraphError, GraphResult};
use crate::schema::{ContextualLink, Message, MessageId, Topic, User, UserId};

#[derive(Debug, Default)]
struct GraphState {
    users: BTreeMap<UserId, User>,
    messages: BTreeMap<MessageId, Message>,
    /// Keyed by canonical topic name.
    topics: BTreeMap<String, Topic>,
    owns: BTreeMap<UserId, Vec<MessageId>>,
    belongs_to: BTreeMap<MessageId, Vec<String>>,
    links: Vec<ContextualLink>,
}

impl GraphState {
    fn stats(&self) -> GraphStats {
        GraphStats {
            users: self.users.len(),
            messages: self.messages.len(),
            topics: self.topics.len(),
            ownership_links: self.owns.values().map(Vec::len).sum(),
            topic_links: self.belongs_to.values().map(Vec::len).sum(),
            contextual_links: self.links.len(),
        }
    }
}

/// Process-local graph store.  Used for tests, demos and the `memory`
/// backend; nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    state: Mutex<GraphState>,
    policy: LinkMergePolicy,
}

impl InMemoryGraphStore {
    pub fn new(policy: LinkMergePolicy) -> Self {
        Self {
            state: Mutex::new(GraphState::default()),
            policy,
        }
    }

    fn lock(&self) -> GraphResult<MutexGuard<'_, GraphState>> {
        self.state
            .lock()
            .map_err(|_| GraphError::Storage("in-memory graph lock poisoned".to_string()))
    }
}

/// Inverse of one write, replayed newest first when a unit of work is
/// rolled back or dropped.
#[derive(Debug)]
enum Undo {
    RemoveMessage(MessageId),
    PopOwned(UserId),
    RestoreLastActive(UserId, DateTime<Utc>),
    RemoveTopic(String),
    PopTopicLink(MessageId),
    PopLink,
    RestoreLink(usize, ContextualLink),
}

/// Holds the store lock for its whole lifetime and writes straight into the
/// shared state, logging an [`Undo`] step for every change it makes.
struct InMemoryUnitOfWork<'a> {
    guard: MutexGuard<'a, GraphState>,
    undo: Vec<Undo>,
    policy: LinkMergePolicy,
}

impl InMemoryUnitOfWork<'_> {
    fn revert(&mut self) {
        let state = &mut *self.guard;
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::RemoveMessage(id) => {
                    state.messages.remove(&id);
                }
                Undo::PopOwned(owner) => pop_last(&mut state.owns, &owner),
                Undo::RestoreLastActive(owner, at) => {
                    if let Some(user) = state.users.get_mut(&owner) {
                        user.last_active_at = at;
                    }
                }
                Undo::RemoveTopic(name) => {
                    state.topics.remove(&name);
                }
                Undo::PopTopicLink(message) => pop_last(&mut state.belongs_to, &message),
                Undo::PopLink => {
                    state.links.pop();
                }
                Undo::RestoreLink(index, previous) => {
                    if let Some(link) = state.links.get_mut(index) {
                        *link = previous;
                    }
                }
            }
        }
    }
}

fn pop_last<K: Ord, V>(map: &mut BTreeMap<K, Vec<V>>, key: &K) {
    if let Some(values) = map.get_mut(key) {
        values.pop();
        if values.is_empty() {
            map.remove(key);
        }
    }
}

impl Drop for InMemoryUnitOfWork<'_> {
    fn drop(&mut self) {
        self.revert();
    }
}

impl UnitOfWork for InMemoryUnitOfWork<'_> {
    fn create_message_node(&mut self, message: &Message) -> GraphResult<()> {
        validate_message(message)?;
        if self.guard.messages.contains_key(&message.id) {
            return Err(GraphError::InvalidRequest(format!(
                "message {} already exists",
                message.id
            )));
        }
        self.guard
            .messages
            .insert(message.id.clone(), message.clone());
        self.undo.push(Undo::RemoveMessage(message.id.clone()));
        Ok(())
    }

    fn link_ownership(&mut self, owner: &UserId, message: &MessageId) -> GraphResult<()> {
        if !self.guard.users.contains_key(owner) {
            return Err(GraphError::NotFound(format!("user {owner}")));
        }
        if !self.guard.messages.contains_key(message) {
            return Err(GraphError::NotFound(format!("message {message}")));
        }
        let owned = self.guard.owns.entry(owner.clone()).or_default();
        if !owned.contains(message) {
            owned.push(message.clone());
            self.undo.push(Undo::PopOwned(owner.clone()));
        }
        Ok(())
    }

    fn update_last_active(&mut self, owner: &UserId, at: DateTime<Utc>) -> GraphResult<()> {
        let user = self
            .guard
            .users
            .get_mut(owner)
            .ok_or_else(|| GraphError::NotFound(format!("user {owner}")))?;
        let previous = std::mem::replace(&mut user.last_active_at, at);
        self.undo
            .push(Undo::RestoreLastActive(owner.clone(), previous));
        Ok(())
    }

    fn upsert_topic(&mut self, request: &TopicUpsert) -> GraphResult<UpsertedTopic> {
        validate_topic_name(&request.name)?;
        if let Some(existing) = self.guard.topics.get(&request.name) {
            return Ok(UpsertedTopic {
                topic: existing.clone(),
                created: false,
            });
        }
        let topic = Topic {
            id: request.id_if_new.clone(),
            name: request.name.clone(),
            created_at: request.created_at,
        };
        self.guard
            .topics
            .insert(request.name.clone(), topic.clone());
        self.undo.push(Undo::RemoveTopic(request.name.clone()));
        Ok(UpsertedTopic {
            topic,
            created: true,
        })
    }

    fn link_message_topic(&mut self, message: &MessageId, topic: &str) -> GraphResult<()> {
        if !self.guard.messages.contains_key(message) {
            return Err(GraphError::NotFound(format!("message {message}")));
        }
        if !self.guard.topics.contains_key(topic) {
            return Err(GraphError::NotFound(format!("topic {topic}")));
        }
        let linked = self.guard.belongs_to.entry(message.clone()).or_default();
        if !linked.iter().any(|name| name == topic) {
            linked.push(topic.to_string());
            self.undo.push(Undo::PopTopicLink(message.clone()));
        }
        Ok(())
    }

    fn fetch_similarity_candidates(
        &mut self,
        message: &MessageId,
        scope: &CandidateScope,
    ) -> GraphResult<Vec<SimilarityCandidate>> {
        let state = &*self.guard;
        let candidates = match scope {
            CandidateScope::Global => state
                .messages
                .values()
                .filter(|m| &m.id != message)
                .map(SimilarityCandidate::from)
                .collect(),
            CandidateScope::SameOwner(owner) => state
                .owns
                .get(owner)
                .map(|ids| {
                    ids.iter()
                        .filter(|id| *id != message)
                        .filter_map(|id| state.messages.get(id))
                        .map(SimilarityCandidate::from)
                        .collect()
                })
                .unwrap_or_default(),
        };
        Ok(candidates)
    }

    fn create_similarity_edge(&mut self, link: &NewContextualLink) -> GraphResult<ContextualLink> {
        validate_link(link)?;
        for endpoint in [&link.source, &link.target] {
            if !self.guard.messages.contains_key(endpoint) {
                return Err(GraphError::NotFound(format!("message {endpoint}")));
            }
        }

        if self.policy == LinkMergePolicy::Pair {
            let key = crate::schema::pair_key(&link.source, &link.target);
            if let Some(index) = self
                .guard
                .links
                .iter()
                .position(|existing| existing.pair_key() == key)
            {
                let existing = &mut self.guard.links[index];
                self.undo.push(Undo::RestoreLink(index, existing.clone()));
                existing.similarity = link.similarity;
                existing.timestamp = link.timestamp;
                return Ok(existing.clone());
            }
        }

        let stored = link.clone().into_link();
        self.guard.links.push(stored.clone());
        self.undo.push(Undo::PopLink);
        Ok(stored)
    }

    fn commit(mut self: Box<Self>) -> GraphResult<()> {
        self.undo.clear();
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> GraphResult<()> {
        self.revert();
        Ok(())
    }
}

impl GraphStore for InMemoryGraphStore {
    fn begin(&self) -> GraphResult<Box<dyn UnitOfWork + '_>> {
        Ok(Box::new(InMemoryUnitOfWork {
            guard: self.lock()?,
            undo: Vec::new(),
            policy: self.policy,
        }))
    }

    fn ensure_user(&self, user: &NewUser) -> GraphResult<User> {
        let mut state = self.lock()?;
        let stored = state.users.entry(user.id.clone()).or_insert_with(|| User {
            id: user.id.clone(),
            display_name: user.display_name.clone(),
            created_at: user.at,
            last_active_at: user.at,
            preferences: user.preferences.clone(),
        });
        Ok(stored.clone())
    }

    fn user(&self, id: &UserId) -> GraphResult<Option<User>> {
        Ok(self.lock()?.users.get(id).cloned())
    }

    fn message(&self, id: &MessageId) -> GraphResult<Option<Message>> {
        Ok(self.lock()?.messages.get(id).cloned())
    }

    fn message_topics(&self, id: &MessageId) -> GraphResult<Vec<String>> {
        Ok(self.lock()?.belongs_to.get(id).cloned().unwrap_or_default())
    }

    fn contextual_links(&self, id: &MessageId) -> GraphResult<Vec<ContextualLink>> {
        Ok(self
            .lock()?
            .links
            .iter()
            .filter(|link| link.other_end(id).is_some())
            .cloned()
            .collect())
    }

    fn topics(&self) -> GraphResult<Vec<Topic>> {
        Ok(self.lock()?.topics.values().cloned().collect())
    }

    fn stats(&self) -> GraphResult<GraphStats> {
        Ok(self.lock()?.stats())
    }
}
