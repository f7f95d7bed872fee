//! Durable graph store backed by [`redb`].
//!
//! Every unit of work is one redb write transaction, so writers serialize and
//! a message is either fully committed with its relationships or absent.
//!
//! # Tables
//!
//! | Name            | Kind     | Key                 | Value                       |
//! |-----------------|----------|---------------------|-----------------------------|
//! | `users`         | table    | user id             | JSON [`User`]               |
//! | `messages`      | table    | message id          | JSON [`Message`]            |
//! | `topics`        | table    | canonical name      | JSON [`Topic`]              |
//! | `links`         | table    | link key            | JSON [`ContextualLink`]     |
//! | `owns`          | multimap | user id             | message id                  |
//! | `belongs_to`    | multimap | message id          | topic name                  |
//! | `message_links` | multimap | message id          | link key                    |
//!
//! A link key is the unordered pair key under [`LinkMergePolicy::Pair`] and
//! `pair#link-id` under [`LinkMergePolicy::Append`].
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable,
    ReadableTableMetadata, TableDefinition, WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use super::{
    CandidateScope, GraphStats, GraphStore, LinkMergePolicy, NewContextualLink, NewUser,
    SimilarityCandidate, TopicUpsert, UnitOfWork, UpsertedTopic, validate_link, validate_message,
    validate_topic_name,
};
use crate::error::{GraphError, GraphResult};
use crate::schema::{ContextualLink, Message, MessageId, Topic, User, UserId, pair_key};

const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
const MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");
const TOPICS: TableDefinition<&str, &[u8]> = TableDefinition::new("topics");
const LINKS: TableDefinition<&str, &[u8]> = TableDefinition::new("links");
const OWNS: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("owns");
const BELONGS_TO: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("belongs_to");
const MESSAGE_LINKS: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("message_links");

pub struct RedbGraphStore {
    db: Database,
    path: PathBuf,
    policy: LinkMergePolicy,
}

impl RedbGraphStore {
    /// Open or create the graph database at `path`.
    pub fn open(path: impl AsRef<Path>, policy: LinkMergePolicy) -> GraphResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    GraphError::Storage(format!("creating {}: {err}", parent.display()))
                })?;
            }
        }
        let db = Database::create(&path)?;

        // Ensure tables exist so read transactions never hit a missing table.
        {
            let tx = db.begin_write()?;
            tx.open_table(USERS)?;
            tx.open_table(MESSAGES)?;
            tx.open_table(TOPICS)?;
            tx.open_table(LINKS)?;
            tx.open_multimap_table(OWNS)?;
            tx.open_multimap_table(BELONGS_TO)?;
            tx.open_multimap_table(MESSAGE_LINKS)?;
            tx.commit()?;
        }

        info!(path = %path.display(), policy = ?policy, "graph store opened");
        Ok(Self { db, path, policy })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_json<T, R>(table: &R, key: &str) -> GraphResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

fn multimap_values<R>(table: &R, key: &str) -> GraphResult<Vec<String>>
where
    R: ReadableMultimapTable<&'static str, &'static str>,
{
    let mut values = Vec::new();
    for value in table.get(key)? {
        values.push(value?.value().to_string());
    }
    Ok(values)
}

fn to_json<T: Serialize>(value: &T) -> GraphResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

struct RedbUnitOfWork {
    tx: WriteTransaction,
    policy: LinkMergePolicy,
}

impl UnitOfWork for RedbUnitOfWork {
    fn create_message_node(&mut self, message: &Message) -> GraphResult<()> {
        validate_message(message)?;
        let mut messages = self.tx.open_table(MESSAGES)?;
        if messages.get(message.id.as_str())?.is_some() {
            return Err(GraphError::InvalidRequest(format!(
                "message {} already exists",
                message.id
            )));
        }
        let bytes = to_json(message)?;
        messages.insert(message.id.as_str(), bytes.as_slice())?;
        Ok(())
    }

    fn link_ownership(&mut self, owner: &UserId, message: &MessageId) -> GraphResult<()> {
        {
            let users = self.tx.open_table(USERS)?;
            if users.get(owner.as_str())?.is_none() {
                return Err(GraphError::NotFound(format!("user {owner}")));
            }
            let messages = self.tx.open_table(MESSAGES)?;
            if messages.get(message.as_str())?.is_none() {
                return Err(GraphError::NotFound(format!("message {message}")));
            }
        }
        let mut owns = self.tx.open_multimap_table(OWNS)?;
        owns.insert(owner.as_str(), message.as_str())?;
        Ok(())
    }

    fn update_last_active(&mut self, owner: &UserId, at: DateTime<Utc>) -> GraphResult<()> {
        let mut users = self.tx.open_table(USERS)?;
        let mut user: User = read_json(&users, owner.as_str())?
            .ok_or_else(|| GraphError::NotFound(format!("user {owner}")))?;
        user.last_active_at = at;
        let bytes = to_json(&user)?;
        users.insert(owner.as_str(), bytes.as_slice())?;
        Ok(())
    }

    fn upsert_topic(&mut self, request: &TopicUpsert) -> GraphResult<UpsertedTopic> {
        validate_topic_name(&request.name)?;
        let mut topics = self.tx.open_table(TOPICS)?;
        if let Some(existing) = read_json::<Topic, _>(&topics, &request.name)? {
            return Ok(UpsertedTopic {
                topic: existing,
                created: false,
            });
        }
        let topic = Topic {
            id: request.id_if_new.clone(),
            name: request.name.clone(),
            created_at: request.created_at,
        };
        let bytes = to_json(&topic)?;
        topics.insert(request.name.as_str(), bytes.as_slice())?;
        Ok(UpsertedTopic {
            topic,
            created: true,
        })
    }

    fn link_message_topic(&mut self, message: &MessageId, topic: &str) -> GraphResult<()> {
        {
            let messages = self.tx.open_table(MESSAGES)?;
            if messages.get(message.as_str())?.is_none() {
                return Err(GraphError::NotFound(format!("message {message}")));
            }
            let topics = self.tx.open_table(TOPICS)?;
            if topics.get(topic)?.is_none() {
                return Err(GraphError::NotFound(format!("topic {topic}")));
            }
        }
        let mut belongs_to = self.tx.open_multimap_table(BELONGS_TO)?;
        belongs_to.insert(message.as_str(), topic)?;
        Ok(())
    }

    fn fetch_similarity_candidates(
        &mut self,
        message: &MessageId,
        scope: &CandidateScope,
    ) -> GraphResult<Vec<SimilarityCandidate>> {
        let messages = self.tx.open_table(MESSAGES)?;
        let mut candidates = Vec::new();
        match scope {
            CandidateScope::Global => {
                for row in messages.iter()? {
                    let (key, value) = row?;
                    if key.value() == message.as_str() {
                        continue;
                    }
                    let stored: Message = serde_json::from_slice(value.value())?;
                    candidates.push(SimilarityCandidate::from(&stored));
                }
            }
            CandidateScope::SameOwner(owner) => {
                let owns = self.tx.open_multimap_table(OWNS)?;
                for id in multimap_values(&owns, owner.as_str())? {
                    if id == message.as_str() {
                        continue;
                    }
                    if let Some(stored) = read_json::<Message, _>(&messages, &id)? {
                        candidates.push(SimilarityCandidate::from(&stored));
                    }
                }
            }
        }
        Ok(candidates)
    }

    fn create_similarity_edge(&mut self, link: &NewContextualLink) -> GraphResult<ContextualLink> {
        validate_link(link)?;
        {
            let messages = self.tx.open_table(MESSAGES)?;
            for endpoint in [&link.source, &link.target] {
                if messages.get(endpoint.as_str())?.is_none() {
                    return Err(GraphError::NotFound(format!("message {endpoint}")));
                }
            }
        }

        let pair = pair_key(&link.source, &link.target);
        let (key, stored) = {
            let links = self.tx.open_table(LINKS)?;
            match self.policy {
                LinkMergePolicy::Pair => match read_json::<ContextualLink, _>(&links, &pair)? {
                    Some(mut existing) => {
                        existing.similarity = link.similarity;
                        existing.timestamp = link.timestamp;
                        (pair, existing)
                    }
                    None => (pair, link.clone().into_link()),
                },
                LinkMergePolicy::Append => {
                    let key = format!("{pair}#{}", link.id);
                    if links.get(key.as_str())?.is_some() {
                        return Err(GraphError::InvalidRequest(format!(
                            "link {} already exists",
                            link.id
                        )));
                    }
                    (key, link.clone().into_link())
                }
            }
        };
        let bytes = to_json(&stored)?;

        // Index rows go in first: an index entry without its link row is
        // skipped on read, a link row without index entries would be counted
        // but unreachable.
        {
            let mut message_links = self.tx.open_multimap_table(MESSAGE_LINKS)?;
            message_links.insert(link.source.as_str(), key.as_str())?;
            message_links.insert(link.target.as_str(), key.as_str())?;
        }
        let mut links = self.tx.open_table(LINKS)?;
        links.insert(key.as_str(), bytes.as_slice())?;
        Ok(stored)
    }

    fn commit(self: Box<Self>) -> GraphResult<()> {
        self.tx.commit()?;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> GraphResult<()> {
        self.tx.abort()?;
        Ok(())
    }
}

impl GraphStore for RedbGraphStore {
    fn begin(&self) -> GraphResult<Box<dyn UnitOfWork + '_>> {
        let tx = self.db.begin_write()?;
        Ok(Box::new(RedbUnitOfWork {
            tx,
            policy: self.policy,
        }))
    }

    fn ensure_user(&self, user: &NewUser) -> GraphResult<User> {
        let tx = self.db.begin_write()?;
        let stored = {
            let mut users = tx.open_table(USERS)?;
            match read_json::<User, _>(&users, user.id.as_str())? {
                Some(existing) => existing,
                None => {
                    let created = User {
                        id: user.id.clone(),
                        display_name: user.display_name.clone(),
                        created_at: user.at,
                        last_active_at: user.at,
                        preferences: user.preferences.clone(),
                    };
                    let bytes = to_json(&created)?;
                    users.insert(user.id.as_str(), bytes.as_slice())?;
                    created
                }
            }
        };
        tx.commit()?;
        Ok(stored)
    }

    fn user(&self, id: &UserId) -> GraphResult<Option<User>> {
        let tx = self.db.begin_read()?;
        let users = tx.open_table(USERS)?;
        read_json(&users, id.as_str())
    }

    fn message(&self, id: &MessageId) -> GraphResult<Option<Message>> {
        let tx = self.db.begin_read()?;
        let messages = tx.open_table(MESSAGES)?;
        read_json(&messages, id.as_str())
    }

    fn message_topics(&self, id: &MessageId) -> GraphResult<Vec<String>> {
        let tx = self.db.begin_read()?;
        let belongs_to = tx.open_multimap_table(BELONGS_TO)?;
        multimap_values(&belongs_to, id.as_str())
    }

    fn contextual_links(&self, id: &MessageId) -> GraphResult<Vec<ContextualLink>> {
        let tx = self.db.begin_read()?;
        let message_links = tx.open_multimap_table(MESSAGE_LINKS)?;
        let links = tx.open_table(LINKS)?;
        let mut found = Vec::new();
        for key in multimap_values(&message_links, id.as_str())? {
            if let Some(link) = read_json::<ContextualLink, _>(&links, &key)? {
                found.push(link);
            }
        }
        Ok(found)
    }

    fn topics(&self) -> GraphResult<Vec<Topic>> {
        let tx = self.db.begin_read()?;
        let topics = tx.open_table(TOPICS)?;
        let mut found = Vec::new();
        for row in topics.iter()? {
            let (_, value) = row?;
            found.push(serde_json::from_slice(value.value())?);
        }
        Ok(found)
    }

    fn stats(&self) -> GraphResult<GraphStats> {
        let tx = self.db.begin_read()?;
        Ok(GraphStats {
            users: tx.open_table(USERS)?.len()? as usize,
            messages: tx.open_table(MESSAGES)?.len()? as usize,
            topics: tx.open_table(TOPICS)?.len()? as usize,
            ownership_links: tx.open_multimap_table(OWNS)?.len()? as usize,
            topic_links: tx.open_multimap_table(BELONGS_TO)?.len()? as usize,
            contextual_links: tx.open_table(LINKS)?.len()? as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::{MESSAGE_LINKS, RedbGraphStore};
    use crate::schema::MessageId;
    use crate::store::contract;
    use crate::store::{GraphStore, LinkMergePolicy};

    fn store(policy: LinkMergePolicy) -> (TempDir, RedbGraphStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbGraphStore::open(dir.path().join("graph.redb"), policy).unwrap();
        (dir, store)
    }

    #[test]
    fn commit_makes_writes_visible() {
        let (_dir, store) = store(LinkMergePolicy::Append);
        contract::commit_makes_writes_visible(&store);
    }

    #[test]
    fn rollback_discards_writes() {
        let (_dir, store) = store(LinkMergePolicy::Append);
        contract::rollback_discards_writes(&store);
    }

    #[test]
    fn duplicate_message_id_is_rejected() {
        let (_dir, store) = store(LinkMergePolicy::Append);
        contract::duplicate_message_id_is_rejected(&store);
    }

    #[test]
    fn ensure_user_is_create_once() {
        let (_dir, store) = store(LinkMergePolicy::Append);
        contract::ensure_user_is_create_once(&store);
    }

    #[test]
    fn update_last_active_moves_timestamp() {
        let (_dir, store) = store(LinkMergePolicy::Append);
        contract::update_last_active_moves_timestamp(&store);
    }

    #[test]
    fn link_ownership_requires_user() {
        let (_dir, store) = store(LinkMergePolicy::Append);
        contract::link_ownership_requires_user(&store);
    }

    #[test]
    fn upsert_topic_keeps_first_id() {
        let (_dir, store) = store(LinkMergePolicy::Append);
        contract::upsert_topic_keeps_first_id(&store);
    }

    #[test]
    fn link_message_topic_is_idempotent() {
        let (_dir, store) = store(LinkMergePolicy::Append);
        contract::link_message_topic_is_idempotent(&store);
    }

    #[test]
    fn candidates_respect_scope() {
        let (_dir, store) = store(LinkMergePolicy::Append);
        contract::candidates_respect_scope(&store);
    }

    #[test]
    fn uncommitted_message_is_visible_inside_its_unit_of_work() {
        let (_dir, store) = store(LinkMergePolicy::Append);
        contract::uncommitted_message_is_visible_inside_its_unit_of_work(&store);
    }

    #[test]
    fn append_policy_multiplies_edges() {
        let (_dir, store) = store(LinkMergePolicy::Append);
        contract::append_policy_multiplies_edges(&store);
    }

    #[test]
    fn pair_policy_updates_single_edge() {
        let (_dir, store) = store(LinkMergePolicy::Pair);
        contract::pair_policy_updates_single_edge(&store);
    }

    #[test]
    fn edge_requires_both_endpoints() {
        let (_dir, store) = store(LinkMergePolicy::Append);
        contract::edge_requires_both_endpoints(&store);
    }

    #[test]
    fn rollback_restores_updated_rows() {
        let (_dir, store) = store(LinkMergePolicy::Pair);
        contract::rollback_restores_updated_rows(&store);
    }

    #[test]
    fn counted_links_are_reachable_from_both_ends() {
        for policy in [LinkMergePolicy::Append, LinkMergePolicy::Pair] {
            let (_dir, store) = store(policy);
            contract::counted_links_are_reachable_from_both_ends(&store);
        }
    }

    #[test]
    fn index_entry_without_link_row_is_skipped() {
        let (_dir, store) = store(LinkMergePolicy::Append);
        let tx = store.db.begin_write().unwrap();
        {
            let mut message_links = tx.open_multimap_table(MESSAGE_LINKS).unwrap();
            message_links.insert("m1", "m1|m2#l9").unwrap();
        }
        tx.commit().unwrap();

        assert!(store.contextual_links(&MessageId::new("m1")).unwrap().is_empty());
        assert_eq!(store.stats().unwrap().contextual_links, 0);
    }

    #[test]
    fn non_finite_embedding_is_rejected() {
        let (_dir, store) = store(LinkMergePolicy::Append);
        contract::non_finite_embedding_is_rejected(&store);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.redb");
        {
            let store = RedbGraphStore::open(&path, LinkMergePolicy::Append).unwrap();
            let mut uow = store.begin().unwrap();
            uow.create_message_node(&contract::message("m1", None, vec![0.5, 0.5]))
                .unwrap();
            uow.commit().unwrap();
        }
        let store = RedbGraphStore::open(&path, LinkMergePolicy::Append).unwrap();
        let message = store.message(&MessageId::new("m1")).unwrap().unwrap();
        assert_eq!(message.embedding, vec![0.5, 0.5]);
    }
}
