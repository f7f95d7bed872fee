pub mod error;
pub mod identity;
pub mod message_log;
pub mod pipeline;
pub mod schema;
pub mod similarity;
pub mod store;
pub mod topics;

pub use error::{GraphError, GraphResult, IngestError, IngestStage};
pub use identity::{IdentityGenerator, RandomIds};
pub use message_log::{MessageLog, MessageLogRecord};
pub use pipeline::{IngestReport, IngestRequest, IngestionPipeline, PipelineConfig, ScopeMode};
pub use schema::{
    ContextualLink, LinkId, Message, MessageId, Sender, Topic, TopicId, User, UserId,
    UserPreferences,
};
pub use similarity::cosine_similarity;
pub use store::{
    GraphStats, GraphStore, InMemoryGraphStore, LinkMergePolicy, NewUser, RedbGraphStore,
};
pub use topics::{TopicExtraction, TopicNormalizer, TopicVocabulary};
