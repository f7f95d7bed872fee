use thiserror::Error;

/// Failure of a single graph store operation.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type GraphResult<T> = std::result::Result<T, GraphError>;

impl From<redb::DatabaseError> for GraphError {
    fn from(e: redb::DatabaseError) -> Self {
        GraphError::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for GraphError {
    fn from(e: redb::TransactionError) -> Self {
        GraphError::Storage(e.to_string())
    }
}

impl From<redb::TableError> for GraphError {
    fn from(e: redb::TableError) -> Self {
        GraphError::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for GraphError {
    fn from(e: redb::StorageError) -> Self {
        GraphError::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for GraphError {
    fn from(e: redb::CommitError) -> Self {
        GraphError::Storage(e.to_string())
    }
}

/// Which step of the per-message unit of work failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Begin,
    CreateMessage,
    LinkOwnership,
    UpdateLastActive,
    FetchCandidates,
    Commit,
}

impl IngestStage {
    pub fn label(self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::CreateMessage => "create-message",
            Self::LinkOwnership => "link-ownership",
            Self::UpdateLastActive => "update-last-active",
            Self::FetchCandidates => "fetch-candidates",
            Self::Commit => "commit",
        }
    }
}

impl std::fmt::Display for IngestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Fatal ingestion failure.  Nothing was persisted for the message.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("user-scoped ingestion requires an owner id")]
    MissingOwner,
    #[error("ingestion aborted at {stage}: {source}")]
    Persistence {
        stage: IngestStage,
        #[source]
        source: GraphError,
    },
}

impl IngestError {
    pub fn stage(&self) -> Option<IngestStage> {
        match self {
            Self::MissingOwner => None,
            Self::Persistence { stage, .. } => Some(*stage),
        }
    }
}
