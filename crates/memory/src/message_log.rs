use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::schema::{Message, MessageId, Sender};

/// One line of the flat-file message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageLogRecord {
    pub message_id: MessageId,
    /// Unix seconds.
    pub timestamp: i64,
    pub sender: Sender,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
}

impl MessageLogRecord {
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp, 0).single()
    }
}

impl From<&Message> for MessageLogRecord {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            timestamp: message.timestamp.timestamp(),
            sender: message.sender,
            content: message.content.clone(),
            embedding: message.embedding.clone(),
            topics: (!message.topics.is_empty()).then(|| message.topics.clone()),
        }
    }
}

/// Append-only JSONL record of ingested messages, used when no graph store
/// is configured or as a mirror of one.
#[derive(Debug, Clone)]
pub struct MessageLog {
    path: PathBuf,
}

impl MessageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &MessageLogRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = serde_json::to_string(record)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Read every record; corrupt lines are skipped with a warning.
    pub fn load(&self) -> Result<Vec<MessageLogRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut corrupt_count = 0usize;

        for (line_idx, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MessageLogRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    corrupt_count += 1;
                    tracing::warn!(
                        line = line_idx + 1,
                        error = %err,
                        path = %self.path.display(),
                        "corrupt message log line skipped"
                    );
                }
            }
        }

        if corrupt_count > 0 {
            tracing::warn!(
                corrupt_lines = corrupt_count,
                path = %self.path.display(),
                "message log loaded with skipped lines"
            );
        }

        Ok(records)
    }
}
