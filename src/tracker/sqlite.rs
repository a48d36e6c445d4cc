//! SQLite-backed tracker for deduplication across process restarts

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use sqlx::{FromRow, QueryBuilder};

use super::traits::{MessageTracker, TrackerStats};
use crate::error::TrackerError;
use crate::types::{Checkpoint, ProcessedMessage, RawMessage};

// SQLite's default bind-variable limit is 999; each processed message uses
// 6 bind variables.
const MAX_MESSAGES_PER_BATCH: usize = 166;
const MAX_IDS_PER_FILTER: usize = 900;

/// Durable tracker storing identities and checkpoints in SQLite
///
/// Unlike [`InMemoryTracker`](super::InMemoryTracker) this backend is
/// unbounded and survives restarts, and it implements the optional
/// checkpoint capability for named resumable operations. Alongside each
/// identity it records the sender, timestamp, and a content hash, so the
/// database doubles as an audit log of what was ingested.
///
/// # Examples
///
/// ```no_run
/// use chat_harvest::tracker::{MessageTracker, SqliteTracker};
/// use std::path::Path;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let tracker = SqliteTracker::new(Path::new("harvest.db")).await?;
///
/// let stats = tracker.stats(None).await?;
/// println!("{} messages tracked", stats.total_processed);
///
/// tracker.close().await;
/// # Ok(())
/// # }
/// ```
pub struct SqliteTracker {
    pool: SqlitePool,
}

/// Checkpoint record as stored in SQLite (unix-second timestamps)
#[derive(Debug, Clone, FromRow)]
struct CheckpointRow {
    operation_id: String,
    group_id: i64,
    last_message_id: i64,
    last_message_timestamp: Option<i64>,
    total_processed: i64,
    metadata: Option<String>,
    created_at: i64,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<Checkpoint, TrackerError> {
        let metadata = match self.metadata {
            Some(text) => Some(serde_json::from_str(&text).map_err(|e| {
                TrackerError::Storage(format!(
                    "Corrupt checkpoint metadata for {}: {}",
                    self.operation_id, e
                ))
            })?),
            None => None,
        };
        Ok(Checkpoint {
            operation_id: self.operation_id,
            group_id: self.group_id,
            last_message_id: self.last_message_id,
            last_message_timestamp: self
                .last_message_timestamp
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            total_processed: self.total_processed.max(0) as u64,
            metadata,
            created_at: Utc
                .timestamp_opt(self.created_at, 0)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }
}

impl SqliteTracker {
    /// Open (or create) a tracker database at the given path
    ///
    /// Creates the parent directory and schema as needed; the database uses
    /// WAL journaling so concurrent readers never block the writer.
    pub async fn new(path: &Path) -> Result<Self, TrackerError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TrackerError::Storage(format!("Failed to create tracker directory: {}", e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            TrackerError::Storage(format!("Failed to open tracker database: {}", e))
        })?;

        let tracker = Self { pool };
        tracker.init_schema().await?;
        Ok(tracker)
    }

    /// Create tables and indexes if they don't exist
    async fn init_schema(&self) -> Result<(), TrackerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TrackerError::Storage(format!("Failed to begin schema setup: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL,
                group_id INTEGER NOT NULL,
                sender_id INTEGER,
                timestamp INTEGER NOT NULL,
                content_hash TEXT,
                processed_at INTEGER NOT NULL,
                UNIQUE(message_id, group_id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            TrackerError::Storage(format!("Failed to create processed_messages table: {}", e))
        })?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_processed_messages_group
            ON processed_messages(group_id)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| TrackerError::Storage(format!("Failed to create group index: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation_id TEXT NOT NULL UNIQUE,
                group_id INTEGER NOT NULL,
                last_message_id INTEGER NOT NULL,
                last_message_timestamp INTEGER,
                total_processed INTEGER NOT NULL,
                metadata TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| TrackerError::Storage(format!("Failed to create checkpoints table: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| TrackerError::Storage(format!("Failed to commit schema setup: {}", e)))?;

        Ok(())
    }

    /// Close the underlying connection pool
    ///
    /// Further operations on this tracker will fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl MessageTracker for SqliteTracker {
    async fn is_processed(&self, message_id: i64, group_id: i64) -> Result<bool, TrackerError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM processed_messages
            WHERE message_id = ? AND group_id = ?
            "#,
        )
        .bind(message_id)
        .bind(group_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrackerError::Storage(format!("Failed to check processed state: {}", e)))?;

        Ok(count > 0)
    }

    async fn mark_processed(&self, message: &ProcessedMessage) -> Result<(), TrackerError> {
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO processed_messages
                (message_id, group_id, sender_id, timestamp, content_hash, processed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_id, group_id) DO UPDATE SET processed_at = ?
            "#,
        )
        .bind(message.message_id)
        .bind(message.group_id)
        .bind(message.sender_id)
        .bind(message.timestamp.timestamp())
        .bind(&message.content_hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| TrackerError::Storage(format!("Failed to mark message processed: {}", e)))?;

        Ok(())
    }

    async fn mark_batch_processed(
        &self,
        messages: &[ProcessedMessage],
    ) -> Result<usize, TrackerError> {
        if messages.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().timestamp();
        let mut newly = 0_usize;

        for chunk in messages.chunks(MAX_MESSAGES_PER_BATCH) {
            let mut query_builder = QueryBuilder::new(
                "INSERT OR IGNORE INTO processed_messages \
                 (message_id, group_id, sender_id, timestamp, content_hash, processed_at) ",
            );

            query_builder.push_values(chunk, |mut b, message| {
                b.push_bind(message.message_id)
                    .push_bind(message.group_id)
                    .push_bind(message.sender_id)
                    .push_bind(message.timestamp.timestamp())
                    .push_bind(&message.content_hash)
                    .push_bind(now);
            });

            let result = query_builder.build().execute(&self.pool).await.map_err(|e| {
                TrackerError::Storage(format!("Failed to insert processed batch: {}", e))
            })?;
            newly += result.rows_affected() as usize;
        }

        Ok(newly)
    }

    async fn filter_unprocessed(
        &self,
        candidates: Vec<RawMessage>,
        group_id: i64,
    ) -> Result<Vec<RawMessage>, TrackerError> {
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let ids: Vec<i64> = candidates.iter().map(|m| m.id).collect();
        let mut seen: HashSet<i64> = HashSet::new();

        for chunk in ids.chunks(MAX_IDS_PER_FILTER) {
            let mut query_builder =
                QueryBuilder::new("SELECT message_id FROM processed_messages WHERE group_id = ");
            query_builder.push_bind(group_id);
            query_builder.push(" AND message_id IN (");
            let mut separated = query_builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            query_builder.push(")");

            let found: Vec<i64> = query_builder
                .build_query_scalar()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    TrackerError::Storage(format!("Failed to query processed ids: {}", e))
                })?;
            seen.extend(found);
        }

        Ok(candidates
            .into_iter()
            .filter(|candidate| !seen.contains(&candidate.id))
            .collect())
    }

    async fn stats(&self, group_id: Option<i64>) -> Result<TrackerStats, TrackerError> {
        let (total, groups) = match group_id {
            Some(g) => {
                let total: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM processed_messages WHERE group_id = ?",
                )
                .bind(g)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    TrackerError::Storage(format!("Failed to query group stats: {}", e))
                })?;
                (total as u64, u64::from(total > 0))
            }
            None => {
                let (total, groups): (i64, i64) = sqlx::query_as(
                    "SELECT COUNT(*), COUNT(DISTINCT group_id) FROM processed_messages",
                )
                .fetch_one(&self.pool)
                .await
                .map_err(|e| TrackerError::Storage(format!("Failed to query stats: {}", e)))?;
                (total as u64, groups as u64)
            }
        };

        Ok(TrackerStats {
            total_processed: total,
            distinct_groups: groups,
            implementation: "sqlite",
            capacity: None,
        })
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), TrackerError> {
        let metadata = match &checkpoint.metadata {
            Some(value) => Some(serde_json::to_string(value).map_err(|e| {
                TrackerError::Storage(format!("Failed to serialize checkpoint metadata: {}", e))
            })?),
            None => None,
        };

        // Transaction so the monotonicity check and the upsert are atomic
        // against a concurrent saver for the same operation.
        let mut tx = self.pool.begin().await.map_err(|e| {
            TrackerError::Storage(format!("Failed to begin checkpoint save: {}", e))
        })?;

        let stored: Option<i64> =
            sqlx::query_scalar("SELECT last_message_id FROM checkpoints WHERE operation_id = ?")
                .bind(&checkpoint.operation_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| {
                    TrackerError::Storage(format!("Failed to read stored checkpoint: {}", e))
                })?;

        if let Some(stored) = stored
            && stored > checkpoint.last_message_id
        {
            return Err(TrackerError::CheckpointRegression {
                operation_id: checkpoint.operation_id.clone(),
                stored,
                attempted: checkpoint.last_message_id,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO checkpoints
                (operation_id, group_id, last_message_id, last_message_timestamp,
                 total_processed, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(operation_id) DO UPDATE SET
                group_id = excluded.group_id,
                last_message_id = excluded.last_message_id,
                last_message_timestamp = excluded.last_message_timestamp,
                total_processed = excluded.total_processed,
                metadata = excluded.metadata
            "#,
        )
        .bind(&checkpoint.operation_id)
        .bind(checkpoint.group_id)
        .bind(checkpoint.last_message_id)
        .bind(checkpoint.last_message_timestamp.map(|ts| ts.timestamp()))
        .bind(checkpoint.total_processed as i64)
        .bind(&metadata)
        .bind(checkpoint.created_at.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(|e| TrackerError::Storage(format!("Failed to save checkpoint: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| TrackerError::Storage(format!("Failed to commit checkpoint: {}", e)))?;

        Ok(())
    }

    async fn load_checkpoint(&self, operation_id: &str) -> Result<Option<Checkpoint>, TrackerError> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            r#"
            SELECT operation_id, group_id, last_message_id, last_message_timestamp,
                   total_processed, metadata, created_at
            FROM checkpoints
            WHERE operation_id = ?
            "#,
        )
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TrackerError::Storage(format!("Failed to load checkpoint: {}", e)))?;

        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
