//! Traits and types for deduplication tracking

use async_trait::async_trait;

use crate::error::TrackerError;
use crate::types::{Checkpoint, ProcessedMessage, RawMessage};

/// Aggregate statistics reported by a tracker backend
#[must_use]
#[derive(Debug, Clone, serde::Serialize)]
pub struct TrackerStats {
    /// Recorded identities (within the queried group, when one was given)
    pub total_processed: u64,
    /// Distinct groups with at least one recorded identity
    pub distinct_groups: u64,
    /// Implementation name, e.g. "memory" or "sqlite"
    pub implementation: &'static str,
    /// Bound on tracked identities, when the backend is bounded
    pub capacity: Option<usize>,
}

/// Trait for deduplication tracking across ingestion runs
///
/// This trait defines the interface for recording which `(message_id,
/// group_id)` identities have already been ingested. Implementations range
/// from a bounded in-memory set to durable SQLite storage; a no-op
/// implementation disables deduplication without branching caller code.
///
/// All methods take `&self`: backends use interior mutability so one
/// instance can be shared behind an `Arc` by concurrent fetch and poll
/// tasks.
///
/// # Examples
///
/// ```
/// use chat_harvest::tracker::{InMemoryTracker, MessageTracker};
/// use chat_harvest::types::ProcessedMessage;
/// use chrono::Utc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let tracker = InMemoryTracker::new(Some(10_000));
///
/// tracker
///     .mark_processed(&ProcessedMessage {
///         message_id: 17,
///         group_id: 1001,
///         sender_id: Some(42),
///         timestamp: Utc::now(),
///         content_hash: None,
///     })
///     .await?;
///
/// assert!(tracker.is_processed(17, 1001).await?);
/// assert!(!tracker.is_processed(18, 1001).await?);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait MessageTracker: Send + Sync {
    /// Whether `(message_id, group_id)` has already been recorded
    ///
    /// On backends with recency-based eviction, a hit also refreshes the
    /// entry's recency.
    async fn is_processed(&self, message_id: i64, group_id: i64) -> Result<bool, TrackerError>;

    /// Record one processed message
    ///
    /// Recording an identity that is already present is not an error; the
    /// entry's recency and metadata are refreshed.
    async fn mark_processed(&self, message: &ProcessedMessage) -> Result<(), TrackerError>;

    /// Record a batch of processed messages
    ///
    /// Equivalent to repeated [`mark_processed`](MessageTracker::mark_processed),
    /// but backends may use a single bulk operation. Identities already
    /// recorded (or repeated within the batch) are ignored, not errors.
    ///
    /// Returns the number of identities that were newly recorded.
    async fn mark_batch_processed(
        &self,
        messages: &[ProcessedMessage],
    ) -> Result<usize, TrackerError>;

    /// Drop candidates already recorded for `group_id`, preserving order
    ///
    /// Behaves like a per-candidate
    /// [`is_processed`](MessageTracker::is_processed) sweep; with no
    /// intervening marks, applying it twice yields the same output.
    async fn filter_unprocessed(
        &self,
        candidates: Vec<RawMessage>,
        group_id: i64,
    ) -> Result<Vec<RawMessage>, TrackerError>;

    /// Aggregate statistics, optionally scoped to one group
    async fn stats(&self, group_id: Option<i64>) -> Result<TrackerStats, TrackerError>;

    /// Persist progress for a named resumable operation
    ///
    /// Optional capability for durable backends.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::CheckpointRegression`] when the save would
    /// move `last_message_id` backwards for an existing `operation_id`, and
    /// [`TrackerError::NotSupported`] on backends without durable storage.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), TrackerError> {
        let _ = checkpoint;
        Err(TrackerError::NotSupported(format!(
            "checkpoints are not supported by the {} tracker",
            self.name()
        )))
    }

    /// Load the checkpoint for a named operation
    ///
    /// Returns `Ok(None)` when no checkpoint was ever saved under
    /// `operation_id`; backends without durable storage always return
    /// `Ok(None)`.
    async fn load_checkpoint(&self, operation_id: &str) -> Result<Option<Checkpoint>, TrackerError> {
        let _ = operation_id;
        Ok(None)
    }

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}
