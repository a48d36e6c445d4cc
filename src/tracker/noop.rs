//! No-op tracker for running with deduplication disabled

use async_trait::async_trait;

use super::traits::{MessageTracker, TrackerStats};
use crate::error::TrackerError;
use crate::types::{ProcessedMessage, RawMessage};

/// Tracker that records nothing and reports nothing as processed
///
/// Used when deduplication is disabled in configuration. Callers interact
/// with the same [`MessageTracker`] interface either way, so disabling
/// dedup never branches the fetch path.
///
/// # Examples
///
/// ```
/// use chat_harvest::tracker::{MessageTracker, NoOpTracker};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let tracker = NoOpTracker;
///
/// // Nothing is ever considered processed
/// assert!(!tracker.is_processed(17, 1001).await?);
/// # Ok(())
/// # }
/// ```
pub struct NoOpTracker;

#[async_trait]
impl MessageTracker for NoOpTracker {
    async fn is_processed(&self, _message_id: i64, _group_id: i64) -> Result<bool, TrackerError> {
        Ok(false)
    }

    async fn mark_processed(&self, _message: &ProcessedMessage) -> Result<(), TrackerError> {
        Ok(())
    }

    async fn mark_batch_processed(
        &self,
        _messages: &[ProcessedMessage],
    ) -> Result<usize, TrackerError> {
        Ok(0)
    }

    async fn filter_unprocessed(
        &self,
        candidates: Vec<RawMessage>,
        _group_id: i64,
    ) -> Result<Vec<RawMessage>, TrackerError> {
        Ok(candidates)
    }

    async fn stats(&self, _group_id: Option<i64>) -> Result<TrackerStats, TrackerError> {
        Ok(TrackerStats {
            total_processed: 0,
            distinct_groups: 0,
            implementation: "noop",
            capacity: None,
        })
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
