//! Client-side helpers for working with fetched message records

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::types::MessageRecord;

/// Compiled regex DFA size limit for caller-supplied filter patterns
const FILTER_PATTERN_SIZE_LIMIT: usize = 1024 * 1024;

/// SHA-256 hex digest of message text
///
/// Stored alongside processed-message metadata so persistent trackers can
/// detect edited re-sends of the same message id.
///
/// # Examples
///
/// ```
/// use chat_harvest::util::content_hash;
///
/// let hash = content_hash("hello");
/// assert_eq!(hash.len(), 64);
/// assert_eq!(hash, content_hash("hello"));
/// assert_ne!(hash, content_hash("hello!"));
/// ```
#[must_use]
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Keep only the records sent by the given sender
///
/// Order is preserved.
#[must_use]
pub fn filter_by_sender(mut records: Vec<MessageRecord>, sender_id: i64) -> Vec<MessageRecord> {
    records.retain(|record| record.sender_id == sender_id);
    records
}

/// Keep only the records whose text matches the given regex pattern
///
/// Records without text never match. Order is preserved.
///
/// # Errors
///
/// Returns a configuration error when `pattern` is not a valid regex or its
/// compiled form exceeds the size limit.
///
/// # Examples
///
/// ```
/// use chat_harvest::util::filter_by_content;
///
/// let filtered = filter_by_content(Vec::new(), r"(?i)release\s+v\d+")?;
/// assert!(filtered.is_empty());
/// # Ok::<(), chat_harvest::Error>(())
/// ```
pub fn filter_by_content(
    mut records: Vec<MessageRecord>,
    pattern: &str,
) -> Result<Vec<MessageRecord>> {
    let re = regex::RegexBuilder::new(pattern)
        .size_limit(FILTER_PATTERN_SIZE_LIMIT)
        .build()
        .map_err(|e| Error::Config {
            message: format!("Invalid content filter pattern '{}': {}", pattern, e),
            key: None,
        })?;

    records.retain(|record| {
        record
            .text
            .as_deref()
            .is_some_and(|text| re.is_match(text))
    });
    Ok(records)
}

/// Summary statistics over a batch of records
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageStatistics {
    /// Number of records in the batch
    pub total: usize,
    /// Number of distinct sender ids
    pub unique_senders: usize,
    /// Number of records carrying text
    pub with_text: usize,
    /// Oldest and newest timestamps, `None` for an empty batch
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Compute summary statistics for a batch of records
///
/// The batch does not need to be ordered; the date range is computed from
/// the actual timestamps.
#[must_use]
pub fn message_statistics(records: &[MessageRecord]) -> MessageStatistics {
    let mut senders = HashSet::new();
    let mut with_text = 0;
    let mut date_range: Option<(DateTime<Utc>, DateTime<Utc>)> = None;

    for record in records {
        senders.insert(record.sender_id);
        if record.text.is_some() {
            with_text += 1;
        }
        date_range = Some(match date_range {
            None => (record.timestamp, record.timestamp),
            Some((oldest, newest)) => (
                oldest.min(record.timestamp),
                newest.max(record.timestamp),
            ),
        });
    }

    MessageStatistics {
        total: records.len(),
        unique_senders: senders.len(),
        with_text,
        date_range,
    }
}
