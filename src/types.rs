//! Core types for chat-harvest

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller-side group address: numeric id or string handle
///
/// The remote service accepts both addressing modes for the same group, so
/// every API that takes a group accepts either. Handles are stored without
/// the leading `@`; both `"rustlang"` and `"@rustlang"` produce the same
/// `GroupRef`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupRef {
    /// Numeric group id
    Id(i64),
    /// String handle, stored without the leading marker
    Handle(String),
}

impl From<i64> for GroupRef {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for GroupRef {
    fn from(handle: &str) -> Self {
        Self::Handle(handle.trim_start_matches('@').to_string())
    }
}

impl From<String> for GroupRef {
    fn from(handle: String) -> Self {
        Self::from(handle.as_str())
    }
}

impl From<&GroupIdentity> for GroupRef {
    fn from(group: &GroupIdentity) -> Self {
        Self::Id(group.id)
    }
}

impl std::fmt::Display for GroupRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupRef::Id(id) => write!(f, "{id}"),
            GroupRef::Handle(handle) => write!(f, "@{handle}"),
        }
    }
}

/// A group as resolved by the remote source
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupIdentity {
    /// Numeric group id
    pub id: i64,
    /// Public handle, if the group has one (stored without the `@`)
    pub handle: Option<String>,
    /// Group title
    pub title: String,
    /// Participant count, when the source reports it
    pub participant_count: Option<u64>,
}

/// The deduplication key: one message within one group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageIdentity {
    /// Message id, unique within its group
    pub message_id: i64,
    /// Group the message belongs to
    pub group_id: i64,
}

impl MessageIdentity {
    /// Create a new identity
    pub fn new(message_id: i64, group_id: i64) -> Self {
        Self {
            message_id,
            group_id,
        }
    }
}

impl std::fmt::Display for MessageIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group_id, self.message_id)
    }
}

/// Identity plus the metadata a tracker records when marking a message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessedMessage {
    /// Message id, unique within its group
    pub message_id: i64,
    /// Group the message belongs to
    pub group_id: i64,
    /// Sender id, when known
    pub sender_id: Option<i64>,
    /// Message timestamp (UTC)
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hex digest of the message text, when the message has text
    pub content_hash: Option<String>,
}

impl ProcessedMessage {
    /// The deduplication key for this entry
    pub fn identity(&self) -> MessageIdentity {
        MessageIdentity::new(self.message_id, self.group_id)
    }
}

impl From<&MessageRecord> for ProcessedMessage {
    fn from(record: &MessageRecord) -> Self {
        Self {
            message_id: record.message_id,
            group_id: record.group_id,
            sender_id: Some(record.sender_id),
            timestamp: record.timestamp,
            content_hash: record.text.as_deref().map(crate::util::content_hash),
        }
    }
}

/// A fully materialized message, as handed to callers
///
/// Built by the engine from a [`RawMessage`] plus resolved sender identity.
/// Records are returned as ordered `Vec`s and never mutated afterward.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Message id, unique within its group
    pub message_id: i64,
    /// Group the message belongs to
    pub group_id: i64,
    /// Sender id
    pub sender_id: i64,
    /// Sender display name (first and last name joined, may be empty)
    pub sender_name: String,
    /// Sender handle with leading `@`, if the sender has one
    pub sender_handle: Option<String>,
    /// Message text, if any
    pub text: Option<String>,
    /// Message timestamp (UTC)
    pub timestamp: DateTime<Utc>,
    /// Id of the message this one replies to, if any
    pub reply_to_id: Option<i64>,
    /// Id of the original sender for forwarded messages, if any
    pub forwarded_from: Option<i64>,
    /// Sender profile photo bytes, when photo download was requested and succeeded
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub photo: Option<Vec<u8>>,
}

impl MessageRecord {
    /// The deduplication key for this record
    pub fn identity(&self) -> MessageIdentity {
        MessageIdentity::new(self.message_id, self.group_id)
    }
}

/// A message as yielded by the remote source, before sender resolution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Message id, unique within its group
    pub id: i64,
    /// Sender id; `None` for service messages with no attributable sender
    pub sender_id: Option<i64>,
    /// Message text, if any
    pub text: Option<String>,
    /// Message timestamp (UTC)
    pub timestamp: DateTime<Utc>,
    /// Id of the message this one replies to, if any
    pub reply_to_id: Option<i64>,
    /// Id of the original sender for forwarded messages, if any
    pub forwarded_from: Option<i64>,
}

/// Sender identity as resolved by the remote source
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SenderInfo {
    /// Sender id
    pub id: i64,
    /// First name, if set
    pub first_name: Option<String>,
    /// Last name, if set
    pub last_name: Option<String>,
    /// Username without the leading marker, if set
    pub username: Option<String>,
}

impl SenderInfo {
    /// Display name: first and last name joined with a space, trimmed.
    /// Empty when the sender has neither.
    pub fn display_name(&self) -> String {
        let first = self.first_name.as_deref().unwrap_or("");
        let last = self.last_name.as_deref().unwrap_or("");
        format!("{first} {last}").trim().to_string()
    }

    /// Handle with the leading `@`, when the sender has a username
    pub fn handle(&self) -> Option<String> {
        self.username.as_ref().map(|u| format!("@{u}"))
    }
}

/// A live push event from the remote source
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    /// Group the event originated from
    pub group_id: i64,
    /// The new message
    pub message: RawMessage,
}

/// A durable record of progress for a named, resumable operation
///
/// Stored by persistent tracker backends; `last_message_id` is monotonically
/// non-decreasing for a given `operation_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique name of the operation this checkpoint belongs to
    pub operation_id: String,
    /// Group the operation ingests from
    pub group_id: i64,
    /// Highest message id the operation has processed
    pub last_message_id: i64,
    /// Timestamp of that message, when known
    pub last_message_timestamp: Option<DateTime<Utc>>,
    /// Total messages the operation has processed across all runs
    pub total_processed: u64,
    /// Free-form metadata supplied by the caller
    pub metadata: Option<serde_json::Value>,
    /// When this checkpoint row was first created
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Build a checkpoint stamped with the current time
    #[must_use]
    pub fn new(
        operation_id: impl Into<String>,
        group_id: i64,
        last_message_id: i64,
        last_message_timestamp: Option<DateTime<Utc>>,
        total_processed: u64,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            group_id,
            last_message_id,
            last_message_timestamp,
            total_processed,
            metadata,
            created_at: Utc::now(),
        }
    }
}
