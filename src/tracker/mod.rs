//! Deduplication tracking
//!
//! This module provides a trait-based architecture for recording which
//! messages have already been ingested, so re-fetching a window never hands
//! the same message to a consumer twice.
//!
//! ## Architecture
//!
//! The core abstraction is the [`MessageTracker`] trait, which defines the
//! capability set every backend implements. Three implementations are
//! provided:
//!
//! - [`InMemoryTracker`]: bounded identity set with LRU eviction, for
//!   single-run deduplication
//! - [`SqliteTracker`]: durable storage with checkpoint support, for
//!   deduplication across restarts
//! - [`NoOpTracker`]: records nothing, for running with dedup disabled
//!
//! ## Usage
//!
//! ```
//! use chat_harvest::tracker::{InMemoryTracker, MessageTracker};
//! use chat_harvest::types::ProcessedMessage;
//! use chrono::Utc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tracker = InMemoryTracker::new(Some(50_000));
//!
//!     let message = ProcessedMessage {
//!         message_id: 17,
//!         group_id: 1001,
//!         sender_id: Some(42),
//!         timestamp: Utc::now(),
//!         content_hash: None,
//!     };
//!
//!     if !tracker.is_processed(message.message_id, message.group_id).await? {
//!         // ... hand the message to the consumer ...
//!         tracker.mark_processed(&message).await?;
//!     }
//!
//!     Ok(())
//! }
//! ```

mod memory;
mod noop;
mod sqlite;
mod traits;

pub use memory::InMemoryTracker;
pub use noop::NoOpTracker;
pub use sqlite::SqliteTracker;
pub use traits::{MessageTracker, TrackerStats};
