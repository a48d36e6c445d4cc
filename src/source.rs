//! Traits and types for the remote message source
//!
//! The chat-protocol client itself (authentication, wire format, entity
//! resolution) lives outside this crate. Everything the ingestion pipeline
//! needs from it is expressed here as the [`MessageSource`] trait, with
//! [`SessionConnector`] as the factory the connection pool uses to mint
//! authenticated sessions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::SourceError;
use crate::types::{GroupIdentity, GroupRef, LiveEvent, RawMessage, SenderInfo};

/// Lazy, ordered sequence of raw messages from the remote source
///
/// Items surface transport problems inline; a rate-limit signal arrives as
/// [`SourceError::RateLimited`] and terminates the stream, after which the
/// caller waits and re-iterates with a narrowed window.
pub type MessageStream = BoxStream<'static, Result<RawMessage, SourceError>>;

/// Window and ordering parameters for one message iteration
///
/// # Examples
///
/// ```
/// use chat_harvest::source::IterParams;
///
/// let params = IterParams {
///     limit: Some(100),
///     reverse: true,
///     ..Default::default()
/// };
/// assert!(params.min_id.is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct IterParams {
    /// Maximum number of messages to yield (None = unbounded)
    pub limit: Option<usize>,
    /// Anchor date: iteration starts at the newest message at or before this
    /// instant (descending), or at the oldest message at or after it when
    /// `reverse` is set
    pub offset_date: Option<DateTime<Utc>>,
    /// Iterate oldest-to-newest instead of the default newest-to-oldest
    pub reverse: bool,
    /// Yield only messages with id strictly greater than this
    pub min_id: Option<i64>,
    /// Yield only messages with id strictly less than this
    pub max_id: Option<i64>,
}

/// Capabilities of a message source implementation
#[derive(Debug, Clone, Copy)]
pub struct SourceCapabilities {
    /// Supports server-side full-text search
    pub can_search: bool,
    /// Can report a total message count cheaply
    pub can_count: bool,
    /// Can push live events for new messages
    pub can_live_events: bool,
}

/// Trait for the remote chat-group message source
///
/// This trait defines the read surface of one authenticated session.
/// Implementations wrap a protocol client; tests use scripted fakes.
/// A group is addressed by [`GroupRef`] (numeric id or string handle)
/// until [`resolve_group`](MessageSource::resolve_group) pins it to a
/// concrete [`GroupIdentity`], after which the numeric id is used.
///
/// # Examples
///
/// ```no_run
/// use chat_harvest::source::{IterParams, MessageSource};
/// use chat_harvest::types::GroupRef;
/// use futures::StreamExt;
///
/// async fn dump_latest(source: &dyn MessageSource) -> chat_harvest::Result<()> {
///     let group = source.resolve_group(&GroupRef::from("@rustlang")).await?;
///     let mut stream = source.iter_messages(
///         group.id,
///         IterParams {
///             limit: Some(10),
///             ..Default::default()
///         },
///     );
///     while let Some(message) = stream.next().await {
///         println!("{:?}", message?);
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Resolve a numeric id or string handle to a concrete group
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::GroupNotFound`] when the identifier does not
    /// resolve, or a transport-level variant when the lookup itself fails.
    async fn resolve_group(&self, group: &GroupRef) -> Result<GroupIdentity, SourceError>;

    /// Iterate messages of a resolved group under the given window
    ///
    /// Messages arrive in the source's delivery order: descending ids by
    /// default, ascending when `params.reverse` is set.
    fn iter_messages(&self, group_id: i64, params: IterParams) -> MessageStream;

    /// Iterate messages matching a server-side full-text query
    fn search_messages(&self, group_id: i64, query: &str, limit: Option<usize>) -> MessageStream;

    /// Look up the sender of a message
    ///
    /// Returns `Ok(None)` when the sender is deleted or otherwise
    /// unrecoverable; that is not an error.
    async fn get_sender(
        &self,
        group_id: i64,
        message: &RawMessage,
    ) -> Result<Option<SenderInfo>, SourceError>;

    /// Total number of messages in the group
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotSupported`] when the source cannot report
    /// a count cheaply; callers treat that as zero, not a failure.
    async fn message_count(&self, group_id: i64) -> Result<u64, SourceError> {
        let _ = group_id;
        Err(SourceError::NotSupported("message count".to_string()))
    }

    /// Download a sender's profile photo, if one exists
    async fn download_profile_photo(&self, sender_id: i64) -> Result<Option<Vec<u8>>, SourceError> {
        let _ = sender_id;
        Ok(None)
    }

    /// List the groups this session can see
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotSupported`] when the source has no
    /// discovery surface.
    async fn list_groups(&self) -> Result<Vec<GroupIdentity>, SourceError> {
        Err(SourceError::NotSupported("group listing".to_string()))
    }

    /// Subscribe to the source's live push stream
    ///
    /// The receiver yields one [`LiveEvent`] per new message across all
    /// groups this session can see; scope filtering happens downstream.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotSupported`] when the source has no push
    /// channel.
    async fn live_events(&self) -> Result<mpsc::Receiver<LiveEvent>, SourceError> {
        Err(SourceError::NotSupported("live events".to_string()))
    }

    /// Cheap liveness probe used by pool health checks
    async fn ping(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Tear down the underlying session
    ///
    /// Called once by the pool on shutdown; further use of the session after
    /// this is undefined.
    async fn disconnect(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Query capabilities of this source implementation
    fn capabilities(&self) -> SourceCapabilities;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

/// Factory for authenticated sessions, used by the connection pool
///
/// `connect` is called lazily, at most once per pooled slot, and again only
/// after a session has been discarded. Authentication failures are permanent:
/// the pool surfaces them instead of retrying.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Establish and authenticate one new session
    async fn connect(&self) -> Result<Arc<dyn MessageSource>, SourceError>;
}
