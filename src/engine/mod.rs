//! Fetch, search, and count orchestration
//!
//! The MessageEngine drives one remote operation end to end: resolve the
//! group, iterate the remote stream under date/id bounds, gate each message
//! through the deduplication tracker, resolve sender identity, and hand the
//! caller an ordered `Vec<MessageRecord>`. Rate-limit signals from any
//! remote call are waited out and the operation resumes from the last
//! appended message, so a resumed fetch never re-appends what it already
//! returned.

mod cache;


use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;

use crate::connection::ConnectionManager;
use crate::error::{Result, SourceError};
use crate::progress::{ProgressObserver, ProgressTracker};
use crate::source::{IterParams, MessageSource};
use crate::tracker::MessageTracker;
use crate::types::{GroupRef, MessageRecord, ProcessedMessage, RawMessage};

use cache::{CacheKey, FetchCache};

/// Progress log cadence during a fetch, in appended messages
const FETCH_LOG_EVERY: usize = 100;

/// Options shaping one fetch
///
/// `start_date` flips the iteration to oldest-to-newest from that instant;
/// without it the fetch walks newest-to-oldest from `end_date` (or from the
/// newest message). Defaults enable deduplication and the fetch cache.
#[derive(Clone)]
pub struct FetchOptions {
    /// Maximum number of records to return
    pub limit: Option<usize>,
    /// Lower date bound; also selects oldest-to-newest iteration
    pub start_date: Option<DateTime<Utc>>,
    /// Upper date bound
    pub end_date: Option<DateTime<Utc>>,
    /// Yield only messages with id strictly greater than this
    pub min_id: Option<i64>,
    /// Skip messages the tracker has already seen, and mark the new ones
    pub dedup: bool,
    /// Serve a repeated identical query from the fetch cache
    pub use_cache: bool,
    /// Download sender profile photos onto the records
    pub with_profile_photos: bool,
    /// Observer invoked after every appended record
    pub progress_observer: Option<Arc<ProgressObserver>>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            limit: None,
            start_date: None,
            end_date: None,
            min_id: None,
            dedup: true,
            use_cache: true,
            with_profile_photos: false,
            progress_observer: None,
        }
    }
}

impl std::fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOptions")
            .field("limit", &self.limit)
            .field("start_date", &self.start_date)
            .field("end_date", &self.end_date)
            .field("min_id", &self.min_id)
            .field("dedup", &self.dedup)
            .field("use_cache", &self.use_cache)
            .field("with_profile_photos", &self.with_profile_photos)
            .field("progress_observer", &self.progress_observer.is_some())
            .finish()
    }
}

/// Orchestrates fetch, search, and count against the remote source
///
/// One engine serves any number of groups; it borrows sessions from the
/// [`ConnectionManager`] per call and shares one tracker across all of them.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use chat_harvest::engine::{FetchOptions, MessageEngine};
/// use chat_harvest::types::GroupRef;
///
/// # async fn example(engine: &MessageEngine) -> chat_harvest::Result<()> {
/// let records = engine
///     .fetch(
///         &GroupRef::from("@rustlang"),
///         FetchOptions {
///             limit: Some(200),
///             ..FetchOptions::default()
///         },
///     )
///     .await?;
/// println!("{} new messages", records.len());
/// # Ok(())
/// # }
/// ```
pub struct MessageEngine {
    connections: Arc<ConnectionManager>,
    tracker: Arc<dyn MessageTracker>,
    cache: FetchCache,
}

impl MessageEngine {
    /// Create an engine over a session pool and a tracker
    #[must_use]
    pub fn new(connections: Arc<ConnectionManager>, tracker: Arc<dyn MessageTracker>) -> Self {
        Self {
            connections,
            tracker,
            cache: FetchCache::new(),
        }
    }

    /// The deduplication tracker this engine consults
    #[must_use]
    pub fn tracker(&self) -> &Arc<dyn MessageTracker> {
        &self.tracker
    }

    /// Fetch messages from a group
    ///
    /// Returns records in the remote stream's delivery order: ascending when
    /// `start_date` is set, otherwise descending from the newest. Messages
    /// the tracker has seen are skipped and do not count against `limit`'s
    /// appended total. Rate limits are absorbed, never surfaced.
    ///
    /// # Errors
    ///
    /// Fails when the group cannot be resolved, the session cannot be
    /// established, the remote stream reports a non-rate-limit failure, or
    /// the tracker backend errors.
    pub async fn fetch(
        &self,
        group: &GroupRef,
        options: FetchOptions,
    ) -> Result<Vec<MessageRecord>> {
        let cache_key = CacheKey::new(group, &options);
        if options.use_cache
            && let Some(cached) = self.cache.get(&cache_key).await
        {
            tracing::debug!(group = %group, records = cached.len(), "Serving fetch from cache");
            return Ok(cached);
        }

        let session = self.connections.acquire().await?;
        let source = session.source();
        let identity = source.resolve_group(group).await?;

        let ascending = options.start_date.is_some();
        let mut progress = ProgressTracker::new(options.limit.map(|l| l as u64));
        if let Some(observer) = &options.progress_observer {
            progress = progress.with_observer(Arc::clone(observer));
        }
        progress.start();

        let mut records: Vec<MessageRecord> = Vec::new();
        let mut skipped_duplicates: u64 = 0;
        let mut last_appended_id: Option<i64> = None;

        // One pass per rate-limit interruption; the window narrows to ids
        // past the last appended record so a resumed pass is additive.
        'window: loop {
            let remaining = options.limit.map(|l| l.saturating_sub(records.len()));
            if remaining == Some(0) {
                break;
            }

            let params = IterParams {
                limit: remaining,
                offset_date: if ascending {
                    options.start_date
                } else {
                    options.end_date
                },
                reverse: ascending,
                min_id: if ascending {
                    last_appended_id.or(options.min_id)
                } else {
                    options.min_id
                },
                max_id: if ascending { None } else { last_appended_id },
            };
            let mut stream = source.iter_messages(identity.id, params);

            while let Some(item) = stream.next().await {
                let raw = match item {
                    Ok(raw) => raw,
                    Err(SourceError::RateLimited { retry_after }) => {
                        self.connections.handle_rate_limit(retry_after).await;
                        continue 'window;
                    }
                    Err(e) => return Err(e.into()),
                };

                // Ascending: skip below the lower bound, stop past the upper
                // one (everything after it is newer still). Descending: skip
                // above the upper bound; the stream only moves older.
                if ascending {
                    if let Some(start) = options.start_date
                        && raw.timestamp < start
                    {
                        continue;
                    }
                    if let Some(end) = options.end_date
                        && raw.timestamp > end
                    {
                        break 'window;
                    }
                } else if let Some(end) = options.end_date
                    && raw.timestamp > end
                {
                    continue;
                }

                if options.dedup && self.tracker.is_processed(raw.id, identity.id).await? {
                    skipped_duplicates += 1;
                    continue;
                }

                let record = match self
                    .materialize(
                        source.as_ref(),
                        identity.id,
                        &raw,
                        options.with_profile_photos,
                    )
                    .await
                {
                    Ok(Some(record)) => record,
                    Ok(None) => continue,
                    Err(SourceError::RateLimited { retry_after }) => {
                        self.connections.handle_rate_limit(retry_after).await;
                        continue 'window;
                    }
                    Err(e) => return Err(e.into()),
                };

                last_appended_id = Some(record.message_id);
                if options.dedup {
                    self.tracker
                        .mark_processed(&ProcessedMessage::from(&record))
                        .await?;
                }
                records.push(record);
                progress.update(1);

                if records.len() % FETCH_LOG_EVERY == 0 {
                    tracing::info!(
                        group = %group,
                        appended = records.len(),
                        rate = progress.rate(),
                        "Fetch in progress"
                    );
                }
                if options.limit.is_some_and(|l| records.len() >= l) {
                    break 'window;
                }
            }
            break;
        }

        let stats = self.tracker.stats(Some(identity.id)).await?;
        tracing::info!(
            group = %group,
            appended = records.len(),
            skipped_duplicates,
            group_tracked = stats.total_processed,
            tracker = stats.implementation,
            "Fetch complete"
        );

        if options.use_cache && !records.is_empty() {
            self.cache.insert(cache_key, records.clone()).await;
        }
        Ok(records)
    }

    /// Search a group's messages by a server-side full-text query
    ///
    /// Read-only exploration: results are neither checked against nor
    /// recorded in the tracker. A rate limit restarts the query; records
    /// already collected in this call are not duplicated.
    ///
    /// # Errors
    ///
    /// Fails on group resolution, session establishment, or a non-rate-limit
    /// stream failure.
    pub async fn search(
        &self,
        group: &GroupRef,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRecord>> {
        let session = self.connections.acquire().await?;
        let source = session.source();
        let identity = source.resolve_group(group).await?;

        let mut records: Vec<MessageRecord> = Vec::new();
        let mut seen: HashSet<i64> = HashSet::new();

        'query: loop {
            if limit.is_some_and(|l| records.len() >= l) {
                break;
            }
            // Narrowing the limit on restart would cover only the already-seen
            // head of the result order, so every pass asks for the full limit.
            let mut stream = source.search_messages(identity.id, query, limit);

            while let Some(item) = stream.next().await {
                let raw = match item {
                    Ok(raw) => raw,
                    Err(SourceError::RateLimited { retry_after }) => {
                        self.connections.handle_rate_limit(retry_after).await;
                        continue 'query;
                    }
                    Err(e) => return Err(e.into()),
                };

                // A restarted query re-delivers from the top
                if !seen.insert(raw.id) {
                    continue;
                }

                let record = match self.materialize(source.as_ref(), identity.id, &raw, false).await
                {
                    Ok(Some(record)) => record,
                    Ok(None) => continue,
                    Err(SourceError::RateLimited { retry_after }) => {
                        self.connections.handle_rate_limit(retry_after).await;
                        continue 'query;
                    }
                    Err(e) => return Err(e.into()),
                };

                records.push(record);
                if limit.is_some_and(|l| records.len() >= l) {
                    break 'query;
                }
            }
            break;
        }

        tracing::info!(group = %group, query, matched = records.len(), "Search complete");
        Ok(records)
    }

    /// Total number of messages in a group
    ///
    /// Returns 0 when the source cannot report a count cheaply; that is a
    /// capability gap, not a failure.
    ///
    /// # Errors
    ///
    /// Fails on group resolution, session establishment, or a non-rate-limit
    /// source failure.
    pub async fn count(&self, group: &GroupRef) -> Result<u64> {
        let session = self.connections.acquire().await?;
        let source = session.source();
        let identity = source.resolve_group(group).await?;

        loop {
            match source.message_count(identity.id).await {
                Ok(count) => return Ok(count),
                Err(SourceError::NotSupported(_)) => {
                    tracing::warn!(group = %group, "Source cannot count cheaply, reporting zero");
                    return Ok(0);
                }
                Err(SourceError::RateLimited { retry_after }) => {
                    self.connections.handle_rate_limit(retry_after).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drop cached fetch results, for one group address or for all
    pub async fn clear_cache(&self, group: Option<&GroupRef>) {
        match group {
            Some(group) => self.cache.clear_group(group).await,
            None => self.cache.clear().await,
        }
    }

    /// Assemble a full record from a raw message
    ///
    /// `Ok(None)` means the message cannot be attributed to a sender and is
    /// skipped. Photo failures degrade to a record without the photo. Only
    /// rate-limit signals escape as errors, for the caller's resume path.
    async fn materialize(
        &self,
        source: &dyn MessageSource,
        group_id: i64,
        raw: &RawMessage,
        with_photo: bool,
    ) -> Result<Option<MessageRecord>, SourceError> {
        let sender = match source.get_sender(group_id, raw).await {
            Ok(Some(sender)) => sender,
            Ok(None) => {
                tracing::debug!(
                    message_id = raw.id,
                    group_id,
                    "Skipping message without attributable sender"
                );
                return Ok(None);
            }
            Err(e @ SourceError::RateLimited { .. }) => return Err(e),
            Err(e) => {
                tracing::warn!(
                    message_id = raw.id,
                    group_id,
                    error = %e,
                    "Sender lookup failed, skipping message"
                );
                return Ok(None);
            }
        };

        let photo = if with_photo {
            match source.download_profile_photo(sender.id).await {
                Ok(photo) => photo,
                Err(e @ SourceError::RateLimited { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        sender_id = sender.id,
                        error = %e,
                        "Profile photo download failed, continuing without it"
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(Some(MessageRecord {
            message_id: raw.id,
            group_id,
            sender_id: sender.id,
            sender_name: sender.display_name(),
            sender_handle: sender.handle(),
            text: raw.text.clone(),
            timestamp: raw.timestamp,
            reply_to_id: raw.reply_to_id,
            forwarded_from: raw.forwarded_from,
            photo,
        }))
    }
}
