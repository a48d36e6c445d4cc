//! Fetch-result cache
//!
//! Keyed by the caller-supplied group address and the date/limit window, so
//! the same logical query served twice costs one remote round trip. Entries
//! never expire on their own; invalidation is an explicit clear, whole-cache
//! or per-group.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::types::{GroupRef, MessageRecord};

use super::FetchOptions;

/// Cache key: group address plus the window parameters that shape a result
///
/// The group component is the address as the caller supplied it, so the same
/// group fetched by id and by handle occupies two entries. Pagination and
/// dedup options are deliberately not part of the key; callers that vary
/// them (polling does) bypass the cache instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    group: String,
    start_date: Option<i64>,
    end_date: Option<i64>,
    limit: Option<usize>,
}

impl CacheKey {
    pub(crate) fn new(group: &GroupRef, options: &FetchOptions) -> Self {
        Self {
            group: group.to_string(),
            start_date: options.start_date.map(|d| d.timestamp_millis()),
            end_date: options.end_date.map(|d| d.timestamp_millis()),
            limit: options.limit,
        }
    }
}

/// In-process store of completed fetch results
pub(crate) struct FetchCache {
    entries: Mutex<HashMap<CacheKey, Vec<MessageRecord>>>,
}

impl FetchCache {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a cached result, cloning it out
    pub(crate) async fn get(&self, key: &CacheKey) -> Option<Vec<MessageRecord>> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Store a completed result
    pub(crate) async fn insert(&self, key: CacheKey, records: Vec<MessageRecord>) {
        self.entries.lock().await.insert(key, records);
    }

    /// Drop every cached result
    pub(crate) async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Drop cached results for one group address
    pub(crate) async fn clear_group(&self, group: &GroupRef) {
        let group = group.to_string();
        self.entries
            .lock()
            .await
            .retain(|key, _| key.group != group);
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
