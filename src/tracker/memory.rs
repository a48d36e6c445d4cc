//! Bounded in-memory tracker with LRU eviction

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::{MessageTracker, TrackerStats};
use crate::error::TrackerError;
use crate::types::{MessageIdentity, ProcessedMessage, RawMessage};

/// In-memory tracker backed by an identity set with recency ordering
///
/// Records only identities, not message metadata. When constructed with a
/// `max_size`, inserting past capacity evicts the least-recently-used entry,
/// where both marking and a successful `is_processed` check count as use.
/// Exactly one entry is evicted per overflow, so the set never exceeds
/// `max_size` after any operation. Unbounded when `max_size` is `None`.
///
/// # Implementation
///
/// Recency is a monotone stamp per entry:
/// - `entries`: identity -> current stamp
/// - `recency`: stamp -> identity, ordered, so the least-recent entry is
///   always the first key
///
/// Refreshing an entry re-stamps it in both maps; eviction pops the first
/// `recency` key. Both operations are `O(log n)`.
///
/// # Examples
///
/// ```
/// use chat_harvest::tracker::{InMemoryTracker, MessageTracker};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// // Track at most 50k identities, evicting the least recently used
/// let bounded = InMemoryTracker::new(Some(50_000));
///
/// // Track everything for the lifetime of the process
/// let unbounded = InMemoryTracker::new(None);
/// # Ok(())
/// # }
/// ```
pub struct InMemoryTracker {
    state: Mutex<LruState>,
    max_size: Option<usize>,
}

struct LruState {
    entries: HashMap<MessageIdentity, u64>,
    recency: BTreeMap<u64, MessageIdentity>,
    next_stamp: u64,
}

impl LruState {
    /// Re-stamp an existing entry as most recently used
    fn refresh(&mut self, identity: MessageIdentity) {
        if let Some(old_stamp) = self.entries.get(&identity).copied() {
            self.recency.remove(&old_stamp);
            let stamp = self.next_stamp;
            self.next_stamp += 1;
            self.recency.insert(stamp, identity);
            self.entries.insert(identity, stamp);
        }
    }

    /// Insert an identity, returning true when it was not already present
    fn insert(&mut self, identity: MessageIdentity, max_size: Option<usize>) -> bool {
        if self.entries.contains_key(&identity) {
            self.refresh(identity);
            return false;
        }

        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.entries.insert(identity, stamp);
        self.recency.insert(stamp, identity);

        if let Some(max) = max_size {
            while self.entries.len() > max {
                if let Some((_, oldest)) = self.recency.pop_first() {
                    self.entries.remove(&oldest);
                } else {
                    break;
                }
            }
        }

        true
    }
}

impl InMemoryTracker {
    /// Create a tracker, bounded by `max_size` when given
    #[must_use]
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_stamp: 0,
            }),
            max_size,
        }
    }
}

#[async_trait]
impl MessageTracker for InMemoryTracker {
    async fn is_processed(&self, message_id: i64, group_id: i64) -> Result<bool, TrackerError> {
        let mut state = self.state.lock().await;
        let identity = MessageIdentity::new(message_id, group_id);
        if state.entries.contains_key(&identity) {
            state.refresh(identity);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn mark_processed(&self, message: &ProcessedMessage) -> Result<(), TrackerError> {
        let mut state = self.state.lock().await;
        state.insert(message.identity(), self.max_size);
        Ok(())
    }

    async fn mark_batch_processed(
        &self,
        messages: &[ProcessedMessage],
    ) -> Result<usize, TrackerError> {
        let mut state = self.state.lock().await;
        let mut newly = 0;
        for message in messages {
            if state.insert(message.identity(), self.max_size) {
                newly += 1;
            }
        }
        Ok(newly)
    }

    async fn filter_unprocessed(
        &self,
        candidates: Vec<RawMessage>,
        group_id: i64,
    ) -> Result<Vec<RawMessage>, TrackerError> {
        let mut state = self.state.lock().await;
        let mut unprocessed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let identity = MessageIdentity::new(candidate.id, group_id);
            if state.entries.contains_key(&identity) {
                state.refresh(identity);
            } else {
                unprocessed.push(candidate);
            }
        }
        Ok(unprocessed)
    }

    async fn stats(&self, group_id: Option<i64>) -> Result<TrackerStats, TrackerError> {
        let state = self.state.lock().await;
        let (total, groups) = match group_id {
            Some(g) => {
                let total = state
                    .entries
                    .keys()
                    .filter(|identity| identity.group_id == g)
                    .count() as u64;
                (total, u64::from(total > 0))
            }
            None => {
                let groups = state
                    .entries
                    .keys()
                    .map(|identity| identity.group_id)
                    .collect::<HashSet<_>>()
                    .len() as u64;
                (state.entries.len() as u64, groups)
            }
        };
        Ok(TrackerStats {
            total_processed: total,
            distinct_groups: groups,
            implementation: "memory",
            capacity: self.max_size,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
