//! Scripted chat source fixtures
//!
//! [`ScriptedChatSource`] serves a mutable in-memory message store through
//! the full source trait: id and date windows, direction, limits, search,
//! counting, rate-limit injection, and a live event channel. Tests mutate
//! the store between operations and the pipeline reads it like a remote
//! service.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chat_harvest::{
    ChatHarvester, Config, GroupIdentity, GroupRef, IterParams, LiveEvent, MessageSource,
    MessageStream, RawMessage, RetryConfig, SenderInfo, SessionConnector, SourceCapabilities,
    SourceError,
};
use chrono::{DateTime, TimeZone, Utc};
use futures::{StreamExt, stream};
use tokio::sync::mpsc;

/// The one group every fixture serves
pub const GROUP_ID: i64 = 9001;
/// Its public handle
pub const GROUP_HANDLE: &str = "harvest_fixture";
/// Sender used for generated messages
pub const SENDER_ID: i64 = 7;

const BASE_TS: i64 = 1_700_000_000;

/// Deterministic timestamp for a message id, one minute apart
pub fn message_ts(id: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(BASE_TS + id * 60, 0)
        .single()
        .expect("fixture timestamp in range")
}

/// A raw message in the fixture's deterministic shape
pub fn message(id: i64, text: &str) -> RawMessage {
    RawMessage {
        id,
        sender_id: Some(SENDER_ID),
        text: Some(text.to_string()),
        timestamp: message_ts(id),
        reply_to_id: None,
        forwarded_from: None,
    }
}

/// In-memory stand-in for a remote chat service
pub struct ScriptedChatSource {
    identity: GroupIdentity,
    store: Mutex<Vec<RawMessage>>,
    interruptions: Mutex<VecDeque<(usize, Duration)>>,
    live_rx: Mutex<Option<mpsc::Receiver<LiveEvent>>>,
    live_tx: mpsc::Sender<LiveEvent>,
}

impl ScriptedChatSource {
    /// An empty source
    pub fn new() -> Arc<Self> {
        let (live_tx, live_rx) = mpsc::channel(64);
        Arc::new(Self {
            identity: GroupIdentity {
                id: GROUP_ID,
                handle: Some(GROUP_HANDLE.to_string()),
                title: "Harvest Fixture".to_string(),
                participant_count: Some(12),
            },
            store: Mutex::new(Vec::new()),
            interruptions: Mutex::new(VecDeque::new()),
            live_rx: Mutex::new(Some(live_rx)),
            live_tx,
        })
    }

    /// A source preloaded with ids `1..=count`
    pub fn with_messages(count: i64) -> Arc<Self> {
        let source = Self::new();
        source.append(1, count);
        source
    }

    /// Append ids `from..=to` to the store
    pub fn append(&self, from: i64, to: i64) {
        let mut store = self.store.lock().unwrap();
        for id in from..=to {
            store.push(message(id, &format!("message {id}")));
        }
    }

    /// Make the next iteration stop with a rate-limit signal after
    /// `yielded` messages
    pub fn interrupt_after(&self, yielded: usize, retry_after: Duration) {
        self.interruptions
            .lock()
            .unwrap()
            .push_back((yielded, retry_after));
    }

    /// Sender side of the live event channel
    pub fn live_sender(&self) -> mpsc::Sender<LiveEvent> {
        self.live_tx.clone()
    }
}

#[async_trait]
impl MessageSource for ScriptedChatSource {
    async fn resolve_group(&self, group: &GroupRef) -> Result<GroupIdentity, SourceError> {
        let known = match group {
            GroupRef::Id(id) => *id == self.identity.id,
            GroupRef::Handle(handle) => Some(handle.as_str()) == self.identity.handle.as_deref(),
        };
        if known {
            Ok(self.identity.clone())
        } else {
            Err(SourceError::GroupNotFound(group.to_string()))
        }
    }

    fn iter_messages(&self, _group_id: i64, params: IterParams) -> MessageStream {
        let mut selected: Vec<RawMessage> = self.store.lock().unwrap().clone();
        selected.sort_by_key(|m| m.id);
        if let Some(offset) = params.offset_date {
            if params.reverse {
                selected.retain(|m| m.timestamp >= offset);
            } else {
                selected.retain(|m| m.timestamp <= offset);
            }
        }
        selected.retain(|m| params.min_id.is_none_or(|min| m.id > min));
        selected.retain(|m| params.max_id.is_none_or(|max| m.id < max));
        if !params.reverse {
            selected.reverse();
        }
        if let Some(limit) = params.limit {
            selected.truncate(limit);
        }

        let mut items: Vec<Result<RawMessage, SourceError>> =
            selected.into_iter().map(Ok).collect();
        if let Some((yielded, retry_after)) = self.interruptions.lock().unwrap().pop_front() {
            items.truncate(yielded);
            items.push(Err(SourceError::RateLimited { retry_after }));
        }
        stream::iter(items).boxed()
    }

    fn search_messages(&self, _group_id: i64, query: &str, limit: Option<usize>) -> MessageStream {
        let query = query.to_lowercase();
        let mut hits: Vec<RawMessage> = self.store.lock().unwrap().clone();
        hits.sort_by_key(|m| m.id);
        hits.reverse();
        hits.retain(|m| {
            m.text
                .as_deref()
                .is_some_and(|t| t.to_lowercase().contains(&query))
        });
        if let Some(limit) = limit {
            hits.truncate(limit);
        }
        stream::iter(hits.into_iter().map(Ok)).boxed()
    }

    async fn get_sender(
        &self,
        _group_id: i64,
        message: &RawMessage,
    ) -> Result<Option<SenderInfo>, SourceError> {
        Ok(message.sender_id.map(|id| SenderInfo {
            id,
            first_name: Some(format!("User{id}")),
            last_name: None,
            username: Some(format!("user{id}")),
        }))
    }

    async fn message_count(&self, _group_id: i64) -> Result<u64, SourceError> {
        Ok(self.store.lock().unwrap().len() as u64)
    }

    async fn list_groups(&self) -> Result<Vec<GroupIdentity>, SourceError> {
        Ok(vec![self.identity.clone()])
    }

    async fn live_events(&self) -> Result<mpsc::Receiver<LiveEvent>, SourceError> {
        self.live_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SourceError::Other("live stream already subscribed".to_string()))
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            can_search: true,
            can_count: true,
            can_live_events: true,
        }
    }

    fn name(&self) -> &'static str {
        "scripted-chat"
    }
}

/// Connector handing out the one scripted source
pub struct ScriptedConnector {
    source: Arc<ScriptedChatSource>,
}

#[async_trait]
impl SessionConnector for ScriptedConnector {
    async fn connect(&self) -> Result<Arc<dyn MessageSource>, SourceError> {
        Ok(Arc::clone(&self.source) as Arc<dyn MessageSource>)
    }
}

/// Wrap a scripted source as a connector
pub fn connector(source: &Arc<ScriptedChatSource>) -> Arc<dyn SessionConnector> {
    Arc::new(ScriptedConnector {
        source: Arc::clone(source),
    })
}

/// Configuration with retry delays short enough for tests
pub fn test_config() -> Config {
    Config {
        retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: false,
            ..RetryConfig::default()
        },
        ..Config::default()
    }
}

/// A harvester over a scripted source, with test-friendly retry timing
pub async fn harvester_over(source: &Arc<ScriptedChatSource>) -> ChatHarvester {
    ChatHarvester::new(test_config(), connector(source))
        .await
        .expect("harvester construction")
}
