//! Top-level facade wiring the ingestion pipeline together
//!
//! A ChatHarvester owns the session pool, the tracker backend selected from
//! configuration, the message engine, the polling coordinator, and the event
//! dispatcher, and exposes the whole pipeline behind one handle. Every
//! method delegates; no ingestion logic lives here.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::connection::{ConnectionManager, HealthReport};
use crate::dispatch::EventDispatcher;
use crate::engine::{FetchOptions, MessageEngine};
use crate::error::Result;
use crate::polling::{PollOptions, PollReport, PollingCoordinator};
use crate::source::SessionConnector;
use crate::tracker::{
    InMemoryTracker, MessageTracker, NoOpTracker, SqliteTracker, TrackerStats,
};
use crate::types::{GroupIdentity, GroupRef, LiveEvent, MessageRecord};

/// One handle over the whole message ingestion pipeline
///
/// Construction selects a tracker backend from configuration; everything
/// else is wired from the same [`Config`]. The harvester is cheap to share
/// behind an [`Arc`] and all methods take `&self`.
pub struct ChatHarvester {
    config: Config,
    connections: Arc<ConnectionManager>,
    engine: Arc<MessageEngine>,
    poller: PollingCoordinator,
    dispatcher: Arc<EventDispatcher>,
}

impl ChatHarvester {
    /// Create a harvester, selecting the tracker backend from configuration
    ///
    /// A configured `persistence.tracker_db` path selects the sqlite tracker
    /// (the only backend with checkpoint support). Otherwise dedup enabled
    /// selects the in-memory tracker, bounded by `dedup.max_tracked` when
    /// set, and dedup disabled selects the no-op tracker.
    ///
    /// # Errors
    ///
    /// Fails when the tracker database cannot be opened or the pool
    /// configuration is invalid.
    pub async fn new(config: Config, connector: Arc<dyn SessionConnector>) -> Result<Self> {
        let tracker: Arc<dyn MessageTracker> =
            if let Some(path) = &config.persistence.tracker_db {
                Arc::new(SqliteTracker::new(path).await?)
            } else if config.dedup.enabled {
                Arc::new(InMemoryTracker::new(config.dedup.max_tracked))
            } else {
                Arc::new(NoOpTracker)
            };
        info!(
            tracker = tracker.name(),
            dedup = config.dedup.enabled,
            "Deduplication tracker initialized"
        );
        Self::new_with_tracker(config, connector, tracker)
    }

    /// Create a harvester over a caller-supplied tracker
    ///
    /// Bypasses backend selection; the configuration's dedup settings are
    /// not consulted.
    ///
    /// # Errors
    ///
    /// Fails when the pool configuration is invalid.
    pub fn new_with_tracker(
        config: Config,
        connector: Arc<dyn SessionConnector>,
        tracker: Arc<dyn MessageTracker>,
    ) -> Result<Self> {
        let connections = Arc::new(ConnectionManager::new(
            connector,
            config.connection.clone(),
            config.retry.clone(),
        )?);
        let engine = Arc::new(MessageEngine::new(Arc::clone(&connections), tracker));
        let poller = PollingCoordinator::new(Arc::clone(&engine), config.polling.clone());
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&connections)));
        Ok(Self {
            config,
            connections,
            engine,
            poller,
            dispatcher,
        })
    }

    /// The configuration this harvester was built from
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fetch messages from a group
    ///
    /// See [`MessageEngine::fetch`] for ordering, bounds, deduplication, and
    /// caching behavior.
    ///
    /// # Errors
    ///
    /// Propagates engine failures unchanged.
    pub async fn fetch(
        &self,
        group: &GroupRef,
        options: FetchOptions,
    ) -> Result<Vec<MessageRecord>> {
        self.engine.fetch(group, options).await
    }

    /// Search a group for messages matching `query`
    ///
    /// # Errors
    ///
    /// Fails when the source does not support search, the group cannot be
    /// resolved, or the session cannot be established.
    pub async fn search(
        &self,
        group: &GroupRef,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRecord>> {
        self.engine.search(group, query, limit).await
    }

    /// Total number of messages in a group
    ///
    /// Returns 0 when the source cannot count.
    ///
    /// # Errors
    ///
    /// Fails when the group cannot be resolved or the session cannot be
    /// established.
    pub async fn count(&self, group: &GroupRef) -> Result<u64> {
        self.engine.count(group).await
    }

    /// List the groups the authenticated session participates in
    ///
    /// # Errors
    ///
    /// Fails when the source does not support listing or the session cannot
    /// be established.
    pub async fn list_groups(&self) -> Result<Vec<GroupIdentity>> {
        let session = self.connections.acquire().await?;
        Ok(session.source().list_groups().await?)
    }

    /// Drop cached fetch results, for one group or all of them
    pub async fn clear_cache(&self, group: Option<&GroupRef>) {
        self.engine.clear_cache(group).await;
    }

    /// Tracker statistics, optionally scoped to one group
    ///
    /// # Errors
    ///
    /// Fails when the tracker backend errors.
    pub async fn tracker_stats(&self, group_id: Option<i64>) -> Result<TrackerStats> {
        Ok(self.engine.tracker().stats(group_id).await?)
    }

    /// Poll a group for new messages until cancelled
    ///
    /// See [`PollingCoordinator::run`] for cursor, checkpoint, and callback
    /// semantics.
    pub async fn poll_messages<F, Fut>(
        &self,
        group: &GroupRef,
        options: PollOptions,
        callback: F,
        cancel: CancellationToken,
    ) -> PollReport
    where
        F: Fn(Vec<MessageRecord>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        self.poller.run(group, options, callback, cancel).await
    }

    /// Register a live-event callback, global or scoped to one group
    pub async fn on_new_message<F, Fut>(&self, scope: Option<i64>, callback: F)
    where
        F: Fn(LiveEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.dispatcher.on_new_message(scope, callback).await;
    }

    /// Receive and dispatch live events until stopped
    ///
    /// # Errors
    ///
    /// Fails when the source does not support live events or the session
    /// cannot be established.
    pub async fn run_events(&self) -> Result<()> {
        self.dispatcher.run().await
    }

    /// Stop a running event dispatch loop
    pub fn stop_events(&self) {
        self.dispatcher.stop();
    }

    /// Probe every pooled session and report per-session health
    pub async fn health_check(&self) -> HealthReport {
        self.connections.health_check().await
    }

    /// Stop the dispatcher and tear down the session pool
    ///
    /// Subsequent operations fail with the closed error. Idempotent.
    pub async fn close(&self) {
        self.dispatcher.stop();
        self.connections.close().await;
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, SourceError};
    use crate::source::{
        IterParams, MessageSource, MessageStream, SourceCapabilities,
    };
    use crate::types::{RawMessage, SenderInfo};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use futures::{StreamExt, stream};

    const GROUP_ID: i64 = 3003;

    fn raw(id: i64) -> RawMessage {
        RawMessage {
            id,
            sender_id: Some(7),
            text: Some(format!("message {id}")),
            timestamp: Utc.timestamp_opt(1_700_000_000 + id * 60, 0).single().unwrap(),
            reply_to_id: None,
            forwarded_from: None,
        }
    }

    /// Source with a small fixed history, newest first
    struct FacadeSource {
        group: GroupIdentity,
    }

    impl FacadeSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                group: GroupIdentity {
                    id: GROUP_ID,
                    handle: Some("fixture".to_string()),
                    title: "Fixture".to_string(),
                    participant_count: Some(3),
                },
            })
        }
    }

    #[async_trait]
    impl MessageSource for FacadeSource {
        async fn resolve_group(&self, _group: &GroupRef) -> Result<GroupIdentity, SourceError> {
            Ok(self.group.clone())
        }

        fn iter_messages(&self, _group_id: i64, params: IterParams) -> MessageStream {
            let items: Vec<Result<RawMessage, SourceError>> = (1..=5)
                .rev()
                .filter(|id| params.min_id.is_none_or(|min| *id > min))
                .map(|id| Ok(raw(id)))
                .collect();
            stream::iter(items).boxed()
        }

        fn search_messages(
            &self,
            _group_id: i64,
            query: &str,
            _limit: Option<usize>,
        ) -> MessageStream {
            let query = query.to_string();
            let items: Vec<Result<RawMessage, SourceError>> = (1..=5)
                .rev()
                .map(raw)
                .filter(|m| m.text.as_deref().is_some_and(|t| t.contains(&query)))
                .map(Ok)
                .collect();
            stream::iter(items).boxed()
        }

        async fn get_sender(
            &self,
            _group_id: i64,
            message: &RawMessage,
        ) -> Result<Option<SenderInfo>, SourceError> {
            Ok(message.sender_id.map(|id| SenderInfo {
                id,
                first_name: Some("User".to_string()),
                last_name: None,
                username: None,
            }))
        }

        async fn message_count(&self, _group_id: i64) -> Result<u64, SourceError> {
            Ok(42)
        }

        async fn list_groups(&self) -> Result<Vec<GroupIdentity>, SourceError> {
            Ok(vec![self.group.clone()])
        }

        fn capabilities(&self) -> SourceCapabilities {
            SourceCapabilities {
                can_search: true,
                can_count: true,
                can_live_events: false,
            }
        }

        fn name(&self) -> &'static str {
            "facade-fixture"
        }
    }

    struct FacadeConnector {
        source: Arc<FacadeSource>,
    }

    #[async_trait]
    impl SessionConnector for FacadeConnector {
        async fn connect(&self) -> Result<Arc<dyn MessageSource>, SourceError> {
            Ok(Arc::clone(&self.source) as Arc<dyn MessageSource>)
        }
    }

    fn connector() -> Arc<dyn SessionConnector> {
        Arc::new(FacadeConnector {
            source: FacadeSource::new(),
        })
    }

    async fn harvester(config: Config) -> ChatHarvester {
        ChatHarvester::new(config, connector()).await.unwrap()
    }

    #[tokio::test]
    async fn default_config_selects_the_memory_tracker() {
        let harvester = harvester(Config::default()).await;

        let stats = harvester.tracker_stats(None).await.unwrap();
        assert_eq!(stats.implementation, "memory");
    }

    #[tokio::test]
    async fn disabled_dedup_selects_the_noop_tracker() {
        let mut config = Config::default();
        config.dedup.enabled = false;

        let harvester = harvester(config).await;

        let stats = harvester.tracker_stats(None).await.unwrap();
        assert_eq!(stats.implementation, "noop");
    }

    #[tokio::test]
    async fn configured_db_path_selects_the_sqlite_tracker() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.persistence.tracker_db = Some(dir.path().join("tracker.db"));

        let harvester = harvester(config).await;

        let stats = harvester.tracker_stats(None).await.unwrap();
        assert_eq!(stats.implementation, "sqlite");
    }

    #[tokio::test]
    async fn injected_tracker_bypasses_backend_selection() {
        let mut config = Config::default();
        config.dedup.enabled = false;

        let harvester = ChatHarvester::new_with_tracker(
            config,
            connector(),
            Arc::new(InMemoryTracker::new(Some(100))),
        )
        .unwrap();

        let stats = harvester.tracker_stats(None).await.unwrap();
        assert_eq!(stats.implementation, "memory");
        assert_eq!(stats.capacity, Some(100));
    }

    #[tokio::test]
    async fn fetch_search_and_count_reach_the_source() {
        let harvester = harvester(Config::default()).await;
        let group = GroupRef::Id(GROUP_ID);

        let fetched = harvester
            .fetch(&group, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(
            fetched.iter().map(|r| r.message_id).collect::<Vec<_>>(),
            vec![5, 4, 3, 2, 1]
        );

        let found = harvester.search(&group, "message 3", None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].message_id, 3);

        assert_eq!(harvester.count(&group).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn list_groups_returns_the_source_inventory() {
        let harvester = harvester(Config::default()).await;

        let groups = harvester.list_groups().await.unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, GROUP_ID);
        assert_eq!(groups[0].handle.as_deref(), Some("fixture"));
    }

    #[tokio::test]
    async fn close_fails_subsequent_operations() {
        let harvester = harvester(Config::default()).await;
        harvester.close().await;

        let result = harvester
            .fetch(&GroupRef::Id(GROUP_ID), FetchOptions::default())
            .await;

        assert!(matches!(result, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn health_check_reports_the_pooled_session() {
        let harvester = harvester(Config::default()).await;
        harvester
            .fetch(&GroupRef::Id(GROUP_ID), FetchOptions::default())
            .await
            .unwrap();

        let report = harvester.health_check().await;

        assert_eq!(report.sessions.len(), 1);
        assert_eq!(report.sessions[0].healthy, Some(true));
    }
}
