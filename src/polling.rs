//! Scheduled incremental polling for new messages
//!
//! The PollingCoordinator repeatedly fetches messages newer than a moving
//! cursor and hands each batch to an async callback, sleeping between
//! iterations. The cursor only ever advances; an empty iteration leaves it
//! in place. When an operation id is configured and the tracker persists
//! checkpoints, progress survives restarts: a fresh run resumes from the
//! stored cursor instead of the newest message.
//!
//! Polling bypasses the fetch cache and runs with deduplication on, so a
//! message that slips past the cursor bound is still dropped by the tracker
//! rather than delivered twice.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PollingConfig;
use crate::engine::{FetchOptions, MessageEngine};
use crate::error::{Result, TrackerError};
use crate::types::{Checkpoint, GroupRef, MessageRecord};

/// Options for one polling run
#[derive(Debug, Clone, Default)]
pub struct PollOptions {
    /// Sleep between iterations; defaults to the configured poll interval
    pub interval: Option<Duration>,
    /// Start the cursor here instead of resuming from a checkpoint
    pub after_id: Option<i64>,
    /// Stop after this many iterations; `None` polls until cancelled
    pub max_iterations: Option<u64>,
    /// Name under which progress is checkpointed, when the tracker supports it
    pub operation_id: Option<String>,
}

/// Summary of a finished polling run
#[derive(Debug, Clone, Serialize)]
#[must_use]
pub struct PollReport {
    /// Completed iterations, including empty ones
    pub iterations: u64,
    /// Messages delivered to the callback across all iterations
    pub new_messages: u64,
    /// Final cursor position, if any message id is known
    pub last_message_id: Option<i64>,
    /// Whether the run was stopped by cancellation rather than `max_iterations`
    pub cancelled: bool,
}

/// Drives repeated cursor-based fetches against one group
///
/// The coordinator owns no session of its own; every iteration goes through
/// the engine and its connection pool, so rate limits and deduplication
/// behave exactly as they do for a one-shot fetch.
pub struct PollingCoordinator {
    engine: Arc<MessageEngine>,
    polling: PollingConfig,
}

impl PollingCoordinator {
    /// Create a coordinator over an engine
    pub fn new(engine: Arc<MessageEngine>, polling: PollingConfig) -> Self {
        Self { engine, polling }
    }

    /// Poll `group` for new messages until cancelled or `max_iterations` is hit
    ///
    /// The callback runs once per iteration, with an empty batch when nothing
    /// new arrived. Callback and fetch failures are logged and absorbed; the
    /// loop itself never fails. Cancellation takes effect at the next
    /// suspension point, between or inside iterations.
    pub async fn run<F, Fut>(
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
        let tracker = Arc::clone(self.engine.tracker());
        let mut cursor = options.after_id;
        let mut group_id: Option<i64> = None;
        let mut last_timestamp: Option<DateTime<Utc>> = None;
        let mut total_processed: u64 = 0;

        // An explicit after_id wins over stored progress.
        if cursor.is_none()
            && let Some(operation_id) = &options.operation_id
        {
            match tracker.load_checkpoint(operation_id).await {
                Ok(Some(checkpoint)) => {
                    info!(
                        operation_id,
                        last_message_id = checkpoint.last_message_id,
                        total_processed = checkpoint.total_processed,
                        "Resuming poll from stored checkpoint"
                    );
                    cursor = Some(checkpoint.last_message_id);
                    group_id = Some(checkpoint.group_id);
                    last_timestamp = checkpoint.last_message_timestamp;
                    total_processed = checkpoint.total_processed;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(operation_id, error = %e, "Failed to load checkpoint, starting fresh");
                }
            }
        }

        let interval = options.interval.unwrap_or(self.polling.poll_interval);
        info!(
            group = %group,
            interval_secs = interval.as_secs(),
            after_id = cursor,
            "Polling started"
        );

        let mut iterations: u64 = 0;
        let mut new_messages: u64 = 0;
        let mut cancelled = false;
        let mut checkpoints_unsupported = false;

        loop {
            if let Some(max) = options.max_iterations
                && iterations >= max
            {
                break;
            }

            let fetch = self.engine.fetch(
                group,
                FetchOptions {
                    min_id: cursor,
                    use_cache: false,
                    ..FetchOptions::default()
                },
            );
            let batch = tokio::select! {
                result = fetch => match result {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(group = %group, error = %e, "Poll fetch failed, treating iteration as empty");
                        Vec::new()
                    }
                },
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            };
            iterations += 1;

            if let Some(newest) = batch.iter().max_by_key(|r| r.message_id) {
                cursor = Some(cursor.map_or(newest.message_id, |c| c.max(newest.message_id)));
                group_id = Some(newest.group_id);
                last_timestamp = Some(newest.timestamp);
                new_messages += batch.len() as u64;
                total_processed += batch.len() as u64;
                debug!(
                    group = %group,
                    batch = batch.len(),
                    cursor = cursor,
                    "Poll iteration found new messages"
                );
            }

            if let Err(e) = callback(batch).await {
                warn!(group = %group, error = %e, "Poll callback failed");
            }

            // The group id comes from a checkpoint or a delivered record; the
            // coordinator never resolves the group itself.
            if !checkpoints_unsupported
                && let Some(operation_id) = &options.operation_id
                && let (Some(last_id), Some(gid)) = (cursor, group_id)
            {
                let checkpoint = Checkpoint::new(
                    operation_id.clone(),
                    gid,
                    last_id,
                    last_timestamp,
                    total_processed,
                    None,
                );
                match tracker.save_checkpoint(&checkpoint).await {
                    Ok(()) => {}
                    Err(TrackerError::NotSupported(_)) => {
                        warn!(
                            operation_id,
                            tracker = tracker.name(),
                            "Tracker does not persist checkpoints, progress will not survive a restart"
                        );
                        checkpoints_unsupported = true;
                    }
                    Err(e) => {
                        warn!(operation_id, error = %e, "Failed to save checkpoint");
                    }
                }
            }

            // Checked again here so the last iteration skips its sleep.
            if options.max_iterations.is_some_and(|max| iterations >= max) {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            }
        }

        let report = PollReport {
            iterations,
            new_messages,
            last_message_id: cursor,
            cancelled,
        };
        info!(
            group = %group,
            iterations = report.iterations,
            new_messages = report.new_messages,
            last_message_id = report.last_message_id,
            cancelled = report.cancelled,
            "Polling finished"
        );
        report
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, RetryConfig};
    use crate::connection::ConnectionManager;
    use crate::error::{Error, SourceError};
    use crate::source::{
        IterParams, MessageSource, MessageStream, SessionConnector, SourceCapabilities,
    };
    use crate::tracker::{InMemoryTracker, MessageTracker, TrackerStats};
    use crate::types::{GroupIdentity, ProcessedMessage, RawMessage, SenderInfo};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use futures::{StreamExt, stream};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    const GROUP_ID: i64 = 2002;

    fn ts(id: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + id * 60, 0).single().unwrap()
    }

    fn raw(id: i64) -> RawMessage {
        RawMessage {
            id,
            sender_id: Some(7),
            text: Some(format!("message {id}")),
            timestamp: ts(id),
            reply_to_id: None,
            forwarded_from: None,
        }
    }

    enum ScriptStep {
        Batch(Vec<i64>),
        Fail,
    }

    /// Source whose successive iterations replay a fixed script
    ///
    /// Each `iter_messages` call consumes one step; an exhausted script
    /// yields empty streams. Id bounds are honoured so cursor handling is
    /// exercised for real.
    struct ScriptedSource {
        group: GroupIdentity,
        script: StdMutex<VecDeque<ScriptStep>>,
        iter_params: StdMutex<Vec<IterParams>>,
    }

    impl ScriptedSource {
        fn new(steps: Vec<ScriptStep>) -> Self {
            Self {
                group: GroupIdentity {
                    id: GROUP_ID,
                    handle: None,
                    title: "Scripted".to_string(),
                    participant_count: None,
                },
                script: StdMutex::new(steps.into()),
                iter_params: StdMutex::new(Vec::new()),
            }
        }

        fn captured_min_ids(&self) -> Vec<Option<i64>> {
            self.iter_params.lock().unwrap().iter().map(|p| p.min_id).collect()
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn resolve_group(&self, _group: &GroupRef) -> Result<GroupIdentity, SourceError> {
            Ok(self.group.clone())
        }

        fn iter_messages(&self, _group_id: i64, params: IterParams) -> MessageStream {
            let step = self.script.lock().unwrap().pop_front();
            let min_id = params.min_id;
            let max_id = params.max_id;
            self.iter_params.lock().unwrap().push(params);
            match step {
                Some(ScriptStep::Batch(ids)) => {
                    let items: Vec<Result<RawMessage, SourceError>> = ids
                        .into_iter()
                        .filter(|id| min_id.is_none_or(|min| *id > min))
                        .filter(|id| max_id.is_none_or(|max| *id < max))
                        .map(|id| Ok(raw(id)))
                        .collect();
                    stream::iter(items).boxed()
                }
                Some(ScriptStep::Fail) => {
                    stream::iter(vec![Err(SourceError::Connection("socket reset".to_string()))])
                        .boxed()
                }
                None => stream::empty().boxed(),
            }
        }

        fn search_messages(
            &self,
            _group_id: i64,
            _query: &str,
            _limit: Option<usize>,
        ) -> MessageStream {
            stream::empty().boxed()
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

        fn capabilities(&self) -> SourceCapabilities {
            SourceCapabilities {
                can_search: false,
                can_count: false,
                can_live_events: false,
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    struct ScriptedConnector {
        source: Arc<ScriptedSource>,
    }

    #[async_trait]
    impl SessionConnector for ScriptedConnector {
        async fn connect(&self) -> Result<Arc<dyn MessageSource>, SourceError> {
            Ok(Arc::clone(&self.source) as Arc<dyn MessageSource>)
        }
    }

    /// Tracker that records checkpoint saves and replays a stored one
    struct CaptureTracker {
        saves: StdMutex<Vec<Checkpoint>>,
        stored: StdMutex<Option<Checkpoint>>,
        supports_checkpoints: bool,
    }

    impl CaptureTracker {
        fn new() -> Self {
            Self {
                saves: StdMutex::new(Vec::new()),
                stored: StdMutex::new(None),
                supports_checkpoints: true,
            }
        }

        fn with_stored(checkpoint: Checkpoint) -> Self {
            let tracker = Self::new();
            *tracker.stored.lock().unwrap() = Some(checkpoint);
            tracker
        }

        fn saved(&self) -> Vec<Checkpoint> {
            self.saves.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageTracker for CaptureTracker {
        async fn is_processed(&self, _message_id: i64, _group_id: i64) -> Result<bool, TrackerError> {
            Ok(false)
        }

        async fn mark_processed(&self, _message: &ProcessedMessage) -> Result<(), TrackerError> {
            Ok(())
        }

        async fn mark_batch_processed(
            &self,
            messages: &[ProcessedMessage],
        ) -> Result<usize, TrackerError> {
            Ok(messages.len())
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
                implementation: "capture",
                capacity: None,
            })
        }

        async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), TrackerError> {
            if !self.supports_checkpoints {
                return Err(TrackerError::NotSupported("capture tracker".to_string()));
            }
            self.saves.lock().unwrap().push(checkpoint.clone());
            Ok(())
        }

        async fn load_checkpoint(
            &self,
            operation_id: &str,
        ) -> Result<Option<Checkpoint>, TrackerError> {
            Ok(self
                .stored
                .lock()
                .unwrap()
                .clone()
                .filter(|c| c.operation_id == operation_id))
        }

        fn name(&self) -> &'static str {
            "capture"
        }
    }

    fn coordinator_over(
        source: &Arc<ScriptedSource>,
        tracker: Arc<dyn MessageTracker>,
    ) -> PollingCoordinator {
        let connector = Arc::new(ScriptedConnector {
            source: Arc::clone(source),
        });
        let manager = ConnectionManager::new(
            connector,
            ConnectionConfig::default(),
            RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            },
        )
        .unwrap();
        PollingCoordinator::new(
            Arc::new(MessageEngine::new(Arc::new(manager), tracker)),
            PollingConfig {
                poll_interval: Duration::from_millis(5),
            },
        )
    }

    fn scripted(steps: Vec<ScriptStep>) -> (Arc<ScriptedSource>, PollingCoordinator) {
        let source = Arc::new(ScriptedSource::new(steps));
        let coordinator = coordinator_over(&source, Arc::new(InMemoryTracker::new(None)));
        (source, coordinator)
    }

    fn options(max_iterations: u64) -> PollOptions {
        PollOptions {
            interval: Some(Duration::from_millis(1)),
            max_iterations: Some(max_iterations),
            ..PollOptions::default()
        }
    }

    #[tokio::test]
    async fn callback_runs_every_iteration_including_empty_ones() {
        let (_, coordinator) = scripted(vec![
            ScriptStep::Batch(vec![1, 2]),
            ScriptStep::Batch(vec![3]),
        ]);
        let batch_sizes = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&batch_sizes);

        let report = coordinator
            .run(
                &GroupRef::Id(GROUP_ID),
                options(3),
                move |batch| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().unwrap().push(batch.len());
                        Ok(())
                    }
                },
                CancellationToken::new(),
            )
            .await;

        assert_eq!(*batch_sizes.lock().unwrap(), vec![2, 1, 0]);
        assert_eq!(report.iterations, 3);
        assert_eq!(report.new_messages, 3);
        assert_eq!(report.last_message_id, Some(3));
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn cursor_advances_to_the_newest_delivered_id() {
        let (source, coordinator) = scripted(vec![
            ScriptStep::Batch(vec![5, 6]),
            ScriptStep::Batch(vec![9]),
        ]);

        coordinator
            .run(
                &GroupRef::Id(GROUP_ID),
                options(3),
                |_| async { Ok(()) },
                CancellationToken::new(),
            )
            .await;

        assert_eq!(
            source.captured_min_ids(),
            vec![None, Some(6), Some(9)],
            "each iteration must ask only for ids past the last delivered one"
        );
    }

    #[tokio::test]
    async fn explicit_after_id_positions_the_first_iteration() {
        let (source, coordinator) = scripted(vec![ScriptStep::Batch(vec![40, 43])]);

        let report = coordinator
            .run(
                &GroupRef::Id(GROUP_ID),
                PollOptions {
                    after_id: Some(42),
                    ..options(1)
                },
                |_| async { Ok(()) },
                CancellationToken::new(),
            )
            .await;

        assert_eq!(source.captured_min_ids(), vec![Some(42)]);
        // 40 is at or below the cursor and must not be delivered.
        assert_eq!(report.new_messages, 1);
        assert_eq!(report.last_message_id, Some(43));
    }

    #[tokio::test]
    async fn fetch_failure_is_an_empty_iteration_not_a_crash() {
        let (_, coordinator) = scripted(vec![ScriptStep::Fail, ScriptStep::Batch(vec![2])]);
        let batch_sizes = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&batch_sizes);

        let report = coordinator
            .run(
                &GroupRef::Id(GROUP_ID),
                options(2),
                move |batch| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().unwrap().push(batch.len());
                        Ok(())
                    }
                },
                CancellationToken::new(),
            )
            .await;

        assert_eq!(*batch_sizes.lock().unwrap(), vec![0, 1]);
        assert_eq!(report.iterations, 2);
        assert_eq!(report.new_messages, 1);
    }

    #[tokio::test]
    async fn callback_failure_does_not_stop_the_loop() {
        let (_, coordinator) = scripted(vec![ScriptStep::Batch(vec![1])]);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let report = coordinator
            .run(
                &GroupRef::Id(GROUP_ID),
                options(2),
                move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(Error::Other("handler rejected the batch".to_string()))
                    }
                },
                CancellationToken::new(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.iterations, 2);
        assert_eq!(report.new_messages, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_promptly() {
        let (_, coordinator) = scripted(vec![ScriptStep::Batch(vec![1])]);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                coordinator
                    .run(
                        &GroupRef::Id(GROUP_ID),
                        PollOptions {
                            // Long enough that only cancellation can end the run.
                            interval: Some(Duration::from_secs(300)),
                            ..PollOptions::default()
                        },
                        |_| async { Ok(()) },
                        cancel,
                    )
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancellation must end the run well before the interval")
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.iterations, 1);
        assert_eq!(report.last_message_id, Some(1));
    }

    #[tokio::test]
    async fn checkpoints_are_saved_with_the_advancing_cursor() {
        let source = Arc::new(ScriptedSource::new(vec![
            ScriptStep::Batch(vec![1, 2]),
            ScriptStep::Batch(vec![5]),
        ]));
        let tracker = Arc::new(CaptureTracker::new());
        let coordinator = coordinator_over(&source, Arc::clone(&tracker) as Arc<dyn MessageTracker>);

        coordinator
            .run(
                &GroupRef::Id(GROUP_ID),
                PollOptions {
                    operation_id: Some("nightly-sync".to_string()),
                    ..options(3)
                },
                |_| async { Ok(()) },
                CancellationToken::new(),
            )
            .await;

        let saved = tracker.saved();
        // The empty third iteration re-saves the unchanged cursor.
        assert_eq!(
            saved.iter().map(|c| c.last_message_id).collect::<Vec<_>>(),
            vec![2, 5, 5]
        );
        assert_eq!(
            saved.iter().map(|c| c.total_processed).collect::<Vec<_>>(),
            vec![2, 3, 3]
        );
        assert!(saved.iter().all(|c| c.operation_id == "nightly-sync"));
        assert!(saved.iter().all(|c| c.group_id == GROUP_ID));
    }

    #[tokio::test]
    async fn stored_checkpoint_positions_the_cursor_and_running_total() {
        let source = Arc::new(ScriptedSource::new(vec![ScriptStep::Batch(vec![8])]));
        let tracker = Arc::new(CaptureTracker::with_stored(Checkpoint::new(
            "nightly-sync",
            GROUP_ID,
            7,
            Some(ts(7)),
            40,
            None,
        )));
        let coordinator = coordinator_over(&source, Arc::clone(&tracker) as Arc<dyn MessageTracker>);

        let report = coordinator
            .run(
                &GroupRef::Id(GROUP_ID),
                PollOptions {
                    operation_id: Some("nightly-sync".to_string()),
                    ..options(1)
                },
                |_| async { Ok(()) },
                CancellationToken::new(),
            )
            .await;

        assert_eq!(source.captured_min_ids(), vec![Some(7)]);
        assert_eq!(report.last_message_id, Some(8));
        let saved = tracker.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].last_message_id, 8);
        assert_eq!(saved[0].total_processed, 41, "running total continues the stored one");
    }

    #[tokio::test]
    async fn explicit_after_id_overrides_the_stored_checkpoint() {
        let source = Arc::new(ScriptedSource::new(Vec::new()));
        let tracker = Arc::new(CaptureTracker::with_stored(Checkpoint::new(
            "nightly-sync",
            GROUP_ID,
            7,
            None,
            40,
            None,
        )));
        let coordinator = coordinator_over(&source, Arc::clone(&tracker) as Arc<dyn MessageTracker>);

        coordinator
            .run(
                &GroupRef::Id(GROUP_ID),
                PollOptions {
                    after_id: Some(100),
                    operation_id: Some("nightly-sync".to_string()),
                    ..options(1)
                },
                |_| async { Ok(()) },
                CancellationToken::new(),
            )
            .await;

        assert_eq!(source.captured_min_ids(), vec![Some(100)]);
    }

    #[tokio::test]
    async fn unsupported_checkpoints_do_not_stop_polling() {
        // The in-memory tracker declines checkpoint saves.
        let (_, coordinator) = scripted(vec![ScriptStep::Batch(vec![1]), ScriptStep::Batch(vec![2])]);

        let report = coordinator
            .run(
                &GroupRef::Id(GROUP_ID),
                PollOptions {
                    operation_id: Some("nightly-sync".to_string()),
                    ..options(2)
                },
                |_| async { Ok(()) },
                CancellationToken::new(),
            )
            .await;

        assert_eq!(report.iterations, 2);
        assert_eq!(report.new_messages, 2);
    }

    #[tokio::test]
    async fn zero_max_iterations_never_fetches() {
        let (source, coordinator) = scripted(vec![ScriptStep::Batch(vec![1])]);

        let report = coordinator
            .run(
                &GroupRef::Id(GROUP_ID),
                options(0),
                |_| async { Ok(()) },
                CancellationToken::new(),
            )
            .await;

        assert!(source.captured_min_ids().is_empty());
        assert_eq!(report.iterations, 0);
        assert_eq!(report.last_message_id, None);
    }
}
