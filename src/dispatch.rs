//! Live event dispatch to registered consumer callbacks
//!
//! The EventDispatcher subscribes to the remote source's push stream and
//! fans each incoming event out to the callbacks registered for it. A
//! callback is either global (sees every group) or scoped to one group id.
//! Callback failures are logged at the dispatch boundary and never reach
//! the other callbacks or the receive loop.
//!
//! Running the dispatcher occupies one pooled session for the lifetime of
//! the subscription.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::types::LiveEvent;

/// Stored form of a registered callback
pub type EventCallback = dyn Fn(LiveEvent) -> BoxFuture<'static, Result<()>> + Send + Sync;

struct Handler {
    /// Group id this callback is limited to; `None` receives every group
    scope: Option<i64>,
    callback: Arc<EventCallback>,
}

/// Fans live source events out to registered callbacks
///
/// Callbacks may be registered before or while [`run`](Self::run) is
/// blocking; late registrations apply from the next event on. Stopping is
/// permanent for a dispatcher instance.
pub struct EventDispatcher {
    connections: Arc<ConnectionManager>,
    handlers: tokio::sync::RwLock<Vec<Handler>>,
    cancel: CancellationToken,
}

impl EventDispatcher {
    /// Create a dispatcher over a session pool
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            handlers: tokio::sync::RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Register a callback for new messages
    ///
    /// `scope` limits delivery to one group id; `None` registers a global
    /// callback. Multiple callbacks of either scope may be registered and
    /// each matching one runs per event, in registration order.
    pub async fn on_new_message<F, Fut>(&self, scope: Option<i64>, callback: F)
    where
        F: Fn(LiveEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let callback: Arc<EventCallback> = Arc::new(move |event| Box::pin(callback(event)));
        self.handlers.write().await.push(Handler { scope, callback });
    }

    /// Receive and dispatch events until stopped
    ///
    /// Blocks the calling task. Returns `Ok(())` when stopped via
    /// [`stop`](Self::stop) or when the source ends the stream.
    ///
    /// # Errors
    ///
    /// Fails when no session can be established or the source does not
    /// support live events.
    pub async fn run(&self) -> Result<()> {
        let session = self.connections.acquire().await?;
        let source = session.source();
        let mut events = source.live_events().await?;
        info!(source = source.name(), "Event dispatch started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => {
                        info!("Live event stream ended");
                        break;
                    }
                },
                _ = self.cancel.cancelled() => {
                    info!("Event dispatch stopped");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Stop a running dispatch loop at its next suspension point
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn dispatch(&self, event: LiveEvent) {
        // Matching callbacks are cloned out so registration is not blocked
        // while they run.
        let matching: Vec<Arc<EventCallback>> = self
            .handlers
            .read()
            .await
            .iter()
            .filter(|h| h.scope.is_none_or(|scope| scope == event.group_id))
            .map(|h| Arc::clone(&h.callback))
            .collect();
        debug!(
            group_id = event.group_id,
            message_id = event.message.id,
            callbacks = matching.len(),
            "Dispatching live event"
        );
        for callback in matching {
            if let Err(e) = callback(event.clone()).await {
                warn!(
                    group_id = event.group_id,
                    message_id = event.message.id,
                    error = %e,
                    "Event callback failed"
                );
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, RetryConfig};
    use crate::error::{Error, SourceError};
    use crate::source::{
        IterParams, MessageSource, MessageStream, SessionConnector, SourceCapabilities,
    };
    use crate::types::{GroupIdentity, GroupRef, RawMessage, SenderInfo};
    use async_trait::async_trait;
    use chrono::Utc;
    use futures::{StreamExt, stream};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn event(group_id: i64, message_id: i64) -> LiveEvent {
        LiveEvent {
            group_id,
            message: RawMessage {
                id: message_id,
                sender_id: Some(7),
                text: Some(format!("live {message_id}")),
                timestamp: Utc::now(),
                reply_to_id: None,
                forwarded_from: None,
            },
        }
    }

    /// Source whose live stream is fed by the test through a held sender
    struct LiveSource {
        receiver: StdMutex<Option<mpsc::Receiver<LiveEvent>>>,
        can_live: bool,
    }

    impl LiveSource {
        fn new(can_live: bool) -> (Arc<Self>, mpsc::Sender<LiveEvent>) {
            let (tx, rx) = mpsc::channel(16);
            let source = Arc::new(Self {
                receiver: StdMutex::new(Some(rx)),
                can_live,
            });
            (source, tx)
        }
    }

    #[async_trait]
    impl MessageSource for LiveSource {
        async fn resolve_group(&self, _group: &GroupRef) -> Result<GroupIdentity, SourceError> {
            Err(SourceError::GroupNotFound("unused".to_string()))
        }

        fn iter_messages(&self, _group_id: i64, _params: IterParams) -> MessageStream {
            stream::empty().boxed()
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
            _message: &RawMessage,
        ) -> Result<Option<SenderInfo>, SourceError> {
            Ok(None)
        }

        async fn live_events(&self) -> Result<mpsc::Receiver<LiveEvent>, SourceError> {
            if !self.can_live {
                return Err(SourceError::NotSupported("live events".to_string()));
            }
            self.receiver
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| SourceError::Other("live stream already taken".to_string()))
        }

        fn capabilities(&self) -> SourceCapabilities {
            SourceCapabilities {
                can_search: false,
                can_count: false,
                can_live_events: self.can_live,
            }
        }

        fn name(&self) -> &'static str {
            "live"
        }
    }

    struct LiveConnector {
        source: Arc<LiveSource>,
    }

    #[async_trait]
    impl SessionConnector for LiveConnector {
        async fn connect(&self) -> Result<Arc<dyn MessageSource>, SourceError> {
            Ok(Arc::clone(&self.source) as Arc<dyn MessageSource>)
        }
    }

    fn dispatcher_over(source: Arc<LiveSource>) -> Arc<EventDispatcher> {
        let manager = ConnectionManager::new(
            Arc::new(LiveConnector { source }),
            ConnectionConfig::default(),
            RetryConfig::default(),
        )
        .unwrap();
        Arc::new(EventDispatcher::new(Arc::new(manager)))
    }

    /// Polls until `condition` holds, failing the test after one second
    async fn wait_for(condition: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached within the deadline"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn recording_handler(
        seen: &Arc<StdMutex<Vec<(i64, i64)>>>,
    ) -> impl Fn(LiveEvent) -> futures::future::Ready<Result<()>> + Send + Sync + 'static {
        let seen = Arc::clone(seen);
        move |event: LiveEvent| {
            seen.lock().unwrap().push((event.group_id, event.message.id));
            futures::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn global_callback_sees_events_from_every_group() {
        let (source, tx) = LiveSource::new(true);
        let dispatcher = dispatcher_over(source);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        dispatcher.on_new_message(None, recording_handler(&seen)).await;

        let running = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.run().await }
        });
        tx.send(event(1, 10)).await.unwrap();
        tx.send(event(2, 20)).await.unwrap();
        wait_for(|| seen.lock().unwrap().len() == 2).await;
        dispatcher.stop();
        running.await.unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(1, 10), (2, 20)]);
    }

    #[tokio::test]
    async fn scoped_callback_only_sees_its_group() {
        let (source, tx) = LiveSource::new(true);
        let dispatcher = dispatcher_over(source);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        dispatcher.on_new_message(Some(1), recording_handler(&seen)).await;

        let running = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.run().await }
        });
        tx.send(event(2, 20)).await.unwrap();
        tx.send(event(1, 10)).await.unwrap();
        wait_for(|| !seen.lock().unwrap().is_empty()).await;
        dispatcher.stop();
        running.await.unwrap().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, 10)],
            "the group 2 event must not reach a callback scoped to group 1"
        );
    }

    #[tokio::test]
    async fn callback_error_does_not_block_other_callbacks() {
        let (source, tx) = LiveSource::new(true);
        let dispatcher = dispatcher_over(source);
        dispatcher
            .on_new_message(None, |_| async {
                Err(Error::Other("handler rejected the event".to_string()))
            })
            .await;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        dispatcher.on_new_message(None, recording_handler(&seen)).await;

        let running = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.run().await }
        });
        tx.send(event(1, 10)).await.unwrap();
        tx.send(event(1, 11)).await.unwrap();
        wait_for(|| seen.lock().unwrap().len() == 2).await;
        dispatcher.stop();
        running.await.unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(1, 10), (1, 11)]);
    }

    #[tokio::test]
    async fn callbacks_registered_while_running_receive_later_events() {
        let (source, tx) = LiveSource::new(true);
        let dispatcher = dispatcher_over(source);

        let running = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.run().await }
        });
        let seen = Arc::new(StdMutex::new(Vec::new()));
        dispatcher.on_new_message(None, recording_handler(&seen)).await;
        tx.send(event(3, 30)).await.unwrap();
        wait_for(|| !seen.lock().unwrap().is_empty()).await;
        dispatcher.stop();
        running.await.unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(3, 30)]);
    }

    #[tokio::test]
    async fn run_fails_when_the_source_has_no_live_stream() {
        let (source, _tx) = LiveSource::new(false);
        let dispatcher = dispatcher_over(source);

        let result = dispatcher.run().await;

        assert!(matches!(
            result,
            Err(Error::Source(SourceError::NotSupported(_)))
        ));
    }

    #[tokio::test]
    async fn closed_event_stream_ends_the_run_cleanly() {
        let (source, tx) = LiveSource::new(true);
        let dispatcher = dispatcher_over(source);

        let running = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.run().await }
        });
        tx.send(event(1, 10)).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("a closed stream must end the run")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stop_unblocks_a_quiet_run() {
        let (source, _tx) = LiveSource::new(true);
        let dispatcher = dispatcher_over(source);

        let running = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.run().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.stop();

        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("stop must end the run promptly")
            .unwrap()
            .unwrap();
    }
}
