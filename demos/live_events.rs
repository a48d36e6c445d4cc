//! Live events example
//!
//! This example demonstrates push-based ingestion:
//! - A source exposing a live event channel
//! - Global and group-scoped callbacks
//! - Running the dispatcher with graceful signal handling
//!
//! A feeder task plays the role of the remote service pushing events.
//! Press Ctrl+C to stop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chat_harvest::{
    ChatHarvester, Config, GroupIdentity, GroupRef, IterParams, LiveEvent, MessageSource,
    MessageStream, RawMessage, SenderInfo, SessionConnector, SourceCapabilities, SourceError,
    run_events_with_shutdown,
};
use chrono::Utc;
use futures::{StreamExt, stream};
use tokio::sync::mpsc;

struct PushSource {
    events: Mutex<Option<mpsc::Receiver<LiveEvent>>>,
}

#[async_trait]
impl MessageSource for PushSource {
    async fn resolve_group(&self, _group: &GroupRef) -> Result<GroupIdentity, SourceError> {
        Ok(GroupIdentity {
            id: 42,
            handle: Some("demo_group".to_string()),
            title: "Demo Group".to_string(),
            participant_count: Some(2),
        })
    }

    fn iter_messages(&self, _group_id: i64, _params: IterParams) -> MessageStream {
        stream::empty().boxed()
    }

    fn search_messages(&self, _group_id: i64, _query: &str, _limit: Option<usize>) -> MessageStream {
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
            username: None,
        }))
    }

    async fn live_events(&self) -> Result<mpsc::Receiver<LiveEvent>, SourceError> {
        self.events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SourceError::Other("live stream already subscribed".to_string()))
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            can_search: false,
            can_count: false,
            can_live_events: true,
        }
    }

    fn name(&self) -> &'static str {
        "push"
    }
}

struct PushConnector {
    events: Mutex<Option<mpsc::Receiver<LiveEvent>>>,
}

#[async_trait]
impl SessionConnector for PushConnector {
    async fn connect(&self) -> Result<Arc<dyn MessageSource>, SourceError> {
        Ok(Arc::new(PushSource {
            events: Mutex::new(self.events.lock().unwrap().take()),
        }) as Arc<dyn MessageSource>)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for logging (optional)
    // Uncomment if you add tracing-subscriber to your dependencies:
    // tracing_subscriber::fmt::init();

    let (live_tx, live_rx) = mpsc::channel(64);
    let harvester = ChatHarvester::new(
        Config::default(),
        Arc::new(PushConnector {
            events: Mutex::new(Some(live_rx)),
        }),
    )
    .await?;

    // Global callback: every group
    harvester
        .on_new_message(None, |event| async move {
            println!(
                "  [group {}] message {}: {}",
                event.group_id,
                event.message.id,
                event.message.text.as_deref().unwrap_or("<no text>")
            );
            Ok(())
        })
        .await;

    // Scoped callback: group 42 only
    harvester
        .on_new_message(Some(42), |event| async move {
            println!("  (scoped) our group got message {}", event.message.id);
            Ok(())
        })
        .await;

    // Feeder task: the remote service pushing events, alternating groups
    tokio::spawn(async move {
        for id in 1.. {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let event = LiveEvent {
                group_id: if id % 2 == 0 { 7 } else { 42 },
                message: RawMessage {
                    id,
                    sender_id: Some(100),
                    text: Some(format!("live message {id}")),
                    timestamp: Utc::now(),
                    reply_to_id: None,
                    forwarded_from: None,
                },
            };
            if live_tx.send(event).await.is_err() {
                break;
            }
        }
    });

    println!("Dispatching live events, Ctrl+C to stop:");
    run_events_with_shutdown(harvester).await?;
    println!("Stopped.");

    Ok(())
}
