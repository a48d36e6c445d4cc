//! Polling example
//!
//! This example demonstrates incremental polling:
//! - Fetching only messages newer than the moving cursor
//! - A feeder task playing the role of people writing into the group
//! - The per-iteration callback, including empty iterations
//! - The report summarizing the run
//!
//! The feeder appends a message roughly twice per poll interval, so most
//! iterations deliver a small batch and some deliver none.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chat_harvest::{
    ChatHarvester, Config, GroupIdentity, GroupRef, IterParams, MessageSource, MessageStream,
    PollOptions, RawMessage, SenderInfo, SessionConnector, SourceCapabilities, SourceError,
};
use chrono::Utc;
use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;

/// Message store shared between the source and the feeder task
type SharedStore = Arc<Mutex<Vec<RawMessage>>>;

struct FeedSource {
    store: SharedStore,
}

#[async_trait]
impl MessageSource for FeedSource {
    async fn resolve_group(&self, _group: &GroupRef) -> Result<GroupIdentity, SourceError> {
        Ok(GroupIdentity {
            id: 42,
            handle: Some("demo_group".to_string()),
            title: "Demo Group".to_string(),
            participant_count: Some(2),
        })
    }

    fn iter_messages(&self, _group_id: i64, params: IterParams) -> MessageStream {
        let mut selected = self.store.lock().unwrap().clone();
        selected.retain(|m| params.min_id.is_none_or(|min| m.id > min));
        if !params.reverse {
            selected.reverse();
        }
        if let Some(limit) = params.limit {
            selected.truncate(limit);
        }
        stream::iter(selected.into_iter().map(Ok)).boxed()
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

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            can_search: false,
            can_count: false,
            can_live_events: false,
        }
    }

    fn name(&self) -> &'static str {
        "feed"
    }
}

struct FeedConnector {
    store: SharedStore,
}

#[async_trait]
impl SessionConnector for FeedConnector {
    async fn connect(&self) -> Result<Arc<dyn MessageSource>, SourceError> {
        Ok(Arc::new(FeedSource {
            store: Arc::clone(&self.store),
        }) as Arc<dyn MessageSource>)
    }
}

/// Appends one message to the store
fn post(store: &SharedStore, id: i64, text: &str) {
    store.lock().unwrap().push(RawMessage {
        id,
        sender_id: Some(100 + id % 2),
        text: Some(text.to_string()),
        timestamp: Utc::now(),
        reply_to_id: None,
        forwarded_from: None,
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for logging (optional)
    // Uncomment if you add tracing-subscriber to your dependencies:
    // tracing_subscriber::fmt::init();

    let store: SharedStore = Arc::new(Mutex::new(Vec::new()));
    post(&store, 1, "anyone around?");
    post(&store, 2, "yes, just getting started");

    let harvester = ChatHarvester::new(
        Config::default(),
        Arc::new(FeedConnector {
            store: Arc::clone(&store),
        }),
    )
    .await?;

    // Feeder task: new messages keep arriving while we poll
    let feeder = tokio::spawn({
        let store = Arc::clone(&store);
        async move {
            for id in 3.. {
                tokio::time::sleep(Duration::from_millis(400)).await;
                post(&store, id, &format!("update number {id}"));
            }
        }
    });

    println!("Polling every second, 6 iterations:");
    let report = harvester
        .poll_messages(
            &GroupRef::Id(42),
            PollOptions {
                interval: Some(Duration::from_secs(1)),
                max_iterations: Some(6),
                ..PollOptions::default()
            },
            |batch| async move {
                if batch.is_empty() {
                    println!("  (nothing new)");
                } else {
                    for record in &batch {
                        println!(
                            "  [{}] {}: {}",
                            record.message_id,
                            record.sender_name,
                            record.text.as_deref().unwrap_or("<no text>")
                        );
                    }
                }
                Ok(())
            },
            CancellationToken::new(),
        )
        .await;
    feeder.abort();

    println!(
        "\n{} iterations delivered {} new messages, cursor ended at {:?}",
        report.iterations, report.new_messages, report.last_message_id
    );

    harvester.close().await;
    Ok(())
}
