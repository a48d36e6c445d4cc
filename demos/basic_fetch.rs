//! Basic fetch example
//!
//! This example demonstrates the core functionality of chat-harvest:
//! - Wiring a message source behind the SessionConnector trait
//! - Creating a harvester instance
//! - Fetching recent messages with a limit
//! - Client-side filtering and statistics
//!
//! The DemoSource below stands in for a real protocol client; in an
//! application you would wrap your chat service's API client instead.

use std::sync::Arc;

use async_trait::async_trait;
use chat_harvest::util;
use chat_harvest::{
    ChatHarvester, Config, FetchOptions, GroupIdentity, GroupRef, IterParams, MessageSource,
    MessageStream, RawMessage, SenderInfo, SessionConnector, SourceCapabilities, SourceError,
};
use chrono::{Duration, Utc};
use futures::{StreamExt, stream};

struct DemoSource {
    messages: Vec<RawMessage>,
}

#[async_trait]
impl MessageSource for DemoSource {
    async fn resolve_group(&self, _group: &GroupRef) -> Result<GroupIdentity, SourceError> {
        Ok(GroupIdentity {
            id: 42,
            handle: Some("demo_group".to_string()),
            title: "Demo Group".to_string(),
            participant_count: Some(3),
        })
    }

    fn iter_messages(&self, _group_id: i64, params: IterParams) -> MessageStream {
        let mut selected = self.messages.clone();
        selected.retain(|m| params.min_id.is_none_or(|min| m.id > min));
        selected.retain(|m| params.max_id.is_none_or(|max| m.id < max));
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
        let Some(id) = message.sender_id else {
            return Ok(None);
        };
        let (first, username) = match id {
            101 => ("Ana", "ana_dev"),
            102 => ("Brett", "brett_ops"),
            _ => ("Chi", "chi_data"),
        };
        Ok(Some(SenderInfo {
            id,
            first_name: Some(first.to_string()),
            last_name: None,
            username: Some(username.to_string()),
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
        "demo"
    }
}

struct DemoConnector;

#[async_trait]
impl SessionConnector for DemoConnector {
    async fn connect(&self) -> Result<Arc<dyn MessageSource>, SourceError> {
        let now = Utc::now();
        let messages = (1..=25)
            .map(|id| RawMessage {
                id,
                sender_id: Some(101 + id % 3),
                text: Some(if id % 5 == 0 {
                    format!("status update {id}, anything blocking?")
                } else {
                    format!("working through item {id}")
                }),
                timestamp: now - Duration::minutes(25 - id),
                reply_to_id: None,
                forwarded_from: None,
            })
            .collect();
        Ok(Arc::new(DemoSource { messages }) as Arc<dyn MessageSource>)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for logging (optional)
    // Uncomment if you add tracing-subscriber to your dependencies:
    // tracing_subscriber::fmt::init();

    // Create a harvester over the demo source
    let harvester = ChatHarvester::new(Config::default(), Arc::new(DemoConnector)).await?;

    // Fetch the 10 newest messages
    let records = harvester
        .fetch(
            &GroupRef::Handle("demo_group".to_string()),
            FetchOptions {
                limit: Some(10),
                ..FetchOptions::default()
            },
        )
        .await?;

    println!("Fetched {} messages (newest first):", records.len());
    for record in &records {
        println!(
            "  [{}] {} {}: {}",
            record.message_id,
            record.timestamp.format("%H:%M"),
            record.sender_name,
            record.text.as_deref().unwrap_or("<no text>")
        );
    }

    // Client-side helpers: slice the fetched batch without touching the source
    let from_ana = util::filter_by_sender(records.clone(), 101);
    println!("\n{} of them were sent by Ana", from_ana.len());

    let questions = util::filter_by_content(records.clone(), r"\?$")?;
    println!("{} of them end in a question", questions.len());

    let stats = util::message_statistics(&records);
    println!(
        "{} messages from {} senders, {} with text",
        stats.total, stats.unique_senders, stats.with_text
    );
    if let Some((oldest, newest)) = stats.date_range {
        println!("spanning {} .. {}", oldest.format("%H:%M"), newest.format("%H:%M"));
    }

    harvester.close().await;
    Ok(())
}
