//! # chat-harvest
//!
//! Backend library for harvesting messages from remote chat groups.
//!
//! ## Design Philosophy
//!
//! chat-harvest is designed to be:
//! - **Source-agnostic** - The wire protocol lives behind a trait; any
//!   client that can resolve groups and stream messages plugs in
//! - **Resumable** - Rate limits are waited out mid-fetch and long-running
//!   polls checkpoint their cursor, so interrupted runs pick up where they
//!   left off
//! - **Deduplicated** - A pluggable tracker remembers which messages were
//!   already ingested, across runs when backed by sqlite
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chat_harvest::{ChatHarvester, Config, FetchOptions, GroupRef};
//!
//! # struct MyConnector;
//! # #[async_trait::async_trait]
//! # impl chat_harvest::SessionConnector for MyConnector {
//! #     async fn connect(
//! #         &self,
//! #     ) -> Result<Arc<dyn chat_harvest::MessageSource>, chat_harvest::SourceError> {
//! #         unimplemented!("wrap your protocol client here")
//! #     }
//! # }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // MyConnector wraps your protocol client as a SessionConnector.
//!     let harvester = ChatHarvester::new(Config::default(), Arc::new(MyConnector)).await?;
//!
//!     // Newest 100 messages, deduplicated against earlier runs.
//!     let records = harvester
//!         .fetch(
//!             &GroupRef::Handle("rustlang".into()),
//!             FetchOptions {
//!                 limit: Some(100),
//!                 ..FetchOptions::default()
//!             },
//!         )
//!         .await?;
//!     for record in &records {
//!         println!("{} {}: {:?}", record.timestamp, record.sender_name, record.text);
//!     }
//!
//!     harvester.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Session pool and rate-limit absorption
pub mod connection;
/// Live event dispatch
pub mod dispatch;
/// Message fetch, search, and count
pub mod engine;
/// Error types
pub mod error;
/// Top-level pipeline facade
pub mod harvester;
/// Scheduled incremental polling
pub mod polling;
/// Progress accounting for long fetches
pub mod progress;
/// Retry logic with exponential backoff
pub mod retry;
/// Remote source and session traits
pub mod source;
/// Deduplication tracker backends
pub mod tracker;
/// Core types
pub mod types;
/// Client-side record utilities
pub mod util;

// Re-export commonly used types
pub use config::{Config, ConnectionConfig, DedupConfig, PollingConfig, RetryConfig};
pub use connection::{ConnectionManager, HealthReport, SessionHandle, SessionStatus};
pub use dispatch::EventDispatcher;
pub use engine::{FetchOptions, MessageEngine};
pub use error::{Error, Result, SourceError, TrackerError};
pub use harvester::ChatHarvester;
pub use polling::{PollOptions, PollReport, PollingCoordinator};
pub use progress::{ProgressObserver, ProgressTracker, ProgressUpdate};
pub use source::{
    IterParams, MessageSource, MessageStream, SessionConnector, SourceCapabilities,
};
pub use tracker::{InMemoryTracker, MessageTracker, NoOpTracker, SqliteTracker, TrackerStats};
pub use types::{
    Checkpoint, GroupIdentity, GroupRef, LiveEvent, MessageRecord, ProcessedMessage, RawMessage,
    SenderInfo,
};

/// Helper function to run the event dispatcher with graceful signal handling.
///
/// Dispatches live events until a termination signal arrives, then stops the
/// dispatcher and closes the harvester.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Errors
///
/// Propagates dispatcher failures, most commonly a source without live-event
/// support.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use chat_harvest::{ChatHarvester, Config, run_events_with_shutdown};
///
/// # struct MyConnector;
/// # #[async_trait::async_trait]
/// # impl chat_harvest::SessionConnector for MyConnector {
/// #     async fn connect(
/// #         &self,
/// #     ) -> Result<Arc<dyn chat_harvest::MessageSource>, chat_harvest::SourceError> {
/// #         unimplemented!()
/// #     }
/// # }
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let harvester = ChatHarvester::new(Config::default(), Arc::new(MyConnector)).await?;
///     harvester
///         .on_new_message(None, |event| async move {
///             println!("group {}: {:?}", event.group_id, event.message.text);
///             Ok(())
///         })
///         .await;
///
///     // Blocks until SIGTERM / Ctrl+C
///     run_events_with_shutdown(harvester).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_events_with_shutdown(harvester: ChatHarvester) -> Result<()> {
    let result = tokio::select! {
        result = harvester.run_events() => result,
        _ = wait_for_signal() => {
            harvester.stop_events();
            Ok(())
        }
    };
    harvester.close().await;
    result
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
