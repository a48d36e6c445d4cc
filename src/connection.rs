//! Session pool and rate-limit absorption
//!
//! The ConnectionManager owns up to `pool_size` authenticated sessions to the
//! remote source. Callers acquire a [`SessionHandle`] for the duration of one
//! fetch, search, or poll iteration; dropping the handle returns the session
//! to the pool. Rate-limit signals from the source are waited out here,
//! never surfaced as failures; authentication failures are fatal and
//! propagate unchanged.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::config::{ConnectionConfig, RetryConfig};
use crate::error::{Error, Result, SourceError};
use crate::retry::connect_with_retry;
use crate::source::{MessageSource, SessionConnector};

/// Status of one pooled session at health-check time
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Pool-unique session id
    pub id: u64,
    /// Whether the session was serving an operation when checked
    pub busy: bool,
    /// Ping outcome; `None` when the session was busy and not probed
    pub healthy: Option<bool>,
    /// When the session was established
    pub connected_at: DateTime<Utc>,
}

/// Point-in-time view of the session pool
#[must_use]
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// When the check ran
    pub checked_at: DateTime<Utc>,
    /// One entry per pooled session
    pub sessions: Vec<SessionStatus>,
}

/// One authenticated session held inside the pool
struct PooledSession {
    id: u64,
    source: Arc<dyn MessageSource>,
    busy: Arc<AtomicBool>,
    connected_at: DateTime<Utc>,
}

/// Exclusive use of one pooled session
///
/// Holds a concurrency permit for its lifetime; dropping the handle marks
/// the session idle and lets the next waiter proceed.
pub struct SessionHandle {
    source: Arc<dyn MessageSource>,
    busy: Arc<AtomicBool>,
    _permit: OwnedSemaphorePermit,
}

impl SessionHandle {
    /// The session's message source
    #[must_use]
    pub fn source(&self) -> &Arc<dyn MessageSource> {
        &self.source
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("source", &self.source.name())
            .field("busy", &self.busy)
            .finish_non_exhaustive()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        // Cleared before the permit is released (fields drop after this
        // body), so a waiter never observes a busy session whose holder
        // has no permit.
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Pool of authenticated sessions with rate-limit absorption
///
/// Sessions are created lazily through the [`SessionConnector`], verified by
/// ping on reuse, and discarded when they stop answering. A session is only
/// ever created while holding a concurrency permit and only when every
/// pooled session is busy; busy sessions each pin a permit, so the pool
/// never exceeds `pool_size`.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use chat_harvest::config::{ConnectionConfig, RetryConfig};
/// use chat_harvest::connection::ConnectionManager;
/// use chat_harvest::source::SessionConnector;
///
/// # async fn example(connector: Arc<dyn SessionConnector>) -> chat_harvest::Result<()> {
/// let manager = ConnectionManager::new(
///     connector,
///     ConnectionConfig::default(),
///     RetryConfig::default(),
/// )?;
///
/// let session = manager.acquire().await?;
/// // ... drive a fetch through session.source() ...
/// drop(session);
///
/// manager.close().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager {
    connector: Arc<dyn SessionConnector>,
    connection: ConnectionConfig,
    retry: RetryConfig,
    semaphore: Arc<Semaphore>,
    sessions: Mutex<Vec<PooledSession>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connection", &self.connection)
            .field("retry", &self.retry)
            .field("next_id", &self.next_id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager over the given connector
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `pool_size` is zero.
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        connection: ConnectionConfig,
        retry: RetryConfig,
    ) -> Result<Self> {
        if connection.pool_size == 0 {
            return Err(Error::Config {
                message: "pool_size must be at least 1".to_string(),
                key: Some("connection.pool_size".to_string()),
            });
        }

        Ok(Self {
            connector,
            semaphore: Arc::new(Semaphore::new(connection.pool_size)),
            connection,
            retry,
            sessions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Acquire exclusive use of a ready session
    ///
    /// Reuses an idle pooled session when one answers a ping; otherwise
    /// establishes a new one. Waits when all `pool_size` sessions are in
    /// use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`close`](Self::close), and surfaces
    /// authentication or persistent connection failures from session
    /// establishment. Rate limits during establishment are waited out, not
    /// surfaced.
    pub async fn acquire(&self) -> Result<SessionHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed)?;

        // Reuse: claim an idle session, discarding any that no longer answer.
        loop {
            let claimed = {
                let sessions = self.sessions.lock().await;
                sessions.iter().find_map(|session| {
                    session
                        .busy
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                        .then(|| (session.id, Arc::clone(&session.source), Arc::clone(&session.busy)))
                })
            };

            let Some((id, source, busy)) = claimed else {
                break;
            };

            match tokio::time::timeout(self.connection.ping_timeout, source.ping()).await {
                Ok(Ok(())) => {
                    tracing::debug!(session_id = id, "Reusing pooled session");
                    return Ok(SessionHandle {
                        source,
                        busy,
                        _permit: permit,
                    });
                }
                Ok(Err(e)) => {
                    tracing::warn!(session_id = id, error = %e, "Discarding dead pooled session");
                }
                Err(_) => {
                    tracing::warn!(
                        session_id = id,
                        timeout_secs = self.connection.ping_timeout.as_secs(),
                        "Discarding unresponsive pooled session"
                    );
                }
            }

            let mut sessions = self.sessions.lock().await;
            sessions.retain(|session| session.id != id);
        }

        // All pooled sessions are busy (each pinned by a permit holder), so
        // there is room for one more.
        let source = self.connect_session().await?;
        let busy = Arc::new(AtomicBool::new(true));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut sessions = self.sessions.lock().await;
            sessions.push(PooledSession {
                id,
                source: Arc::clone(&source),
                busy: Arc::clone(&busy),
                connected_at: Utc::now(),
            });
        }
        tracing::info!(session_id = id, source = source.name(), "Established new session");

        Ok(SessionHandle {
            source,
            busy,
            _permit: permit,
        })
    }

    /// Establish one session, retrying transient failures and absorbing
    /// rate limits
    async fn connect_session(&self) -> Result<Arc<dyn MessageSource>> {
        loop {
            let connector = Arc::clone(&self.connector);
            let result = connect_with_retry(&self.retry, move || {
                let connector = Arc::clone(&connector);
                async move { connector.connect().await }
            })
            .await;

            match result {
                Ok(source) => return Ok(source),
                Err(SourceError::RateLimited { retry_after }) => {
                    self.handle_rate_limit(retry_after).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to establish session");
                    return Err(e.into());
                }
            }
        }
    }

    /// Wait out a rate-limit signal from the remote source
    ///
    /// Never fails: the instructed duration is logged and slept, after which
    /// the caller retries its operation.
    pub async fn handle_rate_limit(&self, retry_after: Duration) {
        tracing::warn!(
            wait_secs = retry_after.as_secs(),
            "Rate limited by remote source, waiting before retry"
        );
        tokio::time::sleep(retry_after).await;
    }

    /// Probe every pooled session and report its status
    ///
    /// Idle sessions are pinged (bounded by the configured ping timeout);
    /// sessions that are busy, or idle but unreachable because the pool is
    /// saturated, are reported without probing.
    pub async fn health_check(&self) -> HealthReport {
        let snapshot: Vec<_> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|session| {
                    (
                        session.id,
                        Arc::clone(&session.source),
                        Arc::clone(&session.busy),
                        session.connected_at,
                    )
                })
                .collect()
        };

        let mut statuses = Vec::with_capacity(snapshot.len());
        for (id, source, busy, connected_at) in snapshot {
            // Probing counts as using the session, so it needs a permit like
            // any other use.
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                statuses.push(SessionStatus {
                    id,
                    busy: busy.load(Ordering::SeqCst),
                    healthy: None,
                    connected_at,
                });
                continue;
            };

            if busy
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let healthy = matches!(
                    tokio::time::timeout(self.connection.ping_timeout, source.ping()).await,
                    Ok(Ok(()))
                );
                busy.store(false, Ordering::SeqCst);
                drop(permit);
                statuses.push(SessionStatus {
                    id,
                    busy: false,
                    healthy: Some(healthy),
                    connected_at,
                });
            } else {
                drop(permit);
                statuses.push(SessionStatus {
                    id,
                    busy: true,
                    healthy: None,
                    connected_at,
                });
            }
        }

        HealthReport {
            checked_at: Utc::now(),
            sessions: statuses,
        }
    }

    /// Number of sessions currently pooled
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Configured maximum number of concurrent sessions
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.connection.pool_size
    }

    /// Shut the pool down
    ///
    /// Pending and future [`acquire`](Self::acquire) calls fail with
    /// [`Error::Closed`]; pooled sessions are disconnected. Operations still
    /// running on an outstanding [`SessionHandle`] may fail once their
    /// session is torn down.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.semaphore.close();

        let drained: Vec<PooledSession> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain(..).collect()
        };
        for session in drained {
            if let Err(e) = session.source.disconnect().await {
                tracing::debug!(
                    session_id = session.id,
                    error = %e,
                    "Session disconnect failed during close"
                );
            }
        }
        tracing::info!("Connection manager closed");
    }
}
