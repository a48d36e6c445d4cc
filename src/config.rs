//! Configuration types for chat-harvest

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Top-level library configuration
///
/// All fields have sensible defaults; `Config::default()` yields a working
/// single-session, in-memory-dedup setup. The crate performs no config-file
/// I/O; callers deserialize this from wherever they keep settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Session pool settings
    #[serde(flatten)]
    pub connection: ConnectionConfig,

    /// Polling defaults
    #[serde(flatten)]
    pub polling: PollingConfig,

    /// Deduplication settings
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Retry behavior for transient session-connect failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Data storage and state management
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Session pool configuration
///
/// Groups settings for how sessions to the remote source are created and
/// reused. Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Maximum concurrent sessions (default: 1)
    ///
    /// Each session backs at most one in-flight fetch/search/poll iteration;
    /// raising this allows that many operations to proceed in parallel.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Health-check ping timeout per session (default: 10 seconds)
    #[serde(default = "default_ping_timeout", with = "duration_serde")]
    pub ping_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            ping_timeout: default_ping_timeout(),
        }
    }
}

/// Polling configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Default interval between poll iterations (default: 60 seconds)
    ///
    /// Used when `PollOptions` does not specify an interval.
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
        }
    }
}

/// Deduplication configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Enable deduplication (default: true)
    ///
    /// When disabled the facade wires a no-op tracker, so every fetched
    /// message is treated as new.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bound on the in-memory tracker (default: None = unbounded)
    ///
    /// When set, the least-recently-seen identities are evicted once the
    /// tracker holds this many entries.
    #[serde(default)]
    pub max_tracked: Option<usize>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tracked: None,
        }
    }
}

/// Retry configuration for transient session-connect failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before the first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each attempt (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Data storage and state management configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Sqlite database path for the persistent tracker backend
    ///
    /// When set, the facade selects the sqlite tracker (with checkpoint
    /// support) instead of the in-memory one. `None` keeps tracking
    /// process-local.
    #[serde(default)]
    pub tracker_db: Option<PathBuf>,
}

// Default value functions

fn default_pool_size() -> usize {
    1
}

fn default_ping_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
