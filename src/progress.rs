//! Progress accounting for long-running fetch operations
//!
//! The ProgressTracker counts processed messages, derives throughput from a
//! monotonic clock, and estimates time to completion when an expected total
//! is known. It holds no locks and talks to nothing; callers own one
//! instance per operation and drive it directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot handed to the observer after every update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    /// Items processed so far
    pub current: u64,
    /// Expected total, when known
    pub total: Option<u64>,
    /// Items per second since [`ProgressTracker::start`]
    pub rate: f64,
}

/// Observer invoked after every update
///
/// The call is synchronous on the updating task; a panic inside the
/// observer propagates to the caller unchanged.
pub type ProgressObserver = dyn Fn(ProgressUpdate) + Send + Sync;

/// Counts processed items and derives rate and ETA
///
/// # Examples
///
/// ```
/// use chat_harvest::progress::ProgressTracker;
///
/// let mut progress = ProgressTracker::new(Some(500));
/// progress.start();
/// progress.update(25);
///
/// assert_eq!(progress.current(), 25);
/// assert_eq!(progress.total_expected(), Some(500));
/// ```
pub struct ProgressTracker {
    /// Monotonically increasing count of processed items
    current: u64,
    /// Expected total, when the caller knows it up front
    total_expected: Option<u64>,
    /// Origin time recorded by `start()`; rate is zero until then
    started_at: Option<Instant>,
    /// Optional synchronous observer
    observer: Option<Arc<ProgressObserver>>,
}

impl ProgressTracker {
    /// Create a tracker, optionally with a known expected total
    #[must_use]
    pub fn new(total_expected: Option<u64>) -> Self {
        Self {
            current: 0,
            total_expected,
            started_at: None,
            observer: None,
        }
    }

    /// Attach an observer that is invoked synchronously on every update
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use chat_harvest::progress::ProgressTracker;
    ///
    /// let mut progress = ProgressTracker::new(None).with_observer(Arc::new(
    ///     |update| {
    ///         println!("{} messages ({:.1}/s)", update.current, update.rate);
    ///     },
    /// ));
    /// progress.start();
    /// progress.update(1);
    /// ```
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Record the origin time for rate calculations
    ///
    /// Updates made before `start()` still count, but report a rate of zero.
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Add `delta` processed items and notify the observer, if any
    pub fn update(&mut self, delta: u64) {
        self.current += delta;
        if let Some(observer) = &self.observer {
            observer(ProgressUpdate {
                current: self.current,
                total: self.total_expected,
                rate: self.rate(),
            });
        }
    }

    /// Number of items processed so far
    #[must_use]
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Expected total, if one was supplied
    #[must_use]
    pub fn total_expected(&self) -> Option<u64> {
        self.total_expected
    }

    /// Time elapsed since `start()`, or zero if never started
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO)
    }

    /// Items per second since `start()`
    ///
    /// Returns 0.0 before `start()` or before any measurable time has passed.
    #[must_use]
    pub fn rate(&self) -> f64 {
        let elapsed_secs = self.elapsed().as_secs_f64();
        if elapsed_secs > 0.0 {
            self.current as f64 / elapsed_secs
        } else {
            0.0
        }
    }

    /// Estimated time remaining
    ///
    /// Returns None when no expected total was supplied or the rate is still
    /// zero. Returns `Duration::ZERO` once `current` has reached the total.
    #[must_use]
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total_expected?;
        if self.current >= total {
            return Some(Duration::ZERO);
        }
        let rate = self.rate();
        if rate <= 0.0 {
            return None;
        }
        let remaining = (total - self.current) as f64 / rate;
        Some(Duration::from_secs_f64(remaining))
    }
}
