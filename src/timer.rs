//! Timer host used by the registry for debounce, initial delivery and compaction.
//!
//! The registry never sleeps itself; it asks a [`TimerHost`] to call it back
//! later and keeps the returned [`TimerId`] so it can cancel the request.
//! [`TokioTimers`] is the production host: every timer is a small tokio task
//! racing its deadline against a [`CancellationToken`].

use crate::error::{HooksError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Callback run once when a timeout expires.
pub type OnceCallback = Box<dyn FnOnce() + Send + 'static>;

/// Callback run on every interval tick. Returning `false` stops the interval.
pub type RepeatCallback = Box<dyn FnMut() -> bool + Send + 'static>;

/// Handle to a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Raw numeric value (for logging).
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Scheduler collaborator: "call me back after D" and "call me every D".
///
/// Implementations must never run a callback synchronously from inside
/// [`timeout`](Self::timeout) or [`interval`](Self::interval); callers arm
/// timers while holding their own locks.
pub trait TimerHost: Send + Sync + 'static {
    /// Run `callback` once after `delay`.
    fn timeout(&self, delay: Duration, callback: OnceCallback) -> TimerId;

    /// Run `callback` every `period` until it returns `false` or the timer is cancelled.
    fn interval(&self, period: Duration, callback: RepeatCallback) -> TimerId;

    /// Cancel a pending timer. Returns `false` if it already fired or was cancelled.
    fn cancel(&self, id: TimerId) -> bool;
}

type TimerMap = HashMap<TimerId, CancellationToken>;
type ActiveTimers = Arc<Mutex<TimerMap>>;

/// [`TimerHost`] backed by tokio tasks.
///
/// Dropping the host cancels every outstanding timer.
pub struct TokioTimers {
    handle: Handle,
    root: CancellationToken,
    next_id: AtomicU64,
    active: ActiveTimers,
}

impl std::fmt::Debug for TokioTimers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioTimers")
            .field("active", &self.active_count())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl TokioTimers {
    /// Create a host on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HooksError::Timer`] when called outside a tokio runtime.
    pub fn new() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| HooksError::Timer(format!("no tokio runtime: {e}")))?;
        Ok(Self::with_handle(handle))
    }

    /// Create a host that spawns its timer tasks on `handle`.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            root: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of timers armed and not yet fired, finished or cancelled.
    pub fn active_count(&self) -> usize {
        lock_active(&self.active).len()
    }

    fn arm(&self) -> (TimerId, CancellationToken) {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = self.root.child_token();
        lock_active(&self.active).insert(id, token.clone());
        (id, token)
    }
}

impl TimerHost for TokioTimers {
    fn timeout(&self, delay: Duration, callback: OnceCallback) -> TimerId {
        let (id, token) = self.arm();
        let deadline = Instant::now() + delay;
        let active = Arc::clone(&self.active);

        self.handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    // A cancel that raced the deadline already removed the entry.
                    if release(&active, id) {
                        callback();
                    }
                }
            }
        });
        id
    }

    fn interval(&self, period: Duration, mut callback: RepeatCallback) -> TimerId {
        let (id, token) = self.arm();
        let period = period.max(Duration::from_millis(1));
        let start = Instant::now() + period;
        let active = Arc::clone(&self.active);

        self.handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if token.is_cancelled() || !callback() {
                            break;
                        }
                    }
                }
            }
            release(&active, id);
            debug!(timer = id.get(), "interval stopped");
        });
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        match lock_active(&self.active).remove(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        self.root.cancel();
        lock_active(&self.active).clear();
    }
}

fn lock_active(active: &Mutex<TimerMap>) -> MutexGuard<'_, TimerMap> {
    active.lock().unwrap_or_else(|e| e.into_inner())
}

fn release(active: &Mutex<TimerMap>, id: TimerId) -> bool {
    lock_active(active).remove(&id).is_some()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (Arc::clone(&count), count)
    }

    #[test]
    fn new_outside_runtime_fails() {
        assert!(matches!(TokioTimers::new(), Err(HooksError::Timer(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_after_delay() {
        let timers = TokioTimers::new().unwrap();
        let (count, seen) = counter();
        timers.timeout(
            Duration::from_millis(50),
            Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(timers.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timeout_never_fires() {
        let timers = TokioTimers::new().unwrap();
        let (count, seen) = counter();
        let id = timers.timeout(
            Duration::from_millis(50),
            Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_repeats_until_callback_returns_false() {
        let timers = TokioTimers::new().unwrap();
        let (count, seen) = counter();
        timers.interval(
            Duration::from_millis(100),
            Box::new(move || count.fetch_add(1, Ordering::SeqCst) + 1 < 3),
        );

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(timers.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_interval_stops_ticking() {
        let timers = TokioTimers::new().unwrap();
        let (count, seen) = counter();
        let id = timers.interval(
            Duration::from_millis(100),
            Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
                true
            }),
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        assert!(timers.cancel(id));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_host_cancels_outstanding_timers() {
        let timers = TokioTimers::new().unwrap();
        let (count, seen) = counter();
        timers.timeout(
            Duration::from_millis(50),
            Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }),
        );
        drop(timers);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
