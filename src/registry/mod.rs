//! Resilient notification registry.
//!
//! Sits between one upstream [`StateSource`] and many subscriber callbacks:
//!
//! ```text
//! upstream change ─> debounce timer ─> dispatch sweep ─> callbacks
//!                                            │
//!                                  slot table + liveness check
//!                                            │
//!                                  periodic compaction sweep
//! ```
//!
//! - A burst of upstream changes re-arms a single debounce timer; one sweep
//!   runs after the burst goes quiet, delivering the freshly read snapshot.
//! - Each subscription lives in a slot with a stable [`SlotIndex`]. A
//!   subscriber that is destroyed, released, or detached is tombstoned in
//!   place and never delivered to again.
//! - A recurring compaction sweep rechecks liveness, detaches leftover
//!   destroy hooks and returns dead indices to the free pool.
//!
//! All work is expected to run on one logical event loop. No internal lock
//! is held while subscriber, callback or source code runs, so callbacks may
//! register, unregister or even destroy the registry.

mod slots;

pub use slots::SlotIndex;

use crate::config::RegistryConfig;
use crate::error::{HooksError, Result};
use crate::source::{SourceConnection, StateSource};
use crate::subscriber::{Subscriber, is_live};
use crate::timer::{TimerHost, TimerId};
use slots::{SlotKey, SlotTable};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Callback invoked with the latest upstream snapshot.
///
/// Returning [`HooksError::SubscriberInvalid`] tombstones the slot; any other
/// error (or a panic) is contained and the slot stays registered.
pub type SubscriberCallback<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync + 'static>;

/// Point-in-time view of the registry for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Slots with a live subscription.
    pub live: usize,
    /// Slots tombstoned and awaiting compaction.
    pub tombstoned: usize,
    /// Reclaimed slots whose index is in the free pool.
    pub vacant: usize,
    /// Total slot storage (live + tombstoned + vacant).
    pub capacity: usize,
    /// Whether a debounced dispatch is armed.
    pub dispatch_pending: bool,
    /// Dispatch sweeps run.
    pub sweeps: u64,
    /// Callback invocations that returned `Ok`, including initial deliveries.
    pub deliveries: u64,
    /// Callback invocations that failed or panicked.
    pub callback_failures: u64,
    /// Compaction sweeps run.
    pub compactions: u64,
    /// Slots reclaimed by compaction.
    pub reclaimed: u64,
    /// Whether [`NotificationRegistry::destroy`] has run.
    pub destroyed: bool,
}

/// Outcome of one compaction sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Slots reclaimed (tombstoned, or found dead on recheck).
    pub reclaimed: usize,
    /// Trailing vacant entries released from storage.
    pub trimmed: usize,
    /// Live slots remaining.
    pub live: usize,
}

#[derive(Debug, Default)]
struct SweepReport {
    delivered: u64,
    tombstoned: u64,
    failed: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingDispatch {
    timer: TimerId,
    epoch: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sweeps: u64,
    deliveries: u64,
    callback_failures: u64,
    compactions: u64,
    reclaimed: u64,
}

struct State<T> {
    slots: SlotTable<T>,
    pending: Option<PendingDispatch>,
    dispatch_epoch: u64,
    compaction_timer: Option<TimerId>,
    connection: Option<SourceConnection>,
    counters: Counters,
}

struct Inner<S: StateSource> {
    source: Arc<S>,
    timers: Arc<dyn TimerHost>,
    config: RegistryConfig,
    destroyed: AtomicBool,
    state: Mutex<State<S::Snapshot>>,
    sweep_guard: Mutex<()>,
}

/// Debounced, self-healing subscriber registry for one upstream source.
///
/// Owned by the UI module it serves; dropping it tears it down.
pub struct NotificationRegistry<S: StateSource> {
    inner: Arc<Inner<S>>,
}

impl<S: StateSource> std::fmt::Debug for NotificationRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRegistry")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<S: StateSource> NotificationRegistry<S> {
    /// Connect to `source` and start the compaction interval.
    ///
    /// # Errors
    ///
    /// Returns [`HooksError::Config`] if `config` fails validation.
    pub fn new(
        source: Arc<S>,
        timers: Arc<dyn TimerHost>,
        config: RegistryConfig,
    ) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(Inner {
            source,
            timers,
            config,
            destroyed: AtomicBool::new(false),
            state: Mutex::new(State {
                slots: SlotTable::new(),
                pending: None,
                dispatch_epoch: 0,
                compaction_timer: None,
                connection: None,
                counters: Counters::default(),
            }),
            sweep_guard: Mutex::new(()),
        });

        let weak = Arc::downgrade(&inner);
        let connection = inner.source.connect_changed(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_upstream_changed();
            }
        }));

        let weak = Arc::downgrade(&inner);
        let compaction_timer = inner.timers.interval(
            inner.config.compaction_interval(),
            Box::new(move || match weak.upgrade() {
                Some(inner) => inner.on_compaction_tick(),
                None => false,
            }),
        );

        {
            let mut state = inner.lock();
            state.connection = Some(connection);
            state.compaction_timer = Some(compaction_timer);
        }

        info!(
            debounce_ms = inner.config.debounce_ms,
            compaction_interval_ms = inner.config.compaction_interval_ms,
            "notification registry created"
        );
        Ok(Self { inner })
    }

    /// Register `subscriber` to receive `callback(snapshot)` after upstream changes.
    ///
    /// The subscriber also receives the current snapshot once, shortly after
    /// registration, without waiting for an upstream change, provided it is
    /// still live by then.
    ///
    /// # Errors
    ///
    /// - [`HooksError::RegistryClosed`] after [`destroy`](Self::destroy).
    /// - [`HooksError::InvalidArgument`] when the subscriber's resource is
    ///   already released or it refuses a destroy hook.
    ///
    /// Neither error leaves any state behind.
    pub fn register<F>(&self, subscriber: Arc<dyn Subscriber>, callback: F) -> Result<SlotIndex>
    where
        F: Fn(&S::Snapshot) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.register(subscriber, Arc::new(callback))
    }

    /// Remove a subscription.
    ///
    /// Returns `false` (and does nothing) for an out-of-range or already
    /// removed index, or once the registry is destroyed.
    pub fn unregister(&self, index: SlotIndex) -> bool {
        self.inner.unregister(index)
    }

    /// Tear the registry down. Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    /// Run one compaction sweep now instead of waiting for the interval.
    pub fn compact_now(&self) -> CompactionReport {
        self.inner.compact()
    }

    /// Whether [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Timing this registry was built with.
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Current slot counts and lifetime counters.
    pub fn stats(&self) -> RegistryStats {
        let state = self.inner.lock();
        let counts = state.slots.counts();
        RegistryStats {
            live: counts.live,
            tombstoned: counts.tombstoned,
            vacant: counts.vacant,
            capacity: state.slots.len(),
            dispatch_pending: state.pending.is_some(),
            sweeps: state.counters.sweeps,
            deliveries: state.counters.deliveries,
            callback_failures: state.counters.callback_failures,
            compactions: state.counters.compactions,
            reclaimed: state.counters.reclaimed,
            destroyed: self.inner.is_destroyed(),
        }
    }
}

impl<S: StateSource> Drop for NotificationRegistry<S> {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl<S: StateSource> Inner<S> {
    fn lock(&self) -> MutexGuard<'_, State<S::Snapshot>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn register(
        self: &Arc<Self>,
        subscriber: Arc<dyn Subscriber>,
        callback: SubscriberCallback<S::Snapshot>,
    ) -> Result<SlotIndex> {
        if self.is_destroyed() {
            debug!(subscriber = %subscriber.label(), "registration rejected: registry closed");
            return Err(HooksError::RegistryClosed);
        }
        if let Err(e) = contain(|| subscriber.probe()) {
            debug!(subscriber = %subscriber.label(), error = %e, "registration rejected");
            return Err(HooksError::InvalidArgument(format!(
                "subscriber '{}' is not usable: {e}",
                subscriber.label()
            )));
        }

        let key = {
            let mut state = self.lock();
            if self.is_destroyed() {
                return Err(HooksError::RegistryClosed);
            }
            state.slots.insert(Arc::clone(&subscriber), callback)
        };

        let weak = Arc::downgrade(self);
        let hooked = contain(|| {
            subscriber.connect_destroy(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_subscriber_destroyed(key);
                }
            }))
        });
        let hook = match hooked {
            Ok(hook) => hook,
            Err(e) => {
                self.lock().slots.rollback(key);
                debug!(subscriber = %subscriber.label(), error = %e, "destroy hook refused");
                return Err(HooksError::InvalidArgument(format!(
                    "subscriber '{}' refused a destroy hook: {e}",
                    subscriber.label()
                )));
            }
        };

        let recorded = self.lock().slots.set_destroy_hook(key, hook);
        if !recorded {
            // Tombstoned or torn down between insert and hook; nothing owns the hook now.
            let _ = contain(|| subscriber.disconnect_destroy(hook));
            if self.is_destroyed() {
                debug!(subscriber = %subscriber.label(), "registry closed during registration");
                return Err(HooksError::RegistryClosed);
            }
        }

        self.schedule_initial_delivery(key);

        debug!(
            index = key.index,
            generation = key.generation,
            subscriber = %subscriber.label(),
            "subscriber registered"
        );
        Ok(SlotIndex::new(key.index))
    }

    fn schedule_initial_delivery(self: &Arc<Self>, key: SlotKey) {
        let weak = Arc::downgrade(self);
        self.timers.timeout(
            self.config.initial_delivery(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.deliver_initial(key);
                }
            }),
        );
    }

    fn deliver_initial(&self, key: SlotKey) {
        // Serialized with dispatch sweeps so an older snapshot never lands after a newer one.
        let _sweep = self.sweep_guard.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_destroyed() {
            return;
        }
        let Some(live) = self.lock().slots.live_for(key) else {
            return;
        };

        if !is_live(live.subscriber.as_ref()) {
            if self.lock().slots.tombstone(key) {
                debug!(
                    index = key.index,
                    subscriber = %live.subscriber.label(),
                    "subscriber not live at initial delivery, slot tombstoned"
                );
            }
            return;
        }
        if !self.lock().slots.is_current(key) {
            return;
        }

        let snapshot = self.source.snapshot();
        let outcome = deliver(&live.callback, &snapshot);
        self.record_delivery(key, outcome);
    }

    fn unregister(&self, index: SlotIndex) -> bool {
        if self.is_destroyed() {
            return false;
        }
        let Some(detach) = self.lock().slots.unregister(index.get()) else {
            return false;
        };
        if let Some(detach) = detach {
            detach.run();
        }
        debug!(index = index.get(), "subscriber unregistered");
        true
    }

    /// Runs inside the subscriber's own destroy notification: tombstone only.
    fn on_subscriber_destroyed(&self, key: SlotKey) {
        if self.is_destroyed() {
            return;
        }
        if self.lock().slots.tombstone_destroyed(key) {
            debug!(
                index = key.index,
                generation = key.generation,
                "subscriber destroyed, slot tombstoned"
            );
        }
    }

    fn on_upstream_changed(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        let mut state = self.lock();
        // Re-checked under the lock: destroy() cancels whatever is pending once it gets the lock.
        if self.is_destroyed() {
            return;
        }
        if let Some(previous) = state.pending.take() {
            self.timers.cancel(previous.timer);
        }

        state.dispatch_epoch += 1;
        let epoch = state.dispatch_epoch;
        let weak = Arc::downgrade(self);
        let timer = self.timers.timeout(
            self.config.debounce(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_debounce_elapsed(epoch);
                }
            }),
        );
        state.pending = Some(PendingDispatch { timer, epoch });
    }

    fn on_debounce_elapsed(&self, epoch: u64) {
        {
            let mut state = self.lock();
            match state.pending {
                Some(pending) if pending.epoch == epoch => state.pending = None,
                // Superseded by a newer change; the newer timer owns the sweep.
                _ => return,
            }
        }
        if self.is_destroyed() {
            return;
        }
        self.dispatch_sweep();
    }

    fn dispatch_sweep(&self) {
        let _sweep = self.sweep_guard.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_destroyed() {
            return;
        }

        let snapshot = self.source.snapshot();
        let upper = self.lock().slots.len();
        let mut report = SweepReport::default();

        for index in 0..upper {
            if self.is_destroyed() {
                break;
            }
            let Some(live) = self.lock().slots.live(index) else {
                continue;
            };

            if !is_live(live.subscriber.as_ref()) {
                if self.lock().slots.tombstone(live.key) {
                    report.tombstoned += 1;
                    debug!(
                        index,
                        subscriber = %live.subscriber.label(),
                        "subscriber no longer live, slot tombstoned"
                    );
                }
                continue;
            }
            // The liveness check ran subscriber code; the slot may have gone meanwhile.
            if !self.lock().slots.is_current(live.key) {
                continue;
            }

            match deliver(&live.callback, &snapshot) {
                Ok(()) => report.delivered += 1,
                Err(e) if e.signals_invalid_subscriber() => {
                    if self.lock().slots.tombstone(live.key) {
                        report.tombstoned += 1;
                    }
                    debug!(index, error = %e, "callback reported invalid subscriber, slot tombstoned");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        index,
                        subscriber = %live.subscriber.label(),
                        error = %e,
                        "subscriber callback failed"
                    );
                }
            }
        }

        {
            let mut state = self.lock();
            state.counters.sweeps += 1;
            state.counters.deliveries += report.delivered;
            state.counters.callback_failures += report.failed;
        }
        debug!(
            delivered = report.delivered,
            tombstoned = report.tombstoned,
            failed = report.failed,
            "dispatch sweep complete"
        );
    }

    fn record_delivery(&self, key: SlotKey, outcome: Result<()>) {
        match outcome {
            Ok(()) => self.lock().counters.deliveries += 1,
            Err(e) if e.signals_invalid_subscriber() => {
                self.lock().slots.tombstone(key);
                debug!(index = key.index, error = %e, "initial delivery found invalid subscriber");
            }
            Err(e) => {
                self.lock().counters.callback_failures += 1;
                warn!(index = key.index, error = %e, "initial delivery failed");
            }
        }
    }

    fn on_compaction_tick(&self) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.compact();
        !self.is_destroyed()
    }

    fn compact(&self) -> CompactionReport {
        if self.is_destroyed() {
            return CompactionReport::default();
        }

        let candidates = self.lock().slots.compaction_candidates();
        let doomed: Vec<SlotKey> = candidates
            .into_iter()
            .filter_map(|(key, subscriber)| match subscriber {
                Some(subscriber) if is_live(subscriber.as_ref()) => None,
                _ => Some(key),
            })
            .collect();

        let (detaches, report) = {
            let mut state = self.lock();
            if self.is_destroyed() {
                return CompactionReport::default();
            }
            let detaches: Vec<_> = doomed
                .into_iter()
                .filter_map(|key| state.slots.reclaim(key))
                .collect();
            let trimmed = state.slots.shrink();
            state.counters.compactions += 1;
            state.counters.reclaimed += detaches.len() as u64;
            let report = CompactionReport {
                reclaimed: detaches.len(),
                trimmed,
                live: state.slots.counts().live,
            };
            (detaches, report)
        };

        for detach in detaches.into_iter().flatten() {
            detach.run();
        }

        if report.reclaimed > 0 {
            debug!(
                reclaimed = report.reclaimed,
                trimmed = report.trimmed,
                live = report.live,
                "compaction sweep reclaimed slots"
            );
        }
        report
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (pending, compaction_timer, connection, detaches) = {
            let mut state = self.lock();
            (
                state.pending.take(),
                state.compaction_timer.take(),
                state.connection.take(),
                state.slots.drain(),
            )
        };

        if let Some(pending) = pending {
            self.timers.cancel(pending.timer);
        }
        if let Some(timer) = compaction_timer {
            self.timers.cancel(timer);
        }
        if let Some(connection) = connection {
            if let Err(e) = self.source.disconnect(connection) {
                debug!(error = %e, "upstream disconnect failed");
            }
        }

        let released = detaches.len();
        for detach in detaches {
            detach.run();
        }
        info!(released_hooks = released, "notification registry destroyed");
    }
}

/// Invoke a callback, turning a panic into [`HooksError::CallbackFailure`].
fn deliver<T>(callback: &SubscriberCallback<T>, snapshot: &T) -> Result<()> {
    contain(|| callback(snapshot))
}

/// Run subscriber-supplied code so that neither its error nor its panic escapes.
fn contain<R>(f: impl FnOnce() -> Result<R>) -> Result<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(HooksError::CallbackFailure(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_owned()
    }
}
