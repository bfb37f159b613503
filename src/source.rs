//! Upstream change sources.
//!
//! A [`StateSource`] raises payload-free "changed" notifications and answers
//! synchronous snapshot reads. The registry never trusts a notification for
//! content; it always re-reads the snapshot, so a lost or coalesced
//! notification is harmless.
//!
//! Two sources ship with the crate:
//! - [`SignalSource`]: emits synchronously to every handler, like a toolkit
//!   "changed" signal.
//! - [`WatchSource`]: backed by [`tokio::sync::watch`]; handlers run on a
//!   forwarding task per connection.

use crate::error::{HooksError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handler invoked on every upstream change.
pub type ChangeHandler = Arc<dyn Fn() + Send + Sync + 'static>;

/// Handle to a connected change handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceConnection(u64);

/// Upstream state the registry delivers to subscribers.
pub trait StateSource: Send + Sync + 'static {
    /// Value handed to subscriber callbacks.
    type Snapshot: Send + Sync + 'static;

    /// Current state, read synchronously.
    fn snapshot(&self) -> Self::Snapshot;

    /// Connect a handler to the "changed" notification.
    fn connect_changed(&self, handler: ChangeHandler) -> SourceConnection;

    /// Disconnect a previously connected handler.
    ///
    /// # Errors
    ///
    /// Returns [`HooksError::InvalidArgument`] for an unknown connection.
    fn disconnect(&self, connection: SourceConnection) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn unknown_connection(connection: SourceConnection) -> HooksError {
    HooksError::InvalidArgument(format!("unknown source connection {}", connection.0))
}

/// Synchronous signal-style source.
///
/// [`set`](Self::set) and [`emit`](Self::emit) call every connected handler on
/// the caller's stack, outside any internal lock.
pub struct SignalSource<T> {
    state: Mutex<T>,
    handlers: Mutex<Vec<(SourceConnection, ChangeHandler)>>,
    next_id: AtomicU64,
}

impl<T> std::fmt::Debug for SignalSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSource")
            .field("handlers", &lock(&self.handlers).len())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> SignalSource<T> {
    /// Create a source holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            state: Mutex::new(initial),
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Replace the state and notify.
    pub fn set(&self, value: T) {
        *lock(&self.state) = value;
        self.emit();
    }

    /// Mutate the state in place and notify.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut lock(&self.state));
        self.emit();
    }

    /// Notify every handler without changing the state.
    pub fn emit(&self) {
        let handlers: Vec<ChangeHandler> = lock(&self.handlers)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler();
        }
    }

    /// Number of connected handlers.
    pub fn handler_count(&self) -> usize {
        lock(&self.handlers).len()
    }
}

impl<T: Clone + Send + Sync + 'static> StateSource for SignalSource<T> {
    type Snapshot = T;

    fn snapshot(&self) -> T {
        lock(&self.state).clone()
    }

    fn connect_changed(&self, handler: ChangeHandler) -> SourceConnection {
        let connection = SourceConnection(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.handlers).push((connection, handler));
        connection
    }

    fn disconnect(&self, connection: SourceConnection) -> Result<()> {
        let mut handlers = lock(&self.handlers);
        let Some(pos) = handlers.iter().position(|(id, _)| *id == connection) else {
            return Err(unknown_connection(connection));
        };
        handlers.remove(pos);
        Ok(())
    }
}

/// Source backed by a [`watch`] channel.
///
/// Each connection gets a forwarding task that waits on
/// [`watch::Receiver::changed`] and calls the handler. Several publishes that
/// land before the task runs collapse into one notification.
pub struct WatchSource<T> {
    tx: watch::Sender<T>,
    handle: Handle,
    connections: Mutex<HashMap<SourceConnection, CancellationToken>>,
    next_id: AtomicU64,
}

impl<T> std::fmt::Debug for WatchSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSource")
            .field("connections", &lock(&self.connections).len())
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> WatchSource<T> {
    /// Create a source on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HooksError::Timer`] when called outside a tokio runtime.
    pub fn new(initial: T) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| HooksError::Timer(format!("no tokio runtime: {e}")))?;
        let (tx, _rx) = watch::channel(initial);
        Ok(Self {
            tx,
            handle,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Replace the state and notify.
    pub fn publish(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Mutate the state in place and notify.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }
}

impl<T: Clone + Send + Sync + 'static> StateSource for WatchSource<T> {
    type Snapshot = T;

    fn snapshot(&self) -> T {
        self.tx.borrow().clone()
    }

    fn connect_changed(&self, handler: ChangeHandler) -> SourceConnection {
        let connection = SourceConnection(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        lock(&self.connections).insert(connection, token.clone());

        let mut rx = self.tx.subscribe();
        self.handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        handler();
                    }
                }
            }
            debug!(connection = connection.0, "watch forwarder stopped");
        });
        connection
    }

    fn disconnect(&self, connection: SourceConnection) -> Result<()> {
        match lock(&self.connections).remove(&connection) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(unknown_connection(connection)),
        }
    }
}

impl<T> Drop for WatchSource<T> {
    fn drop(&mut self) {
        for (_, token) in lock(&self.connections).drain() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_handler() -> (ChangeHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handler: ChangeHandler = Arc::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        (handler, seen)
    }

    #[test]
    fn signal_source_notifies_synchronously() {
        let source = SignalSource::new(1_u32);
        let (handler, seen) = counting_handler();
        source.connect_changed(handler);

        source.set(2);
        source.update(|v| *v += 1);
        source.emit();

        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(source.snapshot(), 3);
    }

    fn describe<T>(source: &SignalSource<T>) -> String {
        format!("{source:?}")
    }

    #[test]
    fn signal_source_debug_reports_handler_count() {
        let source = SignalSource::new(0_u8);
        let (handler, _seen) = counting_handler();
        source.connect_changed(handler);
        assert_eq!(describe(&source), "SignalSource { handlers: 1 }");
    }

    #[test]
    fn signal_source_disconnect_stops_notifications() {
        let source = SignalSource::new(());
        let (handler, seen) = counting_handler();
        let connection = source.connect_changed(handler);

        source.disconnect(connection).unwrap();
        source.emit();

        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(source.handler_count(), 0);
        assert!(matches!(
            source.disconnect(connection),
            Err(HooksError::InvalidArgument(_))
        ));
    }

    #[test]
    fn signal_source_handler_may_reenter() {
        let source = Arc::new(SignalSource::new(0_u32));
        let weak = Arc::downgrade(&source);
        let reads = Arc::new(AtomicUsize::new(0));
        let reads_in = Arc::clone(&reads);
        source.connect_changed(Arc::new(move || {
            if let Some(source) = weak.upgrade() {
                reads_in.fetch_add(source.snapshot() as usize, Ordering::SeqCst);
            }
        }));

        source.set(7);
        assert_eq!(reads.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_source_forwards_changes() {
        let source = WatchSource::new(String::from("offline")).unwrap();
        let (handler, seen) = counting_handler();
        source.connect_changed(handler);
        tokio::task::yield_now().await;

        source.publish(String::from("online"));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(source.snapshot(), "online");
    }

    #[tokio::test(start_paused = true)]
    async fn watch_source_disconnect_cancels_forwarder() {
        let source = WatchSource::new(0_u8).unwrap();
        let (handler, seen) = counting_handler();
        let connection = source.connect_changed(handler);
        assert_eq!(source.connection_count(), 1);

        source.disconnect(connection).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        source.update(|v| *v = 9);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(source.connection_count(), 0);
        assert!(source.disconnect(connection).is_err());
    }
}
