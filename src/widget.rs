//! Display-layer widget handle.
//!
//! [`WidgetHandle`] models a node in the toolkit's ownership tree: it can be
//! parented and unparented, destroyed (firing its destroy hooks), or released
//! behind everyone's back, which is the stale-handle case the registry's
//! liveness predicate exists for.

use crate::error::{HooksError, Result};
use crate::subscriber::{DestroyHook, HookId, Subscriber};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Alive,
    Destroying,
    Released,
}

struct WidgetState {
    parent: Option<String>,
    lifecycle: Lifecycle,
    hooks: Vec<(HookId, DestroyHook)>,
}

/// Handle to a widget owned by the display layer.
pub struct WidgetHandle {
    name: String,
    state: Mutex<WidgetState>,
    next_hook: AtomicU64,
}

impl std::fmt::Debug for WidgetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("WidgetHandle")
            .field("name", &self.name)
            .field("parent", &state.parent)
            .field("lifecycle", &state.lifecycle)
            .field("hooks", &state.hooks.len())
            .finish()
    }
}

impl WidgetHandle {
    /// Create an unparented widget.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(WidgetState {
                parent: None,
                lifecycle: Lifecycle::Alive,
                hooks: Vec::new(),
            }),
            next_hook: AtomicU64::new(1),
        })
    }

    /// Create a widget already attached to `parent`.
    pub fn attached(name: impl Into<String>, parent: impl Into<String>) -> Arc<Self> {
        let widget = Self::new(name);
        widget.attach(parent);
        widget
    }

    /// Parent the widget. Ignored once the widget is released.
    pub fn attach(&self, parent: impl Into<String>) {
        let mut state = self.lock();
        if state.lifecycle != Lifecycle::Released {
            state.parent = Some(parent.into());
        }
    }

    /// Remove the widget from its parent without destroying it.
    pub fn detach(&self) {
        self.lock().parent = None;
    }

    /// Current parent, if any.
    pub fn parent(&self) -> Option<String> {
        self.lock().parent.clone()
    }

    /// Destroy the widget: fire every connected destroy hook once, then
    /// release the underlying resource. Repeated calls do nothing.
    pub fn destroy(&self) {
        let hooks = {
            let mut state = self.lock();
            if state.lifecycle != Lifecycle::Alive {
                return;
            }
            state.lifecycle = Lifecycle::Destroying;
            std::mem::take(&mut state.hooks)
        };

        // Hooks may call back into this widget (e.g. `probe`), so the lock is released.
        for (_, hook) in hooks {
            hook();
        }

        let mut state = self.lock();
        state.lifecycle = Lifecycle::Released;
        state.parent = None;
    }

    /// Release the resource without notifying anyone. Connected hooks are dropped unfired.
    pub fn release_silently(&self) {
        let mut state = self.lock();
        state.lifecycle = Lifecycle::Released;
        state.parent = None;
        state.hooks.clear();
    }

    /// Whether the underlying resource is gone.
    pub fn is_released(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Released
    }

    /// Number of destroy hooks still connected.
    pub fn hook_count(&self) -> usize {
        self.lock().hooks.len()
    }

    fn lock(&self) -> MutexGuard<'_, WidgetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn released_error(&self) -> HooksError {
        HooksError::SubscriberInvalid(format!("widget '{}' has been released", self.name))
    }
}

impl Subscriber for WidgetHandle {
    fn probe(&self) -> Result<()> {
        if self.is_released() {
            return Err(self.released_error());
        }
        Ok(())
    }

    fn has_owner(&self) -> Result<bool> {
        let state = self.lock();
        if state.lifecycle == Lifecycle::Released {
            return Err(self.released_error());
        }
        Ok(state.parent.is_some())
    }

    fn connect_destroy(&self, hook: DestroyHook) -> Result<HookId> {
        let mut state = self.lock();
        if state.lifecycle != Lifecycle::Alive {
            return Err(self.released_error());
        }
        let id = HookId::new(self.next_hook.fetch_add(1, Ordering::Relaxed));
        state.hooks.push((id, hook));
        Ok(id)
    }

    fn disconnect_destroy(&self, id: HookId) -> Result<()> {
        let mut state = self.lock();
        if state.lifecycle == Lifecycle::Released {
            return Err(self.released_error());
        }
        let Some(pos) = state.hooks.iter().position(|(hook_id, _)| *hook_id == id) else {
            return Err(HooksError::InvalidArgument(format!(
                "widget '{}' has no destroy hook {}",
                self.name,
                id.get()
            )));
        };
        // Drop the hook after the lock is released; it may own references back to us.
        let (_, hook) = state.hooks.remove(pos);
        drop(state);
        drop(hook);
        Ok(())
    }

    fn label(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::subscriber::is_live;
    use std::sync::atomic::AtomicUsize;

    fn counting_hook(count: &Arc<AtomicUsize>) -> DestroyHook {
        let count = Arc::clone(count);
        Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn liveness_follows_parenting() {
        let widget = WidgetHandle::new("ssid-label");
        assert!(!is_live(widget.as_ref()));

        widget.attach("current-network");
        assert!(is_live(widget.as_ref()));
        assert_eq!(widget.parent().as_deref(), Some("current-network"));

        widget.detach();
        assert!(!is_live(widget.as_ref()));
    }

    #[test]
    fn destroy_fires_hooks_once() {
        let widget = WidgetHandle::attached("status", "panel");
        let count = Arc::new(AtomicUsize::new(0));
        widget.connect_destroy(counting_hook(&count)).unwrap();
        widget.connect_destroy(counting_hook(&count)).unwrap();

        widget.destroy();
        widget.destroy();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(widget.is_released());
        assert!(widget.probe().is_err());
        assert!(!is_live(widget.as_ref()));
    }

    #[test]
    fn disconnected_hook_does_not_fire() {
        let widget = WidgetHandle::attached("status", "panel");
        let count = Arc::new(AtomicUsize::new(0));
        let id = widget.connect_destroy(counting_hook(&count)).unwrap();

        widget.disconnect_destroy(id).unwrap();
        assert!(matches!(
            widget.disconnect_destroy(id),
            Err(HooksError::InvalidArgument(_))
        ));

        widget.destroy();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn silent_release_drops_hooks_unfired() {
        let widget = WidgetHandle::attached("list", "panel");
        let count = Arc::new(AtomicUsize::new(0));
        let id = widget.connect_destroy(counting_hook(&count)).unwrap();

        widget.release_silently();

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(widget.hook_count(), 0);
        assert!(widget.disconnect_destroy(id).is_err());
        assert!(widget.connect_destroy(counting_hook(&count)).is_err());
    }

    #[test]
    fn hook_can_probe_widget_during_destroy() {
        let widget = WidgetHandle::attached("label", "panel");
        let weak = Arc::downgrade(&widget);
        let probed = Arc::new(AtomicUsize::new(0));
        let probed_in = Arc::clone(&probed);
        widget
            .connect_destroy(Box::new(move || {
                if let Some(widget) = weak.upgrade() {
                    if widget.probe().is_ok() {
                        probed_in.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }))
            .unwrap();

        widget.destroy();
        assert_eq!(probed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn released_widget_cannot_be_reparented() {
        let widget = WidgetHandle::new("orphan");
        widget.release_silently();
        widget.attach("panel");
        assert_eq!(widget.parent(), None);
        assert_eq!(widget.label(), "orphan");
    }
}
