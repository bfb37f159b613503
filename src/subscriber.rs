//! Subscriber handles and the liveness predicate.
//!
//! A subscriber reference can outlive the resource it wraps: the display
//! layer may release a widget without telling the registry. [`is_live`] is
//! the registry's only defense against delivering into a released resource,
//! so it must answer without panicking on a stale handle.

use crate::error::Result;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// One-shot hook run when a subscriber is about to be destroyed.
pub type DestroyHook = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a connected destroy hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

impl HookId {
    /// Wrap a raw hook number issued by a subscriber implementation.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Contract every registered subscriber must satisfy.
pub trait Subscriber: Send + Sync + 'static {
    /// Cheap, side-effect-free read of the underlying resource.
    ///
    /// Returns an error once the resource has been released.
    fn probe(&self) -> Result<()>;

    /// Whether the subscriber is still attached to its owning context
    /// (e.g. has a parent in the display layer's ownership tree).
    fn has_owner(&self) -> Result<bool>;

    /// Connect a one-shot hook fired when the subscriber is being destroyed.
    fn connect_destroy(&self, hook: DestroyHook) -> Result<HookId>;

    /// Disconnect a destroy hook that has not fired yet.
    fn disconnect_destroy(&self, id: HookId) -> Result<()>;

    /// Short name used in log output.
    fn label(&self) -> String {
        "subscriber".to_owned()
    }
}

/// Two-step liveness predicate: the probe read must succeed and the
/// subscriber must still have an owner.
///
/// Errors and panics from either step both report not-live.
pub fn is_live(subscriber: &dyn Subscriber) -> bool {
    let checked = catch_unwind(AssertUnwindSafe(|| {
        subscriber.probe()?;
        subscriber.has_owner()
    }));
    matches!(checked, Ok(Ok(true)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HooksError;

    struct Fixed {
        probe_ok: bool,
        owner: Result<bool>,
        panics: bool,
    }

    impl Fixed {
        fn new(probe_ok: bool, owner: Result<bool>) -> Self {
            Self {
                probe_ok,
                owner,
                panics: false,
            }
        }
    }

    impl Subscriber for Fixed {
        fn probe(&self) -> Result<()> {
            if self.probe_ok {
                Ok(())
            } else {
                Err(HooksError::SubscriberInvalid("released".to_owned()))
            }
        }

        fn has_owner(&self) -> Result<bool> {
            if self.panics {
                panic!("owner lookup on finalized object");
            }
            match &self.owner {
                Ok(owned) => Ok(*owned),
                Err(e) => Err(HooksError::SubscriberInvalid(e.to_string())),
            }
        }

        fn connect_destroy(&self, _hook: DestroyHook) -> Result<HookId> {
            Ok(HookId::new(1))
        }

        fn disconnect_destroy(&self, _id: HookId) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn attached_subscriber_is_live() {
        assert!(is_live(&Fixed::new(true, Ok(true))));
    }

    #[test]
    fn failed_probe_is_not_live() {
        assert!(!is_live(&Fixed::new(false, Ok(true))));
    }

    #[test]
    fn detached_subscriber_is_not_live() {
        assert!(!is_live(&Fixed::new(true, Ok(false))));
    }

    #[test]
    fn owner_error_is_not_live() {
        let owner = Err(HooksError::SubscriberInvalid("parent gone".to_owned()));
        assert!(!is_live(&Fixed::new(true, owner)));
    }

    #[test]
    fn panicking_owner_check_is_not_live() {
        let subscriber = Fixed {
            probe_ok: true,
            owner: Ok(true),
            panics: true,
        };
        assert!(!is_live(&subscriber));
    }

    #[test]
    fn default_label() {
        assert_eq!(Fixed::new(true, Ok(true)).label(), "subscriber");
    }
}
