//! Error types for the notification registry.

/// Top-level error type for shellhooks.
#[derive(Debug, thiserror::Error)]
pub enum HooksError {
    /// A registration argument was unusable (e.g. an already-released subscriber).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The registry has been torn down.
    #[error("registry closed")]
    RegistryClosed,

    /// A subscriber handle no longer refers to a usable resource.
    #[error("subscriber invalid: {0}")]
    SubscriberInvalid(String),

    /// A subscriber callback failed during delivery.
    #[error("callback failure: {0}")]
    CallbackFailure(String),

    /// Timer host error (no runtime, spawn failure).
    #[error("timer error: {0}")]
    Timer(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HooksError {
    /// Whether this error means the subscriber itself can no longer be delivered to.
    ///
    /// Only this class of callback failure tombstones a slot; every other
    /// failure is contained and the slot keeps receiving updates.
    #[must_use]
    pub fn signals_invalid_subscriber(&self) -> bool {
        matches!(self, Self::SubscriberInvalid(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, HooksError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_subscriber_invalid_signals_invalidity() {
        assert!(HooksError::SubscriberInvalid("gone".to_owned()).signals_invalid_subscriber());
        assert!(!HooksError::CallbackFailure("boom".to_owned()).signals_invalid_subscriber());
        assert!(!HooksError::RegistryClosed.signals_invalid_subscriber());
    }

    #[test]
    fn display_includes_context() {
        let err = HooksError::InvalidArgument("subscriber already released".to_owned());
        assert_eq!(
            err.to_string(),
            "invalid argument: subscriber already released"
        );
        assert_eq!(HooksError::RegistryClosed.to_string(), "registry closed");
    }
}
