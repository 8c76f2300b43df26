//! Dispatch error taxonomy and the shared error-handling policy.

use std::time::Duration;

use courier_protocol::Fault;
use courier_transport::TransportError;
use thiserror::Error;
use tracing::{error, warn};

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// No endpoint, address or action accepts the message.
    #[error("message could not be routed: {0}")]
    Resolution(Fault),

    /// A throttle, quota, lock or channel operation missed its deadline.
    #[error("timed out waiting for {what} after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    /// Application code failed with an unexpected error.
    #[error("operation '{operation}' failed: {reason}")]
    Operation { operation: String, reason: String },

    /// Application code raised a declared fault.
    #[error("{0}")]
    Application(Fault),

    /// The request violated the protocol (must-understand, (de)serialization, access).
    #[error("protocol violation: {0}")]
    Protocol(Fault),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Process-level failure; never converted into a fault.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl DispatchError {
    pub fn timeout(what: &'static str, after: Duration) -> Self {
        Self::Timeout { what, after }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// The fault this error already carries, if any.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::Resolution(f) | Self::Application(f) | Self::Protocol(f) => Some(f),
            _ => None,
        }
    }
}

/// Shared error-classification policy.
///
/// Errors pass through two phases: `provide_fault` runs while a reply can
/// still be produced and may replace or suppress the fault; `handle_error`
/// runs during cleanup and only reports. Returning `false` from
/// `handle_error` marks the error unhandled, which aborts the session.
pub trait ErrorHandler: Send + Sync {
    fn provide_fault(&self, _error: &DispatchError, _fault: &mut Option<Fault>) {}

    fn handle_error(&self, error: &DispatchError) -> bool;
}

/// Logs every error; treats everything but fatal errors as handled.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle_error(&self, error: &DispatchError) -> bool {
        if error.is_fatal() {
            error!("Fatal dispatch error: {error}");
            return false;
        }
        warn!("Dispatch error: {error}");
        true
    }
}
