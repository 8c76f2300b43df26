//! Transport errors.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The operation did not complete before its deadline.
    #[error("channel {operation} timed out")]
    Timeout { operation: &'static str },

    /// The channel was closed gracefully.
    #[error("channel is closed")]
    Closed,

    /// The channel was aborted or faulted.
    #[error("channel was aborted")]
    Aborted,

    /// The channel is not in a state that allows the operation.
    #[error("channel is {state}; cannot {operation}")]
    InvalidState { state: String, operation: &'static str },

    /// The peer or the underlying medium failed.
    #[error("communication failure: {0}")]
    Communication(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
