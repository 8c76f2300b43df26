//! Protocol faults and well-known fault subcodes.
//!
//! A fault is a structured error reply: `(code, reason, action, detail)`.
//! Faults produced by the dispatch core and faults thrown by application
//! operations share this type, so they are indistinguishable on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actions;

/// Which side of the exchange is blamed for a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FaultKind {
    /// The request was malformed, misaddressed or not permitted.
    Sender,
    /// The service failed while processing a valid request.
    Receiver,
}

/// Well-known fault subcodes.
pub struct Subcodes;

impl Subcodes {
    pub const DESTINATION_UNREACHABLE: &'static str = "DestinationUnreachable";
    pub const ACTION_NOT_SUPPORTED: &'static str = "ActionNotSupported";
    pub const MULTIPLE_ENDPOINTS_MATCHED: &'static str = "MultipleEndpointsMatched";
    pub const MUST_UNDERSTAND: &'static str = "MustUnderstand";
    pub const DESERIALIZATION_FAILED: &'static str = "DeserializationFailed";
    pub const SESSION_TERMINATED: &'static str = "SessionTerminated";
    pub const ACCESS_DENIED: &'static str = "AccessDenied";
    pub const SERVER_TOO_BUSY: &'static str = "ServerTooBusy";
    pub const INTERNAL_SERVICE_FAULT: &'static str = "InternalServiceFault";
}

/// Fault code: the blamed side plus an optional subcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultCode {
    pub kind: FaultKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subcode: Option<String>,
}

impl FaultCode {
    pub fn sender(subcode: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Sender,
            subcode: Some(subcode.into()),
        }
    }

    pub fn receiver(subcode: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Receiver,
            subcode: Some(subcode.into()),
        }
    }

    pub fn is_subcode(&self, subcode: &str) -> bool {
        self.subcode.as_deref() == Some(subcode)
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FaultKind::Sender => "Sender",
            FaultKind::Receiver => "Receiver",
        };
        match &self.subcode {
            Some(subcode) => write!(f, "{kind}:{subcode}"),
            None => f.write_str(kind),
        }
    }
}

/// A protocol-level fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("fault [{code}]: {reason}")]
pub struct Fault {
    pub code: FaultCode,
    pub reason: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl Fault {
    pub fn new(code: FaultCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            action: actions::FAULT.into(),
            detail: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn destination_unreachable(to: &str) -> Self {
        Self::new(
            FaultCode::sender(Subcodes::DESTINATION_UNREACHABLE),
            format!("No endpoint accepts messages addressed to '{to}'"),
        )
        .with_action(actions::ADDRESSING_FAULT)
    }

    pub fn action_not_supported(action: &str) -> Self {
        Self::new(
            FaultCode::sender(Subcodes::ACTION_NOT_SUPPORTED),
            format!("Action '{action}' is not supported by this endpoint"),
        )
        .with_action(actions::ADDRESSING_FAULT)
    }

    pub fn multiple_endpoints_matched(to: &str) -> Self {
        Self::new(
            FaultCode::sender(Subcodes::MULTIPLE_ENDPOINTS_MATCHED),
            format!("More than one endpoint accepts messages addressed to '{to}'"),
        )
        .with_action(actions::ADDRESSING_FAULT)
    }

    pub fn must_understand(headers: &[String]) -> Self {
        Self::new(
            FaultCode::sender(Subcodes::MUST_UNDERSTAND),
            format!("Headers were not understood: {}", headers.join(", ")),
        )
    }

    pub fn deserialization_failed(operation: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            FaultCode::sender(Subcodes::DESERIALIZATION_FAILED),
            format!("Failed to (de)serialize message for operation '{operation}': {reason}"),
        )
    }

    pub fn session_terminated() -> Self {
        Self::new(
            FaultCode::sender(Subcodes::SESSION_TERMINATED),
            "The session was terminated by a previous operation",
        )
    }

    pub fn access_denied(reason: impl Into<String>) -> Self {
        Self::new(FaultCode::sender(Subcodes::ACCESS_DENIED), reason)
    }

    pub fn server_too_busy(reason: impl Into<String>) -> Self {
        Self::new(FaultCode::receiver(Subcodes::SERVER_TOO_BUSY), reason)
    }

    pub fn internal_service_fault() -> Self {
        Self::new(
            FaultCode::receiver(Subcodes::INTERNAL_SERVICE_FAULT),
            "The server was unable to process the request due to an internal error",
        )
    }

    pub fn is_subcode(&self, subcode: &str) -> bool {
        self.code.is_subcode(subcode)
    }
}
