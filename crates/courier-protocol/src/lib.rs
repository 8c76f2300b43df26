//! Courier protocol types.
//!
//! Addressed messages, message identifiers, endpoint addresses and
//! protocol faults. This crate is the single source of truth for the
//! well-known actions and fault subcodes the dispatch core emits.

pub mod actions;
pub mod address;
pub mod fault;
pub mod message;

pub use address::EndpointAddress;
pub use fault::{Fault, FaultCode, FaultKind, Subcodes};
pub use message::{Header, Message, MessageHeaders, MessageId};
