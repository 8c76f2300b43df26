//! Courier transport layer.
//!
//! The dispatch core consumes already-open channels through the
//! [`TransportChannel`] trait:
//! - `receive` yields the next inbound message, or `None` at end of session
//! - `send` writes an outbound message (replies, faults, duplex requests)
//! - `open`/`close`/`abort` drive the channel lifecycle
//!
//! Framing, TLS and listeners live outside this crate. [`memory`] provides a
//! tokio-backed channel pair used to drive the dispatcher in-process.

pub mod channel;
pub mod error;
pub mod memory;

pub use channel::{ChannelId, ChannelShape, ChannelState, TransportChannel};
pub use error::TransportError;
pub use memory::MemoryChannel;
