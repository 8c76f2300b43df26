//! The transport channel contract consumed by the dispatch core.

use std::fmt;
use std::future::Future;

use courier_protocol::{EndpointAddress, Message};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::TransportError;

/// Identity of a transport or logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Static characteristics of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelShape {
    /// Messages share affinity (state persists between receives).
    pub session: bool,
    /// Either side may send at any time; replies arrive as ordinary messages.
    pub duplex: bool,
    /// The dispatcher must synthesize a "session opened" notification.
    pub open_notification: bool,
}

impl ChannelShape {
    pub const fn duplex_session() -> Self {
        Self {
            session: true,
            duplex: true,
            open_notification: false,
        }
    }

    pub const fn request_reply_session() -> Self {
        Self {
            session: true,
            duplex: false,
            open_notification: false,
        }
    }

    pub const fn datagram() -> Self {
        Self {
            session: false,
            duplex: false,
            open_notification: false,
        }
    }

    pub const fn with_open_notification(mut self) -> Self {
        self.open_notification = true;
        self
    }
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Opened,
    Closed,
    Faulted,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Faulted)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// A bidirectional or request/reply transport channel.
///
/// All operations take `&self` so a channel can be shared between the
/// receive loop and the tasks sending replies. Every blocking operation
/// accepts a deadline.
pub trait TransportChannel: Send + Sync + 'static {
    fn id(&self) -> ChannelId;

    fn shape(&self) -> ChannelShape;

    fn state(&self) -> ChannelState;

    /// Address this channel was accepted on.
    fn local_address(&self) -> Option<EndpointAddress> {
        None
    }

    /// Transport-level session identifier, if the channel has one.
    fn session_id(&self) -> Option<String> {
        None
    }

    fn open(&self, deadline: Instant) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next inbound message; `Ok(None)` signals end of session.
    fn receive(
        &self,
        deadline: Instant,
    ) -> impl Future<Output = Result<Option<Message>, TransportError>> + Send;

    fn send(
        &self,
        message: Message,
        deadline: Instant,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Graceful close: pending receives observe end of session.
    fn close(&self, deadline: Instant) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Immediate teardown; never blocks.
    fn abort(&self);
}
