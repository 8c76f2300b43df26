//! In-process channel pair backed by tokio channels.
//!
//! Each end owns the receiving half of one unbounded queue and the sending
//! half of the other. Closing or aborting an end drops its sender, so the
//! peer observes end of session on its next receive.

use std::sync::atomic::{AtomicBool, Ordering};

use courier_protocol::{EndpointAddress, Message};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::channel::{ChannelId, ChannelShape, ChannelState, TransportChannel};
use crate::error::TransportError;

/// One end of an in-memory channel.
pub struct MemoryChannel {
    id: ChannelId,
    shape: ChannelShape,
    local_address: Option<EndpointAddress>,
    session_id: Option<String>,
    state: watch::Sender<ChannelState>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    refuse_open: AtomicBool,
}

impl MemoryChannel {
    /// Create a connected pair `(server, client)`.
    ///
    /// `local_address` is reported by the server end as the address it was
    /// accepted on. Both ends share a session id when the shape is sessionful.
    pub fn pair(shape: ChannelShape, local_address: Option<EndpointAddress>) -> (Self, Self) {
        let (to_server, server_rx) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let session_id = shape.session.then(|| uuid::Uuid::new_v4().to_string());

        let server = Self::end(shape, local_address, session_id.clone(), server_rx, to_client);
        let client = Self::end(shape, None, session_id, client_rx, to_server);
        (server, client)
    }

    fn end(
        shape: ChannelShape,
        local_address: Option<EndpointAddress>,
        session_id: Option<String>,
        inbound: mpsc::UnboundedReceiver<Message>,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Created);
        Self {
            id: ChannelId::new(),
            shape,
            local_address,
            session_id,
            state,
            inbound: tokio::sync::Mutex::new(inbound),
            outbound: Mutex::new(Some(outbound)),
            refuse_open: AtomicBool::new(false),
        }
    }

    /// Make the next `open` fail with a communication error.
    pub fn refuse_next_open(&self) {
        self.refuse_open.store(true, Ordering::SeqCst);
    }

    fn ensure_usable(&self, operation: &'static str) -> Result<(), TransportError> {
        match *self.state.borrow() {
            ChannelState::Faulted => Err(TransportError::Aborted),
            ChannelState::Closed => Err(TransportError::InvalidState {
                state: ChannelState::Closed.to_string(),
                operation,
            }),
            ChannelState::Created | ChannelState::Opened => Ok(()),
        }
    }

    fn shut(&self, terminal: ChannelState) {
        // Faulted is sticky.
        self.state.send_if_modified(|state| {
            if *state == ChannelState::Faulted || *state == terminal {
                return false;
            }
            *state = terminal;
            true
        });
        self.outbound.lock().take();
    }
}

impl TransportChannel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn shape(&self) -> ChannelShape {
        self.shape
    }

    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn local_address(&self) -> Option<EndpointAddress> {
        self.local_address.clone()
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    async fn open(&self, _deadline: Instant) -> Result<(), TransportError> {
        if self.refuse_open.swap(false, Ordering::SeqCst) {
            self.shut(ChannelState::Faulted);
            return Err(TransportError::Communication("open refused by peer".into()));
        }
        self.ensure_usable("open")?;
        self.state.send_replace(ChannelState::Opened);
        debug!(channel = %self.id, "memory channel opened");
        Ok(())
    }

    async fn receive(&self, deadline: Instant) -> Result<Option<Message>, TransportError> {
        let mut state = self.state.subscribe();
        match *state.borrow_and_update() {
            ChannelState::Faulted => return Err(TransportError::Aborted),
            ChannelState::Closed => return Ok(None),
            ChannelState::Created | ChannelState::Opened => {}
        }

        let mut inbound = tokio::select! {
            guard = self.inbound.lock() => guard,
            _ = sleep_until(deadline) => return Err(TransportError::Timeout { operation: "receive" }),
        };

        tokio::select! {
            message = inbound.recv() => Ok(message),
            changed = state.wait_for(|s| s.is_terminal()) => match changed.map(|s| *s) {
                Ok(ChannelState::Closed) => Ok(None),
                _ => Err(TransportError::Aborted),
            },
            _ = sleep_until(deadline) => Err(TransportError::Timeout { operation: "receive" }),
        }
    }

    async fn send(&self, message: Message, _deadline: Instant) -> Result<(), TransportError> {
        self.ensure_usable("send")?;
        let sender = self.outbound.lock().clone();
        match sender {
            Some(tx) => tx
                .send(message)
                .map_err(|_| TransportError::Communication("peer has gone away".into())),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&self, _deadline: Instant) -> Result<(), TransportError> {
        if self.state().is_terminal() {
            return Ok(());
        }
        self.shut(ChannelState::Closed);
        debug!(channel = %self.id, "memory channel closed");
        Ok(())
    }

    fn abort(&self) {
        self.shut(ChannelState::Faulted);
        debug!(channel = %self.id, "memory channel aborted");
    }
}
