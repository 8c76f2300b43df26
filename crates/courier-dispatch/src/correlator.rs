//! Request/reply correlation over a duplex channel.
//!
//! Outgoing requests register a pending entry keyed by message id; a reply is
//! matched by its `relates_to`. When a [`ChannelPump`](crate::pump::ChannelPump)
//! owns the receive side, it hands replies to [`RequestCorrelator::on_reply`].
//! Otherwise waiting callers take turns reading the channel themselves,
//! routing whatever arrives: replies to their pending entries, anything else
//! to the unmatched queue returned by [`RequestCorrelator::new`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use courier_protocol::{Message, MessageId};
use courier_transport::{TransportChannel, TransportError};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, warn};

use crate::reentrancy::while_unlocked;

type ReplySender = oneshot::Sender<Result<Message, TransportError>>;
type ReplyReceiver = oneshot::Receiver<Result<Message, TransportError>>;

pub struct RequestCorrelator<C: TransportChannel> {
    channel: Arc<C>,
    pending: DashMap<MessageId, ReplySender>,
    receive_lock: tokio::sync::Mutex<()>,
    pumped: AtomicBool,
    closed: AtomicBool,
    unmatched: mpsc::UnboundedSender<Message>,
}

enum Turn<'a> {
    Replied(Result<Message, TransportError>),
    Reader(tokio::sync::MutexGuard<'a, ()>),
    TimedOut,
}

/// Purges its table entry unless the reply was delivered.
struct PendingEntry<'a> {
    table: &'a DashMap<MessageId, ReplySender>,
    id: MessageId,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

impl<C: TransportChannel> RequestCorrelator<C> {
    /// Wrap `channel`; inbound messages that are not replies arrive on the receiver.
    pub fn new(channel: Arc<C>) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (unmatched, rx) = mpsc::unbounded_channel();
        let correlator = Self {
            channel,
            pending: DashMap::new(),
            receive_lock: tokio::sync::Mutex::new(()),
            pumped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            unmatched,
        };
        (correlator, rx)
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    /// A pump now owns the receive side; callers only wait.
    pub fn set_pumped(&self, pumped: bool) {
        self.pumped.store(pumped, Ordering::SeqCst);
    }

    pub fn is_pumped(&self) -> bool {
        self.pumped.load(Ordering::SeqCst)
    }

    /// Requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: MessageId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Send `request` and wait for the reply correlated to it.
    pub async fn send(&self, mut request: Message, timeout: Duration) -> Result<Message, TransportError> {
        let deadline = Instant::now() + timeout;
        let id = *request.headers.message_id.get_or_insert_with(MessageId::new);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _entry = PendingEntry {
            table: &self.pending,
            id,
        };
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        debug!(message_id = %id, action = request.action(), "request sent");

        while_unlocked(async {
            self.channel.send(request, deadline).await?;
            self.await_reply(rx, deadline).await
        })
        .await
    }

    async fn await_reply(&self, mut rx: ReplyReceiver, deadline: Instant) -> Result<Message, TransportError> {
        if self.is_pumped() {
            return match timeout_at(deadline, rx).await {
                Ok(reply) => reply.unwrap_or(Err(TransportError::Aborted)),
                Err(_) => Err(TransportError::Timeout { operation: "request" }),
            };
        }

        let turn = tokio::select! {
            reply = &mut rx => Turn::Replied(reply.unwrap_or(Err(TransportError::Aborted))),
            guard = self.receive_lock.lock() => Turn::Reader(guard),
            _ = sleep_until(deadline) => Turn::TimedOut,
        };
        match turn {
            Turn::Replied(reply) => reply,
            Turn::Reader(_guard) => self.read_until_reply(rx, deadline).await,
            Turn::TimedOut => Err(TransportError::Timeout { operation: "request" }),
        }
    }

    /// Read the channel on behalf of every waiter until our own reply shows up.
    async fn read_until_reply(&self, mut rx: ReplyReceiver, deadline: Instant) -> Result<Message, TransportError> {
        loop {
            tokio::select! {
                biased;
                reply = &mut rx => return reply.unwrap_or(Err(TransportError::Aborted)),
                received = self.channel.receive(deadline) => match received {
                    Ok(Some(message)) => {
                        if let Some(unmatched) = self.on_reply(message) {
                            let _ = self.unmatched.send(unmatched);
                        }
                    }
                    Ok(None) => {
                        self.fail_all(TransportError::Closed);
                        return Err(TransportError::Closed);
                    }
                    Err(e) if e.is_timeout() => {
                        return Err(TransportError::Timeout { operation: "request" });
                    }
                    Err(e) => {
                        self.fail_all(e.clone());
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Deliver a reply to its pending request; unmatched messages are handed back.
    pub fn on_reply(&self, message: Message) -> Option<Message> {
        let Some(relates_to) = message.relates_to() else {
            return Some(message);
        };
        match self.pending.remove(&relates_to) {
            Some((_, tx)) => {
                debug!(message_id = %relates_to, "reply correlated");
                let _ = tx.send(Ok(message));
                None
            }
            None => Some(message),
        }
    }

    /// Fail every pending request and empty the table.
    pub fn fail_all(&self, error: TransportError) {
        let ids: Vec<MessageId> = self.pending.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            warn!(pending = ids.len(), "failing pending requests: {error}");
        }
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    /// Fail every pending request with `Closed` and refuse new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.fail_all(TransportError::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Abort the channel and everything waiting on it.
    pub fn abort(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.channel.abort();
        self.fail_all(TransportError::Aborted);
    }
}
