//! Per-message dispatch state.
//!
//! A [`CallContext`] is created by the pump for every inbound message and
//! threaded through each pipeline stage by `&mut`. It records which releases
//! the call owes; every release checks and clears its flag, so cleanup can
//! run more than once, and dropping an unfinished context still returns its
//! throttle slots.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use courier_protocol::{EndpointAddress, Message, MessageId};
use parking_lot::Mutex;
use tokio::sync::{OwnedMutexGuard, oneshot};
use tokio::time::Instant;

use crate::channel::ResolvedChannel;
use crate::dispatcher::ChannelDispatcher;
use crate::error::DispatchError;
use crate::inspector::CorrelationToken;
use crate::instance::InstanceContext;
use crate::operation::OperationDescriptor;

/// Progress of one call through the pipeline.
///
/// Any state may jump to `Cleaning`; `Done` is reached exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallState {
    Received,
    Resolved,
    Admitted,
    InstanceBound,
    Locked,
    Invoking,
    Replying,
    Cleaning,
    Done,
}

/// Lets the pump receive the next message. Released at most once; dropping
/// the gate releases it.
#[derive(Default)]
pub(crate) struct PumpGate(Option<oneshot::Sender<()>>);

impl PumpGate {
    pub(crate) fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    pub(crate) fn release(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for PumpGate {
    fn drop(&mut self) {
        self.release();
    }
}

/// Per-transport-channel activity, used for the idle timeout.
pub(crate) struct ActivityTracker {
    last: Mutex<Instant>,
    busy: AtomicUsize,
}

impl ActivityTracker {
    pub(crate) fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            busy: AtomicUsize::new(0),
        }
    }

    pub(crate) fn begin(&self) {
        self.busy.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Instant::now();
    }

    pub(crate) fn end(&self) {
        *self.last.lock() = Instant::now();
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst) > 0
    }

    /// When the channel counts as idle, given no further messages.
    pub(crate) fn idle_deadline(&self, idle: std::time::Duration) -> Instant {
        if self.is_busy() {
            Instant::now() + idle
        } else {
            *self.last.lock() + idle
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Owed {
    pub(crate) call_slot: bool,
    pub(crate) instance_slot: bool,
    pub(crate) quota: bool,
    /// A per-call instance context to close.
    pub(crate) instance_context: bool,
    /// Counted in the dispatcher's calls in flight.
    pub(crate) activity: bool,
}

pub struct CallContext {
    pub(crate) request: Message,
    pub(crate) channel: Arc<ResolvedChannel>,
    pub(crate) dispatcher: Arc<ChannelDispatcher>,
    pub(crate) state: CallState,
    pub(crate) operation: Option<Arc<OperationDescriptor>>,
    pub(crate) instance_context: Option<Arc<InstanceContext>>,
    pub(crate) needs_instance_slot: bool,
    pub(crate) slots: Vec<CorrelationToken>,
    pub(crate) inspected: bool,
    pub(crate) reply: Option<Message>,
    pub(crate) error: Option<DispatchError>,
    pub(crate) faulted: bool,
    pub(crate) reply_attempted: bool,
    pub(crate) reply_sent: bool,
    pub(crate) abort_session: bool,
    pub(crate) owed: Owed,
    pub(crate) lock_guard: Option<OwnedMutexGuard<()>>,
    pub(crate) pump_gate: PumpGate,
    pub(crate) activity: Option<Arc<ActivityTracker>>,
}

impl CallContext {
    pub fn new(request: Message, channel: Arc<ResolvedChannel>, dispatcher: Arc<ChannelDispatcher>) -> Self {
        dispatcher.call_started();
        let needs_instance_slot = dispatcher
            .endpoint(channel.endpoint())
            .is_none_or(|pipeline| pipeline.existing_instance(&channel).is_none());
        Self {
            request,
            channel,
            dispatcher,
            state: CallState::Received,
            operation: None,
            instance_context: None,
            needs_instance_slot,
            slots: Vec::new(),
            inspected: false,
            reply: None,
            error: None,
            faulted: false,
            reply_attempted: false,
            reply_sent: false,
            abort_session: false,
            owed: Owed {
                activity: true,
                ..Owed::default()
            },
            lock_guard: None,
            pump_gate: PumpGate::default(),
            activity: None,
        }
    }

    /// Take the call-throttle slot for this message.
    pub async fn acquire_call_slot(&mut self, deadline: Instant) -> Result<(), DispatchError> {
        let owed = self.dispatcher.throttle().acquire_call(deadline).await?;
        self.owed.call_slot |= owed;
        Ok(())
    }

    pub(crate) fn track_activity(&mut self, activity: Arc<ActivityTracker>) {
        activity.begin();
        self.activity = Some(activity);
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn channel(&self) -> &Arc<ResolvedChannel> {
        &self.channel
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Selected operation; `None` until selection succeeds.
    pub fn operation(&self) -> Option<&OperationDescriptor> {
        self.operation.as_deref()
    }

    pub fn instance_context(&self) -> Option<&Arc<InstanceContext>> {
        self.instance_context.as_ref()
    }

    /// Whether admission must take an instance-context slot.
    pub fn needs_instance_slot(&self) -> bool {
        self.needs_instance_slot
    }

    /// Whether a reply reached the transport.
    pub fn reply_sent(&self) -> bool {
        self.reply_sent
    }

    /// Give back everything this call still holds. Safe to repeat.
    pub(crate) fn release_resources(&mut self) {
        self.lock_guard.take();
        self.slots.clear();

        if std::mem::take(&mut self.owed.instance_context) {
            if let Some(context) = &self.instance_context {
                context.close();
            }
        }
        let throttle = self.dispatcher.throttle();
        if std::mem::take(&mut self.owed.instance_slot) {
            throttle.release_instance_context();
        }
        if std::mem::take(&mut self.owed.quota) {
            throttle.release_quota();
        }
        if std::mem::take(&mut self.owed.call_slot) {
            throttle.release_call();
        }
        if std::mem::take(&mut self.owed.activity) {
            if let Some(activity) = &self.activity {
                activity.end();
            }
            self.dispatcher.call_finished();
        }
        self.pump_gate.release();
    }
}

impl Drop for CallContext {
    fn drop(&mut self) {
        self.release_resources();
    }
}

/// Stamp correlation and addressing headers on a reply to `request`.
///
/// Faults go to the request's fault-to address, falling back to reply-to; a
/// missing address means the anonymous back-channel. Returns false when the
/// target is the none address, in which case the reply must be dropped.
pub(crate) fn address_reply(request: &Message, reply: &mut Message, session: bool) -> bool {
    let target = if reply.is_fault() {
        request
            .headers
            .fault_to
            .clone()
            .or_else(|| request.headers.reply_to.clone())
    } else {
        request.headers.reply_to.clone()
    }
    .unwrap_or_else(EndpointAddress::anonymous);

    if target.is_none() {
        return false;
    }
    reply.headers.relates_to = request.message_id();
    if reply.headers.message_id.is_none() {
        reply.headers.message_id = Some(MessageId::new());
    }
    if !session {
        reply.headers.to = Some(target);
    }
    true
}
