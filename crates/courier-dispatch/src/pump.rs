//! The per-channel receive loop.
//!
//! A [`ChannelPump`] owns one transport channel. It resolves each inbound
//! message to a logical channel and endpoint, takes the call slot, and hands
//! the call to the endpoint's pipeline on a task of its own. The next
//! message is received only after the call releases the pump gate: once the
//! concurrency lock is held for serialized endpoints, right after instance
//! binding for concurrent ones, or when the call finishes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use courier_protocol::{Fault, Message};
use courier_transport::TransportChannel;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::call_context::{ActivityTracker, CallContext, PumpGate, address_reply};
use crate::channel::ResolvedChannel;
use crate::correlator::RequestCorrelator;
use crate::dispatcher::ChannelDispatcher;
use crate::error::DispatchError;
use crate::filter::FilterMatch;
use crate::pipeline::DispatchPipeline;
use crate::throttle::deadline_after;

/// Receive deadline used when no idle timeout is configured.
const NO_IDLE_TIMEOUT: Duration = Duration::from_secs(86_400 * 365 * 30);

/// What the receive loop should do after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpFlow {
    Continue,
    Ended,
}

pub struct ChannelPump<C: TransportChannel> {
    transport: Arc<C>,
    dispatcher: Arc<ChannelDispatcher>,
    correlator: Option<Arc<RequestCorrelator<C>>>,
    /// Cached logical channel of a session transport.
    binding: Mutex<Option<Arc<ResolvedChannel>>>,
    session_slot: AtomicBool,
    ended: AtomicBool,
    in_flight: Mutex<JoinSet<Result<(), DispatchError>>>,
    activity: Arc<ActivityTracker>,
}

impl<C: TransportChannel> ChannelPump<C> {
    pub fn new(transport: Arc<C>, dispatcher: Arc<ChannelDispatcher>) -> Self {
        Self {
            transport,
            dispatcher,
            correlator: None,
            binding: Mutex::new(None),
            session_slot: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            in_flight: Mutex::new(JoinSet::new()),
            activity: Arc::new(ActivityTracker::new()),
        }
    }

    /// Route replies to requests sent through `correlator` on the same channel.
    pub fn with_correlator(mut self, correlator: Arc<RequestCorrelator<C>>) -> Self {
        self.correlator = Some(correlator);
        self
    }

    /// The transport channel this pump drives.
    pub fn transport(&self) -> &Arc<C> {
        &self.transport
    }

    pub fn dispatcher(&self) -> &Arc<ChannelDispatcher> {
        &self.dispatcher
    }

    /// The logical channel this session transport resolved to, once known.
    pub fn resolved_channel(&self) -> Option<Arc<ResolvedChannel>> {
        self.binding.lock().clone()
    }

    /// Open the transport, take the session slot, and announce the session if required.
    pub async fn open(&self) -> Result<(), DispatchError> {
        let settings = self.dispatcher.settings();
        let shape = self.transport.shape();

        let opened = async {
            self.transport.open(deadline_after(settings.open_timeout())).await?;
            if shape.session {
                let deadline = deadline_after(settings.admission_timeout());
                let owed = self.dispatcher.throttle().acquire_session(deadline).await?;
                self.session_slot.store(owed, Ordering::SeqCst);
            }
            Ok::<(), DispatchError>(())
        }
        .await;

        if let Err(error) = opened {
            self.release_session_slot();
            warn!(channel = %self.transport.id(), "channel failed to open: {error}");
            self.handle_error(&error);
            self.transport.abort();
            return Err(error);
        }
        info!(channel = %self.transport.id(), session = shape.session, "channel opened");

        if shape.open_notification {
            let notification = Message::session_opened(self.transport.local_address());
            self.dispatch(Some(notification)).await?;
        }
        Ok(())
    }

    /// Open the channel and pump messages until it ends.
    ///
    /// Returns `Ok` after end of session, an idle timeout or an abort; fatal
    /// errors abort the channel and are returned as-is.
    pub async fn run(&self) -> Result<(), DispatchError> {
        self.open().await?;
        if let Some(correlator) = &self.correlator {
            correlator.set_pumped(true);
        }

        let idle = self.dispatcher.settings().idle_timeout();
        loop {
            let deadline = match idle {
                Some(idle) => self.activity.idle_deadline(idle),
                None => Instant::now() + NO_IDLE_TIMEOUT,
            };
            let received = self.transport.receive(deadline).await;
            let flow = match received {
                Ok(message) => self.dispatch(message).await,
                Err(e) if e.is_timeout() => {
                    if self.activity.is_busy() {
                        continue;
                    }
                    info!(channel = %self.transport.id(), "channel idle; closing");
                    self.dispatch(None).await
                }
                Err(e) => {
                    let error = DispatchError::from(e);
                    warn!(channel = %self.transport.id(), "receive failed: {error}");
                    self.handle_error(&error);
                    self.abort();
                    self.dispatch(None).await
                }
            };
            match flow {
                Ok(PumpFlow::Continue) => {}
                Ok(PumpFlow::Ended) => return Ok(()),
                Err(fatal) => {
                    error!(channel = %self.transport.id(), "fatal dispatch error: {fatal}");
                    self.abort();
                    self.end_of_channel().await?;
                    return Err(fatal);
                }
            }
        }
    }

    /// Dispatch one inbound message; `None` is end of channel.
    ///
    /// Returns once the call has released the pump gate. A fatal error from
    /// an earlier call on this channel surfaces here.
    pub async fn dispatch(&self, request: Option<Message>) -> Result<PumpFlow, DispatchError> {
        let Some(request) = request else {
            self.end_of_channel().await?;
            return Ok(PumpFlow::Ended);
        };
        self.reap()?;

        let request = match &self.correlator {
            Some(correlator) => match correlator.on_reply(request) {
                Some(request) => request,
                None => return Ok(PumpFlow::Continue),
            },
            None => request,
        };
        debug!(
            channel = %self.transport.id(),
            action = request.action(),
            message_id = ?request.message_id(),
            "message received"
        );

        if self.resolved_channel().is_some_and(|channel| channel.is_terminated()) {
            self.reply_fault(&request, Fault::session_terminated()).await;
            return Ok(PumpFlow::Continue);
        }

        let channel = match self.resolve(&request) {
            Ok(channel) => channel,
            Err(fault) => {
                self.handle_error(&DispatchError::Resolution(fault.clone()));
                self.reply_fault(&request, fault).await;
                return Ok(PumpFlow::Continue);
            }
        };
        let Some(pipeline) = self.dispatcher.endpoint(channel.endpoint()).cloned() else {
            return Err(DispatchError::Fatal(format!("endpoint {} is not registered", channel.endpoint())));
        };

        let mut ctx = CallContext::new(request, channel, self.dispatcher.clone());
        ctx.track_activity(self.activity.clone());
        let (gate, released) = PumpGate::new();
        ctx.pump_gate = gate;

        let deadline = deadline_after(self.dispatcher.settings().admission_timeout());
        let admitted = ctx.acquire_call_slot(deadline).await;

        let transport = self.transport.clone();
        self.in_flight
            .lock()
            .spawn(run_call(pipeline, ctx, admitted.err(), transport));

        let _ = released.await;
        self.reap()?;
        Ok(PumpFlow::Continue)
    }

    /// Resolve the logical channel and endpoint of `request`.
    ///
    /// Session channels resolve once and keep the result; the lock makes a
    /// concurrent first resolution produce a single logical channel.
    fn resolve(&self, request: &Message) -> Result<Arc<ResolvedChannel>, Fault> {
        let shape = self.transport.shape();
        let mut binding = self.binding.lock();
        if shape.session {
            if let Some(channel) = binding.as_ref() {
                return Ok(channel.clone());
            }
        }

        let endpoint = match self.dispatcher.filter().match_message(request) {
            FilterMatch::Endpoint(index) => index,
            FilterMatch::Ambiguous(fault) => return Err(fault),
            FilterMatch::AddressMismatch => {
                let to = request.headers.to.as_ref().map_or("", |to| to.as_str());
                return Err(Fault::destination_unreachable(to));
            }
            FilterMatch::ActionMismatch => return Err(Fault::action_not_supported(request.action())),
        };

        let channel = Arc::new(ResolvedChannel::new(
            self.transport.id(),
            self.transport.session_id(),
            shape.session,
            endpoint,
        ));
        if shape.session {
            debug!(channel = %self.transport.id(), endpoint, "session resolved");
            *binding = Some(channel.clone());
        }
        Ok(channel)
    }

    /// Send a fault produced before the call reached a pipeline.
    async fn reply_fault(&self, request: &Message, fault: Fault) {
        let mut reply = Message::from_fault(fault);
        if !address_reply(request, &mut reply, self.transport.shape().session) {
            return;
        }
        let deadline = deadline_after(self.dispatcher.settings().send_timeout());
        if let Err(e) = self.transport.send(reply, deadline).await {
            self.handle_error(&e.into());
        }
    }

    /// Surface fatal errors and panics from finished calls.
    fn reap(&self) -> Result<(), DispatchError> {
        let mut in_flight = self.in_flight.lock();
        while let Some(joined) = in_flight.try_join_next() {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(fatal)) => return Err(fatal),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => warn!(channel = %self.transport.id(), "call task cancelled: {e}"),
            }
        }
        Ok(())
    }

    /// Wait for every in-flight call on this channel.
    async fn drain(&self) -> Result<(), DispatchError> {
        let mut in_flight = std::mem::take(&mut *self.in_flight.lock());
        let mut outcome = Ok(());
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(fatal)) => {
                    if outcome.is_ok() {
                        outcome = Err(fatal);
                    }
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => warn!(channel = %self.transport.id(), "call task cancelled: {e}"),
            }
        }
        outcome
    }

    /// Tear down: drain calls, close the transport, release the session.
    async fn end_of_channel(&self) -> Result<(), DispatchError> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Callbacks fail before the drain; calls may be waiting on them.
        if let Some(correlator) = &self.correlator {
            correlator.close();
        }
        let drained = self.drain().await;
        if !self.transport.state().is_terminal() {
            let deadline = deadline_after(self.dispatcher.settings().close_timeout());
            if let Err(e) = self.transport.close(deadline).await {
                self.handle_error(&e.into());
                self.transport.abort();
            }
        }

        let binding = self.binding.lock().take();
        if let Some(channel) = binding {
            self.dispatcher.deactivate(channel.id());
            channel.close_instance_context();
        }
        self.release_session_slot();
        info!(channel = %self.transport.id(), state = %self.transport.state(), "channel closed");
        drained
    }

    fn release_session_slot(&self) {
        if self.session_slot.swap(false, Ordering::SeqCst) {
            self.dispatcher.throttle().release_session();
        }
    }

    fn abort(&self) {
        match &self.correlator {
            Some(correlator) => correlator.abort(),
            None => self.transport.abort(),
        }
    }

    /// Report through the shared policy; unhandled errors abort the channel.
    pub fn handle_error(&self, error: &DispatchError) -> bool {
        let handled = self.dispatcher.error_handler().handle_error(error);
        if !handled {
            self.abort();
        }
        handled
    }
}

async fn run_call<C: TransportChannel>(
    pipeline: Arc<DispatchPipeline>,
    mut ctx: CallContext,
    rejected: Option<DispatchError>,
    transport: Arc<C>,
) -> Result<(), DispatchError> {
    match rejected {
        Some(error) => pipeline.reject(&mut ctx, error, transport.as_ref()).await,
        None => pipeline.dispatch(&mut ctx, transport.as_ref()).await,
    }
}
