//! Logical channels resolved by the pump.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use courier_transport::ChannelId;
use parking_lot::Mutex;

use crate::instance::InstanceContext;

/// The logical channel a message belongs to.
///
/// Session channels resolve once per transport channel and keep their
/// instance context across messages; datagram channels resolve per message.
/// A channel starts out *pending* and joins the dispatcher's active set the
/// first time a call binds an instance to it.
pub struct ResolvedChannel {
    id: ChannelId,
    transport_id: ChannelId,
    session_id: Option<String>,
    session: bool,
    endpoint: usize,
    instance_context: Mutex<Option<Arc<InstanceContext>>>,
    pending: AtomicBool,
    terminated: AtomicBool,
}

impl ResolvedChannel {
    pub fn new(transport_id: ChannelId, session_id: Option<String>, session: bool, endpoint: usize) -> Self {
        Self {
            id: ChannelId::new(),
            transport_id,
            session_id,
            session,
            endpoint,
            instance_context: Mutex::new(None),
            pending: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
        }
    }

    /// Identity of this logical channel.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// The transport channel messages arrived on.
    pub fn transport_id(&self) -> ChannelId {
        self.transport_id
    }

    /// Transport session id, when the transport reports one.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_session(&self) -> bool {
        self.session
    }

    /// Index of the endpoint this channel resolved to.
    pub fn endpoint(&self) -> usize {
        self.endpoint
    }

    pub fn instance_context(&self) -> Option<Arc<InstanceContext>> {
        self.instance_context.lock().clone()
    }

    /// The bound instance context, creating it with `make` if there is none.
    /// The flag reports whether `make` ran.
    pub(crate) fn bind_instance_context(
        &self,
        make: impl FnOnce() -> Arc<InstanceContext>,
    ) -> (Arc<InstanceContext>, bool) {
        let mut bound = self.instance_context.lock();
        if let Some(existing) = bound.as_ref() {
            return (existing.clone(), false);
        }
        let created = make();
        *bound = Some(created.clone());
        (created, true)
    }

    /// Unbind and close the instance context, if any.
    pub(crate) fn close_instance_context(&self) {
        let bound = self.instance_context.lock().take();
        if let Some(context) = bound {
            context.close();
        }
    }

    /// Not yet registered with the dispatcher.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Clears the pending flag; true only for the first caller.
    pub(crate) fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    /// A terminating operation completed; later messages are refused.
    pub(crate) fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ResolvedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedChannel")
            .field("id", &self.id)
            .field("transport_id", &self.transport_id)
            .field("session", &self.session)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
