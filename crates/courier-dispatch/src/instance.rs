//! Instance contexts: the container holding the application instance bound to
//! a call, a session or the whole endpoint.
//!
//! An instance context refers to the channels using it by [`ChannelId`]
//! only; the channel pump owns channel identity.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use courier_protocol::Message;
use courier_transport::ChannelId;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::InstanceMode;
use crate::operation::InvokeError;
use crate::throttle::ServiceThrottle;

/// The application object operations are invoked on.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Creates and releases application instances.
pub trait InstanceProvider: Send + Sync {
    fn create(&self, request: &Message) -> Result<Instance, InvokeError>;

    fn release(&self, _instance: Instance) {}
}

impl<F> InstanceProvider for F
where
    F: Fn() -> Instance + Send + Sync,
{
    fn create(&self, _request: &Message) -> Result<Instance, InvokeError> {
        Ok(self())
    }
}

/// Provider for stateless endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnitInstanceProvider;

impl InstanceProvider for UnitInstanceProvider {
    fn create(&self, _request: &Message) -> Result<Instance, InvokeError> {
        Ok(Arc::new(()))
    }
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(u64);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

pub struct InstanceContext {
    id: InstanceId,
    mode: InstanceMode,
    provider: Arc<dyn InstanceProvider>,
    instance: Mutex<Option<Instance>>,
    /// Serializes calls for non-concurrent endpoints; FIFO.
    concurrency_lock: Arc<tokio::sync::Mutex<()>>,
    channels: Mutex<Vec<ChannelId>>,
    throttle: Arc<ServiceThrottle>,
    owns_throttle_slot: AtomicBool,
    closed: AtomicBool,
}

impl InstanceContext {
    pub(crate) fn new(mode: InstanceMode, provider: Arc<dyn InstanceProvider>, throttle: Arc<ServiceThrottle>) -> Self {
        let id = InstanceId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed));
        debug!(%id, ?mode, "instance context created");
        Self {
            id,
            mode,
            provider,
            instance: Mutex::new(None),
            concurrency_lock: Arc::new(tokio::sync::Mutex::new(())),
            channels: Mutex::new(Vec::new()),
            throttle,
            owns_throttle_slot: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn mode(&self) -> InstanceMode {
        self.mode
    }

    /// The application instance, created on first use.
    pub(crate) fn instance(&self, request: &Message) -> Result<Instance, InvokeError> {
        let mut slot = self.instance.lock();
        if let Some(instance) = slot.as_ref() {
            return Ok(instance.clone());
        }
        let instance = self.provider.create(request)?;
        *slot = Some(instance.clone());
        Ok(instance)
    }

    pub(crate) fn concurrency_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.concurrency_lock.clone()
    }

    /// The instance-context throttle slot now lives as long as this context.
    pub(crate) fn adopt_throttle_slot(&self) {
        self.owns_throttle_slot.store(true, Ordering::SeqCst);
    }

    pub(crate) fn attach_channel(&self, channel: ChannelId) {
        let mut channels = self.channels.lock();
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }

    /// Logical channels that have bound this context.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.channels.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release the instance and any throttle slot this context owns. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let instance = self.instance.lock().take();
        if let Some(instance) = instance {
            self.provider.release(instance);
        }
        if self.owns_throttle_slot.swap(false, Ordering::SeqCst) {
            self.throttle.release_instance_context();
        }
        self.channels.lock().clear();
        debug!(id = %self.id, "instance context closed");
    }
}
