//! Per-endpoint dispatch pipeline.
//!
//! An [`EndpointBuilder`] collects the mutable description of one endpoint.
//! Freezing it produces a [`DispatchPipeline`]: immutable, shared by every
//! call to the endpoint, with correlation-slot offsets fixed once. Any
//! mutation after the freeze fails with [`ConfigError::Frozen`].
//!
//! Stages, in order:
//! 1. message inspectors (`after_receive`)
//! 2. operation selection, authentication and authorization
//! 3. admission: instance-context slot and dynamic quota
//! 4. instance binding per [`InstanceMode`]
//! 5. concurrency lock and pump-gate release
//! 6. invocation through the [`OperationExecutor`]
//! 7. fault of last resort
//! 8. reply preparation (`before_send`, addressing) and send
//! 9. cleanup

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use courier_protocol::{EndpointAddress, Fault, Message, actions};
use courier_transport::TransportChannel;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::time::timeout_at;
use tracing::{debug, error, warn};

use crate::call_context::{CallContext, CallState, address_reply};
use crate::channel::ResolvedChannel;
use crate::config::{ConcurrencyMode, ConfigError, InstanceMode};
use crate::error::DispatchError;
use crate::executor::OperationExecutor;
use crate::formatter::{JsonFormatter, MessageFormatter};
use crate::inspector::{CallSummary, CompletionHook, MessageInspector};
use crate::instance::{Instance, InstanceContext, InstanceProvider, UnitInstanceProvider};
use crate::operation::{InvokeError, InvokeOutput, OperationBuilder, OperationDescriptor, OperationSelector};
use crate::security::{AuthorizationHook, Impersonator};
use crate::throttle::deadline_after;

/// Name of the operation answering the session-opened notification when the
/// endpoint registers none.
pub const SESSION_OPENED_OPERATION: &str = "SessionOpened";

/// Mutable description of one endpoint.
pub struct EndpointBuilder {
    name: String,
    address: EndpointAddress,
    concurrency: ConcurrencyMode,
    instance_mode: InstanceMode,
    message_inspectors: Vec<Arc<dyn MessageInspector>>,
    operations: Vec<OperationBuilder>,
    unhandled: Option<OperationBuilder>,
    selector: Option<Arc<dyn OperationSelector>>,
    authorization: Vec<Arc<dyn AuthorizationHook>>,
    impersonator: Option<Arc<dyn Impersonator>>,
    instance_provider: Arc<dyn InstanceProvider>,
    formatter: Arc<dyn MessageFormatter>,
    completion_hooks: Vec<Arc<dyn CompletionHook>>,
    execution_handle: Option<Handle>,
    send_faults: bool,
    manual_addressing: bool,
    frozen: Option<Arc<DispatchPipeline>>,
}

impl EndpointBuilder {
    pub fn new(name: impl Into<String>, address: impl Into<EndpointAddress>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            concurrency: ConcurrencyMode::default(),
            instance_mode: InstanceMode::default(),
            message_inspectors: Vec::new(),
            operations: Vec::new(),
            unhandled: None,
            selector: None,
            authorization: Vec::new(),
            impersonator: None,
            instance_provider: Arc::new(UnitInstanceProvider),
            formatter: Arc::new(JsonFormatter),
            completion_hooks: Vec::new(),
            execution_handle: None,
            send_faults: true,
            manual_addressing: false,
            frozen: None,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    fn mutable(&mut self) -> Result<&mut Self, ConfigError> {
        if self.frozen.is_some() {
            return Err(ConfigError::Frozen {
                endpoint: self.name.clone(),
            });
        }
        Ok(self)
    }

    pub fn concurrency_mode(&mut self, mode: ConcurrencyMode) -> Result<&mut Self, ConfigError> {
        let this = self.mutable()?;
        this.concurrency = mode;
        Ok(this)
    }

    pub fn instance_mode(&mut self, mode: InstanceMode) -> Result<&mut Self, ConfigError> {
        let this = self.mutable()?;
        this.instance_mode = mode;
        Ok(this)
    }

    pub fn message_inspector(&mut self, inspector: impl MessageInspector + 'static) -> Result<&mut Self, ConfigError> {
        let this = self.mutable()?;
        this.message_inspectors.push(Arc::new(inspector));
        Ok(this)
    }

    pub fn operation(&mut self, operation: OperationBuilder) -> Result<&mut Self, ConfigError> {
        let this = self.mutable()?;
        if this.operations.iter().any(|op| op.action == operation.action) {
            return Err(ConfigError::DuplicateAction {
                endpoint: this.name.clone(),
                action: operation.action,
            });
        }
        this.operations.push(operation);
        Ok(this)
    }

    /// Operation run for actions no other operation handles.
    pub fn unhandled_operation(&mut self, operation: OperationBuilder) -> Result<&mut Self, ConfigError> {
        let this = self.mutable()?;
        this.unhandled = Some(operation);
        Ok(this)
    }

    /// Select operations by name with `selector` instead of by action.
    pub fn selector(&mut self, selector: impl OperationSelector + 'static) -> Result<&mut Self, ConfigError> {
        let this = self.mutable()?;
        this.selector = Some(Arc::new(selector));
        Ok(this)
    }

    pub fn authorization_hook(&mut self, hook: impl AuthorizationHook + 'static) -> Result<&mut Self, ConfigError> {
        let this = self.mutable()?;
        this.authorization.push(Arc::new(hook));
        Ok(this)
    }

    pub fn impersonator(&mut self, impersonator: impl Impersonator + 'static) -> Result<&mut Self, ConfigError> {
        let this = self.mutable()?;
        this.impersonator = Some(Arc::new(impersonator));
        Ok(this)
    }

    pub fn instance_provider(&mut self, provider: impl InstanceProvider + 'static) -> Result<&mut Self, ConfigError> {
        let this = self.mutable()?;
        this.instance_provider = Arc::new(provider);
        Ok(this)
    }

    /// Formatter for operations that do not set their own.
    pub fn formatter(&mut self, formatter: impl MessageFormatter + 'static) -> Result<&mut Self, ConfigError> {
        let this = self.mutable()?;
        this.formatter = Arc::new(formatter);
        Ok(this)
    }

    pub fn completion_hook(&mut self, hook: impl CompletionHook + 'static) -> Result<&mut Self, ConfigError> {
        let this = self.mutable()?;
        this.completion_hooks.push(Arc::new(hook));
        Ok(this)
    }

    /// Run invocations on this runtime instead of the caller's.
    pub fn execution_handle(&mut self, handle: Handle) -> Result<&mut Self, ConfigError> {
        let this = self.mutable()?;
        this.execution_handle = Some(handle);
        Ok(this)
    }

    /// Whether failures are reported to callers as faults (default) or abort the session.
    pub fn send_faults(&mut self, enabled: bool) -> Result<&mut Self, ConfigError> {
        let this = self.mutable()?;
        this.send_faults = enabled;
        Ok(this)
    }

    /// Leave correlation and addressing headers of replies to the application.
    pub fn manual_addressing(&mut self, enabled: bool) -> Result<&mut Self, ConfigError> {
        let this = self.mutable()?;
        this.manual_addressing = enabled;
        Ok(this)
    }

    /// The frozen pipeline, freezing on first call.
    pub fn pipeline(&mut self) -> Result<Arc<DispatchPipeline>, ConfigError> {
        match &self.frozen {
            Some(pipeline) => Ok(pipeline.clone()),
            None => self.freeze(),
        }
    }

    /// Freeze the endpoint. Later mutation fails with [`ConfigError::Frozen`].
    pub fn freeze(&mut self) -> Result<Arc<DispatchPipeline>, ConfigError> {
        if self.frozen.is_some() {
            return Err(ConfigError::Frozen {
                endpoint: self.name.clone(),
            });
        }

        let mut operations = std::mem::take(&mut self.operations);
        if !operations.iter().any(|op| op.action == actions::SESSION_OPENED) {
            operations.push(session_opened_operation());
        }
        let unhandled = self.unhandled.take();

        let first_slot = self.message_inspectors.len();
        let slot_count = first_slot
            + operations
                .iter()
                .chain(unhandled.iter())
                .map(OperationBuilder::slot_demand)
                .max()
                .unwrap_or(0);

        let mut by_action = HashMap::with_capacity(operations.len());
        let mut by_name = HashMap::with_capacity(operations.len());
        for builder in operations {
            let descriptor = Arc::new(builder.freeze(&self.formatter, first_slot));
            by_name.insert(descriptor.name.clone(), descriptor.clone());
            by_action.insert(descriptor.action.clone(), descriptor);
        }
        let unhandled = unhandled.map(|builder| Arc::new(builder.freeze(&self.formatter, first_slot)));

        let pipeline = Arc::new(DispatchPipeline {
            name: self.name.clone(),
            address: self.address.clone(),
            concurrency: self.concurrency,
            instance_mode: self.instance_mode,
            message_inspectors: std::mem::take(&mut self.message_inspectors),
            by_action,
            by_name,
            unhandled,
            selector: self.selector.take(),
            authorization: std::mem::take(&mut self.authorization),
            impersonator: self.impersonator.take(),
            instance_provider: self.instance_provider.clone(),
            singleton: OnceLock::new(),
            completion_hooks: std::mem::take(&mut self.completion_hooks),
            execution_handle: self.execution_handle.take(),
            send_faults: self.send_faults,
            manual_addressing: self.manual_addressing,
            slot_count,
        });
        debug!(endpoint = %pipeline.name, slots = slot_count, "endpoint frozen");
        self.frozen = Some(pipeline.clone());
        Ok(pipeline)
    }
}

fn session_opened_operation() -> OperationBuilder {
    OperationBuilder::from_fn(
        SESSION_OPENED_OPERATION,
        actions::SESSION_OPENED,
        |_instance: Instance, _inputs: Vec<Value>| async { Ok::<_, InvokeError>(InvokeOutput::default()) },
    )
    .one_way()
    .without_deserialization()
}

/// Frozen, thread-safe dispatch description of one endpoint.
pub struct DispatchPipeline {
    name: String,
    address: EndpointAddress,
    concurrency: ConcurrencyMode,
    instance_mode: InstanceMode,
    message_inspectors: Vec<Arc<dyn MessageInspector>>,
    by_action: HashMap<String, Arc<OperationDescriptor>>,
    by_name: HashMap<String, Arc<OperationDescriptor>>,
    unhandled: Option<Arc<OperationDescriptor>>,
    selector: Option<Arc<dyn OperationSelector>>,
    authorization: Vec<Arc<dyn AuthorizationHook>>,
    pub(crate) impersonator: Option<Arc<dyn Impersonator>>,
    instance_provider: Arc<dyn InstanceProvider>,
    singleton: OnceLock<Arc<InstanceContext>>,
    completion_hooks: Vec<Arc<dyn CompletionHook>>,
    pub(crate) execution_handle: Option<Handle>,
    send_faults: bool,
    manual_addressing: bool,
    slot_count: usize,
}

impl DispatchPipeline {
    /// Endpoint name, used in logs and config errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the filter table matches `to` headers against.
    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn concurrency_mode(&self) -> ConcurrencyMode {
        self.concurrency
    }

    pub fn instance_mode(&self) -> InstanceMode {
        self.instance_mode
    }

    /// Whether failures reach callers as faults instead of aborting the session.
    pub fn sends_faults(&self) -> bool {
        self.send_faults
    }

    pub fn manual_addressing(&self) -> bool {
        self.manual_addressing
    }

    /// Correlation slots each call reserves.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Actions this endpoint handles by name, excluding the unhandled operation.
    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.by_action.keys().map(String::as_str)
    }

    /// Whether any action reaches an operation (unhandled operation or selector).
    pub fn accepts_any_action(&self) -> bool {
        self.unhandled.is_some() || self.selector.is_some()
    }

    /// Operation registered for `action`.
    pub fn operation(&self, action: &str) -> Option<&OperationDescriptor> {
        self.by_action.get(action).map(Arc::as_ref)
    }

    /// The instance context a call on `channel` would reuse.
    pub fn existing_instance(&self, channel: &ResolvedChannel) -> Option<Arc<InstanceContext>> {
        match self.instance_mode {
            InstanceMode::PerCall => None,
            InstanceMode::PerSession if channel.is_session() => channel.instance_context(),
            InstanceMode::PerSession => None,
            InstanceMode::Single => self.singleton.get().cloned(),
        }
    }

    /// Run one call to completion, replying and cleaning up.
    ///
    /// Only fatal errors are returned; the channel has been aborted by then.
    pub async fn dispatch<C: TransportChannel>(
        &self,
        ctx: &mut CallContext,
        transport: &C,
    ) -> Result<(), DispatchError> {
        let outcome = self.process(ctx).await;
        self.complete(ctx, outcome, transport).await
    }

    /// Reply to a call that failed before reaching the pipeline (admission).
    pub(crate) async fn reject<C: TransportChannel>(
        &self,
        ctx: &mut CallContext,
        error: DispatchError,
        transport: &C,
    ) -> Result<(), DispatchError> {
        self.complete(ctx, Err(error), transport).await
    }

    async fn complete<C: TransportChannel>(
        &self,
        ctx: &mut CallContext,
        outcome: Result<(), DispatchError>,
        transport: &C,
    ) -> Result<(), DispatchError> {
        if let Err(error) = outcome {
            if error.is_fatal() {
                error!(endpoint = %self.name, action = ctx.request.action(), "{error}");
                ctx.abort_session = true;
                ctx.reply = None;
                self.cleanup(ctx, transport);
                return Err(error);
            }
            self.fault_of_last_resort(ctx, error);
        }
        self.prepare_reply(ctx);
        self.send_reply(ctx, transport).await;
        self.cleanup(ctx, transport);
        Ok(())
    }

    async fn process(&self, ctx: &mut CallContext) -> Result<(), DispatchError> {
        ctx.slots.resize_with(self.slot_count, || None);
        self.inspect_received(ctx);
        self.select_operation(ctx)?;
        self.authorize(ctx)?;
        self.admit(ctx).await?;
        self.bind_instance(ctx)?;
        self.lock(ctx).await?;

        ctx.state = CallState::Invoking;
        let operation = ctx
            .operation
            .clone()
            .ok_or_else(|| DispatchError::Fatal("no operation selected".into()))?;
        OperationExecutor::new(self, operation).execute(ctx).await
    }

    fn inspect_received(&self, ctx: &mut CallContext) {
        if self.message_inspectors.is_empty() {
            return;
        }
        for (slot, inspector) in self.message_inspectors.iter().enumerate() {
            ctx.slots[slot] = inspector.after_receive(&mut ctx.request, &ctx.channel);
        }
        ctx.inspected = true;
    }

    fn select_operation(&self, ctx: &mut CallContext) -> Result<(), DispatchError> {
        let action = ctx.request.action();
        let selected = match &self.selector {
            Some(selector) if !actions::is_internal(action) => selector
                .select(&ctx.request)
                .and_then(|name| self.by_name.get(&name).cloned()),
            _ => self.by_action.get(action).cloned(),
        };
        let operation = selected
            .or_else(|| self.unhandled.clone())
            .ok_or_else(|| DispatchError::Resolution(Fault::action_not_supported(action)))?;
        debug!(endpoint = %self.name, operation = %operation.name, "operation selected");
        ctx.operation = Some(operation);
        ctx.state = CallState::Resolved;
        Ok(())
    }

    fn authorize(&self, ctx: &CallContext) -> Result<(), DispatchError> {
        for hook in &self.authorization {
            hook.check(&ctx.request, &ctx.channel).map_err(DispatchError::Protocol)?;
        }
        Ok(())
    }

    async fn admit(&self, ctx: &mut CallContext) -> Result<(), DispatchError> {
        let deadline = deadline_after(ctx.dispatcher.settings().admission_timeout());
        let admission = ctx
            .dispatcher
            .throttle()
            .acquire_instance_and_quota(ctx.needs_instance_slot, deadline)
            .await?;
        ctx.owed.instance_slot |= admission.instance_slot;
        ctx.owed.quota |= admission.quota;
        ctx.state = CallState::Admitted;
        Ok(())
    }

    fn bind_instance(&self, ctx: &mut CallContext) -> Result<(), DispatchError> {
        let throttle = ctx.dispatcher.throttle().clone();
        let make = || Arc::new(InstanceContext::new(self.instance_mode, self.instance_provider.clone(), throttle));

        let (context, created, per_call) = match self.instance_mode {
            InstanceMode::PerSession if ctx.channel.is_session() => {
                let (context, created) = ctx.channel.bind_instance_context(make);
                (context, created, false)
            }
            InstanceMode::PerCall | InstanceMode::PerSession => (make(), true, true),
            InstanceMode::Single => {
                let mut created = false;
                let context = self
                    .singleton
                    .get_or_init(|| {
                        created = true;
                        make()
                    })
                    .clone();
                (context, created, false)
            }
        };

        if created && std::mem::take(&mut ctx.owed.instance_slot) {
            context.adopt_throttle_slot();
        }
        ctx.owed.instance_context = per_call;
        context.attach_channel(ctx.channel.id());
        ctx.instance_context = Some(context);

        if ctx.channel.take_pending() {
            ctx.dispatcher.activate(ctx.channel.clone());
        }
        ctx.state = CallState::InstanceBound;
        Ok(())
    }

    async fn lock(&self, ctx: &mut CallContext) -> Result<(), DispatchError> {
        match self.concurrency {
            ConcurrencyMode::Single | ConcurrencyMode::Reentrant => {
                let lock = match &ctx.instance_context {
                    Some(context) => context.concurrency_lock(),
                    None => return Err(DispatchError::Fatal("instance context missing at lock".into())),
                };
                let timeout = ctx.dispatcher.settings().admission_timeout();
                let guard = timeout_at(deadline_after(timeout), lock.lock_owned())
                    .await
                    .map_err(|_| DispatchError::timeout("concurrency lock", timeout))?;
                ctx.lock_guard = Some(guard);
                ctx.pump_gate.release();
            }
            ConcurrencyMode::Multiple => {
                ctx.pump_gate.release();
                tokio::task::yield_now().await;
            }
        }
        ctx.state = CallState::Locked;
        Ok(())
    }

    fn fault_of_last_resort(&self, ctx: &mut CallContext, error: DispatchError) {
        let one_way = ctx.operation.as_ref().is_some_and(|op| op.one_way);
        let resolution = matches!(error, DispatchError::Resolution(_));

        let mut fault = (self.send_faults || resolution).then(|| self.fault_for(ctx, &error));
        ctx.dispatcher.error_handler().provide_fault(&error, &mut fault);

        match fault {
            Some(fault) if !one_way => {
                debug!(endpoint = %self.name, code = %fault.code, "replying with fault");
                ctx.reply = Some(Message::from_fault(fault));
                ctx.faulted = true;
            }
            _ => {
                ctx.reply = None;
                if !self.send_faults && !resolution {
                    ctx.abort_session = true;
                }
            }
        }
        ctx.error = Some(error);
    }

    fn fault_for(&self, ctx: &CallContext, error: &DispatchError) -> Fault {
        if let Some(fault) = error.fault() {
            return fault.clone();
        }
        if error.is_timeout() {
            return Fault::server_too_busy(error.to_string());
        }
        let fault = Fault::internal_service_fault();
        if ctx.dispatcher.settings().include_exception_detail_in_faults {
            fault.with_detail(json!({ "message": error.to_string() }))
        } else {
            fault
        }
    }

    fn prepare_reply(&self, ctx: &mut CallContext) {
        ctx.state = CallState::Replying;
        if ctx.inspected {
            for (slot, inspector) in self.message_inspectors.iter().enumerate().rev() {
                let token = ctx.slots[slot].take();
                inspector.before_send(&mut ctx.reply, token);
            }
            ctx.inspected = false;
        }
        if self.manual_addressing {
            return;
        }
        if let Some(reply) = ctx.reply.as_mut() {
            if !address_reply(&ctx.request, reply, ctx.channel.is_session()) {
                debug!(endpoint = %self.name, "reply address is none; dropping reply");
                ctx.reply = None;
            }
        }
    }

    async fn send_reply<C: TransportChannel>(&self, ctx: &mut CallContext, transport: &C) {
        if ctx.reply_attempted {
            return;
        }
        let Some(reply) = ctx.reply.take() else { return };
        ctx.reply_attempted = true;

        let deadline = deadline_after(ctx.dispatcher.settings().send_timeout());
        match transport.send(reply, deadline).await {
            Ok(()) => ctx.reply_sent = true,
            Err(e) => {
                let error = DispatchError::from(e);
                warn!(endpoint = %self.name, action = ctx.request.action(), "reply not sent: {error}");
                if !ctx.dispatcher.error_handler().handle_error(&error) {
                    ctx.abort_session = true;
                }
            }
        }
    }

    /// Release everything the call holds and run completion hooks.
    ///
    /// Idempotent: a second call finds nothing owed and returns immediately.
    pub fn cleanup<C: TransportChannel>(&self, ctx: &mut CallContext, transport: &C) {
        if ctx.state == CallState::Done {
            return;
        }
        ctx.state = CallState::Cleaning;

        if let Some(error) = ctx.error.take() {
            if !ctx.dispatcher.error_handler().handle_error(&error) {
                ctx.abort_session = true;
            }
        }
        if ctx.abort_session {
            error!(endpoint = %self.name, channel = %ctx.channel.transport_id(), "aborting session");
            transport.abort();
        }

        ctx.release_resources();
        if !ctx.channel.is_session() {
            ctx.dispatcher.deactivate(ctx.channel.id());
        }

        if !self.completion_hooks.is_empty() {
            let summary = CallSummary {
                action: ctx.request.action().to_string(),
                operation: ctx.operation.as_ref().map(|op| op.name.clone()),
                replied: ctx.reply_sent,
                faulted: ctx.faulted,
                aborted: ctx.abort_session,
            };
            for hook in &self.completion_hooks {
                hook.on_complete(&summary);
            }
        }
        ctx.state = CallState::Done;
    }
}

impl std::fmt::Debug for DispatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPipeline")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("concurrency", &self.concurrency)
            .field("instance_mode", &self.instance_mode)
            .field("operations", &self.by_action.len())
            .finish_non_exhaustive()
    }
}
