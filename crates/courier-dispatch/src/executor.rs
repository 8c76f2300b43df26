//! Operation execution: parameters in, reply out.
//!
//! Order: deserialize, initializers (before), parameter inspectors (before),
//! must-understand check, invoke, parameter inspectors (after, reverse),
//! initializers (after, reverse), serialize. Initializers always see their
//! after-hook once their before-hook ran, even when invocation fails.

use std::sync::Arc;

use courier_protocol::{Fault, Message};
use serde_json::Value;
use tracing::debug;

use crate::call_context::CallContext;
use crate::config::ConcurrencyMode;
use crate::error::DispatchError;
use crate::instance::InstanceContext;
use crate::operation::{InvokeError, InvokeFuture, InvokeOutput, OperationDescriptor};
use crate::pipeline::DispatchPipeline;
use crate::reentrancy::HeldLock;
use crate::security::ImpersonationScope;

pub(crate) struct OperationExecutor<'a> {
    pipeline: &'a DispatchPipeline,
    operation: Arc<OperationDescriptor>,
}

impl<'a> OperationExecutor<'a> {
    pub(crate) fn new(pipeline: &'a DispatchPipeline, operation: Arc<OperationDescriptor>) -> Self {
        Self { pipeline, operation }
    }

    pub(crate) async fn execute(&self, ctx: &mut CallContext) -> Result<(), DispatchError> {
        let op = self.operation.clone();
        let instance_context = ctx
            .instance_context
            .clone()
            .ok_or_else(|| DispatchError::Fatal(format!("operation '{}' has no instance context", op.name)))?;

        let inputs = if op.deserialize_request {
            op.formatter
                .deserialize_request(&ctx.request)
                .map_err(|e| DispatchError::Protocol(Fault::deserialization_failed(&op.name, e)))?
        } else {
            Vec::new()
        };

        for (i, initializer) in op.initializers.iter().enumerate() {
            ctx.slots[op.initializer_offset + i] = initializer.before_invoke(&instance_context, &ctx.request);
        }

        let outcome = self.invoke(ctx, &instance_context, inputs).await;

        let outcome = match outcome {
            Ok(output) => {
                for (i, inspector) in op.parameter_inspectors.iter().enumerate().rev() {
                    let token = ctx.slots[op.inspector_offset + i].take();
                    inspector.after_call(&op.name, &output.outputs, &output.result, token);
                }
                Ok(output)
            }
            Err(error) => {
                for i in 0..op.parameter_inspectors.len() {
                    ctx.slots[op.inspector_offset + i].take();
                }
                Err(error)
            }
        };

        for (i, initializer) in op.initializers.iter().enumerate().rev() {
            let token = ctx.slots[op.initializer_offset + i].take();
            initializer.after_invoke(token);
        }

        let output = outcome?;
        if op.terminating {
            debug!(operation = %op.name, "terminating operation completed");
            ctx.channel.terminate();
        }
        if !op.one_way {
            ctx.reply = Some(self.serialize(output)?);
        }
        Ok(())
    }

    async fn invoke(
        &self,
        ctx: &mut CallContext,
        instance_context: &InstanceContext,
        inputs: Vec<Value>,
    ) -> Result<InvokeOutput, DispatchError> {
        let op = &self.operation;
        for (i, inspector) in op.parameter_inspectors.iter().enumerate() {
            ctx.slots[op.inspector_offset + i] = inspector.before_call(&op.name, &inputs);
        }

        for header in &op.understood_headers {
            ctx.request.headers.understand(header);
        }
        let missing = ctx.request.headers.not_understood();
        if !missing.is_empty() {
            return Err(DispatchError::Protocol(Fault::must_understand(&missing)));
        }

        let instance = instance_context
            .instance(&ctx.request)
            .map_err(|e| self.invoke_error(e))?;

        let _scope = match (&self.pipeline.impersonator, op.impersonate) {
            (Some(impersonator), true) => impersonator.enter(&ctx.request).map_err(DispatchError::Protocol)?,
            _ => ImpersonationScope::noop(),
        };

        let held = match self.pipeline.concurrency_mode() {
            ConcurrencyMode::Reentrant => ctx.lock_guard.take().map(HeldLock::new),
            _ => None,
        };

        debug!(operation = %op.name, "invoking");
        let future = op.invoker.invoke(instance, inputs);
        let future: InvokeFuture = match &held {
            Some(held) => Box::pin(held.scope(future)),
            None => future,
        };
        let result = match &self.pipeline.execution_handle {
            Some(handle) => match handle.spawn(future).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => Err(InvokeError::Fatal(format!("invocation task failed: {e}"))),
            },
            None => future.await,
        };
        if let Some(held) = held {
            ctx.lock_guard = held.take_guard();
        }
        result.map_err(|e| self.invoke_error(e))
    }

    fn invoke_error(&self, error: InvokeError) -> DispatchError {
        match error {
            InvokeError::Fault(fault) => DispatchError::Application(fault),
            InvokeError::Failed(reason) => DispatchError::Operation {
                operation: self.operation.name.clone(),
                reason,
            },
            InvokeError::Fatal(reason) => DispatchError::Fatal(reason),
        }
    }

    fn serialize(&self, output: InvokeOutput) -> Result<Message, DispatchError> {
        let op = &self.operation;
        if !op.serialize_reply {
            return Ok(Message::reply(op.reply_action.clone(), output.result));
        }
        op.formatter
            .serialize_reply(&op.reply_action, &output.outputs, output.result)
            .map_err(|e| DispatchError::Protocol(Fault::deserialization_failed(&op.name, e)))
    }
}
