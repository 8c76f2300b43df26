//! Pluggable inspection hooks.
//!
//! Each hook returns an opaque correlation token from its "before" call;
//! the token is parked in the call's correlation slot and handed back to the
//! matching "after" call. Slot offsets are fixed when the endpoint freezes.

use std::any::Any;

use courier_protocol::Message;
use serde_json::Value;

use crate::channel::ResolvedChannel;
use crate::instance::InstanceContext;

/// Opaque state carried from a before-hook to its after-hook.
pub type CorrelationToken = Option<Box<dyn Any + Send>>;

/// Endpoint-wide message inspection, around the whole call.
pub trait MessageInspector: Send + Sync {
    fn after_receive(&self, request: &mut Message, channel: &ResolvedChannel) -> CorrelationToken;

    /// Sees the reply (or `None` for one-way calls) before it is sent.
    fn before_send(&self, reply: &mut Option<Message>, token: CorrelationToken);
}

/// Per-operation inspection of deserialized parameters and results.
pub trait ParameterInspector: Send + Sync {
    fn before_call(&self, operation: &str, inputs: &[Value]) -> CorrelationToken;

    fn after_call(&self, operation: &str, outputs: &[Value], result: &Value, token: CorrelationToken);
}

/// Per-operation setup and teardown around invocation, with the instance context bound.
pub trait CallContextInitializer: Send + Sync {
    fn before_invoke(&self, instance: &InstanceContext, request: &Message) -> CorrelationToken;

    fn after_invoke(&self, token: CorrelationToken);
}

/// Receives a summary once a call has fully completed.
pub trait CompletionHook: Send + Sync {
    fn on_complete(&self, summary: &CallSummary);
}

/// Outcome of one dispatched call, as seen by completion hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    pub action: String,
    pub operation: Option<String>,
    pub replied: bool,
    pub faulted: bool,
    pub aborted: bool,
}
