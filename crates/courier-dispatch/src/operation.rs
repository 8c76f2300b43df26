//! Operations: what the dispatcher invokes for a given action.
//!
//! An [`OperationBuilder`] is the mutable description registered on an
//! endpoint; freezing the endpoint turns it into an immutable
//! [`OperationDescriptor`] shared by every call.

use std::future::Future;
use std::sync::Arc;

use courier_protocol::{Fault, Message, actions};
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::formatter::MessageFormatter;
use crate::inspector::{CallContextInitializer, ParameterInspector};
use crate::instance::Instance;

/// What an operation produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvokeOutput {
    pub result: Value,
    pub outputs: Vec<Value>,
}

impl InvokeOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            outputs: Vec::new(),
        }
    }
}

impl From<Value> for InvokeOutput {
    fn from(result: Value) -> Self {
        Self::new(result)
    }
}

#[derive(Debug, Error)]
pub enum InvokeError {
    /// A declared fault, sent to the caller as-is.
    #[error("{0}")]
    Fault(Fault),

    /// An unexpected failure; becomes an internal-service fault.
    #[error("{0}")]
    Failed(String),

    /// Unrecoverable; tears the channel down and surfaces from the pump.
    #[error("{0}")]
    Fatal(String),
}

pub type InvokeFuture = BoxFuture<'static, Result<InvokeOutput, InvokeError>>;

/// Application method bound to an operation.
pub trait Invoker: Send + Sync {
    fn invoke(&self, instance: Instance, inputs: Vec<Value>) -> InvokeFuture;
}

impl<F, Fut> Invoker for F
where
    F: Fn(Instance, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<InvokeOutput, InvokeError>> + Send + 'static,
{
    fn invoke(&self, instance: Instance, inputs: Vec<Value>) -> InvokeFuture {
        Box::pin(self(instance, inputs))
    }
}

/// Picks the operation for a message when dispatch is not by action.
pub trait OperationSelector: Send + Sync {
    /// Name of the operation to run, or `None` for the unhandled operation.
    fn select(&self, request: &Message) -> Option<String>;
}

/// Mutable operation description.
pub struct OperationBuilder {
    pub(crate) name: String,
    pub(crate) action: String,
    pub(crate) reply_action: Option<String>,
    pub(crate) one_way: bool,
    pub(crate) deserialize_request: bool,
    pub(crate) serialize_reply: bool,
    pub(crate) terminating: bool,
    pub(crate) impersonate: bool,
    pub(crate) understood_headers: Vec<String>,
    pub(crate) invoker: Arc<dyn Invoker>,
    pub(crate) formatter: Option<Arc<dyn MessageFormatter>>,
    pub(crate) parameter_inspectors: Vec<Arc<dyn ParameterInspector>>,
    pub(crate) initializers: Vec<Arc<dyn CallContextInitializer>>,
}

impl OperationBuilder {
    pub fn new(name: impl Into<String>, action: impl Into<String>, invoker: impl Invoker + 'static) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            reply_action: None,
            one_way: false,
            deserialize_request: true,
            serialize_reply: true,
            terminating: false,
            impersonate: false,
            understood_headers: Vec::new(),
            invoker: Arc::new(invoker),
            formatter: None,
            parameter_inspectors: Vec::new(),
            initializers: Vec::new(),
        }
    }

    /// Operation backed by an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, action: impl Into<String>, f: F) -> Self
    where
        F: Fn(Instance, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<InvokeOutput, InvokeError>> + Send + 'static,
    {
        Self::new(name, action, f)
    }

    pub fn reply_action(mut self, action: impl Into<String>) -> Self {
        self.reply_action = Some(action.into());
        self
    }

    /// No reply is ever produced, not even a fault.
    pub fn one_way(mut self) -> Self {
        self.one_way = true;
        self
    }

    /// Skip body deserialization; the invoker receives no parameters.
    pub fn without_deserialization(mut self) -> Self {
        self.deserialize_request = false;
        self
    }

    /// Send the invoker's result as the raw reply body, bypassing the formatter.
    pub fn without_reply_serialization(mut self) -> Self {
        self.serialize_reply = false;
        self
    }

    /// Completing this operation ends the session.
    pub fn terminating(mut self) -> Self {
        self.terminating = true;
        self
    }

    /// Run the invocation inside the endpoint's impersonation scope.
    pub fn impersonate(mut self) -> Self {
        self.impersonate = true;
        self
    }

    /// Headers this operation's contract consumes.
    pub fn understands(mut self, header: impl Into<String>) -> Self {
        self.understood_headers.push(header.into());
        self
    }

    pub fn formatter(mut self, formatter: impl MessageFormatter + 'static) -> Self {
        self.formatter = Some(Arc::new(formatter));
        self
    }

    pub fn parameter_inspector(mut self, inspector: impl ParameterInspector + 'static) -> Self {
        self.parameter_inspectors.push(Arc::new(inspector));
        self
    }

    pub fn initializer(mut self, initializer: impl CallContextInitializer + 'static) -> Self {
        self.initializers.push(Arc::new(initializer));
        self
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub(crate) fn slot_demand(&self) -> usize {
        self.initializers.len() + self.parameter_inspectors.len()
    }

    pub(crate) fn freeze(self, default_formatter: &Arc<dyn MessageFormatter>, first_slot: usize) -> OperationDescriptor {
        let reply_action = self
            .reply_action
            .unwrap_or_else(|| actions::reply_action_for(&self.action));
        OperationDescriptor {
            initializer_offset: first_slot,
            inspector_offset: first_slot + self.initializers.len(),
            formatter: self.formatter.unwrap_or_else(|| default_formatter.clone()),
            name: self.name,
            action: self.action,
            reply_action,
            one_way: self.one_way,
            deserialize_request: self.deserialize_request,
            serialize_reply: self.serialize_reply,
            terminating: self.terminating,
            impersonate: self.impersonate,
            understood_headers: self.understood_headers,
            invoker: self.invoker,
            parameter_inspectors: self.parameter_inspectors,
            initializers: self.initializers,
        }
    }
}

/// Immutable operation description, shared by all calls of a frozen endpoint.
pub struct OperationDescriptor {
    pub(crate) name: String,
    pub(crate) action: String,
    pub(crate) reply_action: String,
    pub(crate) one_way: bool,
    pub(crate) deserialize_request: bool,
    pub(crate) serialize_reply: bool,
    pub(crate) terminating: bool,
    pub(crate) impersonate: bool,
    pub(crate) understood_headers: Vec<String>,
    pub(crate) invoker: Arc<dyn Invoker>,
    pub(crate) formatter: Arc<dyn MessageFormatter>,
    pub(crate) parameter_inspectors: Vec<Arc<dyn ParameterInspector>>,
    pub(crate) initializers: Vec<Arc<dyn CallContextInitializer>>,
    pub(crate) initializer_offset: usize,
    pub(crate) inspector_offset: usize,
}

impl OperationDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn reply_action(&self) -> &str {
        &self.reply_action
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    /// First correlation slot used by this operation's initializers.
    pub fn initializer_offset(&self) -> usize {
        self.initializer_offset
    }

    /// First correlation slot used by this operation's parameter inspectors.
    pub fn inspector_offset(&self) -> usize {
        self.inspector_offset
    }
}

impl std::fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("name", &self.name)
            .field("action", &self.action)
            .field("one_way", &self.one_way)
            .finish_non_exhaustive()
    }
}
