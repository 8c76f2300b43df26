//! Courier dispatch core.
//!
//! A [`ChannelPump`] drives one transport channel: it resolves every inbound
//! message to a logical channel and endpoint, admits it through the
//! [`ServiceThrottle`], and runs it through the endpoint's frozen
//! [`DispatchPipeline`], which invokes the operation and replies. Replies to
//! requests the server itself sent are routed to a [`RequestCorrelator`].

pub mod call_context;
pub mod channel;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod error;
mod executor;
pub mod filter;
pub mod formatter;
pub mod inspector;
pub mod instance;
pub mod operation;
pub mod pipeline;
pub mod pump;
mod reentrancy;
pub mod security;
pub mod throttle;

pub use call_context::{CallContext, CallState};
pub use channel::ResolvedChannel;
pub use config::{ConcurrencyMode, ConfigError, DispatchSettings, InstanceMode, ThrottleSettings};
pub use correlator::RequestCorrelator;
pub use dispatcher::{ChannelDispatcher, ChannelDispatcherBuilder};
pub use error::{DispatchError, ErrorHandler, LoggingErrorHandler};
pub use filter::{EndpointFilterTable, ExactFilterTable, FilterMatch};
pub use formatter::{FormatterError, JsonFormatter, MessageFormatter};
pub use inspector::{CallContextInitializer, CallSummary, CompletionHook, CorrelationToken, MessageInspector, ParameterInspector};
pub use instance::{Instance, InstanceContext, InstanceProvider, UnitInstanceProvider};
pub use operation::{InvokeError, InvokeFuture, InvokeOutput, Invoker, OperationBuilder, OperationDescriptor, OperationSelector};
pub use pipeline::{DispatchPipeline, EndpointBuilder};
pub use pump::{ChannelPump, PumpFlow};
pub use security::{AuthorizationHook, ImpersonationScope, Impersonator};
pub use throttle::{Admission, GateStats, ServiceThrottle, ThrottleGate, ThrottleStats};
