//! Courier: the message-dispatch core of a session-aware RPC server.
//!
//! - [`protocol`]: messages, addressing headers, faults
//! - [`transport`]: the channel contract and an in-memory channel pair
//! - [`dispatch`]: channel pump, dispatch pipeline, throttling, correlation
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier::dispatch::{
//!     ChannelDispatcher, ChannelPump, DispatchSettings, EndpointBuilder, InvokeError, InvokeOutput, OperationBuilder,
//! };
//! use courier::transport::{ChannelShape, MemoryChannel};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut echo = EndpointBuilder::new("echo", "mem://echo");
//! echo.operation(OperationBuilder::from_fn("Echo", "urn:echo", |_, inputs| async move {
//!     Ok::<_, InvokeError>(InvokeOutput::new(inputs.into_iter().next().unwrap_or_default()))
//! }))?;
//!
//! let dispatcher = ChannelDispatcher::builder(DispatchSettings::default())
//!     .endpoint(echo.freeze()?)
//!     .build()?;
//! let (server, _client) = MemoryChannel::pair(ChannelShape::request_reply_session(), Some("mem://echo".into()));
//! ChannelPump::new(Arc::new(server), dispatcher).run().await?;
//! # Ok(())
//! # }
//! ```

pub mod telemetry;

pub use courier_dispatch as dispatch;
pub use courier_protocol as protocol;
pub use courier_transport as transport;

pub use courier_dispatch::{ChannelDispatcher, ChannelPump, DispatchPipeline, EndpointBuilder, RequestCorrelator};
pub use courier_protocol::{Fault, Message};
pub use telemetry::{init_json_tracing, init_tracing};
