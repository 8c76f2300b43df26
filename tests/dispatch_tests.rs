//! End-to-end dispatch tests: a channel pump driving an in-memory channel,
//! observed from the client end.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use courier_dispatch::{
    CallContextInitializer, ChannelDispatcher, ChannelPump, ConcurrencyMode, CorrelationToken, DispatchError,
    DispatchSettings, EndpointBuilder, Instance, InstanceContext, InstanceMode, InvokeError, InvokeOutput,
    OperationBuilder, RequestCorrelator, ThrottleSettings,
};
use courier_protocol::{Fault, FaultCode, Header, Message, Subcodes, actions};
use courier_transport::{ChannelShape, ChannelState, MemoryChannel, TransportChannel, TransportError};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const ADDRESS: &str = "mem://calc";

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

fn unbounded() -> DispatchSettings {
    DispatchSettings {
        throttle: ThrottleSettings::unbounded(),
        ..DispatchSettings::default()
    }
}

fn add() -> OperationBuilder {
    OperationBuilder::from_fn("Add", "urn:add", |_, inputs: Vec<Value>| async move {
        let sum: i64 = inputs.iter().filter_map(Value::as_i64).sum();
        Ok::<_, InvokeError>(InvokeOutput::new(json!(sum)))
    })
}

fn reply_to(request: &Message, body: Value) -> Message {
    let mut reply = Message::reply(format!("{}Response", request.action()), body);
    reply.headers.relates_to = request.message_id();
    reply
}

/// A pump running on its own task, and the client end of its channel.
struct Running {
    client: MemoryChannel,
    dispatcher: Arc<ChannelDispatcher>,
    pump: JoinHandle<Result<(), DispatchError>>,
}

fn start(endpoint: &mut EndpointBuilder, settings: DispatchSettings, shape: ChannelShape) -> Running {
    let dispatcher = ChannelDispatcher::builder(settings)
        .endpoint(endpoint.freeze().unwrap())
        .build()
        .unwrap();
    let (server, client) = MemoryChannel::pair(shape, Some(ADDRESS.into()));
    let pump = ChannelPump::new(Arc::new(server), dispatcher.clone());
    Running {
        client,
        dispatcher,
        pump: tokio::spawn(async move { pump.run().await }),
    }
}

impl Running {
    async fn call(&self, request: Message) -> Message {
        self.client.send(request, soon()).await.unwrap();
        self.client.receive(soon()).await.unwrap().unwrap()
    }

    async fn expect_silence(&self) {
        let quiet = self.client.receive(Instant::now() + Duration::from_millis(200)).await;
        assert!(matches!(quiet, Err(TransportError::Timeout { .. })), "unexpected: {quiet:?}");
    }

    async fn finish(self) -> Result<(), DispatchError> {
        self.client.close(soon()).await.unwrap();
        self.pump.await.unwrap()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request/reply
// ─────────────────────────────────────────────────────────────────────────────

mod request_reply {
    use super::*;

    #[tokio::test]
    async fn reply_is_correlated_and_named() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint.operation(add()).unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());

        let request = Message::request("urn:add", ADDRESS, json!([2, 3]));
        let id = request.message_id();
        let reply = running.call(request).await;

        assert_eq!(reply.relates_to(), id);
        assert_ne!(reply.message_id(), id);
        assert!(reply.message_id().is_some());
        assert_eq!(reply.action(), "urn:addResponse");
        assert_eq!(reply.body, json!(5));
        // Session replies travel on the back-channel without an explicit destination.
        assert!(reply.headers.to.is_none());

        running.finish().await.unwrap();
    }

    #[tokio::test]
    async fn out_parameters_are_wrapped_with_the_result() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint
            .operation(OperationBuilder::from_fn("DivMod", "urn:divmod", |_, inputs: Vec<Value>| async move {
                let (a, b) = (inputs[0].as_i64().unwrap_or(0), inputs[1].as_i64().unwrap_or(1));
                Ok::<_, InvokeError>(InvokeOutput {
                    result: json!(a / b),
                    outputs: vec![json!(a % b)],
                })
            }))
            .unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());

        let reply = running.call(Message::request("urn:divmod", ADDRESS, json!([7, 2]))).await;
        assert_eq!(reply.body, json!({ "result": 3, "outputs": [1] }));

        running.finish().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn one_way_calls_never_reply() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        let counter = invoked.clone();
        endpoint
            .operation(
                OperationBuilder::from_fn("Log", "urn:log", move |_, _| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, InvokeError>(InvokeOutput::default())
                    }
                })
                .one_way(),
            )
            .unwrap();
        let settings = DispatchSettings {
            throttle: ThrottleSettings {
                max_concurrent_calls: Some(1),
                ..ThrottleSettings::unbounded()
            },
            ..DispatchSettings::default()
        };
        let running = start(&mut endpoint, settings, ChannelShape::request_reply_session());

        running
            .client
            .send(Message::one_way("urn:log", ADDRESS, json!("hi")), soon())
            .await
            .unwrap();
        running.expect_silence().await;

        let dispatcher = running.dispatcher.clone();
        wait_until(|| dispatcher.calls_in_flight() == 0).await;
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        let calls = dispatcher.throttle().stats().calls.unwrap();
        assert_eq!(calls.acquired, 1);
        assert_eq!(calls.released, 1);
        assert_eq!(calls.outstanding, 0);

        running.finish().await.unwrap();
    }

    #[tokio::test]
    async fn datagram_replies_are_addressed_to_reply_to() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint.operation(add()).unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::datagram());

        let request = Message::request("urn:add", ADDRESS, json!([1])).with_reply_to("mem://caller");
        let reply = running.call(request).await;
        assert_eq!(reply.headers.to.unwrap().as_str(), "mem://caller");

        running.finish().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reply_to_none_address_is_dropped() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint.operation(add()).unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());

        let request = Message::request("urn:add", ADDRESS, json!([1])).with_reply_to(courier_protocol::EndpointAddress::none());
        running.client.send(request, soon()).await.unwrap();
        running.expect_silence().await;

        running.finish().await.unwrap();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ordering and concurrency
// ─────────────────────────────────────────────────────────────────────────────

mod ordering {
    use super::*;

    type Events = Arc<Mutex<Vec<String>>>;
    type Log = Mutex<Vec<String>>;

    fn tag(request: &Message) -> String {
        request.body[0].as_str().unwrap_or_default().to_string()
    }

    struct RecordLock(Events);

    impl CallContextInitializer for RecordLock {
        fn before_invoke(&self, _instance: &InstanceContext, request: &Message) -> CorrelationToken {
            self.0.lock().push(format!("locked {}", tag(request)));
            None
        }

        fn after_invoke(&self, _token: CorrelationToken) {}
    }

    fn session_endpoint(events: &Events, mode: ConcurrencyMode) -> EndpointBuilder {
        let invoke_events = events.clone();
        let mut endpoint = EndpointBuilder::new("journal", ADDRESS);
        endpoint
            .concurrency_mode(mode)
            .unwrap()
            .instance_mode(InstanceMode::PerSession)
            .unwrap()
            .instance_provider(|| -> Instance { Arc::new(Log::default()) })
            .unwrap()
            .operation(
                OperationBuilder::from_fn("Append", "urn:append", move |instance: Instance, inputs: Vec<Value>| {
                    let events = invoke_events.clone();
                    async move {
                        let entry = inputs[0].as_str().unwrap_or_default().to_string();
                        let log = instance
                            .downcast_ref::<Log>()
                            .ok_or_else(|| InvokeError::Failed("wrong instance type".into()))?;
                        events.lock().push(format!("start {entry}"));
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        log.lock().push(entry.clone());
                        events.lock().push(format!("end {entry}"));
                        let seen = log.lock().clone();
                        Ok::<_, InvokeError>(InvokeOutput::new(json!(seen)))
                    }
                })
                .initializer(RecordLock(events.clone())),
            )
            .unwrap();
        endpoint
    }

    #[tokio::test(start_paused = true)]
    async fn single_sessions_run_messages_strictly_in_order() {
        let events = Events::default();
        let mut endpoint = session_endpoint(&events, ConcurrencyMode::Single);
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());

        running.client.send(Message::request("urn:append", ADDRESS, json!(["A"])), soon()).await.unwrap();
        running.client.send(Message::request("urn:append", ADDRESS, json!(["B"])), soon()).await.unwrap();

        let first = running.client.receive(soon()).await.unwrap().unwrap();
        let second = running.client.receive(soon()).await.unwrap().unwrap();
        assert_eq!(first.body, json!(["A"]));
        // B observes A's completed effects on the shared session instance.
        assert_eq!(second.body, json!(["A", "B"]));

        assert_eq!(
            *events.lock(),
            vec!["locked A", "start A", "end A", "locked B", "start B", "end B"]
        );
        running.finish().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn multiple_mode_overlaps_calls_of_one_session() {
        let events = Events::default();
        let mut endpoint = session_endpoint(&events, ConcurrencyMode::Multiple);
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());

        running.client.send(Message::request("urn:append", ADDRESS, json!(["A"])), soon()).await.unwrap();
        running.client.send(Message::request("urn:append", ADDRESS, json!(["B"])), soon()).await.unwrap();
        running.client.receive(soon()).await.unwrap().unwrap();
        running.client.receive(soon()).await.unwrap().unwrap();

        let events = events.lock().clone();
        let start_b = events.iter().position(|e| e == "start B").unwrap();
        let end_a = events.iter().position(|e| e == "end A").unwrap();
        assert!(start_b < end_a, "calls did not overlap: {events:?}");
        running.finish().await.unwrap();
    }

    #[tokio::test]
    async fn call_capacity_of_one_blocks_the_second_request() {
        let started = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(tokio::sync::Semaphore::new(0));
        let mut endpoint = EndpointBuilder::new("slow", ADDRESS);
        let (counter, gate) = (started.clone(), release.clone());
        endpoint
            .concurrency_mode(ConcurrencyMode::Multiple)
            .unwrap()
            .instance_mode(InstanceMode::PerCall)
            .unwrap()
            .operation(OperationBuilder::from_fn("Slow", "urn:slow", move |_, inputs: Vec<Value>| {
                let (counter, gate) = (counter.clone(), gate.clone());
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    gate.acquire().await.map_err(|e| InvokeError::Failed(e.to_string()))?.forget();
                    Ok::<_, InvokeError>(InvokeOutput::new(inputs[0].clone()))
                }
            }))
            .unwrap();
        let settings = DispatchSettings {
            throttle: ThrottleSettings {
                max_concurrent_calls: Some(1),
                ..ThrottleSettings::unbounded()
            },
            ..DispatchSettings::default()
        };
        let running = start(&mut endpoint, settings, ChannelShape::request_reply_session());
        let dispatcher = running.dispatcher.clone();

        running.client.send(Message::request("urn:slow", ADDRESS, json!([1])), soon()).await.unwrap();
        running.client.send(Message::request("urn:slow", ADDRESS, json!([2])), soon()).await.unwrap();

        wait_until(|| dispatcher.throttle().stats().calls.is_some_and(|calls| calls.waiting == 1)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        release.add_permits(1);
        let first = running.client.receive(soon()).await.unwrap().unwrap();
        assert_eq!(first.body, json!(1));

        wait_until(|| started.load(Ordering::SeqCst) == 2).await;
        release.add_permits(1);
        let second = running.client.receive(soon()).await.unwrap().unwrap();
        assert_eq!(second.body, json!(2));

        let calls = dispatcher.throttle().stats().calls.unwrap();
        assert_eq!(calls.acquired, 2);
        assert_eq!(calls.over_released, 0);
        running.finish().await.unwrap();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Faults
// ─────────────────────────────────────────────────────────────────────────────

mod faults {
    use super::*;

    fn failing(error: fn() -> InvokeError) -> OperationBuilder {
        OperationBuilder::from_fn("Fail", "urn:fail", move |_, _| async move { Err::<InvokeOutput, _>(error()) })
    }

    #[tokio::test]
    async fn unknown_destination_is_unreachable_and_invokes_nothing() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = invoked.clone();
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint
            .operation(OperationBuilder::from_fn("Add", "urn:add", move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, InvokeError>(InvokeOutput::default()) }
            }))
            .unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::datagram());

        let reply = running.call(Message::request("urn:add", "mem://elsewhere", json!([]))).await;
        let fault = reply.fault.unwrap();
        assert!(fault.is_subcode(Subcodes::DESTINATION_UNREACHABLE));
        assert_eq!(fault.action, actions::ADDRESSING_FAULT);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        let reply = running.call(Message::request("urn:mul", ADDRESS, json!([]))).await;
        assert!(reply.fault.unwrap().is_subcode(Subcodes::ACTION_NOT_SUPPORTED));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        running.finish().await.unwrap();
    }

    #[tokio::test]
    async fn declared_faults_reach_the_caller_unchanged() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint
            .operation(failing(|| {
                InvokeError::Fault(Fault::new(FaultCode::sender("DivideByZero"), "cannot divide by zero"))
            }))
            .unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());

        let request = Message::request("urn:fail", ADDRESS, json!([])).with_fault_to("mem://faults");
        let id = request.message_id();
        let reply = running.call(request).await;
        assert_eq!(reply.relates_to(), id);
        let fault = reply.fault.unwrap();
        assert!(fault.is_subcode("DivideByZero"));
        assert_eq!(fault.reason, "cannot divide by zero");
        assert_eq!(fault.action, actions::FAULT);

        running.finish().await.unwrap();
    }

    #[tokio::test]
    async fn unexpected_errors_become_internal_service_faults() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint.operation(failing(|| InvokeError::Failed("boom".into()))).unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());

        let fault = running.call(Message::request("urn:fail", ADDRESS, json!([]))).await.fault.unwrap();
        assert!(fault.is_subcode(Subcodes::INTERNAL_SERVICE_FAULT));
        assert!(fault.detail.is_none());

        running.finish().await.unwrap();
    }

    #[tokio::test]
    async fn exception_detail_is_included_on_request() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint.operation(failing(|| InvokeError::Failed("boom".into()))).unwrap();
        let settings = DispatchSettings {
            include_exception_detail_in_faults: true,
            ..unbounded()
        };
        let running = start(&mut endpoint, settings, ChannelShape::request_reply_session());

        let fault = running.call(Message::request("urn:fail", ADDRESS, json!([]))).await.fault.unwrap();
        let message = fault.detail.unwrap()["message"].as_str().unwrap().to_string();
        assert!(message.contains("boom"), "detail was {message}");

        running.finish().await.unwrap();
    }

    #[tokio::test]
    async fn disabled_faults_abort_the_session() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint
            .send_faults(false)
            .unwrap()
            .operation(failing(|| InvokeError::Failed("boom".into())))
            .unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());

        running.client.send(Message::request("urn:fail", ADDRESS, json!([])), soon()).await.unwrap();
        // The aborted server end closes the client's inbound side.
        assert!(running.client.receive(soon()).await.unwrap().is_none());
        assert!(running.pump.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unconsumed_must_understand_headers_are_refused() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint
            .operation(add())
            .unwrap()
            .operation(
                OperationBuilder::from_fn("Traced", "urn:traced", |_, _| async {
                    Ok::<_, InvokeError>(InvokeOutput::new(json!("ok")))
                })
                .understands("x-trace"),
            )
            .unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());
        let header = || Header::new("x-trace", json!("t-1")).must_understand();

        let refused = running
            .call(Message::request("urn:add", ADDRESS, json!([1])).with_header(header()))
            .await;
        let fault = refused.fault.unwrap();
        assert!(fault.is_subcode(Subcodes::MUST_UNDERSTAND));
        assert!(fault.reason.contains("x-trace"));

        let accepted = running
            .call(Message::request("urn:traced", ADDRESS, Value::Null).with_header(header()))
            .await;
        assert_eq!(accepted.body, json!("ok"));

        running.finish().await.unwrap();
    }

    #[tokio::test]
    async fn fatal_errors_abort_the_channel_and_surface_from_run() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint.operation(failing(|| InvokeError::Fatal("heap corrupted".into()))).unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());

        running.client.send(Message::request("urn:fail", ADDRESS, json!([])), soon()).await.unwrap();
        let result = running.pump.await.unwrap();
        assert!(matches!(result, Err(DispatchError::Fatal(reason)) if reason == "heap corrupted"));
        assert!(running.client.receive(soon()).await.unwrap().is_none());
        assert_eq!(running.dispatcher.calls_in_flight(), 0);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session lifecycle
// ─────────────────────────────────────────────────────────────────────────────

mod session {
    use super::*;

    fn bounded() -> DispatchSettings {
        DispatchSettings {
            throttle: ThrottleSettings {
                max_concurrent_calls: Some(4),
                max_concurrent_sessions: Some(1),
                max_concurrent_instances: Some(4),
                dynamic_quota: None,
            },
            ..DispatchSettings::default()
        }
    }

    #[tokio::test]
    async fn end_of_session_releases_every_slot() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint.operation(add()).unwrap();
        let running = start(&mut endpoint, bounded(), ChannelShape::request_reply_session());
        let dispatcher = running.dispatcher.clone();

        running.call(Message::request("urn:add", ADDRESS, json!([1, 1]))).await;
        running.call(Message::request("urn:add", ADDRESS, json!([2, 2]))).await;
        assert_eq!(dispatcher.active_channels(), 1);
        let instances = dispatcher.throttle().stats().instance_contexts.unwrap();
        // One per-session instance context, reused by both calls.
        assert_eq!(instances.acquired, 1);
        assert_eq!(instances.outstanding, 1);

        running.finish().await.unwrap();

        let stats = dispatcher.throttle().stats();
        assert_eq!(stats.sessions.unwrap().outstanding, 0);
        assert_eq!(stats.sessions.unwrap().released, 1);
        assert_eq!(stats.instance_contexts.unwrap().outstanding, 0);
        assert_eq!(stats.calls.unwrap().outstanding, 0);
        assert_eq!(dispatcher.active_channels(), 0);
    }

    #[tokio::test]
    async fn failed_open_releases_the_session_slot() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint.operation(add()).unwrap();
        let dispatcher = ChannelDispatcher::builder(bounded())
            .endpoint(endpoint.freeze().unwrap())
            .build()
            .unwrap();
        let (server, _client) = MemoryChannel::pair(ChannelShape::request_reply_session(), Some(ADDRESS.into()));
        server.refuse_next_open();
        let server = Arc::new(server);

        let result = ChannelPump::new(server.clone(), dispatcher.clone()).run().await;
        assert!(matches!(result, Err(DispatchError::Transport(TransportError::Communication(_)))));
        assert_eq!(server.state(), ChannelState::Faulted);
        assert_eq!(dispatcher.throttle().stats().sessions.unwrap().outstanding, 0);
    }

    #[tokio::test]
    async fn terminating_operation_ends_the_session() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint
            .operation(add())
            .unwrap()
            .operation(
                OperationBuilder::from_fn("Bye", "urn:bye", |_, _| async {
                    Ok::<_, InvokeError>(InvokeOutput::new(json!("bye")))
                })
                .terminating(),
            )
            .unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());

        assert_eq!(running.call(Message::request("urn:bye", ADDRESS, Value::Null)).await.body, json!("bye"));
        let refused = running.call(Message::request("urn:add", ADDRESS, json!([1]))).await;
        assert!(refused.fault.unwrap().is_subcode(Subcodes::SESSION_TERMINATED));

        running.finish().await.unwrap();
    }

    #[tokio::test]
    async fn session_opened_notification_precedes_application_messages() {
        let events: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let (opened_events, call_events) = (events.clone(), events.clone());
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint
            .operation(
                OperationBuilder::from_fn("Opened", actions::SESSION_OPENED, move |_, _| {
                    opened_events.lock().push("opened");
                    async { Ok::<_, InvokeError>(InvokeOutput::default()) }
                })
                .one_way()
                .without_deserialization(),
            )
            .unwrap()
            .operation(OperationBuilder::from_fn("Call", "urn:call", move |_, _| {
                call_events.lock().push("call");
                async { Ok::<_, InvokeError>(InvokeOutput::new(json!(true))) }
            }))
            .unwrap();
        let shape = ChannelShape::request_reply_session().with_open_notification();
        let running = start(&mut endpoint, unbounded(), shape);

        let reply = running.call(Message::request("urn:call", ADDRESS, Value::Null)).await;
        assert_eq!(reply.body, json!(true));
        assert_eq!(*events.lock(), vec!["opened", "call"]);

        running.finish().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_closed() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint.operation(add()).unwrap();
        let settings = DispatchSettings {
            idle_timeout_ms: Some(1_000),
            ..unbounded()
        };
        let running = start(&mut endpoint, settings, ChannelShape::request_reply_session());

        running.call(Message::request("urn:add", ADDRESS, json!([1]))).await;
        assert!(running.client.receive(Instant::now() + Duration::from_secs(10)).await.unwrap().is_none());
        assert!(running.pump.await.unwrap().is_ok());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Duplex correlation through the pump
// ─────────────────────────────────────────────────────────────────────────────

mod duplex {
    use super::*;

    #[tokio::test]
    async fn pumped_replies_reach_the_correlated_request() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint.operation(add()).unwrap();
        let dispatcher = ChannelDispatcher::builder(unbounded())
            .endpoint(endpoint.freeze().unwrap())
            .build()
            .unwrap();
        let (server, client) = MemoryChannel::pair(ChannelShape::duplex_session(), Some(ADDRESS.into()));
        let server = Arc::new(server);
        let (correlator, _unmatched) = RequestCorrelator::new(server.clone());
        let correlator = Arc::new(correlator);
        let pump = ChannelPump::new(server, dispatcher).with_correlator(correlator.clone());
        let pumping = tokio::spawn(async move { pump.run().await });

        // An ordinary call first, so the pump owns the receive side.
        client.send(Message::request("urn:add", ADDRESS, json!([1, 2])), soon()).await.unwrap();
        assert_eq!(client.receive(soon()).await.unwrap().unwrap().body, json!(3));
        assert!(correlator.is_pumped());

        let callback = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send(Message::request("urn:notify", "mem://client", json!("ping")), Duration::from_secs(5))
                    .await
            })
        };
        let request = client.receive(soon()).await.unwrap().unwrap();
        assert_eq!(request.action(), "urn:notify");
        client.send(reply_to(&request, json!("pong")), soon()).await.unwrap();

        let reply = callback.await.unwrap().unwrap();
        assert_eq!(reply.body, json!("pong"));
        assert_eq!(correlator.pending_count(), 0);

        client.close(soon()).await.unwrap();
        pumping.await.unwrap().unwrap();
    }

    type Callback = Arc<RequestCorrelator<MemoryChannel>>;
    type Outcome = Arc<Mutex<Option<Result<Message, TransportError>>>>;

    /// An operation that asks the client back through the correlator and replies with its answer.
    fn ask(correlator: &Callback, outcome: &Outcome) -> OperationBuilder {
        let (correlator, outcome) = (correlator.clone(), outcome.clone());
        OperationBuilder::from_fn("Ask", "urn:ask", move |_, _| {
            let (correlator, outcome) = (correlator.clone(), outcome.clone());
            async move {
                let answer = correlator
                    .send(Message::request("urn:notify", "mem://client", json!("ping")), Duration::from_secs(30))
                    .await;
                *outcome.lock() = Some(answer.clone());
                answer
                    .map(|reply| InvokeOutput::new(reply.body))
                    .map_err(|e| InvokeError::Failed(e.to_string()))
            }
        })
    }

    fn duplex_pump(
        configure: impl FnOnce(&Callback, &mut EndpointBuilder),
    ) -> (MemoryChannel, JoinHandle<Result<(), DispatchError>>) {
        let (server, client) = MemoryChannel::pair(ChannelShape::duplex_session(), Some(ADDRESS.into()));
        let server = Arc::new(server);
        let (correlator, _unmatched) = RequestCorrelator::new(server.clone());
        let correlator = Arc::new(correlator);
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        configure(&correlator, &mut endpoint);
        let dispatcher = ChannelDispatcher::builder(unbounded())
            .endpoint(endpoint.freeze().unwrap())
            .build()
            .unwrap();
        let pump = ChannelPump::new(server, dispatcher).with_correlator(correlator);
        (client, tokio::spawn(async move { pump.run().await }))
    }

    #[tokio::test(start_paused = true)]
    async fn closing_the_channel_fails_calls_waiting_on_a_callback() {
        let outcome = Outcome::default();
        let (client, pumping) = duplex_pump(|correlator, endpoint| {
            endpoint
                .concurrency_mode(ConcurrencyMode::Multiple)
                .unwrap()
                .operation(ask(correlator, &outcome))
                .unwrap();
        });

        client.send(Message::request("urn:ask", ADDRESS, Value::Null), soon()).await.unwrap();
        let callback = client.receive(soon()).await.unwrap().unwrap();
        assert_eq!(callback.action(), "urn:notify");
        client.close(soon()).await.unwrap();

        // Teardown must not sit out the callback's 30s timeout.
        let finished = tokio::time::timeout(Duration::from_secs(5), pumping).await;
        assert!(finished.is_ok(), "pump still draining after close");
        let outcome = outcome.lock();
        assert!(matches!(outcome.as_ref(), Some(Err(TransportError::Closed))), "callback outcome: {outcome:?}");
    }

    #[tokio::test]
    async fn reentrant_calls_admit_nested_requests_during_a_callback() {
        let outcome = Outcome::default();
        let (client, pumping) = duplex_pump(|correlator, endpoint| {
            endpoint
                .concurrency_mode(ConcurrencyMode::Reentrant)
                .unwrap()
                .instance_mode(InstanceMode::PerSession)
                .unwrap()
                .operation(ask(correlator, &outcome))
                .unwrap()
                .operation(add())
                .unwrap();
        });

        client.send(Message::request("urn:ask", ADDRESS, Value::Null), soon()).await.unwrap();
        let callback = client.receive(soon()).await.unwrap().unwrap();
        assert_eq!(callback.action(), "urn:notify");

        // The asking call still owns the session instance; the nested call runs anyway.
        client.send(Message::request("urn:add", ADDRESS, json!([2, 3])), soon()).await.unwrap();
        let nested = client.receive(soon()).await.unwrap().unwrap();
        assert_eq!(nested.body, json!(5));

        client.send(reply_to(&callback, json!("pong")), soon()).await.unwrap();
        let answered = client.receive(soon()).await.unwrap().unwrap();
        assert_eq!(answered.action(), "urn:askResponse");
        assert_eq!(answered.body, json!("pong"));

        client.close(soon()).await.unwrap();
        pumping.await.unwrap().unwrap();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extension hooks and admission
// ─────────────────────────────────────────────────────────────────────────────

mod hooks {
    use super::*;
    use courier_dispatch::{
        AuthorizationHook, CallSummary, CompletionHook, ImpersonationScope, Impersonator, MessageInspector,
        OperationSelector, ResolvedChannel,
    };

    type Events = Arc<Mutex<Vec<String>>>;

    fn recorded(name: &'static str, events: &Events) -> OperationBuilder {
        let events = events.clone();
        OperationBuilder::from_fn(name, format!("urn:{}", name.to_lowercase()), move |_, _| {
            events.lock().push(format!("invoke {name}"));
            async move { Ok::<_, InvokeError>(InvokeOutput::new(json!(name))) }
        })
    }

    struct RequireUser;

    impl AuthorizationHook for RequireUser {
        fn check(&self, request: &Message, _channel: &ResolvedChannel) -> Result<(), Fault> {
            match request.headers.get("x-user") {
                Some(_) => Ok(()),
                None => Err(Fault::access_denied("caller is anonymous")),
            }
        }
    }

    #[tokio::test]
    async fn rejected_callers_get_access_denied_and_nothing_runs() {
        let events = Events::default();
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint
            .authorization_hook(RequireUser)
            .unwrap()
            .operation(recorded("Secret", &events))
            .unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());

        let refused = running.call(Message::request("urn:secret", ADDRESS, Value::Null)).await;
        let fault = refused.fault.unwrap();
        assert!(fault.is_subcode(Subcodes::ACCESS_DENIED));
        assert!(events.lock().is_empty());

        let request = Message::request("urn:secret", ADDRESS, Value::Null).with_header(Header::new("x-user", json!("ana")));
        assert_eq!(running.call(request).await.body, json!("Secret"));
        assert_eq!(*events.lock(), vec!["invoke Secret"]);

        running.finish().await.unwrap();
    }

    struct RecordImpersonation(Events);

    impl Impersonator for RecordImpersonation {
        fn enter(&self, request: &Message) -> Result<ImpersonationScope, Fault> {
            self.0.lock().push(format!("enter {}", request.action()));
            let events = self.0.clone();
            Ok(ImpersonationScope::new(move || events.lock().push("revert".into())))
        }
    }

    #[tokio::test]
    async fn impersonation_wraps_only_operations_that_ask_for_it() {
        let events = Events::default();
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint
            .impersonator(RecordImpersonation(events.clone()))
            .unwrap()
            .operation(recorded("Audit", &events).impersonate())
            .unwrap()
            .operation(recorded("Plain", &events))
            .unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());

        running.call(Message::request("urn:audit", ADDRESS, Value::Null)).await;
        running.call(Message::request("urn:plain", ADDRESS, Value::Null)).await;
        assert_eq!(*events.lock(), vec!["enter urn:audit", "invoke Audit", "revert", "invoke Plain"]);

        running.finish().await.unwrap();
    }

    #[test]
    fn invocations_run_on_the_bound_runtime() {
        let executor = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("courier-exec")
            .enable_all()
            .build()
            .unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint
            .execution_handle(executor.handle().clone())
            .unwrap()
            .operation(OperationBuilder::from_fn("Where", "urn:where", |_, _| async {
                let thread = std::thread::current().name().unwrap_or_default().to_string();
                Ok::<_, InvokeError>(InvokeOutput::new(json!(thread)))
            }))
            .unwrap();

        runtime.block_on(async {
            let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());
            let reply = running.call(Message::request("urn:where", ADDRESS, Value::Null)).await;
            assert_eq!(reply.body, json!("courier-exec"));
            running.finish().await.unwrap();
        });
    }

    /// Routes by the `x-op` header instead of the action.
    struct ByHeader;

    impl OperationSelector for ByHeader {
        fn select(&self, request: &Message) -> Option<String> {
            request.headers.get("x-op").and_then(Value::as_str).map(str::to_string)
        }
    }

    #[tokio::test]
    async fn selector_routes_by_name_and_falls_back_to_unhandled() {
        let events = Events::default();
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint
            .selector(ByHeader)
            .unwrap()
            .operation(recorded("Ping", &events))
            .unwrap()
            .operation(recorded("Pong", &events))
            .unwrap()
            .unhandled_operation(recorded("Fallback", &events))
            .unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());
        let routed = |op: &str| Message::request("urn:any", ADDRESS, Value::Null).with_header(Header::new("x-op", json!(op)));

        assert_eq!(running.call(routed("Pong")).await.body, json!("Pong"));
        assert_eq!(running.call(routed("Missing")).await.body, json!("Fallback"));
        assert_eq!(running.call(Message::request("urn:ping", ADDRESS, Value::Null)).await.body, json!("Fallback"));
        assert_eq!(*events.lock(), vec!["invoke Pong", "invoke Fallback", "invoke Fallback"]);

        running.finish().await.unwrap();
    }

    #[tokio::test]
    async fn unhandled_operation_catches_unknown_actions() {
        let events = Events::default();
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint
            .operation(add())
            .unwrap()
            .unhandled_operation(recorded("Fallback", &events))
            .unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());

        assert_eq!(running.call(Message::request("urn:add", ADDRESS, json!([4, 4]))).await.body, json!(8));
        let caught = running.call(Message::request("urn:mul", ADDRESS, json!([4, 4]))).await;
        assert!(caught.fault.is_none());
        assert_eq!(caught.body, json!("Fallback"));

        running.finish().await.unwrap();
    }

    #[tokio::test]
    async fn calls_wait_for_dynamic_quota() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint.operation(add()).unwrap();
        let settings = DispatchSettings {
            throttle: ThrottleSettings {
                dynamic_quota: Some(0),
                ..ThrottleSettings::unbounded()
            },
            ..DispatchSettings::default()
        };
        let running = start(&mut endpoint, settings, ChannelShape::request_reply_session());
        let dispatcher = running.dispatcher.clone();

        running.client.send(Message::request("urn:add", ADDRESS, json!([1, 2])), soon()).await.unwrap();
        wait_until(|| dispatcher.throttle().stats().dynamic_quota.is_some_and(|quota| quota.waiting == 1)).await;

        dispatcher.throttle().increment_quota(1);
        let reply = running.client.receive(soon()).await.unwrap().unwrap();
        assert_eq!(reply.body, json!(3));

        wait_until(|| dispatcher.calls_in_flight() == 0).await;
        let quota = dispatcher.throttle().stats().dynamic_quota.unwrap();
        assert_eq!(quota.acquired, 1);
        assert_eq!(quota.outstanding, 0);

        running.finish().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lock_wait_past_admission_timeout_is_server_too_busy() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint
            .instance_mode(InstanceMode::PerSession)
            .unwrap()
            .operation(OperationBuilder::from_fn("Slow", "urn:slow", |_, _| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, InvokeError>(InvokeOutput::new(json!("done")))
            }))
            .unwrap();
        let settings = DispatchSettings {
            admission_timeout_ms: 100,
            ..unbounded()
        };
        let running = start(&mut endpoint, settings, ChannelShape::request_reply_session());

        let first = Message::request("urn:slow", ADDRESS, Value::Null);
        let second = Message::request("urn:slow", ADDRESS, Value::Null);
        let (first_id, second_id) = (first.message_id(), second.message_id());
        running.client.send(first, soon()).await.unwrap();
        running.client.send(second, soon()).await.unwrap();

        let busy = running.client.receive(soon()).await.unwrap().unwrap();
        assert_eq!(busy.relates_to(), second_id);
        assert!(busy.fault.unwrap().is_subcode(Subcodes::SERVER_TOO_BUSY));

        let done = running.client.receive(soon()).await.unwrap().unwrap();
        assert_eq!(done.relates_to(), first_id);
        assert_eq!(done.body, json!("done"));

        running.finish().await.unwrap();
    }

    struct RecordSummaries(Arc<Mutex<Vec<CallSummary>>>);

    impl CompletionHook for RecordSummaries {
        fn on_complete(&self, summary: &CallSummary) {
            self.0.lock().push(summary.clone());
        }
    }

    #[tokio::test]
    async fn completion_hooks_see_every_finished_call() {
        let summaries: Arc<Mutex<Vec<CallSummary>>> = Arc::default();
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint
            .completion_hook(RecordSummaries(summaries.clone()))
            .unwrap()
            .operation(add())
            .unwrap()
            .operation(OperationBuilder::from_fn("Fail", "urn:fail", |_, _| async {
                Err::<InvokeOutput, _>(InvokeError::Failed("boom".into()))
            }))
            .unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());

        running.call(Message::request("urn:add", ADDRESS, json!([1, 1]))).await;
        running.call(Message::request("urn:fail", ADDRESS, json!([]))).await;
        wait_until(|| summaries.lock().len() == 2).await;

        let summaries = summaries.lock().clone();
        assert_eq!(
            summaries[0],
            CallSummary {
                action: "urn:add".into(),
                operation: Some("Add".into()),
                replied: true,
                faulted: false,
                aborted: false,
            }
        );
        assert_eq!(summaries[1].operation.as_deref(), Some("Fail"));
        assert!(summaries[1].faulted);
        assert!(summaries[1].replied);
        assert!(!summaries[1].aborted);

        running.finish().await.unwrap();
    }

    /// Carries the request's trace id over to the reply.
    struct EchoTrace;

    impl MessageInspector for EchoTrace {
        fn after_receive(&self, request: &mut Message, _channel: &ResolvedChannel) -> CorrelationToken {
            let trace = request.headers.get("x-trace")?.as_str()?.to_string();
            Some(Box::new(trace))
        }

        fn before_send(&self, reply: &mut Option<Message>, token: CorrelationToken) {
            let Some(trace) = token.and_then(|token| token.downcast::<String>().ok()) else {
                return;
            };
            if let Some(reply) = reply {
                reply.headers.extra.push(Header::new("x-trace", json!(*trace)));
            }
        }
    }

    #[tokio::test]
    async fn inspector_tokens_travel_from_receive_to_send() {
        let mut endpoint = EndpointBuilder::new("calc", ADDRESS);
        endpoint.message_inspector(EchoTrace).unwrap().operation(add()).unwrap();
        let running = start(&mut endpoint, unbounded(), ChannelShape::request_reply_session());

        let traced = Message::request("urn:add", ADDRESS, json!([1])).with_header(Header::new("x-trace", json!("t-42")));
        let reply = running.call(traced).await;
        assert_eq!(reply.headers.get("x-trace"), Some(&json!("t-42")));

        let untraced = running.call(Message::request("urn:add", ADDRESS, json!([1]))).await;
        assert!(untraced.headers.get("x-trace").is_none());

        running.finish().await.unwrap();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

mod settings {
    use super::*;

    #[test]
    fn settings_load_from_json_with_defaults() {
        let settings = DispatchSettings::from_json(
            r#"{
                "sendTimeoutMs": 250,
                "idleTimeoutMs": 30000,
                "includeExceptionDetailInFaults": true,
                "throttle": { "maxConcurrentCalls": 3, "dynamicQuota": 1 }
            }"#,
        )
        .unwrap();

        assert_eq!(settings.send_timeout(), Duration::from_millis(250));
        assert_eq!(settings.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(settings.open_timeout(), Duration::from_secs(60));
        assert!(settings.include_exception_detail_in_faults);
        assert_eq!(settings.throttle.max_concurrent_calls, Some(3));
        assert_eq!(settings.throttle.dynamic_quota, Some(1));
        assert_eq!(
            settings.throttle.max_concurrent_sessions,
            ThrottleSettings::default().max_concurrent_sessions
        );
    }

    #[test]
    fn malformed_settings_are_a_config_error() {
        let err = DispatchSettings::from_json("{ \"sendTimeoutMs\": \"soon\" }").unwrap_err();
        assert!(err.to_string().starts_with("failed to parse settings"));
    }

    #[test]
    fn init_tracing_is_idempotent() {
        courier::init_tracing(false);
        assert!(!courier::init_tracing(true));
    }
}
