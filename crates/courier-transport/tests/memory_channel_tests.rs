//! In-memory channel tests: delivery, end of session, abort and deadlines.

use std::time::Duration;

use courier_protocol::Message;
use courier_transport::{ChannelShape, ChannelState, MemoryChannel, TransportChannel, TransportError};
use serde_json::json;
use tokio::time::Instant;

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

#[tokio::test]
async fn messages_flow_both_ways() {
    let (server, client) = MemoryChannel::pair(ChannelShape::duplex_session(), Some("mem://svc".into()));
    server.open(soon()).await.unwrap();
    assert_eq!(server.state(), ChannelState::Opened);

    client.send(Message::request("urn:a", "mem://svc", json!(1)), soon()).await.unwrap();
    let received = server.receive(soon()).await.unwrap().unwrap();
    assert_eq!(received.action(), "urn:a");

    server.send(Message::reply("urn:aResponse", json!(2)), soon()).await.unwrap();
    let reply = client.receive(soon()).await.unwrap().unwrap();
    assert_eq!(reply.body, json!(2));
}

#[tokio::test]
async fn pair_shares_session_id_and_reports_address() {
    let (server, client) = MemoryChannel::pair(ChannelShape::duplex_session(), Some("mem://svc".into()));
    assert!(server.session_id().is_some());
    assert_eq!(server.session_id(), client.session_id());
    assert_eq!(server.local_address().unwrap().as_str(), "mem://svc");
    assert!(client.local_address().is_none());

    let (datagram, _) = MemoryChannel::pair(ChannelShape::datagram(), None);
    assert!(datagram.session_id().is_none());
}

#[tokio::test]
async fn peer_close_ends_session() {
    let (server, client) = MemoryChannel::pair(ChannelShape::duplex_session(), None);
    client.send(Message::one_way("urn:a", "mem://svc", json!(null)), soon()).await.unwrap();
    client.close(soon()).await.unwrap();

    // Buffered messages drain before end of session.
    assert!(server.receive(soon()).await.unwrap().is_some());
    assert!(server.receive(soon()).await.unwrap().is_none());
}

#[tokio::test]
async fn local_close_wakes_pending_receive() {
    let (server, _client) = MemoryChannel::pair(ChannelShape::duplex_session(), None);
    let server = std::sync::Arc::new(server);

    let receiver = {
        let server = server.clone();
        tokio::spawn(async move { server.receive(soon()).await })
    };
    tokio::task::yield_now().await;
    server.close(soon()).await.unwrap();

    assert_eq!(receiver.await.unwrap(), Ok(None));
    assert_eq!(server.state(), ChannelState::Closed);
}

#[tokio::test]
async fn abort_fails_receive_and_send() {
    let (server, _client) = MemoryChannel::pair(ChannelShape::duplex_session(), None);
    server.abort();
    assert_eq!(server.state(), ChannelState::Faulted);
    assert_eq!(server.receive(soon()).await, Err(TransportError::Aborted));
    assert_eq!(
        server.send(Message::reply("urn:x", json!(null)), soon()).await,
        Err(TransportError::Aborted)
    );

    // Close after abort keeps the channel faulted.
    server.close(soon()).await.unwrap();
    assert_eq!(server.state(), ChannelState::Faulted);
}

#[tokio::test(start_paused = true)]
async fn receive_honours_deadline() {
    let (server, _client) = MemoryChannel::pair(ChannelShape::duplex_session(), None);
    let outcome = server.receive(Instant::now() + Duration::from_millis(50)).await;
    assert!(matches!(outcome, Err(TransportError::Timeout { operation: "receive" })));
}

#[tokio::test]
async fn refused_open_faults_channel() {
    let (server, _client) = MemoryChannel::pair(ChannelShape::duplex_session(), None);
    server.refuse_next_open();
    assert!(matches!(server.open(soon()).await, Err(TransportError::Communication(_))));
    assert_eq!(server.state(), ChannelState::Faulted);
}
