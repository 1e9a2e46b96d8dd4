//! Contract Test: Request Handling
//!
//! Drives a CoapServer with encoded datagrams and checks what it writes back.
//!
//! Constraints verified:
//! - GET with Observe=0 registers, Observe=1 deregisters
//! - Every state change (PUT, POST, DELETE) reaches the observers
//! - A reset to a notification ends the subscription, even after the object was swapped
//! - An unacknowledged notification ends the subscription
//! - POST to a missing child creates it, POST that swaps the object keeps observers
//! - Empty CON pings are answered with RST
//! - Blockwise transfers in both directions, with a cap on uploads
//! - Slow resources answer with an empty ACK and a separate response

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use coap_core::message::{BlockOption, MessageType, Method, option_number};
use coap_core::traits::ReliabilityEvent;
use coap_core::{
    CoapServer, Code, RemovalReason, Request, Response, ResourceTree, ServerConfig, ServerEvent,
    Token,
};
use common::*;
use tokio::sync::mpsc;

const OBSERVER: &str = "10.0.0.1:5683";
const WRITER: &str = "10.0.0.9:5683";

fn config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.reliability = patient();
    config
}

fn server_with(
    config: ServerConfig,
) -> (CoapServer, mpsc::Receiver<ServerEvent>, Arc<RecordingTransport>) {
    let mut tree = ResourceTree::new();
    tree.add("basic", TextResource::boxed("hello")).unwrap();
    tree.add("basic/child", TextResource::boxed("nested")).unwrap();
    tree.add("storage", Box::new(ContainerResource)).unwrap();
    tree.add("config", SwappingResource::boxed("v1")).unwrap();
    tree.add(
        "slow",
        DelayedResource::boxed("slowly", Duration::from_millis(20)),
    )
    .unwrap();

    let transport = RecordingTransport::new();
    let (server, events) = CoapServer::with_transport(config, tree, transport.clone())
        .expect("server assembles");
    (server, events, transport)
}

fn server() -> (CoapServer, mpsc::Receiver<ServerEvent>, Arc<RecordingTransport>) {
    server_with(config())
}

fn request(method: Method, path: &str, from: &str, token: u8, mid: u16) -> Request {
    Request::new(method, path)
        .with_source(peer(from))
        .with_token(Token::from(token))
        .with_message_id(mid)
}

async fn send(server: &CoapServer, request: &Request) {
    let source: SocketAddr = request.source.expect("request has a source");
    server
        .handle_datagram(&datagram(request), source)
        .await
        .expect("datagram handled");
}

fn drain(events: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

async fn observe(server: &CoapServer, path: &str, token: u8) {
    let subscribe = request(Method::Get, path, OBSERVER, token, 100).with_observe(0);
    send(server, &subscribe).await;
}

#[tokio::test]
async fn get_with_observe_registers_and_answers_with_sequence_number() {
    let (server, mut events, transport) = server();

    let subscribe = request(Method::Get, "basic", OBSERVER, 7, 100).with_observe(0);
    send(&server, &subscribe).await;

    let sent = transport.take();
    assert_eq!(sent.len(), 1);
    let (response, destination) = &sent[0];
    assert_eq!(*destination, peer(OBSERVER));
    assert_eq!(response.mtype, MessageType::Acknowledgement);
    assert_eq!(response.message_id, Some(100));
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.token, Token::from(7));
    assert_eq!(response.observe(), Some(0));
    assert_eq!(response.payload, b"hello");

    assert_eq!(
        drain(&mut events),
        vec![ServerEvent::ObserverRegistered {
            path: "basic".to_string(),
            peer: peer(OBSERVER),
            token: Token::from(7),
        }]
    );
}

#[tokio::test]
async fn put_notifies_observers() {
    let (server, mut events, transport) = server();
    observe(&server, "basic", 7).await;
    transport.take();
    drain(&mut events);

    let put = request(Method::Put, "basic", WRITER, 1, 200).with_payload("world");
    send(&server, &put).await;

    let sent = transport.take();
    assert_eq!(sent.len(), 2);

    let (ack, destination) = &sent[0];
    assert_eq!(*destination, peer(WRITER));
    assert_eq!(ack.code, Code::CHANGED);
    assert_eq!(ack.mtype, MessageType::Acknowledgement);

    let (notification, destination) = &sent[1];
    assert_eq!(*destination, peer(OBSERVER));
    assert_eq!(notification.mtype, MessageType::Confirmable);
    assert_eq!(notification.code, Code::CONTENT);
    assert_eq!(notification.observe(), Some(1));
    assert_eq!(notification.token, Token::from(7));
    assert_eq!(notification.payload, b"world");
    assert_eq!(server.pending_retransmissions(), 1);

    assert!(drain(&mut events).contains(&ServerEvent::NotificationSent {
        path: "basic".to_string(),
        peer: peer(OBSERVER),
        code: Code::CONTENT,
    }));
}

#[tokio::test]
async fn ack_stops_retransmission_and_keeps_observer() {
    let (server, _events, transport) = server();
    observe(&server, "basic", 7).await;
    transport.take();
    send(&server, &request(Method::Put, "basic", WRITER, 1, 200).with_payload("x")).await;
    let notification_mid = transport.take()[1].0.message_id.unwrap();

    server
        .handle_datagram(&empty(MessageType::Acknowledgement, notification_mid), peer(OBSERVER))
        .await
        .unwrap();

    assert_eq!(server.pending_retransmissions(), 0);
    assert_eq!(server.observe().relations().read().await.observer_count(), 1);
}

#[tokio::test]
async fn reset_ends_the_subscription() {
    let (server, mut events, transport) = server();
    observe(&server, "basic", 7).await;
    transport.take();
    send(&server, &request(Method::Put, "basic", WRITER, 1, 200).with_payload("x")).await;
    let notification_mid = transport.take()[1].0.message_id.unwrap();
    drain(&mut events);

    server
        .handle_datagram(&empty(MessageType::Reset, notification_mid), peer(OBSERVER))
        .await
        .unwrap();

    assert!(server.observe().relations().is_empty().await);
    assert_eq!(server.pending_retransmissions(), 0);
    assert_eq!(
        drain(&mut events),
        vec![ServerEvent::ObserverRemoved {
            path: "basic".to_string(),
            peer: peer(OBSERVER),
            reason: RemovalReason::Reset,
        }]
    );

    send(&server, &request(Method::Put, "basic", WRITER, 2, 201).with_payload("y")).await;
    assert_eq!(transport.take().len(), 1, "only the writer hears back");
}

#[tokio::test]
async fn reset_after_the_object_was_swapped_ends_the_subscription() {
    let (server, mut events, transport) = server();
    observe(&server, "config", 7).await;
    transport.take();

    assert_eq!(server.notify("config").await.unwrap(), 1);
    let before_swap = transport.take()[0].0.message_id.unwrap();

    send(&server, &request(Method::Post, "config", WRITER, 1, 500).with_payload("v2")).await;
    assert_eq!(transport.take().len(), 2);
    drain(&mut events);

    server
        .handle_datagram(&empty(MessageType::Reset, before_swap), peer(OBSERVER))
        .await
        .unwrap();

    assert!(server.observe().relations().is_empty().await);
    assert_eq!(
        drain(&mut events),
        vec![ServerEvent::ObserverRemoved {
            path: "config".to_string(),
            peer: peer(OBSERVER),
            reason: RemovalReason::Reset,
        }]
    );
}

#[tokio::test]
async fn unacknowledged_notification_after_a_swap_ends_the_subscription() {
    let mut tree = ResourceTree::new();
    let original = tree.add("config", SwappingResource::boxed("v1")).unwrap();
    let transport = RecordingTransport::new();
    let (server, mut events) =
        CoapServer::with_transport(config(), tree, transport.clone()).expect("server assembles");

    observe(&server, "config", 7).await;
    send(&server, &request(Method::Post, "config", WRITER, 1, 500).with_payload("v2")).await;
    drain(&mut events);

    // the give-up still names the object that was observed before the swap
    let subscribe = request(Method::Get, "config", OBSERVER, 7, 100).with_observe(0);
    let unanswered = Response::for_request(&subscribe);
    server
        .handle_reliability_event(ReliabilityEvent::Exhausted {
            resource: original,
            request: subscribe,
            response: unanswered,
        })
        .await;

    assert!(server.observe().relations().is_empty().await);
    assert_eq!(
        drain(&mut events),
        vec![ServerEvent::ObserverRemoved {
            path: "config".to_string(),
            peer: peer(OBSERVER),
            reason: RemovalReason::Unacknowledged,
        }]
    );
}

#[tokio::test]
async fn get_with_observe_one_deregisters() {
    let (server, mut events, _transport) = server();
    observe(&server, "basic", 7).await;
    drain(&mut events);

    let cancel = request(Method::Get, "basic", OBSERVER, 7, 101).with_observe(1);
    send(&server, &cancel).await;

    assert!(server.observe().relations().is_empty().await);
    assert_eq!(
        drain(&mut events),
        vec![ServerEvent::ObserverRemoved {
            path: "basic".to_string(),
            peer: peer(OBSERVER),
            reason: RemovalReason::Deregistered,
        }]
    );
}

#[tokio::test]
async fn delete_sends_not_found_to_observers_of_the_subtree() {
    let (server, _events, transport) = server();
    observe(&server, "basic", 7).await;
    observe(&server, "basic/child", 8).await;
    transport.take();

    send(&server, &request(Method::Delete, "basic", WRITER, 1, 300)).await;

    let sent = transport.take();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].0.code, Code::DELETED);
    assert_eq!(sent[0].1, peer(WRITER));

    let mut tokens: Vec<_> = sent[1..]
        .iter()
        .map(|(notice, destination)| {
            assert_eq!(*destination, peer(OBSERVER));
            assert_eq!(notice.code, Code::NOT_FOUND);
            assert_eq!(notice.observe(), None);
            notice.token.clone()
        })
        .collect();
    tokens.sort();
    assert_eq!(tokens, vec![Token::from(7), Token::from(8)]);

    assert!(server.observe().relations().is_empty().await);
    assert_eq!(server.resource_paths().await, vec!["storage", "config", "slow"]);

    send(&server, &request(Method::Get, "basic", WRITER, 2, 301)).await;
    assert_eq!(transport.take()[0].0.code, Code::NOT_FOUND);
}

#[tokio::test]
async fn post_to_missing_child_creates_it() {
    let (server, _events, transport) = server();

    let post = request(Method::Post, "storage/note", WRITER, 1, 400).with_payload("remember");
    send(&server, &post).await;

    let (created, _) = &transport.take()[0];
    assert_eq!(created.code, Code::CREATED);
    let location: Vec<_> = created.option_values(option_number::LOCATION_PATH).collect();
    assert_eq!(location, vec![&b"storage"[..], &b"note"[..]]);

    send(&server, &request(Method::Get, "storage/note", WRITER, 2, 401)).await;
    let (fetched, _) = &transport.take()[0];
    assert_eq!(fetched.code, Code::CONTENT);
    assert_eq!(fetched.payload, b"remember");

    send(&server, &request(Method::Post, "nowhere/deep/path", WRITER, 3, 402)).await;
    assert_eq!(transport.take()[0].0.code, Code::NOT_FOUND);
}

#[tokio::test]
async fn post_that_swaps_the_object_keeps_observers() {
    let (server, _events, transport) = server();
    observe(&server, "config", 7).await;
    transport.take();

    let post = request(Method::Post, "config", WRITER, 1, 500).with_payload("v2");
    send(&server, &post).await;

    let sent = transport.take();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0.code, Code::CHANGED);
    let (notification, destination) = &sent[1];
    assert_eq!(*destination, peer(OBSERVER));
    assert_eq!(notification.payload, b"v2");
    assert_eq!(notification.observe(), Some(1));
}

#[tokio::test]
async fn unsupported_method_is_refused() {
    let (server, _events, transport) = server();

    send(&server, &request(Method::Delete, "storage", WRITER, 1, 600)).await;

    assert_eq!(transport.take()[0].0.code, Code::METHOD_NOT_ALLOWED);
    assert!(server.resource_paths().await.contains(&"storage".to_string()));
}

#[tokio::test]
async fn empty_confirmable_is_answered_with_reset() {
    let (server, _events, transport) = server();

    server
        .handle_datagram(&empty(MessageType::Confirmable, 77), peer(WRITER))
        .await
        .unwrap();

    let sent = transport.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.mtype, MessageType::Reset);
    assert_eq!(sent[0].0.message_id, Some(77));
    assert_eq!(sent[0].0.code, Code::EMPTY);
}

#[tokio::test]
async fn malformed_datagram_is_rejected() {
    let (server, _events, transport) = server();

    let result = server.handle_datagram(&[0xFF, 0x00], peer(WRITER)).await;

    assert!(result.is_err());
    assert_eq!(transport.count(), 0);
}

#[tokio::test]
async fn blockwise_in_both_directions() {
    let mut config = config();
    config.blockwise.max_block_size = 16;
    let (server, _events, transport) = server_with(config);

    // Block1 upload of 20 bytes
    let mut first = request(Method::Put, "basic", WRITER, 1, 700).with_payload(vec![b'a'; 16]);
    first.set_block1(BlockOption::new(0, true, 0));
    send(&server, &first).await;
    let (cont, _) = &transport.take()[0];
    assert_eq!(cont.code, Code::CONTINUE);
    assert_eq!(cont.block1(), Some(BlockOption::new(0, true, 0)));

    let mut last = request(Method::Put, "basic", WRITER, 1, 701).with_payload(vec![b'b'; 4]);
    last.set_block1(BlockOption::new(1, false, 0));
    send(&server, &last).await;
    assert_eq!(transport.take()[0].0.code, Code::CHANGED);

    // Block2 download of the same 20 bytes
    send(&server, &request(Method::Get, "basic", WRITER, 2, 702)).await;
    let (block0, _) = &transport.take()[0];
    assert_eq!(block0.payload, vec![b'a'; 16]);
    assert_eq!(block0.block2(), Some(BlockOption::new(0, true, 0)));

    let mut follow_up = request(Method::Get, "basic", WRITER, 3, 703);
    follow_up.set_block2(BlockOption::new(1, false, 0));
    send(&server, &follow_up).await;
    let (block1, _) = &transport.take()[0];
    assert_eq!(block1.payload, vec![b'b'; 4]);
    assert_eq!(block1.block2(), Some(BlockOption::new(1, false, 0)));
}

#[tokio::test]
async fn oversized_upload_is_refused() {
    let mut config = config();
    config.blockwise.max_block_size = 16;
    config.blockwise.max_body_size = 32;
    let (server, _events, transport) = server_with(config);

    for num in 0..2 {
        let mut block = request(Method::Put, "basic", WRITER, 1, 710 + num as u16)
            .with_payload(vec![b'a'; 16]);
        block.set_block1(BlockOption::new(num, true, 0));
        send(&server, &block).await;
        assert_eq!(transport.take()[0].0.code, Code::CONTINUE);
    }

    let mut overflow = request(Method::Put, "basic", WRITER, 1, 712).with_payload(vec![b'a'; 16]);
    overflow.set_block1(BlockOption::new(2, true, 0));
    send(&server, &overflow).await;

    let (refused, _) = &transport.take()[0];
    assert_eq!(refused.code, Code::REQUEST_ENTITY_TOO_LARGE);
    assert_eq!(refused.uint_option(option_number::SIZE1), Some(32));

    send(&server, &request(Method::Get, "basic", WRITER, 2, 713)).await;
    assert_eq!(transport.take()[0].0.payload, b"hello", "resource untouched");
}

#[tokio::test]
async fn slow_resource_answers_separately() {
    let (server, mut events, transport) = server();

    let subscribe = request(Method::Get, "slow", OBSERVER, 9, 800).with_observe(0);
    send(&server, &subscribe).await;

    let sent = transport.take();
    assert_eq!(sent.len(), 1, "only the empty ACK goes out right away");
    let (ack, destination) = &sent[0];
    assert_eq!(*destination, peer(OBSERVER));
    assert_eq!(ack.mtype, MessageType::Acknowledgement);
    assert_eq!(ack.code, Code::EMPTY);
    assert_eq!(ack.message_id, Some(800));

    let sent = wait_for(&transport, 1).await;
    assert_eq!(sent.len(), 1);
    let (response, destination) = &sent[0];
    assert_eq!(*destination, peer(OBSERVER));
    assert_eq!(response.mtype, MessageType::Confirmable);
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.token, Token::from(9));
    assert_eq!(response.payload, b"slowly");
    assert_eq!(response.observe(), Some(0));
    assert_ne!(response.message_id, Some(800));
    assert_eq!(server.pending_retransmissions(), 1);
    assert_eq!(server.observe().relations().read().await.observer_count(), 1);
    assert!(drain(&mut events).contains(&ServerEvent::ObserverRegistered {
        path: "slow".to_string(),
        peer: peer(OBSERVER),
        token: Token::from(9),
    }));

    let mid = response.message_id.unwrap();
    server
        .handle_datagram(&empty(MessageType::Acknowledgement, mid), peer(OBSERVER))
        .await
        .unwrap();
    assert_eq!(server.pending_retransmissions(), 0);
}
