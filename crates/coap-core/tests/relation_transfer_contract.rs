//! Contract Test: Deletion, Transfer and Unreachable Subscribers
//!
//! Constraints verified:
//! - Subtree deletion yields one deletion command per (resource, observer) pair
//!   and leaves no relation for any resource of the subtree
//! - Swapping the object bound to a path keeps its subscribers
//! - A resource without a GET handler produces 4.05 notifications and keeps its observers
//! - An observer whose confirmable notification is never acknowledged can be dropped
//!   using the exhausted message alone

mod common;

use std::collections::HashSet;
use std::time::Duration;

use coap_core::message::Code;
use coap_core::traits::{ReliabilityEvent, RetransmissionScheduler};
use coap_core::{ObserveLayer, ReliabilityConfig, ResourceHandle, ResourceTree};
use common::*;

#[tokio::test]
async fn deleting_a_subtree_clears_every_relation() {
    let layer = ObserveLayer::default();
    let mut tree = ResourceTree::new();
    let house = tree.add("house", TextResource::boxed("house")).unwrap();
    let kitchen = tree.add("house/kitchen", TextResource::boxed("kitchen")).unwrap();
    let oven = tree.add("house/kitchen/oven", TextResource::boxed("180")).unwrap();
    let garden = tree.add("garden", TextResource::boxed("garden")).unwrap();

    let observed = [
        (&house, "10.0.0.1:5683", 1),
        (&kitchen, "10.0.0.1:5683", 2),
        (&oven, "10.0.0.1:5683", 3),
        (&oven, "10.0.0.2:5683", 3),
        (&garden, "10.0.0.3:5683", 9),
    ];
    for (resource, addr, token) in observed {
        let (request, response) = subscription(resource.path(), addr, token);
        layer.add_observing(resource, &request, response).await.unwrap();
    }

    let subtree = tree.remove("house").unwrap();
    let commands = layer.remove_observers(&subtree).await;

    assert_eq!(commands.len(), 4, "one command per (resource, observer) pair");
    assert!(commands.iter().all(|c| c.is_deletion()));

    let table = layer.relations().read().await;
    for resource in [&house, &kitchen, &oven] {
        assert!(!table.contains(resource.id()), "{} still tracked", resource.path());
    }
    assert!(table.contains(garden.id()), "resources outside the subtree are untouched");
}

#[tokio::test]
async fn deleting_an_unobserved_subtree_returns_nothing() {
    let layer = ObserveLayer::default();
    let mut tree = ResourceTree::new();
    tree.add("a", TextResource::boxed("a")).unwrap();
    tree.add("a/b", TextResource::boxed("b")).unwrap();

    let subtree = tree.remove("a").unwrap();
    assert!(layer.remove_observers(&subtree).await.is_empty());
    assert!(layer.relations().is_empty().await);
}

#[tokio::test]
async fn transfer_preserves_subscribers() {
    let layer = ObserveLayer::default();
    let mut tree = ResourceTree::new();
    let old = tree.add("config", SwappingResource::boxed("v1")).unwrap();

    for (addr, token) in [("10.0.0.1:5683", 1), ("10.0.0.2:6000", 2)] {
        let (request, response) = subscription("config", addr, token);
        layer.add_observing(&old, &request, response).await.unwrap();
    }

    let new = ResourceHandle::new("config", SwappingResource::boxed("v2"));
    layer
        .update_relations(tree.find_node("config").unwrap(), &new)
        .await;
    tree.replace("config", new.clone()).unwrap();

    assert!(!layer.relations().read().await.contains(old.id()));

    let commands = layer.notify(&new).await;
    let destinations: HashSet<_> = commands.iter().filter_map(|c| c.destination()).collect();
    assert_eq!(
        destinations,
        HashSet::from([peer("10.0.0.1:5683"), peer("10.0.0.2:6000")])
    );
    assert!(commands.iter().all(|c| c.resource().id() == new.id()));
}

#[tokio::test]
async fn unreadable_resource_notifies_method_not_allowed() {
    let transport = RecordingTransport::new();
    let pipeline = pipeline(transport.clone(), patient());
    let layer = ObserveLayer::default();
    let mut tree = ResourceTree::new();
    let resource = tree.add("actuator", Box::new(WriteOnlyResource)).unwrap();

    let (request, response) = subscription("actuator", "10.0.0.1:5683", 4);
    layer.add_observing(&resource, &request, response).await.unwrap();

    let outcome = pipeline
        .dispatcher
        .dispatch(&pipeline.builder, layer.notify(&resource).await)
        .await;
    assert!(outcome.failed.is_empty());
    let sent = outcome.sent;

    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].response.code, Code::METHOD_NOT_ALLOWED);
    assert!(sent[0].response.payload.is_empty());
    assert_eq!(layer.observer_count(&resource).await, 1, "relation stays intact");
    assert_eq!(transport.count(), 1);
}

#[tokio::test]
async fn exhausted_notification_drops_its_observer() {
    let transport = RecordingTransport::new();
    let mut pipeline = pipeline(
        transport.clone(),
        ReliabilityConfig {
            ack_timeout_ms: 10,
            max_retransmit: 2,
        },
    );
    let layer = ObserveLayer::default();
    let mut tree = ResourceTree::new();
    let resource = tree.add("sensor", TextResource::boxed("1")).unwrap();

    let (request, response) = subscription("sensor", "10.0.0.1:5683", 5);
    layer.add_observing(&resource, &request, response).await.unwrap();
    let (request, response) = subscription("sensor", "10.0.0.2:5683", 5);
    layer.add_observing(&resource, &request, response).await.unwrap();

    let commands = layer.notify(&resource).await;
    let sent = pipeline.dispatcher.dispatch(&pipeline.builder, commands).await.sent;
    assert_eq!(sent.len(), 2);

    // acknowledge the second observer's notification only
    let acked = sent
        .iter()
        .find(|n| n.response.destination == Some(peer("10.0.0.2:5683")))
        .unwrap();
    assert!(pipeline.reliability.cancel(
        peer("10.0.0.2:5683"),
        acked.response.message_id.unwrap()
    ));

    let event = tokio::time::timeout(Duration::from_secs(5), pipeline.reliability_rx.recv())
        .await
        .expect("give-up within timeout")
        .expect("event channel open");
    let ReliabilityEvent::Exhausted {
        resource: exhausted,
        request,
        response,
    } = event;
    assert_eq!(response.destination, Some(peer("10.0.0.1:5683")));

    assert!(layer.remove_observer(&exhausted, &request, &response).await.unwrap());
    assert_eq!(layer.observer_count(&resource).await, 1);
    let remaining = layer.notify(&resource).await;
    assert_eq!(remaining[0].destination(), Some(peer("10.0.0.2:5683")));
}
