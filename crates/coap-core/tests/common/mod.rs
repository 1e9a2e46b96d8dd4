//! Test doubles and common utilities for contract tests
//!
//! This module provides a recording transport, a handful of resources with
//! observable state, and helpers to assemble the notification pipeline.

#![allow(dead_code)]

use coap_core::error::{Error, Result};
use coap_core::layers::{Blockwise, Matcher, Reliability};
use coap_core::message::{CoapCodec, Message, MessageType, Serializer};
use coap_core::resource::{PostOutcome, Representation, Resource};
use coap_core::traits::{ReliabilityEvent, Transport};
use coap_core::{
    Method, NotificationBuilder, NotificationDispatcher, ReliabilityConfig, Request, Response,
    Token,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Transport that keeps every datagram instead of sending it
#[derive(Default)]
pub struct RecordingTransport {
    datagrams: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of datagrams written so far
    pub fn count(&self) -> usize {
        self.datagrams.lock().unwrap().len()
    }

    /// Decode and drain everything written so far
    pub fn take(&self) -> Vec<(Message, SocketAddr)> {
        let datagrams = std::mem::take(&mut *self.datagrams.lock().unwrap());
        datagrams
            .into_iter()
            .map(|(bytes, destination)| {
                let message = CoapCodec
                    .deserialize(&bytes, destination)
                    .expect("recorded datagram decodes");
                (message, destination)
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn write(&self, datagram: &[u8], destination: SocketAddr) -> Result<()> {
        self.datagrams
            .lock()
            .unwrap()
            .push((datagram.to_vec(), destination));
        Ok(())
    }
}

/// Text resource supporting every method
pub struct TextResource {
    value: Mutex<String>,
}

impl TextResource {
    pub fn boxed(value: &str) -> Box<dyn Resource> {
        Box::new(Self {
            value: Mutex::new(value.to_string()),
        })
    }
}

impl Resource for TextResource {
    fn render_get(&self, _request: &Request) -> Result<Representation> {
        Ok(Representation::text(self.value.lock().unwrap().clone()))
    }

    fn render_put(&self, request: &Request) -> Result<()> {
        let text = String::from_utf8(request.payload.clone())
            .map_err(|_| Error::bad_request("payload is not UTF-8"))?;
        *self.value.lock().unwrap() = text;
        Ok(())
    }

    fn render_post(&self, request: &Request) -> Result<PostOutcome> {
        self.render_put(request)?;
        Ok(PostOutcome::Updated)
    }

    fn render_delete(&self, _request: &Request) -> Result<()> {
        Ok(())
    }
}

/// Resource whose POST swaps in a brand-new object
pub struct SwappingResource {
    value: String,
}

impl SwappingResource {
    pub fn boxed(value: &str) -> Box<dyn Resource> {
        Box::new(Self {
            value: value.to_string(),
        })
    }
}

impl Resource for SwappingResource {
    fn render_get(&self, _request: &Request) -> Result<Representation> {
        Ok(Representation::text(self.value.clone()))
    }

    fn render_post(&self, request: &Request) -> Result<PostOutcome> {
        let value = String::from_utf8_lossy(&request.payload).into_owned();
        Ok(PostOutcome::Replaced(SwappingResource::boxed(&value)))
    }
}

/// Resource that accepts writes but cannot be read
pub struct WriteOnlyResource;

impl Resource for WriteOnlyResource {
    fn render_put(&self, _request: &Request) -> Result<()> {
        Ok(())
    }
}

/// Container resource whose POST to a missing child creates it
pub struct ContainerResource;

impl Resource for ContainerResource {
    fn render_get(&self, _request: &Request) -> Result<Representation> {
        Ok(Representation::text("container"))
    }

    fn create_child(&self, _name: &str, request: &Request) -> Result<Box<dyn Resource>> {
        Ok(TextResource::boxed(&String::from_utf8_lossy(&request.payload)))
    }
}

/// Read-only resource that takes a while to answer
pub struct DelayedResource {
    value: String,
    delay: Duration,
}

impl DelayedResource {
    pub fn boxed(value: &str, delay: Duration) -> Box<dyn Resource> {
        Box::new(Self {
            value: value.to_string(),
            delay,
        })
    }
}

impl Resource for DelayedResource {
    fn render_get(&self, _request: &Request) -> Result<Representation> {
        Ok(Representation::text(self.value.clone()))
    }

    fn response_delay(&self) -> Option<Duration> {
        Some(self.delay)
    }
}

pub fn peer(addr: &str) -> SocketAddr {
    addr.parse().expect("valid socket address")
}

/// An observe registration from `addr` with `token`, and the response about to answer it
pub fn subscription(path: &str, addr: &str, token: u8) -> (Request, Response) {
    let request = Request::new(Method::Get, path)
        .with_source(peer(addr))
        .with_token(Token::from(token))
        .with_message_id(1000 + token as u16)
        .with_observe(0);
    let response = Response::for_request(&request);
    (request, response)
}

/// Serialize a request as a client would send it
pub fn datagram(request: &Request) -> Vec<u8> {
    CoapCodec
        .serialize(request)
        .expect("request serializes")
}

/// An empty ACK or RST for `message_id`
pub fn empty(mtype: MessageType, message_id: u16) -> Vec<u8> {
    let mut message = Message::default();
    message.mtype = mtype;
    message.message_id = Some(message_id);
    CoapCodec.serialize(&message).expect("empty message serializes")
}

/// Wait until the transport has recorded at least `count` datagrams, then drain it
pub async fn wait_for(transport: &RecordingTransport, count: usize) -> Vec<(Message, SocketAddr)> {
    for _ in 0..200 {
        if transport.count() >= count {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    transport.take()
}

/// Real layers wired around a recording transport
pub struct Pipeline {
    pub builder: NotificationBuilder,
    pub dispatcher: NotificationDispatcher,
    pub reliability: Arc<Reliability>,
    pub reliability_rx: mpsc::Receiver<ReliabilityEvent>,
}

pub fn pipeline(transport: Arc<RecordingTransport>, reliability: ReliabilityConfig) -> Pipeline {
    let serializer: Arc<dyn Serializer> = Arc::new(CoapCodec);
    let (layer, reliability_rx) = Reliability::new(reliability, transport.clone(), serializer.clone());
    let layer = Arc::new(layer);
    let builder = NotificationBuilder::new(
        Arc::new(Blockwise::default()),
        layer.clone(),
        Arc::new(Matcher::default()),
    );
    let dispatcher = NotificationDispatcher::new(transport, serializer, layer.clone());
    Pipeline {
        builder,
        dispatcher,
        reliability: layer,
        reliability_rx,
    }
}

/// Reliability settings that never fire during a test
pub fn patient() -> ReliabilityConfig {
    ReliabilityConfig {
        ack_timeout_ms: 60_000,
        max_retransmit: 4,
    }
}
