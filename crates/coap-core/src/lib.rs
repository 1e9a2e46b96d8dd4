// # coap-core
//
// Core library for a CoAP server with resource observation (RFC 7641).
//
// ## Architecture Overview
//
// This library provides the pieces a constrained-device server needs to keep
// clients informed about resource state:
// - **ResourceTree**: Path-addressed resources, each with its own observe counter
// - **ObserveLayer**: Who observes what, and the notification commands a change produces
// - **NotificationBuilder / NotificationDispatcher**: Turn commands into datagrams
// - **Collaborator traits**: Transport, blockwise, reliability and matcher seams
// - **CoapServer**: UDP request handling on top of all of the above
//
// ## Design Principles
//
// 1. **Observer identity is (peer, token)**: Always derived from what goes on the wire
// 2. **One transaction per change**: The relation update and the counter bump happen together
// 3. **Commands, then I/O**: Relations are never locked while sending
// 4. **Library-First**: The daemon is a thin shell around `CoapServer`

pub mod config;
pub mod error;
pub mod layers;
pub mod message;
pub mod observe;
pub mod resource;
pub mod server;
pub mod traits;

// Re-export core types for convenience
pub use config::{BlockwiseConfig, EngineConfig, MatcherConfig, ReliabilityConfig, ServerConfig};
pub use error::{Error, Result};
pub use message::{Code, Message, MessageType, Method, Request, Response, Token};
pub use observe::{
    Notification, NotificationBuilder, NotificationCommand, NotificationDispatcher, ObserveLayer,
    RelationStore,
};
pub use resource::{PostOutcome, Representation, Resource, ResourceHandle, ResourceRef, ResourceTree};
pub use server::{CoapServer, RemovalReason, ServerEvent, UdpTransport};
pub use traits::{BlockwiseLayer, MessageMatcher, ReliabilityLayer, RetransmissionScheduler, Transport};
