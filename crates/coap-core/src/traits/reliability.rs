// # Reliability Traits
//
// Defines message typing (piggybacked ACK, CON, NON) and retransmission of
// confirmable messages. Backoff timing belongs to the implementation; the
// observe layer only arms and disarms it.

use std::net::SocketAddr;

use crate::error::Result;
use crate::message::{Request, Response};
use crate::resource::ResourceRef;

/// Events raised by the retransmission scheduler
#[derive(Debug, Clone)]
pub enum ReliabilityEvent {
    /// A confirmable message was never acknowledged
    Exhausted {
        /// Resource the message was about
        resource: ResourceRef,
        /// Request the message answered
        request: Request,
        /// The unacknowledged message
        response: Response,
    },
}

/// Chooses the message type of outbound responses
pub trait ReliabilityLayer: Send + Sync {
    /// Type the response for the given request
    ///
    /// An unacknowledged confirmable request gets a piggybacked ACK carrying
    /// the request's message id; anything else mirrors the request type.
    fn response(
        &self,
        request: &Request,
        response: Response,
        resource: ResourceRef,
    ) -> Result<(Response, ResourceRef)>;
}

/// Arms and disarms retransmission of confirmable messages
pub trait RetransmissionScheduler: Send + Sync {
    /// Start retransmission tracking for `message`
    ///
    /// Non-confirmable messages are ignored.
    fn schedule(&self, request: &Request, message: &Response, resource: &ResourceRef) -> Result<()>;

    /// Stop tracking after an ACK or RST; returns whether anything was pending
    fn cancel(&self, peer: SocketAddr, message_id: u16) -> bool;

    /// Stop every pending retransmission
    fn cancel_all(&self);
}
