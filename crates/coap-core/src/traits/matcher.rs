// # Message Matcher Trait
//
// Assigns message ids to outbound messages and remembers them so that a
// later ACK or RST can be traced back to the exchange it answers.

use std::net::SocketAddr;

use crate::error::Result;
use crate::message::{Request, Response};
use crate::resource::ResourceRef;

/// An outbound message together with what it was about
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Resource the message was about
    pub resource: ResourceRef,
    /// Request the message answered
    pub request: Request,
    /// The message as sent
    pub response: Response,
}

/// Trait for matcher implementations
pub trait MessageMatcher: Send + Sync {
    /// Assign a message id if needed and record the exchange
    fn response(
        &self,
        request: &Request,
        response: Response,
        resource: ResourceRef,
    ) -> Result<(Response, ResourceRef)>;

    /// Remove and return the exchange for `(peer, message_id)`
    fn take_exchange(&self, peer: SocketAddr, message_id: u16) -> Option<Exchange>;
}
