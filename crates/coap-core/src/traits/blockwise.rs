// # Blockwise Layer Trait
//
// Defines fragmentation of large payloads across several exchanges
// (RFC 7959). Block1 carries request bodies, Block2 carries response bodies.

use std::net::SocketAddr;

use crate::error::Result;
use crate::message::{BlockOption, Request, Response, Token};
use crate::resource::ResourceRef;

/// Key of per-exchange reassembly state: client endpoint plus token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeKey {
    /// Client endpoint
    pub peer: SocketAddr,
    /// Exchange token
    pub token: Token,
}

impl ExchangeKey {
    /// Create a key
    pub fn new(peer: SocketAddr, token: Token) -> Self {
        Self { peer, token }
    }
}

/// Outcome of feeding a request through Block1 reassembly
#[derive(Debug)]
pub enum BlockwiseRequest {
    /// The body is complete; handle the request
    Complete(Request),
    /// A block was stored; acknowledge it with 2.31 Continue
    Continue(BlockOption),
    /// A block arrived out of order; answer 4.08
    Incomplete,
    /// The body would exceed the size limit; answer 4.13 with Size1 set to `limit`
    TooLarge { limit: usize },
}

/// Trait for blockwise implementations
pub trait BlockwiseLayer: Send + Sync {
    /// Feed an inbound request through Block1 reassembly
    fn request(&self, request: Request) -> Result<BlockwiseRequest>;

    /// Slice an outbound response according to the request's Block2 option
    ///
    /// May replace the response (and resource) with a partial-transfer view.
    fn response(
        &self,
        request: &Request,
        response: Response,
        resource: ResourceRef,
    ) -> Result<(Response, ResourceRef)>;

    /// Drop any reassembly state kept for an exchange
    fn forget(&self, key: &ExchangeKey);
}
