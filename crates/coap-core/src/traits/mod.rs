//! Collaborator traits for the CoAP observe server
//!
//! The observe subsystem builds and sends notifications through these
//! interfaces and never reaches into their internals.
//!
//! - [`Transport`]: Datagram output
//! - [`BlockwiseLayer`]: Block1 reassembly and Block2 slicing
//! - [`ReliabilityLayer`] / [`RetransmissionScheduler`]: Message typing and CON retransmission
//! - [`MessageMatcher`]: Message id assignment and ACK/RST correlation
//!
//! Post-processors share the shape `(request, response, resource) -> (response, resource)`
//! and always run in the order blockwise, reliability, matcher.

pub mod transport;
pub mod blockwise;
pub mod reliability;
pub mod matcher;

pub use transport::Transport;
pub use blockwise::{BlockwiseLayer, BlockwiseRequest, ExchangeKey};
pub use reliability::{ReliabilityEvent, ReliabilityLayer, RetransmissionScheduler};
pub use matcher::{Exchange, MessageMatcher};
