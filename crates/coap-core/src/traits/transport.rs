// # Transport Trait
//
// Defines the datagram output used by the notification dispatcher and the
// retransmission scheduler.
//
// ## Usage
//
// ```rust,ignore
// use coap_core::traits::Transport;
//
// async fn send(transport: &dyn Transport, bytes: &[u8]) -> coap_core::Result<()> {
//     transport.write(bytes, "10.0.0.1:5683".parse().unwrap()).await
// }
// ```

use async_trait::async_trait;
use std::net::SocketAddr;

/// Trait for datagram transports
///
/// Writes are fire-and-forget: a successful return means the datagram was
/// handed to the network stack, not that the peer received it. Delivery is
/// the reliability layer's concern.
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram
    ///
    /// # Parameters
    ///
    /// - `datagram`: Serialized message
    /// - `destination`: Remote endpoint
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Datagram handed to the network stack
    /// - `Err(Error)`: Socket error
    async fn write(&self, datagram: &[u8], destination: SocketAddr) -> Result<(), crate::Error>;
}
