// # UDP Transport
//
// The production datagram endpoint: one `tokio::net::UdpSocket`, shared
// between the receive loop and every writer (responses, notifications,
// retransmission tasks).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{Error, Result};
use crate::traits::Transport;

/// Largest datagram the server accepts
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// A bound UDP socket
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind to `addr`
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        debug!("UDP socket bound to {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive the next datagram
    pub async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, source) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((buf, source))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn write(&self, datagram: &[u8], destination: SocketAddr) -> Result<()> {
        let sent = self.socket.send_to(datagram, destination).await?;
        if sent != datagram.len() {
            return Err(Error::transport(format!(
                "short write to {}: {} of {} bytes",
                destination,
                sent,
                datagram.len()
            )));
        }
        Ok(())
    }
}
