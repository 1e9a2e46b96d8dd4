// # Reliability Layer
//
// Message typing plus timer-driven retransmission of confirmable messages.
//
// ## Retransmission
//
// Each scheduled CON message gets one tokio task that sleeps for the current
// timeout, resends, doubles the timeout, and gives up after
// `max_retransmit` resends with a [`ReliabilityEvent::Exhausted`]. The task
// is cancelled through a oneshot when the peer answers with ACK or RST, or
// when the server shuts down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::ReliabilityConfig;
use crate::error::{Error, Result};
use crate::message::{MessageType, Request, Response, Serializer};
use crate::resource::ResourceRef;
use crate::traits::reliability::{ReliabilityEvent, ReliabilityLayer, RetransmissionScheduler};
use crate::traits::Transport;

/// Capacity of the reliability event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

type PendingKey = (SocketAddr, u16);

/// Reliability layer and retransmission scheduler
pub struct Reliability {
    config: ReliabilityConfig,
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn Serializer>,
    pending: Arc<Mutex<HashMap<PendingKey, oneshot::Sender<()>>>>,
    events: mpsc::Sender<ReliabilityEvent>,
}

impl Reliability {
    /// Create the layer
    ///
    /// # Returns
    ///
    /// A tuple of (layer, event_receiver) where event_receiver yields
    /// give-up notices for unacknowledged messages
    pub fn new(
        config: ReliabilityConfig,
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn Serializer>,
    ) -> (Self, mpsc::Receiver<ReliabilityEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let layer = Self {
            config,
            transport,
            serializer,
            pending: Arc::new(Mutex::new(HashMap::new())),
            events: tx,
        };
        (layer, rx)
    }

    /// Number of messages awaiting acknowledgement
    pub fn pending_count(&self) -> usize {
        super::lock(&self.pending).len()
    }
}

impl std::fmt::Debug for Reliability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reliability")
            .field("config", &self.config)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl ReliabilityLayer for Reliability {
    fn response(
        &self,
        request: &Request,
        mut response: Response,
        resource: ResourceRef,
    ) -> Result<(Response, ResourceRef)> {
        if request.mtype == MessageType::Confirmable && !request.acknowledged {
            response.mtype = MessageType::Acknowledgement;
            response.message_id = request.message_id;
        } else if request.mtype == MessageType::Confirmable {
            response.mtype = MessageType::Confirmable;
        } else {
            response.mtype = MessageType::NonConfirmable;
        }
        Ok((response, resource))
    }
}

impl RetransmissionScheduler for Reliability {
    fn schedule(&self, request: &Request, message: &Response, resource: &ResourceRef) -> Result<()> {
        if message.mtype != MessageType::Confirmable {
            return Ok(());
        }
        let destination = message
            .destination
            .ok_or_else(|| Error::invalid_input("confirmable message has no destination"))?;
        let mid = message
            .message_id
            .ok_or_else(|| Error::invalid_input("confirmable message has no message id"))?;
        let datagram = self.serializer.serialize(message)?;

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        super::lock(&self.pending).insert((destination, mid), cancel_tx);

        let transport = Arc::clone(&self.transport);
        let pending = Arc::clone(&self.pending);
        let events = self.events.clone();
        let max_retransmit = self.config.max_retransmit;
        let mut timeout = self.config.ack_timeout();
        let request = request.clone();
        let message = message.clone();
        let resource = Arc::clone(resource);

        tokio::spawn(async move {
            let mut attempts = 0;
            loop {
                tokio::select! {
                    // Acknowledged, reset, superseded or shut down
                    _ = &mut cancel_rx => return,
                    _ = tokio::time::sleep(timeout) => {}
                }

                if attempts >= max_retransmit {
                    break;
                }
                attempts += 1;
                debug!(
                    "Retransmitting mid {} to {} (attempt {}/{})",
                    mid, destination, attempts, max_retransmit
                );
                if let Err(e) = transport.write(&datagram, destination).await {
                    warn!("Retransmission of mid {} to {} failed: {}", mid, destination, e);
                }
                timeout *= 2;
            }

            super::lock(&pending).remove(&(destination, mid));
            warn!(
                "Giving up on mid {} to {} after {} retransmissions",
                mid, destination, max_retransmit
            );
            let event = ReliabilityEvent::Exhausted {
                resource,
                request,
                response: message,
            };
            if events.send(event).await.is_err() {
                debug!("Reliability event receiver dropped");
            }
        });

        Ok(())
    }

    fn cancel(&self, peer: SocketAddr, message_id: u16) -> bool {
        match super::lock(&self.pending).remove(&(peer, message_id)) {
            Some(cancel) => {
                let _ = cancel.send(());
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) {
        let drained: Vec<_> = super::lock(&self.pending).drain().collect();
        for (_, cancel) in drained {
            let _ = cancel.send(());
        }
    }
}
