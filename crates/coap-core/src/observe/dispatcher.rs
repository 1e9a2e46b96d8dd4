// # Notification Dispatcher
//
// Puts built notifications on the wire: arm retransmission, serialize,
// write. Nothing here touches the relation store.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::message::Serializer;
use crate::resource::ResourceRef;
use crate::traits::{RetransmissionScheduler, Transport};

use super::{Notification, NotificationBuilder, NotificationCommand};

/// A command that could not be built or sent
#[derive(Debug)]
pub struct DispatchFailure {
    /// Resource the notification was about
    pub resource: ResourceRef,
    /// Observer it was meant for
    pub destination: Option<SocketAddr>,
    pub error: Error,
}

/// Result of dispatching a batch of commands
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Notifications handed to the transport, in command order
    pub sent: Vec<Notification>,
    /// Commands that failed, in command order
    pub failed: Vec<DispatchFailure>,
}

/// Sends notifications through the transport
#[derive(Clone)]
pub struct NotificationDispatcher {
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn Serializer>,
    scheduler: Arc<dyn RetransmissionScheduler>,
}

impl NotificationDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn Serializer>,
        scheduler: Arc<dyn RetransmissionScheduler>,
    ) -> Self {
        Self {
            transport,
            serializer,
            scheduler,
        }
    }

    /// Send one notification
    ///
    /// Retransmission is armed before the first write, so a confirmable
    /// notification whose write fails is still retried.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: The datagram was handed to the transport
    /// - `Err(Error::InvalidInput)`: The notification has no destination
    /// - `Err(_)`: Scheduling, serialization or transport failure
    pub async fn send_notification(&self, notification: &Notification) -> Result<()> {
        let destination = notification
            .response
            .destination
            .ok_or_else(|| Error::invalid_input("notification has no destination"))?;

        self.scheduler.schedule(
            &notification.request,
            &notification.response,
            &notification.resource,
        )?;

        let datagram = self.serializer.serialize(&notification.response)?;
        debug!(
            "Sending {} notification ({} bytes) to {}",
            notification.response.code,
            datagram.len(),
            destination
        );
        self.transport.write(&datagram, destination).await
    }

    /// Build and send every command, in order
    ///
    /// A failing command does not stop the ones after it. Its error is
    /// returned in [`DispatchOutcome::failed`] for the caller to act on.
    pub async fn dispatch(
        &self,
        builder: &NotificationBuilder,
        commands: Vec<NotificationCommand>,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome {
            sent: Vec::with_capacity(commands.len()),
            failed: Vec::new(),
        };
        for command in commands {
            let resource = Arc::clone(command.resource());
            let destination = command.destination();
            let result = match command.execute(builder) {
                Ok(notification) => self
                    .send_notification(&notification)
                    .await
                    .map(|()| notification),
                Err(e) => Err(e),
            };
            match result {
                Ok(notification) => outcome.sent.push(notification),
                Err(error) => outcome.failed.push(DispatchFailure {
                    resource,
                    destination,
                    error,
                }),
            }
        }
        outcome
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher").finish_non_exhaustive()
    }
}
