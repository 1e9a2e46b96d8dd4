//! Observer relations and notifications (RFC 7641)
//!
//! The [`ObserveLayer`] owns the bookkeeping of who observes what:
//! - [`ObserveLayer::add_observing`]: register or renew a subscription
//! - [`ObserveLayer::notify`] / [`ObserveLayer::notify_deletion`]: turn a change into commands
//! - [`ObserveLayer::remove_observers`]: tear down a deleted subtree
//! - [`ObserveLayer::update_relations`]: re-point subscriptions after a POST replaced a resource
//! - [`ObserveLayer::remove_observer`]: drop one unreachable or uninterested client
//!
//! ## Flow
//!
//! ```text
//! mutation ──► notify() ──► Vec<NotificationCommand> ──► execute(builder) ──► Notification
//!                 │                                                              │
//!          RelationStore (+ observe_count)                     NotificationDispatcher::send_notification
//! ```
//!
//! Commands are produced inside the critical section that advances the
//! resource's `observe_count`; building and sending happen afterwards, outside
//! of it, at the caller's pace.

pub mod builder;
pub mod dispatcher;
pub mod relation;

pub use builder::NotificationBuilder;
pub use dispatcher::{DispatchFailure, DispatchOutcome, NotificationDispatcher};
pub use relation::{ObserverEntry, ObserverKey, ObserverMap, RelationStore, RelationTable};

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::message::{Request, Response};
use crate::resource::{ResourceNode, ResourceRef};

/// A built notification, ready for the dispatcher
#[derive(Debug, Clone)]
pub struct Notification {
    /// Resource the notification is about (possibly a partial-transfer view)
    pub resource: ResourceRef,
    /// The subscriber's request, marked acknowledged
    pub request: Request,
    /// The outgoing message
    pub response: Response,
}

/// Deferred unit of notification work
///
/// Produced by [`ObserveLayer`], consumed by [`NotificationCommand::execute`].
#[derive(Debug, Clone)]
pub enum NotificationCommand {
    /// Tell the observer about the resource's new state
    NotifySuccess {
        resource: ResourceRef,
        request: Request,
        old_response: Response,
    },
    /// Tell the observer the resource is gone
    NotifyDeletion {
        resource: ResourceRef,
        request: Request,
        old_response: Response,
    },
}

impl NotificationCommand {
    /// Build the notification this command stands for
    pub fn execute(self, builder: &NotificationBuilder) -> Result<Notification> {
        match self {
            NotificationCommand::NotifySuccess {
                resource,
                request,
                old_response,
            } => builder.prepare_notification(resource, request, &old_response),
            NotificationCommand::NotifyDeletion {
                resource,
                request,
                old_response,
            } => builder.prepare_notification_deletion(resource, request, &old_response),
        }
    }

    /// Resource the command is about
    pub fn resource(&self) -> &ResourceRef {
        match self {
            NotificationCommand::NotifySuccess { resource, .. }
            | NotificationCommand::NotifyDeletion { resource, .. } => resource,
        }
    }

    /// Where the notification will be sent
    pub fn destination(&self) -> Option<SocketAddr> {
        match self {
            NotificationCommand::NotifySuccess { old_response, .. }
            | NotificationCommand::NotifyDeletion { old_response, .. } => old_response.destination,
        }
    }

    /// Whether this is a deletion notice
    pub fn is_deletion(&self) -> bool {
        matches!(self, NotificationCommand::NotifyDeletion { .. })
    }
}

#[derive(Clone, Copy)]
enum CommandKind {
    Success,
    Deletion,
}

impl CommandKind {
    fn command(self, resource: &ResourceRef, entry: &ObserverEntry) -> NotificationCommand {
        let resource = Arc::clone(resource);
        let request = entry.request.clone();
        let old_response = entry.response.clone();
        match self {
            CommandKind::Success => NotificationCommand::NotifySuccess {
                resource,
                request,
                old_response,
            },
            CommandKind::Deletion => NotificationCommand::NotifyDeletion {
                resource,
                request,
                old_response,
            },
        }
    }
}

/// Observer relation bookkeeping
///
/// Cheap to clone; clones share the same [`RelationStore`].
///
/// ## Threading
///
/// Every operation takes the store's write guard once and performs its whole
/// read-modify-write (including the `observe_count` bump) under it, so two
/// concurrent calls on the same resource never interleave.
#[derive(Debug, Clone, Default)]
pub struct ObserveLayer {
    relations: RelationStore,
}

impl ObserveLayer {
    /// Create a layer over an existing store
    pub fn new(relations: RelationStore) -> Self {
        Self { relations }
    }

    /// The underlying store
    pub fn relations(&self) -> &RelationStore {
        &self.relations
    }

    /// Register or renew a subscription and stamp the response with the Observe option
    ///
    /// The observer key comes from the response's destination and token. The
    /// Observe value is the resource's current (pre-increment) counter.
    ///
    /// # Returns
    ///
    /// - `Ok(Response)`: The response carrying the Observe option
    /// - `Err(Error::InvalidInput)`: The response has no destination
    pub async fn add_observing(
        &self,
        resource: &ResourceRef,
        request: &Request,
        mut response: Response,
    ) -> Result<Response> {
        let key = ObserverKey::from_response(&response)?;

        let mut table = self.relations.write().await;
        response.set_observe(resource.observe_count());
        let entry = ObserverEntry::new(request.clone(), response.clone());

        match table.get_mut(resource.id()) {
            None => {
                info!(
                    "Initiate an observe relation between {} and resource {}",
                    key.peer,
                    resource.path()
                );
                let mut observers = ObserverMap::new();
                observers.insert(key, entry);
                table.put(resource.id(), observers);
            }
            Some(observers) => {
                if observers.contains_key(&key) {
                    info!(
                        "Update observe relation between {} and resource {}",
                        key.peer,
                        resource.path()
                    );
                } else {
                    info!(
                        "Initiate an observe relation between {} and resource {}",
                        key.peer,
                        resource.path()
                    );
                }
                observers.insert(key, entry);
            }
        }

        Ok(response)
    }

    /// Commands notifying every observer of `resource` about its new state
    ///
    /// Advances `observe_count` by exactly one, observers or not.
    pub async fn notify(&self, resource: &ResourceRef) -> Vec<NotificationCommand> {
        self.collect(resource, CommandKind::Success).await
    }

    /// Commands telling every observer of `resource` that it was deleted
    ///
    /// Advances `observe_count` by exactly one, observers or not. Relations are
    /// kept; use [`ObserveLayer::remove_observers`] when the resource leaves the tree.
    pub async fn notify_deletion(&self, resource: &ResourceRef) -> Vec<NotificationCommand> {
        self.collect(resource, CommandKind::Deletion).await
    }

    async fn collect(&self, resource: &ResourceRef, kind: CommandKind) -> Vec<NotificationCommand> {
        let mut table = self.relations.write().await;

        let Some(observers) = table.get_mut(resource.id()) else {
            // A later first subscriber must not see a stale sequence number
            resource.advance_observe_count();
            return Vec::new();
        };

        let mut commands = Vec::with_capacity(observers.len());
        for entry in observers.values_mut() {
            commands.push(kind.command(resource, entry));
            entry.touch();
        }
        let count = resource.advance_observe_count();

        debug!(
            "{} observer(s) of {} to notify, observe count now {}",
            commands.len(),
            resource.path(),
            count
        );
        commands
    }

    /// Deletion commands for every observer in a detached subtree, and their teardown
    ///
    /// Visits every node of the subtree, root included, children before
    /// parents. Every visited resource loses its relation entry, observed or not.
    pub async fn remove_observers(&self, node: &ResourceNode) -> Vec<NotificationCommand> {
        info!("Remove observers below {}", node.value().path());
        let mut table = self.relations.write().await;
        let mut commands = Vec::new();
        propagate_deletion(&mut table, node, &mut commands);
        commands
    }

    /// Move the relations of the node's current resource to `resource`
    ///
    /// Used when a POST replaces the object bound to a path. Sends nothing.
    /// The new resource's counter is raised to the old one's so transferred
    /// observers never see the sequence number go backwards.
    pub async fn update_relations(&self, node: &ResourceNode, resource: &ResourceRef) {
        let old = node.value();
        if old.id() == resource.id() {
            return;
        }

        let mut table = self.relations.write().await;
        resource.raise_observe_count(old.observe_count());

        let Some(observers) = table.delete(old.id()) else {
            return;
        };
        info!(
            "Transferring {} observer(s) of {} from {} to {}",
            observers.len(),
            resource.path(),
            old.id(),
            resource.id()
        );
        match table.get_mut(resource.id()) {
            Some(existing) => existing.extend(observers),
            None => table.put(resource.id(), observers),
        }
    }

    /// Drop a single subscription; sends nothing
    ///
    /// The key comes from the response that failed to be acknowledged or that
    /// drew a reset.
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: The subscription existed and was removed
    /// - `Ok(false)`: No such subscription
    /// - `Err(Error::InvalidInput)`: The response has no destination
    pub async fn remove_observer(
        &self,
        resource: &ResourceRef,
        _request: &Request,
        response: &Response,
    ) -> Result<bool> {
        let key = ObserverKey::from_response(response)?;

        let mut table = self.relations.write().await;
        let Some(observers) = table.get_mut(resource.id()) else {
            return Ok(false);
        };
        if observers.remove(&key).is_none() {
            return Ok(false);
        }
        info!(
            "Remove observer {} (token {}) of resource {}",
            key.peer,
            key.token,
            resource.path()
        );
        if observers.is_empty() {
            table.delete(resource.id());
        }
        Ok(true)
    }

    /// Number of observers of a resource
    pub async fn observer_count(&self, resource: &ResourceRef) -> usize {
        self.relations
            .read()
            .await
            .get(resource.id())
            .map(ObserverMap::len)
            .unwrap_or(0)
    }
}

fn propagate_deletion(
    table: &mut RelationTable,
    node: &ResourceNode,
    commands: &mut Vec<NotificationCommand>,
) {
    for child in node.children() {
        propagate_deletion(table, child, commands);
    }

    let resource = node.value();
    if let Some(observers) = table.delete(resource.id()) {
        for entry in observers.values() {
            commands.push(CommandKind::Deletion.command(resource, entry));
        }
    }
}
