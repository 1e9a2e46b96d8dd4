// # Relation Store
//
// Tracks which clients observe which resources.
//
// ## Layout
//
// ```text
// ResourceId -> { ObserverKey(peer, token) -> ObserverEntry(last_activity, request, response) }
// ```
//
// A missing resource id means "no observers". A drained map may be dropped;
// nothing relies on an empty map being present.
//
// ## Concurrency
//
// The table sits behind a single `tokio::sync::RwLock`. The observe layer
// performs every get -> mutate -> put sequence, together with the resource's
// counter bump, under one write guard.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::message::{Request, Response, Token};
use crate::resource::ResourceId;

/// Identity of one subscription: client endpoint plus request token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObserverKey {
    /// Client endpoint
    pub peer: SocketAddr,
    /// Subscription token
    pub token: Token,
}

impl ObserverKey {
    /// Create a key
    pub fn new(peer: SocketAddr, token: Token) -> Self {
        Self { peer, token }
    }

    /// Derive the key from what was (or will be) sent on the wire
    ///
    /// # Returns
    ///
    /// - `Err(Error::InvalidInput)`: The response has no destination
    pub fn from_response(response: &Response) -> Result<Self> {
        let peer = response
            .destination
            .ok_or_else(|| Error::invalid_input("response has no destination"))?;
        Ok(Self::new(peer, response.token.clone()))
    }
}

/// One (resource, client) subscription
#[derive(Debug, Clone)]
pub struct ObserverEntry {
    /// Last registration, renewal or notification
    pub last_activity: DateTime<Utc>,
    /// The subscribe request; notifications re-render with it
    pub request: Request,
    /// The last response sent; notifications reuse its destination and token
    pub response: Response,
}

impl ObserverEntry {
    pub(crate) fn new(request: Request, response: Response) -> Self {
        Self {
            last_activity: Utc::now(),
            request,
            response,
        }
    }

    /// Last activity as milliseconds since the Unix epoch
    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity.timestamp_millis()
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Observers of a single resource
pub type ObserverMap = HashMap<ObserverKey, ObserverEntry>;

/// The unguarded relation table
#[derive(Debug, Default)]
pub struct RelationTable {
    relations: HashMap<ResourceId, ObserverMap>,
}

impl RelationTable {
    /// Observers of a resource, `None` if it has none
    pub fn get(&self, resource: ResourceId) -> Option<&ObserverMap> {
        self.relations.get(&resource)
    }

    /// Mutable access to the observers of a resource
    pub fn get_mut(&mut self, resource: ResourceId) -> Option<&mut ObserverMap> {
        self.relations.get_mut(&resource)
    }

    /// Replace the full observer set of a resource
    pub fn put(&mut self, resource: ResourceId, observers: ObserverMap) {
        self.relations.insert(resource, observers);
    }

    /// Remove all tracking for a resource (idempotent)
    pub fn delete(&mut self, resource: ResourceId) -> Option<ObserverMap> {
        self.relations.remove(&resource)
    }

    /// Whether the resource has an entry
    pub fn contains(&self, resource: ResourceId) -> bool {
        self.relations.contains_key(&resource)
    }

    /// Number of observed resources
    pub fn len(&self) -> usize {
        self.relations.len()
    }

    /// Whether no resource is observed
    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    /// Total number of subscriptions across all resources
    pub fn observer_count(&self) -> usize {
        self.relations.values().map(HashMap::len).sum()
    }
}

/// Shared, lock-guarded relation table
///
/// Cloning yields another handle to the same table.
///
/// # Example
///
/// ```rust,no_run
/// use coap_core::observe::RelationStore;
///
/// #[tokio::main]
/// async fn main() {
///     let store = RelationStore::new();
///     assert!(store.is_empty().await);
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct RelationStore {
    inner: Arc<RwLock<RelationTable>>,
}

impl RelationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access for inspection
    pub async fn read(&self) -> RwLockReadGuard<'_, RelationTable> {
        self.inner.read().await
    }

    /// Exclusive access; the guard is the critical section
    pub async fn write(&self) -> RwLockWriteGuard<'_, RelationTable> {
        self.inner.write().await
    }

    /// Snapshot of the observers of a resource
    pub async fn get(&self, resource: ResourceId) -> Option<ObserverMap> {
        self.inner.read().await.get(resource).cloned()
    }

    /// Replace the observers of a resource
    pub async fn put(&self, resource: ResourceId, observers: ObserverMap) {
        self.inner.write().await.put(resource, observers);
    }

    /// Drop all tracking for a resource
    pub async fn delete(&self, resource: ResourceId) {
        self.inner.write().await.delete(resource);
    }

    /// Number of observed resources
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether no resource is observed
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Method;

    fn entry(peer: SocketAddr, token: u8) -> (ObserverKey, ObserverEntry) {
        let request = Request::new(Method::Get, "a")
            .with_source(peer)
            .with_token(Token::from(token));
        let response = Response::for_request(&request);
        let key = ObserverKey::from_response(&response).unwrap();
        (key, ObserverEntry::new(request, response))
    }

    #[test]
    fn test_key_requires_destination() {
        let response = Response::new();
        assert!(matches!(
            ObserverKey::from_response(&response),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_table_get_put_delete() {
        let mut table = RelationTable::default();
        let id = ResourceId::next();
        assert!(table.get(id).is_none());

        let (key, value) = entry("10.0.0.1:5683".parse().unwrap(), 1);
        let mut observers = ObserverMap::new();
        observers.insert(key.clone(), value);
        table.put(id, observers);

        assert!(table.get(id).unwrap().contains_key(&key));
        assert_eq!(table.observer_count(), 1);

        assert!(table.delete(id).is_some());
        assert!(table.delete(id).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_store_handles_share_state() {
        let store = RelationStore::new();
        let other = store.clone();
        let id = ResourceId::next();

        let (key, value) = entry("10.0.0.2:5683".parse().unwrap(), 2);
        let mut observers = ObserverMap::new();
        observers.insert(key, value);
        store.put(id, observers).await;

        assert_eq!(other.len().await, 1);
        assert_eq!(other.get(id).await.unwrap().len(), 1);

        other.delete(id).await;
        assert!(store.is_empty().await);
    }
}
