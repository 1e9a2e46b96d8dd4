// # Resources
//
// A resource is split in two:
// - [`Resource`]: application behaviour (render GET/PUT/POST/DELETE)
// - [`ResourceHandle`]: the identity-bearing wrapper the server shares around
//
// The observe layer keys relations by [`ResourceId`], never by path: a POST
// may swap the handle bound to a path, and the new handle gets a new id.

pub mod tree;

pub use tree::{ResourceNode, ResourceTree};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::message::{Method, Request};

/// Counter for unique [`ResourceId`] allocation.
static RESOURCE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique per-handle resource identifier
///
/// Two handles never share an id, even when bound to the same path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(RESOURCE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A rendered resource state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Representation {
    /// Payload bytes
    pub payload: Vec<u8>,
    /// Content-Format to advertise, if any
    pub content_format: Option<u16>,
}

impl Representation {
    /// Opaque payload without a content format
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            content_format: None,
        }
    }

    /// UTF-8 text payload
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload: text.into().into_bytes(),
            content_format: Some(crate::message::CONTENT_FORMAT_TEXT),
        }
    }
}

/// What a POST did to the target resource
pub enum PostOutcome {
    /// State mutated in place; the handle keeps its identity
    Updated,
    /// The resource must be replaced by a new object at the same path
    Replaced(Box<dyn Resource>),
}

impl fmt::Debug for PostOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostOutcome::Updated => f.write_str("Updated"),
            PostOutcome::Replaced(_) => f.write_str("Replaced(..)"),
        }
    }
}

/// Application behaviour of a resource
///
/// Every method defaults to [`Error::MethodNotAllowed`]; a resource only
/// implements the methods it supports. A missing `render_get` is what the
/// notification builder reports to observers as 4.05.
///
/// # Thread Safety
///
/// Resources are shared between the request path and the notification path,
/// so interior state must be synchronized by the implementation.
pub trait Resource: Send + Sync {
    /// Render the current state for a GET (or a notification)
    fn render_get(&self, _request: &Request) -> Result<Representation> {
        Err(Error::method_not_allowed(Method::Get))
    }

    /// Apply a PUT in place
    fn render_put(&self, _request: &Request) -> Result<()> {
        Err(Error::method_not_allowed(Method::Put))
    }

    /// Apply a POST to this resource
    fn render_post(&self, _request: &Request) -> Result<PostOutcome> {
        Err(Error::method_not_allowed(Method::Post))
    }

    /// Accept or refuse deletion
    fn render_delete(&self, _request: &Request) -> Result<()> {
        Err(Error::method_not_allowed(Method::Delete))
    }

    /// Create a child named `name` from a POST to a missing path below this resource
    fn create_child(&self, _name: &str, _request: &Request) -> Result<Box<dyn Resource>> {
        Err(Error::method_not_allowed(Method::Post))
    }

    /// How long a GET takes to answer
    ///
    /// `Some` makes the server acknowledge a confirmable GET with an empty
    /// ACK and send the representation later as a separate response.
    fn response_delay(&self) -> Option<Duration> {
        None
    }
}

/// Shared reference to a resource handle
pub type ResourceRef = Arc<ResourceHandle>;

/// Identity-bearing wrapper around a [`Resource`]
///
/// Holds the observe sequence counter. The counter is only advanced by the
/// observe layer while it holds the relation store's write guard.
pub struct ResourceHandle {
    id: ResourceId,
    path: String,
    observable: bool,
    observe_count: AtomicU32,
    behaviour: Box<dyn Resource>,
}

impl ResourceHandle {
    /// Wrap an observable resource bound to `path`
    pub fn new(path: impl Into<String>, behaviour: Box<dyn Resource>) -> ResourceRef {
        Self::with_observable(path, true, behaviour)
    }

    /// Wrap a resource, choosing whether it accepts observers
    pub fn with_observable(
        path: impl Into<String>,
        observable: bool,
        behaviour: Box<dyn Resource>,
    ) -> ResourceRef {
        Arc::new(Self {
            id: ResourceId::next(),
            path: path.into(),
            observable,
            observe_count: AtomicU32::new(0),
            behaviour,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_observable(&self) -> bool {
        self.observable
    }

    /// Current observe sequence number
    pub fn observe_count(&self) -> u32 {
        self.observe_count.load(Ordering::Acquire)
    }

    /// Advance the sequence number by one, returning the new value
    pub(crate) fn advance_observe_count(&self) -> u32 {
        self.observe_count
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }

    /// Raise the sequence number to at least `floor`
    pub(crate) fn raise_observe_count(&self, floor: u32) {
        self.observe_count.fetch_max(floor, Ordering::AcqRel);
    }

    /// The application behaviour
    pub fn behaviour(&self) -> &dyn Resource {
        self.behaviour.as_ref()
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("observable", &self.observable)
            .field("observe_count", &self.observe_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Empty;

    impl Resource for Empty {}

    #[test]
    fn test_ids_are_unique_per_handle() {
        let a = ResourceHandle::new("a", Box::new(Empty));
        let b = ResourceHandle::new("a", Box::new(Empty));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_default_methods_are_not_allowed() {
        let handle = ResourceHandle::new("a", Box::new(Empty));
        let request = Request::new(Method::Get, "a");
        assert!(matches!(
            handle.behaviour().render_get(&request),
            Err(Error::MethodNotAllowed(Method::Get))
        ));
        assert!(matches!(
            handle.behaviour().render_delete(&request),
            Err(Error::MethodNotAllowed(Method::Delete))
        ));
        assert_eq!(handle.behaviour().response_delay(), None);
    }

    #[test]
    fn test_observe_count_advances_and_raises() {
        let handle = ResourceHandle::new("a", Box::new(Empty));
        assert_eq!(handle.observe_count(), 0);
        assert_eq!(handle.advance_observe_count(), 1);
        handle.raise_observe_count(10);
        assert_eq!(handle.observe_count(), 10);
        handle.raise_observe_count(3);
        assert_eq!(handle.observe_count(), 10);
    }
}
