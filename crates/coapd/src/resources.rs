// Example resources served by coapd

use std::sync::Mutex;
use std::time::Duration;

use coap_core::error::{Error, Result};
use coap_core::{PostOutcome, Representation, Request, Resource, ResourceTree};

const BIG_PARAGRAPH: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. \
Cras sollicitudin fermentum ornare. Integer luctus, odio quis tincidunt hendrerit, \
nunc arcu ultricies urna, in condimentum mauris nisi vel metus. ";

/// Delay before `separate` answers
const SEPARATE_DELAY: Duration = Duration::from_secs(5);

/// Delay before `long` answers
const LONG_DELAY: Duration = Duration::from_secs(10);

/// Build the tree coapd serves
pub fn build_tree() -> Result<ResourceTree> {
    let mut tree = ResourceTree::new();
    tree.add("basic", Box::new(BasicResource::new("Basic Resource")))?;
    tree.add("storage", Box::new(Storage::new()))?;
    tree.add("separate", Box::new(Separate))?;
    tree.add("long", Box::new(Long))?;
    tree.add("big", Box::new(Big::new()))?;
    Ok(tree)
}

fn utf8(request: &Request) -> Result<String> {
    String::from_utf8(request.payload.clone())
        .map_err(|_| Error::bad_request("payload must be UTF-8 text"))
}

fn lock(value: &Mutex<String>) -> std::sync::MutexGuard<'_, String> {
    value.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Text resource supporting every method
pub struct BasicResource {
    value: Mutex<String>,
}

impl BasicResource {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: Mutex::new(value.into()),
        }
    }
}

impl Resource for BasicResource {
    fn render_get(&self, _request: &Request) -> Result<Representation> {
        Ok(Representation::text(lock(&self.value).clone()))
    }

    fn render_put(&self, request: &Request) -> Result<()> {
        *lock(&self.value) = utf8(request)?;
        Ok(())
    }

    fn render_post(&self, request: &Request) -> Result<PostOutcome> {
        // a POST replaces the object bound to the path
        Ok(PostOutcome::Replaced(Box::new(BasicResource::new(utf8(request)?))))
    }

    fn render_delete(&self, _request: &Request) -> Result<()> {
        Ok(())
    }
}

/// Container whose POST to a missing child creates it
pub struct Storage {
    value: Mutex<String>,
}

impl Storage {
    pub fn new() -> Self {
        Self {
            value: Mutex::new("Storage Resource for PUT, POST and DELETE".to_string()),
        }
    }
}

impl Resource for Storage {
    fn render_get(&self, _request: &Request) -> Result<Representation> {
        Ok(Representation::text(lock(&self.value).clone()))
    }

    fn render_put(&self, request: &Request) -> Result<()> {
        *lock(&self.value) = utf8(request)?;
        Ok(())
    }

    fn render_post(&self, request: &Request) -> Result<PostOutcome> {
        *lock(&self.value) = utf8(request)?;
        Ok(PostOutcome::Updated)
    }

    fn create_child(&self, _name: &str, request: &Request) -> Result<Box<dyn Resource>> {
        Ok(Box::new(BasicResource::new(utf8(request)?)))
    }
}

/// A representation larger than one block
pub struct Big {
    value: Mutex<String>,
}

impl Big {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(BIG_PARAGRAPH.repeat(12)),
        }
    }
}

impl Resource for Big {
    fn render_get(&self, _request: &Request) -> Result<Representation> {
        Ok(Representation::text(lock(&self.value).clone()))
    }

    fn render_put(&self, request: &Request) -> Result<()> {
        *lock(&self.value) = utf8(request)?;
        Ok(())
    }
}

/// Answered with an empty ACK first and the representation later
pub struct Separate;

impl Resource for Separate {
    fn render_get(&self, _request: &Request) -> Result<Representation> {
        Ok(Representation::text("Separate"))
    }

    fn response_delay(&self) -> Option<Duration> {
        Some(SEPARATE_DELAY)
    }
}

/// Slow read-only resource that is never deleted
pub struct Long;

impl Resource for Long {
    fn render_get(&self, _request: &Request) -> Result<Representation> {
        Ok(Representation::text("Long Time"))
    }

    fn response_delay(&self) -> Option<Duration> {
        Some(LONG_DELAY)
    }
}
