//! Path-addressed resource tree
//!
//! Paths are slash-separated; leading, trailing and repeated slashes are
//! ignored, so `"storage/"`, `"/storage"` and `"storage"` address the same node.
//! The root node has the empty path and is never removed.

use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceHandle, ResourceRef};

/// A node in the resource tree
#[derive(Debug)]
pub struct ResourceNode {
    name: String,
    value: ResourceRef,
    children: Vec<ResourceNode>,
}

impl ResourceNode {
    fn new(name: impl Into<String>, value: ResourceRef) -> Self {
        Self {
            name: name.into(),
            value,
            children: Vec::new(),
        }
    }

    /// Last path segment of this node
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resource bound to this node
    pub fn value(&self) -> &ResourceRef {
        &self.value
    }

    /// Child nodes in insertion order
    pub fn children(&self) -> &[ResourceNode] {
        &self.children
    }

    fn child(&self, name: &str) -> Option<&ResourceNode> {
        self.children.iter().find(|c| c.name == name)
    }

    fn child_mut(&mut self, name: &str) -> Option<&mut ResourceNode> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    fn collect_paths(&self, out: &mut Vec<String>) {
        for child in &self.children {
            out.push(child.value.path().to_string());
            child.collect_paths(out);
        }
    }
}

struct RootResource;

impl Resource for RootResource {}

/// The server's resource tree
#[derive(Debug)]
pub struct ResourceTree {
    root: ResourceNode,
}

impl Default for ResourceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTree {
    /// Create a tree holding only the root
    pub fn new() -> Self {
        let root = ResourceHandle::with_observable("", false, Box::new(RootResource));
        Self {
            root: ResourceNode::new("", root),
        }
    }

    /// The root node
    pub fn root(&self) -> &ResourceNode {
        &self.root
    }

    /// Bind a new resource at `path`
    ///
    /// The parent must already exist and the path must be free.
    ///
    /// # Returns
    ///
    /// - `Ok(ResourceRef)`: Handle of the inserted resource
    /// - `Err(Error::InvalidInput)`: Path is the root or already bound
    /// - `Err(Error::NotFound)`: Parent path does not exist
    pub fn add(&mut self, path: &str, behaviour: Box<dyn Resource>) -> Result<ResourceRef> {
        let segments = split(path);
        let Some((name, parents)) = segments.split_last() else {
            return Err(Error::invalid_input("cannot bind a resource at the root"));
        };

        let parent = self
            .node_mut(parents)
            .ok_or_else(|| Error::not_found(parents.join("/")))?;
        if parent.child(name).is_some() {
            return Err(Error::invalid_input(format!(
                "resource already exists at {}",
                segments.join("/")
            )));
        }

        let handle = ResourceHandle::new(segments.join("/"), behaviour);
        parent
            .children
            .push(ResourceNode::new(*name, handle.clone()));
        Ok(handle)
    }

    /// Resource bound at `path`
    pub fn find(&self, path: &str) -> Option<ResourceRef> {
        self.find_node(path).map(|node| node.value.clone())
    }

    /// Node at `path`; the empty path is the root
    pub fn find_node(&self, path: &str) -> Option<&ResourceNode> {
        let mut node = &self.root;
        for segment in split(path) {
            node = node.child(segment)?;
        }
        Some(node)
    }

    /// Deepest existing node on the way to `path`, with the remaining segments
    pub fn find_closest(&self, path: &str) -> (&ResourceNode, Vec<String>) {
        let segments = split(path);
        let mut node = &self.root;
        let mut consumed = 0;
        for segment in &segments {
            match node.child(segment) {
                Some(child) => {
                    node = child;
                    consumed += 1;
                }
                None => break,
            }
        }
        let rest = segments[consumed..].iter().map(|s| s.to_string()).collect();
        (node, rest)
    }

    /// Rebind `path` to a different handle, keeping the node's children
    ///
    /// # Returns
    ///
    /// The handle previously bound at `path`.
    pub fn replace(&mut self, path: &str, value: ResourceRef) -> Result<ResourceRef> {
        let segments = split(path);
        if segments.is_empty() {
            return Err(Error::invalid_input("cannot replace the root"));
        }
        let node = self
            .node_mut(&segments)
            .ok_or_else(|| Error::not_found(segments.join("/")))?;
        Ok(std::mem::replace(&mut node.value, value))
    }

    /// Detach the subtree at `path`
    ///
    /// The caller owns the returned node and must propagate deletion to the
    /// observers of every resource in it.
    pub fn remove(&mut self, path: &str) -> Option<ResourceNode> {
        let segments = split(path);
        let (name, parents) = segments.split_last()?;
        let parent = self.node_mut(parents)?;
        let pos = parent.children.iter().position(|c| c.name == *name)?;
        Some(parent.children.remove(pos))
    }

    /// Paths of every resource below the root, depth-first
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.root.collect_paths(&mut out);
        out
    }

    fn node_mut(&mut self, segments: &[&str]) -> Option<&mut ResourceNode> {
        let mut node = &mut self.root;
        for segment in segments {
            node = node.child_mut(segment)?;
        }
        Some(node)
    }
}

fn split(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}
