//! Tree topology contract.
//!
//! The coordination layer addresses nodes through their ids only. It reads
//! the local node's id, its children and its parent, and never mutates the
//! tree.

/// What the coordination layer needs from the tree layer.
///
/// Implementations must guarantee unique node ids and an acyclic tree.
pub trait NodeTopology: Send + Sync + 'static {
    /// This node's id.
    fn node_id(&self) -> &str;

    /// Ids of this node's direct children.
    fn children(&self) -> Vec<String>;

    /// Id of this node's parent, if any.
    fn parent(&self) -> Option<String>;
}

/// Fixed topology for tests and simple embeddings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticTopology {
    node_id: String,
    parent: Option<String>,
    children: Vec<String>,
}

impl StaticTopology {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            parent: None,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Add a child. Duplicate ids and self-references are ignored.
    #[must_use]
    pub fn with_child(mut self, child: impl Into<String>) -> Self {
        let child = child.into();
        if child != self.node_id && !self.children.contains(&child) {
            self.children.push(child);
        }
        self
    }

    #[must_use]
    pub fn with_children<I, S>(self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        children.into_iter().fold(self, |topology, child| topology.with_child(child))
    }
}

impl NodeTopology for StaticTopology {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn children(&self) -> Vec<String> {
        self.children.clone()
    }

    fn parent(&self) -> Option<String> {
        self.parent.clone()
    }
}
