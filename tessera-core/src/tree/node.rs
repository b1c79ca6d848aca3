//! Tree Nodes
//!
//! This module defines the node types that live in a document arena.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

/// Auxiliary per-node data. It lives in the node's arena slot and is dropped
/// with the node, so it never extends the node's lifetime.
pub type Aux = Arc<dyn Any + Send + Sync>;

/// Handle to a node in a document arena.
///
/// The generation makes handles to freed slots stale instead of aliasing
/// whatever node reuses the slot later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in the arena.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this handle was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}v{}", self.index, self.generation)
    }
}

/// The kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// The document root. It has children but no markup of its own.
    Fragment,

    /// An element with a tag, attributes and children.
    Element,

    /// A run of text.
    Text,

    /// A comment.
    Comment,

    /// A `<!...>` declaration, kept verbatim.
    Declaration,
}

/// Payload of a node.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeData {
    Fragment,
    Element {
        tag: String,
        attributes: IndexMap<String, String>,
    },
    Text(String),
    Comment(String),
    Declaration(String),
}

impl NodeData {
    pub(crate) fn kind(&self) -> NodeKind {
        match self {
            NodeData::Fragment => NodeKind::Fragment,
            NodeData::Element { .. } => NodeKind::Element,
            NodeData::Text(_) => NodeKind::Text,
            NodeData::Comment(_) => NodeKind::Comment,
            NodeData::Declaration(_) => NodeKind::Declaration,
        }
    }

    pub(crate) fn element(tag: &str) -> Self {
        NodeData::Element {
            tag: tag.to_ascii_lowercase(),
            attributes: IndexMap::new(),
        }
    }
}

/// A node in the arena.
pub(crate) struct Node {
    pub(crate) data: NodeData,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) aux: Option<Aux>,
}

impl Node {
    pub(crate) fn new(data: NodeData) -> Self {
        Self {
            data,
            parent: None,
            children: Vec::new(),
            aux: None,
        }
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.data.kind()
    }

    pub(crate) fn tag(&self) -> Option<&str> {
        match &self.data {
            NodeData::Element { tag, .. } => Some(tag),
            _ => None,
        }
    }

    pub(crate) fn attributes(&self) -> Option<&IndexMap<String, String>> {
        match &self.data {
            NodeData::Element { attributes, .. } => Some(attributes),
            _ => None,
        }
    }

    pub(crate) fn attributes_mut(&mut self) -> Option<&mut IndexMap<String, String>> {
        match &mut self.data {
            NodeData::Element { attributes, .. } => Some(attributes),
            _ => None,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("data", &self.data)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("has_aux", &self.aux.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_tags_are_lowercased() {
        let node = Node::new(NodeData::element("DIV"));
        assert_eq!(node.kind(), NodeKind::Element);
        assert_eq!(node.tag(), Some("div"));
        assert!(node.attributes().is_some_and(IndexMap::is_empty));
    }

    #[test]
    fn text_nodes_have_no_attributes() {
        let mut node = Node::new(NodeData::Text("hi".into()));
        assert_eq!(node.kind(), NodeKind::Text);
        assert!(node.tag().is_none());
        assert!(node.attributes_mut().is_none());
    }

    #[test]
    fn node_ids_compare_by_generation() {
        let first = NodeId::new(3, 0);
        let reused = NodeId::new(3, 1);
        assert_ne!(first, reused);
        assert_eq!(first.index(), reused.index());
        assert_eq!(reused.to_string(), "n3v1");
    }
}
