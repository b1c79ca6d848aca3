//! Mutable Tree
//!
//! The engine never touches markup directly. It drives an abstract mutable
//! tree through the [`Tree`] trait, which a browser-backed tree and the
//! in-memory [`Document`] both implement.
//!
//! # Contract
//!
//! - Every operation on a handle that no longer names a live node is a
//!   silent no-op (reads return empty results). Directives racing against a
//!   higher-priority directive that already removed their node rely on this.
//! - Writes that would not change anything are not mutations.
//! - Auxiliary data attached with `set_aux` is owned by the node and dropped
//!   with it.

mod document;
mod markup;
mod node;

pub use document::Document;
pub use markup::{decode_entities, escape_attribute, escape_text, is_void, VOID_ELEMENTS};
pub use node::{Aux, NodeId, NodeKind};

use crate::error::Result;

/// The mutable tree the engine renders into and attaches to.
pub trait Tree: Send + Sync {
    /// The document root.
    fn root(&self) -> NodeId;

    /// Whether `node` is live (attached or not).
    fn contains(&self, node: NodeId) -> bool;

    /// Kind of a live node.
    fn kind(&self, node: NodeId) -> Option<NodeKind>;

    /// Lowercase tag of an element.
    fn tag(&self, node: NodeId) -> Option<String>;

    /// Attributes of an element in declaration order.
    fn attributes(&self, node: NodeId) -> Vec<(String, String)>;

    /// One attribute of an element.
    fn attribute(&self, node: NodeId, name: &str) -> Option<String>;

    /// Set an attribute, appending it if new.
    fn set_attribute(&self, node: NodeId, name: &str, value: &str);

    /// Remove an attribute.
    fn remove_attribute(&self, node: NodeId, name: &str);

    /// Concatenated text of the node and its descendants.
    fn text_content(&self, node: NodeId) -> String;

    /// Replace the node's children with a single text node.
    fn set_text(&self, node: NodeId, text: &str);

    /// Serialized children.
    fn inner_markup(&self, node: NodeId) -> String;

    /// Serialized node including its own tag.
    fn outer_markup(&self, node: NodeId) -> String;

    /// Replace the node's children with parsed markup.
    fn set_inner_markup(&self, node: NodeId, markup: &str) -> Result<()>;

    /// Parent of an attached node.
    fn parent(&self, node: NodeId) -> Option<NodeId>;

    /// Children in order.
    fn children(&self, node: NodeId) -> Vec<NodeId>;

    /// The sibling right after `node`.
    fn next_sibling(&self, node: NodeId) -> Option<NodeId>;

    /// A new detached element.
    fn create_element(&self, tag: &str) -> NodeId;

    /// Move `child` to the end of `parent`'s children.
    fn append_child(&self, parent: NodeId, child: NodeId);

    /// Move `node` right after `reference`.
    fn insert_after(&self, reference: NodeId, node: NodeId);

    /// Unlink `node` from its parent, keeping it alive.
    fn detach(&self, node: NodeId);

    /// Unlink and free `node` with its subtree.
    fn remove(&self, node: NodeId);

    /// A detached deep copy of `node`, without auxiliary data.
    fn clone_subtree(&self, node: NodeId) -> Option<NodeId>;

    /// Attach auxiliary data to a node.
    fn set_aux(&self, node: NodeId, data: Aux);

    /// Auxiliary data attached to a node.
    fn aux(&self, node: NodeId) -> Option<Aux>;

    /// Whether `node` is an element.
    fn is_element(&self, node: NodeId) -> bool {
        self.kind(node) == Some(NodeKind::Element)
    }
}
