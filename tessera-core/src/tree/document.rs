//! Virtual Document
//!
//! `Document` is the server-side implementation of [`Tree`]: a generational
//! arena of nodes behind a single lock. Removing a node frees its whole
//! subtree, including auxiliary data, and bumps the slot generation, so any
//! handle still pointing at it turns into a silent no-op.

use std::sync::Arc;

use parking_lot::Mutex;

use super::markup::{self, escape_attribute, escape_text, is_void, Markup};
use super::node::{Aux, Node, NodeData, NodeId, NodeKind};
use super::Tree;
use crate::error::Result;

struct Slot {
    generation: u32,
    node: Option<Node>,
}

struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: NodeId,
    mutations: u64,
}

impl Arena {
    fn new() -> Self {
        let mut arena = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: NodeId::new(0, 0),
            mutations: 0,
        };
        arena.root = arena.alloc(Node::new(NodeData::Fragment));
        arena
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId::new(index, 0)
            }
        }
    }

    fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_ref())
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_mut())
    }

    fn unlink(&mut self, id: NodeId) -> bool {
        let Some(parent) = self.get(id).and_then(|node| node.parent) else {
            return false;
        };
        if let Some(parent) = self.get_mut(parent) {
            parent.children.retain(|child| *child != id);
        }
        if let Some(node) = self.get_mut(id) {
            node.parent = None;
        }
        true
    }

    fn free_subtree(&mut self, id: NodeId) {
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            let Some(slot) = self.slots.get_mut(current.index() as usize) else {
                continue;
            };
            if slot.generation != current.generation() {
                continue;
            }
            if let Some(node) = slot.node.take() {
                pending.extend(node.children);
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(current.index());
            }
        }
    }

    fn clear_children(&mut self, id: NodeId) {
        let children = match self.get_mut(id) {
            Some(node) => std::mem::take(&mut node.children),
            None => return,
        };
        for child in children {
            self.free_subtree(child);
        }
    }

    fn append(&mut self, parent: NodeId, child: NodeId) {
        if parent == child || self.get(parent).is_none() || self.get(child).is_none() {
            return;
        }
        self.unlink(child);
        if let Some(node) = self.get_mut(child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.get_mut(parent) {
            node.children.push(child);
        }
    }

    fn build(&mut self, parent: NodeId, nodes: Vec<Markup>) {
        for markup in nodes {
            let (data, children) = match markup {
                Markup::Element {
                    tag,
                    attributes,
                    children,
                } => (NodeData::Element { tag, attributes }, children),
                Markup::Text(text) => (NodeData::Text(text), Vec::new()),
                Markup::Comment(text) => (NodeData::Comment(text), Vec::new()),
                Markup::Declaration(text) => (NodeData::Declaration(text), Vec::new()),
            };
            let id = self.alloc(Node::new(data));
            self.append(parent, id);
            self.build(id, children);
        }
    }

    fn copy(&mut self, id: NodeId) -> Option<NodeId> {
        let (data, children) = {
            let node = self.get(id)?;
            (node.data.clone(), node.children.clone())
        };
        let copy = self.alloc(Node::new(data));
        for child in children {
            if let Some(child_copy) = self.copy(child) {
                self.append(copy, child_copy);
            }
        }
        Some(copy)
    }

    fn write_children(&self, id: NodeId, out: &mut String) {
        if let Some(node) = self.get(id) {
            for child in &node.children {
                self.write(*child, out);
            }
        }
    }

    fn write(&self, id: NodeId, out: &mut String) {
        let Some(node) = self.get(id) else {
            return;
        };
        match &node.data {
            NodeData::Fragment => self.write_children(id, out),
            NodeData::Text(text) => {
                let raw = node
                    .parent
                    .and_then(|parent| self.get(parent))
                    .and_then(Node::tag)
                    .is_some_and(|tag| tag == "script" || tag == "style");
                if raw {
                    out.push_str(text);
                } else {
                    out.push_str(&escape_text(text));
                }
            }
            NodeData::Comment(text) => {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
            NodeData::Declaration(text) => {
                out.push_str("<!");
                out.push_str(text);
                out.push('>');
            }
            NodeData::Element { tag, attributes } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attributes {
                    out.push(' ');
                    out.push_str(name);
                    if !value.is_empty() {
                        out.push_str("=\"");
                        out.push_str(&escape_attribute(value));
                        out.push('"');
                    }
                }
                out.push('>');
                if !is_void(tag) {
                    self.write_children(id, out);
                    out.push_str("</");
                    out.push_str(tag);
                    out.push('>');
                }
            }
        }
    }

    fn text_content(&self, id: NodeId, out: &mut String) {
        let Some(node) = self.get(id) else {
            return;
        };
        match &node.data {
            NodeData::Text(text) => out.push_str(text),
            NodeData::Element { .. } | NodeData::Fragment => {
                for child in &node.children {
                    self.text_content(*child, out);
                }
            }
            _ => {}
        }
    }

    fn descendants(&self, id: NodeId, out: &mut Vec<NodeId>) {
        if let Some(node) = self.get(id) {
            for child in &node.children {
                out.push(*child);
                self.descendants(*child, out);
            }
        }
    }
}

/// A shared handle to an in-memory document.
#[derive(Clone)]
pub struct Document {
    arena: Arc<Mutex<Arena>>,
}

impl Document {
    /// An empty document.
    pub fn new() -> Self {
        Self {
            arena: Arc::new(Mutex::new(Arena::new())),
        }
    }

    /// Parse markup into a new document.
    pub fn parse(markup: &str) -> Result<Self> {
        let nodes = markup::parse(markup)?;
        let document = Self::new();
        {
            let mut arena = document.arena.lock();
            let root = arena.root;
            arena.build(root, nodes);
        }
        Ok(document)
    }

    /// Serialize the whole document.
    pub fn to_markup(&self) -> String {
        self.inner_markup(self.root())
    }

    /// Number of effective mutations applied so far.
    pub fn mutation_count(&self) -> u64 {
        self.arena.lock().mutations
    }

    /// Number of nodes attached under the root.
    pub fn node_count(&self) -> usize {
        self.descendants(self.root()).len()
    }

    /// Every node attached under `node`, in tree order.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.arena.lock().descendants(node, &mut out);
        out
    }

    /// Attached elements with the given tag, in tree order.
    pub fn elements_by_tag(&self, tag: &str) -> Vec<NodeId> {
        let arena = self.arena.lock();
        let mut all = Vec::new();
        arena.descendants(arena.root, &mut all);
        all.into_iter()
            .filter(|id| arena.get(*id).and_then(Node::tag) == Some(tag))
            .collect()
    }

    /// The first attached element whose attribute `name` equals `value`.
    pub fn find_by_attribute(&self, name: &str, value: &str) -> Option<NodeId> {
        let arena = self.arena.lock();
        let mut all = Vec::new();
        arena.descendants(arena.root, &mut all);
        all.into_iter().find(|id| {
            arena
                .get(*id)
                .and_then(Node::attributes)
                .and_then(|attributes| attributes.get(name))
                .is_some_and(|found| found == value)
        })
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Arena) -> Option<R>) -> Option<R> {
        let mut arena = self.arena.lock();
        let result = f(&mut arena);
        if result.is_some() {
            arena.mutations += 1;
        }
        result
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("nodes", &self.node_count())
            .field("mutations", &self.mutation_count())
            .finish()
    }
}

impl Tree for Document {
    fn root(&self) -> NodeId {
        self.arena.lock().root
    }

    fn contains(&self, node: NodeId) -> bool {
        self.arena.lock().get(node).is_some()
    }

    fn kind(&self, node: NodeId) -> Option<NodeKind> {
        self.arena.lock().get(node).map(Node::kind)
    }

    fn tag(&self, node: NodeId) -> Option<String> {
        self.arena.lock().get(node).and_then(Node::tag).map(str::to_string)
    }

    fn attributes(&self, node: NodeId) -> Vec<(String, String)> {
        self.arena
            .lock()
            .get(node)
            .and_then(Node::attributes)
            .map(|attributes| {
                attributes
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.arena
            .lock()
            .get(node)
            .and_then(Node::attributes)
            .and_then(|attributes| attributes.get(name).cloned())
    }

    fn set_attribute(&self, node: NodeId, name: &str, value: &str) {
        self.mutate(|arena| {
            let attributes = arena.get_mut(node)?.attributes_mut()?;
            if attributes.get(name).is_some_and(|current| current == value) {
                return None;
            }
            attributes.insert(name.to_string(), value.to_string());
            Some(())
        });
    }

    fn remove_attribute(&self, node: NodeId, name: &str) {
        self.mutate(|arena| {
            arena
                .get_mut(node)?
                .attributes_mut()?
                .shift_remove(name)
                .map(|_| ())
        });
    }

    fn text_content(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.arena.lock().text_content(node, &mut out);
        out
    }

    fn set_text(&self, node: NodeId, text: &str) {
        self.mutate(|arena| {
            let (kind, children) = {
                let current = arena.get(node)?;
                (current.kind(), current.children.clone())
            };
            if kind == NodeKind::Text {
                match &mut arena.get_mut(node)?.data {
                    NodeData::Text(existing) if existing.as_str() != text => {
                        *existing = text.to_string();
                        return Some(());
                    }
                    _ => return None,
                }
            }
            let unchanged = match children.as_slice() {
                [only] => matches!(
                    arena.get(*only).map(|child| &child.data),
                    Some(NodeData::Text(existing)) if existing == text
                ),
                [] => text.is_empty(),
                _ => false,
            };
            if unchanged {
                return None;
            }
            arena.clear_children(node);
            if !text.is_empty() {
                let child = arena.alloc(Node::new(NodeData::Text(text.to_string())));
                arena.append(node, child);
            }
            Some(())
        });
    }

    fn inner_markup(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.arena.lock().write_children(node, &mut out);
        out
    }

    fn outer_markup(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.arena.lock().write(node, &mut out);
        out
    }

    fn set_inner_markup(&self, node: NodeId, markup: &str) -> Result<()> {
        let nodes = markup::parse(markup)?;
        self.mutate(|arena| {
            arena.get(node)?;
            let mut current = String::new();
            arena.write_children(node, &mut current);
            if current == markup {
                return None;
            }
            arena.clear_children(node);
            arena.build(node, nodes);
            Some(())
        });
        Ok(())
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.arena.lock().get(node).and_then(|node| node.parent)
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.arena
            .lock()
            .get(node)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    fn next_sibling(&self, node: NodeId) -> Option<NodeId> {
        let arena = self.arena.lock();
        let parent = arena.get(node)?.parent?;
        let siblings = &arena.get(parent)?.children;
        let position = siblings.iter().position(|id| *id == node)?;
        siblings.get(position + 1).copied()
    }

    fn create_element(&self, tag: &str) -> NodeId {
        self.arena.lock().alloc(Node::new(NodeData::element(tag)))
    }

    fn append_child(&self, parent: NodeId, child: NodeId) {
        self.mutate(|arena| {
            arena.get(parent)?;
            arena.get(child)?;
            arena.append(parent, child);
            Some(())
        });
    }

    fn insert_after(&self, reference: NodeId, node: NodeId) {
        self.mutate(|arena| {
            if reference == node {
                return None;
            }
            let parent = arena.get(reference)?.parent?;
            arena.get(node)?;
            arena.unlink(node);
            let siblings = &mut arena.get_mut(parent)?.children;
            let position = siblings.iter().position(|id| *id == reference)?;
            siblings.insert(position + 1, node);
            arena.get_mut(node)?.parent = Some(parent);
            Some(())
        });
    }

    fn detach(&self, node: NodeId) {
        self.mutate(|arena| arena.unlink(node).then_some(()));
    }

    fn remove(&self, node: NodeId) {
        self.mutate(|arena| {
            arena.get(node)?;
            if node == arena.root {
                return None;
            }
            arena.unlink(node);
            arena.free_subtree(node);
            Some(())
        });
    }

    fn clone_subtree(&self, node: NodeId) -> Option<NodeId> {
        self.arena.lock().copy(node)
    }

    fn set_aux(&self, node: NodeId, data: Aux) {
        if let Some(node) = self.arena.lock().get_mut(node) {
            node.aux = Some(data);
        }
    }

    fn aux(&self, node: NodeId) -> Option<Aux> {
        self.arena.lock().get(node).and_then(|node| node.aux.clone())
    }
}
