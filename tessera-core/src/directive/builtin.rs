//! Built-in directives: `if`, `for`, `text` and `show`.
//!
//! `if` and `for` keep their source in a `template` element and render
//! copies of its first element right after it. Rendered copies carry a
//! marker attribute, so attaching to server output adopts them instead of
//! rendering again. Used on any other element, both first wrap the element
//! in a `template`, which detaches it from its parent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::{Directive, DirectiveClass, DirectiveRegistry, Invocation, Outcome};
use crate::error::{EngineError, Result};
use crate::expr::{evaluate_in, to_text, truthy};
use crate::pipeline::{Frame, Mode, Pipeline};
use crate::reactive::{untrack, EffectScope};
use crate::tree::{NodeId, Tree};

/// Marker on nodes rendered by `if`.
pub const IF_RENDERED_ATTR: &str = "data-if-rendered";

/// Marker on nodes rendered by `for`, holding the item position.
pub const FOR_INDEX_ATTR: &str = "data-for-index";

const HIDDEN_STYLE: &str = "display: none";

/// Add the built-in directives to `registry`. Names already taken are left
/// alone.
pub fn register_builtins(registry: &mut DirectiveRegistry) {
    let builtins = [
        Directive::new("if")
            .class(DirectiveClass::Conditional)
            .behavior(conditional),
        Directive::new("for")
            .class(DirectiveClass::Repeat)
            .behavior(repeat),
        Directive::new("text").behavior(text),
        Directive::new("show").behavior(show),
    ];
    for directive in builtins {
        let name = directive.name().to_string();
        if registry.get(&name).is_none() {
            if let Err(err) = registry.register(directive) {
                tracing::warn!(directive = %name, error = %err, "built-in not registered");
            }
        }
    }
}

/// Make sure the directive sits on a `template`. Returns the template and
/// whether the node had to be wrapped.
fn into_template(inv: &Invocation<'_>) -> (NodeId, bool) {
    let tree = inv.tree();
    let node = inv.node();
    if tree.tag(node).as_deref() == Some("template") {
        return (node, false);
    }

    let template = tree.create_element("template");
    tree.set_attribute(template, inv.attribute(), inv.expression());
    tree.remove_attribute(node, inv.attribute());
    tree.insert_after(node, template);
    tree.append_child(template, node);
    inv.pipeline().mark_processed(template, inv.frame());
    (template, true)
}

fn first_element_child(tree: &dyn Tree, node: NodeId) -> Option<NodeId> {
    tree.children(node)
        .into_iter()
        .find(|child| tree.is_element(*child))
}

/// Siblings after `after` up to, not including, `stop`.
fn range_after(tree: &dyn Tree, after: NodeId, stop: Option<NodeId>) -> Vec<NodeId> {
    let mut nodes = Vec::new();
    let mut cursor = tree.next_sibling(after);
    while let Some(node) = cursor {
        if Some(node) == stop {
            break;
        }
        nodes.push(node);
        cursor = tree.next_sibling(node);
    }
    nodes
}

/// Insert a processed copy of `content` after `after`. Returns every node
/// the copy turned into, each marked with `marker`.
fn stamp(
    pipeline: &Pipeline,
    after: NodeId,
    content: NodeId,
    frame: &Frame,
    marker: &str,
    value: &str,
) -> Result<Vec<NodeId>> {
    let tree = pipeline.tree();
    let Some(copy) = tree.clone_subtree(content) else {
        return Ok(Vec::new());
    };
    tree.set_attribute(copy, marker, value);
    let stop = tree.next_sibling(after);
    tree.insert_after(after, copy);
    pipeline.process(copy, frame)?;

    let nodes = range_after(tree.as_ref(), after, stop);
    for node in &nodes {
        tree.set_attribute(*node, marker, value);
    }
    Ok(nodes)
}

/// Marked elements right after `after`, grouped by marker value.
fn marked_after(tree: &dyn Tree, after: NodeId, marker: &str) -> Vec<Vec<NodeId>> {
    let mut groups: Vec<(String, Vec<NodeId>)> = Vec::new();
    let mut cursor = tree.next_sibling(after);
    while let Some(node) = cursor {
        let Some(value) = tree.attribute(node, marker) else {
            break;
        };
        match groups.last_mut() {
            Some((current, nodes)) if *current == value => nodes.push(node),
            _ => groups.push((value, vec![node])),
        }
        cursor = tree.next_sibling(node);
    }
    groups.into_iter().map(|(_, nodes)| nodes).collect()
}

/// What a structural directive currently has in the tree.
struct Rendered {
    nodes: Vec<NodeId>,
    effects: EffectScope,
}

impl Rendered {
    fn clear(self, tree: &dyn Tree) {
        self.effects.stop();
        for node in self.nodes {
            tree.remove(node);
        }
    }
}

fn conditional(inv: &mut Invocation<'_>) -> Result<Outcome> {
    let (template, wrapped) = into_template(inv);
    let pipeline = inv.pipeline().clone();
    let frame = inv.frame().clone();
    let expression = inv.expression().to_string();
    let current: Arc<Mutex<Option<Rendered>>> = Arc::new(Mutex::new(None));
    let adopt = AtomicBool::new(inv.mode() == Mode::Client);

    inv.effect(move || {
        let visible = truthy(&evaluate_in(pipeline.evaluator().as_ref(), &expression, frame.scope())?);
        untrack(|| -> Result<()> {
            let tree = pipeline.tree().as_ref();

            if adopt.swap(false, Ordering::AcqRel) {
                let existing: Vec<NodeId> = marked_after(tree, template, IF_RENDERED_ATTR)
                    .into_iter()
                    .flatten()
                    .collect();
                if visible && !existing.is_empty() {
                    let branch = frame.branch();
                    for node in &existing {
                        pipeline.process(*node, &branch)?;
                    }
                    *current.lock() = Some(Rendered {
                        nodes: existing,
                        effects: branch.effects().clone(),
                    });
                    return Ok(());
                }
                for node in existing {
                    tree.remove(node);
                }
            }

            let previous = current.lock().take();
            match (visible, previous) {
                (true, None) => {
                    let Some(content) = first_element_child(tree, template) else {
                        return Ok(());
                    };
                    let branch = frame.branch();
                    let nodes = stamp(&pipeline, template, content, &branch, IF_RENDERED_ATTR, "")?;
                    *current.lock() = Some(Rendered {
                        nodes,
                        effects: branch.effects().clone(),
                    });
                }
                (false, Some(rendered)) => rendered.clear(tree),
                (_, previous) => *current.lock() = previous,
            }
            Ok(())
        })
    })?;

    Ok(if wrapped {
        Outcome::Detached
    } else {
        Outcome::Continue
    })
}

/// `item in items`, `(item, index) in items`, `of` works as `in`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LoopSpec {
    item: String,
    index: Option<String>,
    source: String,
}

fn parse_loop(expression: &str) -> Option<LoopSpec> {
    let (left, source) = expression
        .split_once(" in ")
        .or_else(|| expression.split_once(" of "))?;
    let left = left.trim();
    let left = left
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .unwrap_or(left);

    let mut names = left.split(',').map(str::trim);
    let item = names.next().filter(|name| !name.is_empty())?.to_string();
    let index = names.next().filter(|name| !name.is_empty()).map(str::to_string);
    let source = source.trim().to_string();
    if source.is_empty() || names.next().is_some() {
        return None;
    }
    Some(LoopSpec {
        item,
        index,
        source,
    })
}

/// Items of a loop source with their keys: array positions, object keys,
/// or `0..n` for a number.
fn entries(value: Value) -> std::result::Result<Vec<(Value, Value)>, String> {
    match value {
        Value::Array(items) => Ok(items
            .into_iter()
            .enumerate()
            .map(|(position, item)| (item, Value::from(position)))
            .collect()),
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, item)| (item, Value::String(key)))
            .collect()),
        Value::Number(n) => {
            let count = n.as_u64().unwrap_or(0);
            Ok((0..count).map(|i| (Value::from(i), Value::from(i))).collect())
        }
        Value::Null => Ok(Vec::new()),
        other => Err(format!("cannot iterate over {other}")),
    }
}

fn item_frame(frame: &Frame, pattern: &LoopSpec, item: Value, key: Value) -> Frame {
    let mut locals = Map::new();
    locals.insert(pattern.item.clone(), item);
    if let Some(index) = &pattern.index {
        locals.insert(index.clone(), key);
    }
    frame.nested(locals)
}

fn repeat(inv: &mut Invocation<'_>) -> Result<Outcome> {
    let pattern = parse_loop(inv.expression())
        .ok_or_else(|| inv.fail("expected `item in items` or `(item, index) in items`"))?;
    let (template, wrapped) = into_template(inv);
    let pipeline = inv.pipeline().clone();
    let frame = inv.frame().clone();
    let directive = inv.directive().to_string();
    let current: Arc<Mutex<Vec<Rendered>>> = Arc::new(Mutex::new(Vec::new()));
    let adopt = AtomicBool::new(inv.mode() == Mode::Client);

    inv.effect(move || {
        let source = evaluate_in(pipeline.evaluator().as_ref(), &pattern.source, frame.scope())?;
        let items = entries(source).map_err(|cause| EngineError::Directive {
            directive: directive.clone(),
            node: template,
            cause,
        })?;

        untrack(|| -> Result<()> {
            let tree = pipeline.tree().as_ref();
            let previous = std::mem::take(&mut *current.lock());

            if adopt.swap(false, Ordering::AcqRel) {
                let groups = marked_after(tree, template, FOR_INDEX_ATTR);
                if groups.len() == items.len() {
                    let mut adopted = Vec::with_capacity(groups.len());
                    for ((item, key), nodes) in items.into_iter().zip(groups) {
                        let item_frame = item_frame(&frame, &pattern, item, key);
                        for node in &nodes {
                            pipeline.process(*node, &item_frame)?;
                        }
                        adopted.push(Rendered {
                            nodes,
                            effects: item_frame.effects().clone(),
                        });
                    }
                    *current.lock() = adopted;
                    return Ok(());
                }
                tracing::debug!(
                    rendered = groups.len(),
                    items = items.len(),
                    "item count changed since render, rendering again"
                );
                for node in groups.into_iter().flatten() {
                    tree.remove(node);
                }
            }

            for rendered in previous {
                rendered.clear(tree);
            }
            let Some(content) = first_element_child(tree, template) else {
                return Ok(());
            };

            let mut anchor = template;
            let mut next = Vec::with_capacity(items.len());
            for (position, (item, key)) in items.into_iter().enumerate() {
                let item_frame = item_frame(&frame, &pattern, item, key);
                let nodes = stamp(
                    &pipeline,
                    anchor,
                    content,
                    &item_frame,
                    FOR_INDEX_ATTR,
                    &position.to_string(),
                )?;
                if let Some(last) = nodes.last() {
                    anchor = *last;
                }
                next.push(Rendered {
                    nodes,
                    effects: item_frame.effects().clone(),
                });
            }
            *current.lock() = next;
            Ok(())
        })
    })?;

    Ok(if wrapped {
        Outcome::Detached
    } else {
        Outcome::Continue
    })
}

fn text(inv: &mut Invocation<'_>) -> Result<Outcome> {
    let tree = inv.tree().clone();
    let evaluator = inv.evaluator();
    let scope = inv.scope().clone();
    let expression = inv.expression().to_string();
    let node = inv.node();

    inv.effect(move || {
        let value = evaluate_in(evaluator.as_ref(), &expression, &scope)?;
        tree.set_text(node, &to_text(&value));
        Ok(())
    })?;
    Ok(Outcome::Continue)
}

fn show(inv: &mut Invocation<'_>) -> Result<Outcome> {
    let tree = inv.tree().clone();
    let evaluator = inv.evaluator();
    let scope = inv.scope().clone();
    let expression = inv.expression().to_string();
    let node = inv.node();

    inv.effect(move || {
        let visible = truthy(&evaluate_in(evaluator.as_ref(), &expression, &scope)?);
        if !visible {
            tree.set_attribute(node, "style", HIDDEN_STYLE);
        } else if tree.attribute(node, "style").as_deref() == Some(HIDDEN_STYLE) {
            tree.remove_attribute(node, "style");
        }
        Ok(())
    })?;
    Ok(Outcome::Continue)
}
