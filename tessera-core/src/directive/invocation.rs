//! Invocation context handed to directive behaviors.
//!
//! # Dependency resolution
//!
//! Each declared dependency resolves, in order, to a built-in (`$el`,
//! `$scope`, `$expression`, `$arg`, `$tree`), to the nearest value provided
//! by a directive on an ancestor, or to a registered service. A name none of
//! those supply aborts the pass with `UnresolvedDependency`.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use super::{Directive, Matched};
use crate::error::{EngineError, Result};
use crate::expr::{evaluate_in, Evaluator};
use crate::pipeline::{watch, Frame, Mode, Pipeline};
use crate::reactive::Effect;
use crate::scope::Scope;
use crate::tree::{NodeId, Tree};

/// Values provided by directives on ancestors, nearest first.
///
/// A persistent list: extending it never affects frames that already hold
/// the shorter one.
#[derive(Clone, Default)]
pub struct Providers {
    head: Option<Arc<ProvidedValue>>,
}

struct ProvidedValue {
    name: String,
    value: Value,
    next: Option<Arc<ProvidedValue>>,
}

impl Providers {
    /// A list with one more value in front.
    pub fn with(&self, name: impl Into<String>, value: Value) -> Self {
        Self {
            head: Some(Arc::new(ProvidedValue {
                name: name.into(),
                value,
                next: self.head.clone(),
            })),
        }
    }

    /// The nearest value provided under `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let mut cursor = self.head.as_deref();
        while let Some(entry) = cursor {
            if entry.name == name {
                return Some(&entry.value);
            }
            cursor = entry.next.as_deref();
        }
        None
    }
}

impl fmt::Debug for Providers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        let mut cursor = self.head.as_deref();
        while let Some(entry) = cursor {
            list.entry(&entry.name);
            cursor = entry.next.as_deref();
        }
        list.finish()
    }
}

/// One resolved dependency.
#[derive(Clone)]
pub enum Dependency {
    Node(NodeId),
    Scope(Scope),
    Value(Value),
    Tree(Arc<dyn Tree>),
    Service(Arc<dyn Any + Send + Sync>),
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Node(node) => write!(f, "Node({node})"),
            Dependency::Scope(scope) => write!(f, "Scope(depth {})", scope.depth()),
            Dependency::Value(value) => write!(f, "Value({value})"),
            Dependency::Tree(_) => f.write_str("Tree"),
            Dependency::Service(_) => f.write_str("Service"),
        }
    }
}

/// Dependencies of one invocation, by declared name.
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    entries: IndexMap<String, Dependency>,
}

impl Resolved {
    /// Resolve every dependency `directive` declares.
    pub(crate) fn resolve(
        pipeline: &Pipeline,
        node: NodeId,
        frame: &Frame,
        matched: &Matched,
    ) -> Result<Self> {
        let directive: &Directive = &matched.directive;
        let mut entries = IndexMap::new();
        for name in directive.dependencies() {
            let dependency = match name.as_str() {
                "$el" => Dependency::Node(node),
                "$scope" => Dependency::Scope(frame.scope().clone()),
                "$expression" => Dependency::Value(Value::String(matched.expression.clone())),
                "$arg" => Dependency::Value(
                    matched.arg.clone().map(Value::String).unwrap_or(Value::Null),
                ),
                "$tree" => Dependency::Tree(pipeline.tree().clone()),
                other => {
                    if let Some(value) = frame.providers().get(other) {
                        Dependency::Value(value.clone())
                    } else if let Some(service) = pipeline.services().get_any(other) {
                        Dependency::Service(service)
                    } else {
                        return Err(EngineError::UnresolvedDependency {
                            directive: directive.name().to_string(),
                            name: other.to_string(),
                        });
                    }
                }
            };
            entries.insert(name.clone(), dependency);
        }
        Ok(Self { entries })
    }

    /// A resolved dependency of either kind.
    pub fn get(&self, name: &str) -> Option<&Dependency> {
        self.entries.get(name)
    }

    /// A value dependency (provided value or `$expression`/`$arg`).
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.entries.get(name)? {
            Dependency::Value(value) => Some(value),
            _ => None,
        }
    }

    /// A service dependency of type `T`.
    pub fn service<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        match self.entries.get(name)? {
            Dependency::Service(service) => service.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Number of resolved dependencies.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directive declared no dependencies.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything a behavior can see and do while it runs on one node.
pub struct Invocation<'a> {
    pub(crate) pipeline: &'a Pipeline,
    pub(crate) node: NodeId,
    pub(crate) frame: &'a mut Frame,
    pub(crate) matched: &'a Matched,
    pub(crate) deps: Resolved,
}

impl<'a> Invocation<'a> {
    /// The node being processed.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The tree the node lives in.
    pub fn tree(&self) -> &Arc<dyn Tree> {
        self.pipeline.tree()
    }

    /// The running pass.
    pub fn pipeline(&self) -> &Pipeline {
        self.pipeline
    }

    /// Whether this is a server render or a client attach.
    pub fn mode(&self) -> Mode {
        self.pipeline.mode()
    }

    /// Name of the running directive.
    pub fn directive(&self) -> &str {
        self.matched.directive.name()
    }

    /// Full attribute name that matched.
    pub fn attribute(&self) -> &str {
        &self.matched.attribute
    }

    /// Raw attribute value.
    pub fn expression(&self) -> &str {
        &self.matched.expression
    }

    /// The part after `:` in the attribute name, if any.
    pub fn arg(&self) -> Option<&str> {
        self.matched.arg.as_deref()
    }

    /// The node's scope.
    pub fn scope(&self) -> &Scope {
        self.frame.scope()
    }

    /// The node's frame: scope, providers and effect scope.
    pub fn frame(&self) -> &Frame {
        &*self.frame
    }

    /// Dependencies resolved for this invocation.
    pub fn deps(&self) -> &Resolved {
        &self.deps
    }

    /// The engine's expression evaluator.
    pub fn evaluator(&self) -> Arc<dyn Evaluator> {
        self.pipeline.evaluator().clone()
    }

    /// Evaluate an expression in the node's scope. Reads are tracked when
    /// called inside an effect.
    pub fn evaluate(&self, expression: &str) -> Result<Value> {
        evaluate_in(self.pipeline.evaluator().as_ref(), expression, self.frame.scope())
    }

    /// Make `value` visible to directives on descendants under `name`.
    pub fn provide(&mut self, name: impl Into<String>, value: Value) {
        self.frame.providers = self.frame.providers.with(name, value);
    }

    /// Replace the scope descendants and later directives see.
    pub fn set_scope(&mut self, scope: Scope) {
        self.frame.scope = scope;
    }

    /// An error naming this directive and node.
    pub fn fail(&self, cause: impl fmt::Display) -> EngineError {
        EngineError::Directive {
            directive: self.directive().to_string(),
            node: self.node,
            cause: cause.to_string(),
        }
    }

    /// Run `f` as an effect owned by the node.
    ///
    /// An error from the first run aborts the pass. Errors from later runs
    /// have nobody to return to and are logged.
    pub fn effect<F>(&self, f: F) -> Result<Effect>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        watch(self.frame.effects(), self.directive(), self.node, f)
    }
}
