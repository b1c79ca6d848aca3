//! Directives
//!
//! A directive is a named behavior attached to elements through prefixed
//! attributes (`x-name` or `x-name:arg`) or, for element directives, through
//! the tag itself. Registration goes through [`DirectiveRegistry`], which
//! rejects meaningless definitions up front and fixes the execution order of
//! every directive that can meet on one node.
//!
//! # Ordering
//!
//! On a node, directives run by class first (conditional, then repeat, then
//! everything else), then by priority descending, then by name. The class
//! rank guarantees that "should this exist" is decided before "how many", and
//! both before any per-node work.

mod builtin;
mod invocation;
mod registry;

pub use builtin::{register_builtins, IF_RENDERED_ATTR, FOR_INDEX_ATTR};
pub use invocation::{Dependency, Invocation, Providers, Resolved};
pub use registry::{DirectiveRegistry, Matched, ServiceRegistry};

use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AsyncFailure, Result};
use crate::tree::NodeId;

/// Synchronous body of a directive.
pub type Behavior = Arc<dyn Fn(&mut Invocation<'_>) -> Result<Outcome> + Send + Sync>;

/// Asynchronous initialization of a directive.
pub type AsyncInit =
    Arc<dyn Fn(AsyncInput) -> BoxFuture<'static, std::result::Result<Value, AsyncFailure>> + Send + Sync>;

/// What a behavior reports back to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep going with the node's remaining directives.
    Continue,
    /// The node was taken out of the tree; stop processing it.
    Detached,
}

/// Structural class of a directive. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectiveClass {
    /// Decides whether the node exists at all.
    Conditional,
    /// Decides how many copies of the node exist.
    Repeat,
    /// Everything else.
    Plain,
}

/// Server-side handling of an asynchronous directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SsrStrategy {
    /// Await the initialization and render the result into the output.
    #[default]
    Block,
    /// Render the fallback and leave the work to the client.
    Skip,
    /// Render the fallback now and stream the result as a later chunk.
    Stream,
}

/// What an asynchronous initialization receives.
#[derive(Debug, Clone)]
pub struct AsyncInput {
    /// The node being initialized.
    pub node: NodeId,
    /// The directive's attribute value.
    pub expression: String,
    /// The attribute value evaluated in the node's scope, or null when empty.
    pub value: Value,
    /// Resolved dependencies.
    pub deps: Resolved,
}

/// Asynchronous part of a directive.
#[derive(Clone)]
pub struct AsyncOptions {
    pub(crate) load: AsyncInit,
    pub(crate) fallback: Option<String>,
    pub(crate) strategy: SsrStrategy,
    pub(crate) bind_as: String,
}

impl AsyncOptions {
    /// Wrap an async initialization function.
    pub fn new<F, Fut>(load: F) -> Self
    where
        F: Fn(AsyncInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, AsyncFailure>> + Send + 'static,
    {
        Self {
            load: Arc::new(move |input| load(input).boxed()),
            fallback: None,
            strategy: SsrStrategy::default(),
            bind_as: "data".to_string(),
        }
    }

    /// Markup shown while the initialization is outstanding.
    pub fn fallback(mut self, markup: impl Into<String>) -> Self {
        self.fallback = Some(markup.into());
        self
    }

    /// Server strategy.
    pub fn strategy(mut self, strategy: SsrStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Name the loaded value is bound to in the node's scope.
    pub fn bind_as(mut self, name: impl Into<String>) -> Self {
        self.bind_as = name.into();
        self
    }

    /// The configured server strategy.
    pub fn ssr_strategy(&self) -> SsrStrategy {
        self.strategy
    }

    /// The configured fallback markup.
    pub fn fallback_markup(&self) -> Option<&str> {
        self.fallback.as_deref()
    }
}

impl fmt::Debug for AsyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOptions")
            .field("fallback", &self.fallback)
            .field("strategy", &self.strategy)
            .field("bind_as", &self.bind_as)
            .finish_non_exhaustive()
    }
}

/// A directive definition, built fluently and handed to
/// [`DirectiveRegistry::register`].
///
/// ```
/// use tessera_core::directive::{Directive, Outcome};
///
/// let shout = Directive::new("shout")
///     .priority(10)
///     .behavior(|inv| {
///         let text = inv.tree().text_content(inv.node()).to_uppercase();
///         inv.tree().set_text(inv.node(), &text);
///         Ok(Outcome::Continue)
///     });
/// assert_eq!(shout.name(), "shout");
/// ```
#[derive(Clone)]
pub struct Directive {
    name: String,
    class: DirectiveClass,
    priority: i32,
    behavior: Option<Behavior>,
    template: Option<String>,
    isolate: bool,
    provides: IndexMap<String, Value>,
    dependencies: Vec<String>,
    asynchronous: Option<AsyncOptions>,
    element: bool,
}

impl Directive {
    /// Start a plain directive with priority 0.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: DirectiveClass::Plain,
            priority: 0,
            behavior: None,
            template: None,
            isolate: false,
            provides: IndexMap::new(),
            dependencies: Vec::new(),
            asynchronous: None,
            element: false,
        }
    }

    /// Structural class. Defaults to [`DirectiveClass::Plain`].
    pub fn class(mut self, class: DirectiveClass) -> Self {
        self.class = class;
        self
    }

    /// Higher runs first within a class.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Synchronous body, run after the template and any async part.
    pub fn behavior<F>(mut self, behavior: F) -> Self
    where
        F: Fn(&mut Invocation<'_>) -> Result<Outcome> + Send + Sync + 'static,
    {
        self.behavior = Some(Arc::new(behavior));
        self
    }

    /// Markup that replaces the node's children when the directive runs.
    pub fn template(mut self, markup: impl Into<String>) -> Self {
        self.template = Some(markup.into());
        self
    }

    /// Give the node a child scope of its own.
    pub fn isolate(mut self) -> Self {
        self.isolate = true;
        self
    }

    /// Make a named value available to directives on descendants.
    pub fn provide(mut self, name: impl Into<String>, value: Value) -> Self {
        self.provides.insert(name.into(), value);
        self
    }

    /// Declare a dependency, resolved before every invocation.
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Async initialization, handled on the server per its strategy.
    pub fn asynchronous(mut self, options: AsyncOptions) -> Self {
        self.asynchronous = Some(options);
        self
    }

    /// Match elements whose tag is the prefixed name instead of attributes.
    pub fn element(mut self) -> Self {
        self.element = true;
        self
    }

    /// Name without the attribute prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The structural class.
    pub fn directive_class(&self) -> DirectiveClass {
        self.class
    }

    /// Priority within the class.
    pub fn directive_priority(&self) -> i32 {
        self.priority
    }

    /// Whether the directive matches tags rather than attributes.
    pub fn is_element(&self) -> bool {
        self.element
    }

    pub(crate) fn behavior_fn(&self) -> Option<&Behavior> {
        self.behavior.as_ref()
    }

    pub(crate) fn template_markup(&self) -> Option<&str> {
        self.template.as_deref()
    }

    pub(crate) fn provided(&self) -> &IndexMap<String, Value> {
        &self.provides
    }

    pub(crate) fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub(crate) fn async_options(&self) -> Option<&AsyncOptions> {
        self.asynchronous.as_ref()
    }

    /// Whether the node needs a scope of its own. Async directives bind
    /// their result locally, so they get one too.
    pub(crate) fn wants_own_scope(&self) -> bool {
        self.isolate || self.asynchronous.is_some()
    }

    /// Execution order between two directives on the same node.
    pub fn execution_order(&self, other: &Directive) -> Ordering {
        self.class
            .cmp(&other.class)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl fmt::Debug for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Directive")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("priority", &self.priority)
            .field("has_behavior", &self.behavior.is_some())
            .field("template", &self.template)
            .field("isolate", &self.isolate)
            .field("dependencies", &self.dependencies)
            .field("asynchronous", &self.asynchronous)
            .field("element", &self.element)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Directive {
        Directive::new("noop").behavior(|_| Ok(Outcome::Continue))
    }

    #[test]
    fn class_outranks_priority() {
        let conditional = noop().class(DirectiveClass::Conditional).priority(-100);
        let plain = noop().priority(1_000);
        assert_eq!(conditional.execution_order(&plain), Ordering::Less);
    }

    #[test]
    fn higher_priority_runs_first_then_name() {
        let high = Directive::new("b").priority(5);
        let low = Directive::new("a").priority(1);
        assert_eq!(high.execution_order(&low), Ordering::Less);

        let a = Directive::new("a");
        let b = Directive::new("b");
        assert_eq!(a.execution_order(&b), Ordering::Less);
    }

    #[test]
    fn async_options_defaults() {
        let options = AsyncOptions::new(|_| async { Ok(Value::Null) });
        assert_eq!(options.ssr_strategy(), SsrStrategy::Block);
        assert_eq!(options.bind_as, "data");
        assert!(options.fallback_markup().is_none());
    }

    #[test]
    fn strategy_names_deserialize() {
        let strategy: SsrStrategy = serde_json::from_str("\"stream\"").unwrap();
        assert_eq!(strategy, SsrStrategy::Stream);
    }
}
