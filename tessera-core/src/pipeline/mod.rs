//! Execution Pipeline
//!
//! Walks a tree and applies directives to every element, once.
//!
//! # Per-node state machine
//!
//! 1. **Discover**: match attributes (and the tag) against the registry and
//!    sort the matches into execution order.
//! 2. **Scope decision**: a scope initializer attribute or a directive that
//!    wants its own scope gets the node a child scope; otherwise the parent's
//!    scope is shared.
//! 3. **Run**: behaviors run one after another. After each synchronous one
//!    the node is checked for detachment (removed, or moved away from its
//!    original parent); a detached node gets no further processing. An async
//!    behavior suspends the node: its remaining behaviors, bindings and
//!    children are chained after it as one continuation on the pass's task
//!    set, so other nodes keep going meanwhile.
//! 4. **Bindings**: `:name="expr"` attributes, applied last.
//! 5. **Recurse** into children, except under `template`.
//!
//! A node is marked processed before anything runs on it, and marked nodes
//! are skipped. That is what lets the client attach to server output, and
//! attach twice, without applying any behavior twice.

mod queue;

pub(crate) use queue::{Running, TaskSet};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::directive::{Invocation, Matched, Outcome, Providers, Resolved, ServiceRegistry};
use crate::engine::Environment;
use crate::error::{EngineError, Result};
use crate::expr::{evaluate_in, to_text, Evaluator};
use crate::lifecycle::{self, PendingUnits, Waiter};
use crate::reactive::{untrack, Effect, EffectScope};
use crate::scope::Scope;
use crate::tree::{NodeId, NodeKind, Tree};

/// Which side of the wire a pass runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Rendering markup from scratch.
    Server,
    /// Attaching to markup that was already rendered.
    Client,
}

/// What a node passes down to its children.
#[derive(Debug, Clone)]
pub struct Frame {
    pub(crate) scope: Scope,
    pub(crate) providers: Providers,
    pub(crate) effects: EffectScope,
    pub(crate) async_depth: usize,
}

impl Frame {
    /// A root frame over `scope` with a fresh effect scope.
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            providers: Providers::default(),
            effects: EffectScope::new(),
            async_depth: 0,
        }
    }

    /// Scope reads and writes go through.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Values provided by ancestors, nearest first.
    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    /// Effect scope that owns everything created under this frame.
    pub fn effects(&self) -> &EffectScope {
        &self.effects
    }

    /// Number of block-and-render async directives above this frame.
    pub fn async_depth(&self) -> usize {
        self.async_depth
    }

    /// The same frame over another scope.
    pub fn with_scope(&self, scope: Scope) -> Self {
        Self {
            scope,
            ..self.clone()
        }
    }

    /// The same scope with an effect scope that can be stopped on its own.
    pub fn branch(&self) -> Self {
        Self {
            effects: self.effects.child(),
            ..self.clone()
        }
    }

    /// A frame for a produced subtree: a child scope holding `locals` and an
    /// effect scope that can be stopped on its own.
    pub fn nested(&self, locals: Map<String, Value>) -> Self {
        Self {
            scope: self.scope.child(locals),
            providers: self.providers.clone(),
            effects: self.effects.child(),
            async_depth: self.async_depth,
        }
    }
}

/// Per-node record stored as auxiliary data. Its presence means processed.
struct NodeState {
    frame: Mutex<Frame>,
}

/// Result of invoking one directive.
pub(crate) enum Step {
    Continue,
    Detached,
    /// The directive is async; the future yields the frame the rest of the
    /// node runs with.
    Settle(BoxFuture<'static, Result<Frame>>),
    /// The node waits for the streamed unit with this id. Nothing else runs
    /// on it until the unit is applied.
    Wait(String),
}

#[derive(Clone)]
struct PassState {
    env: Arc<Environment>,
    tree: Arc<dyn Tree>,
    mode: Mode,
    deadline: Instant,
    tasks: Arc<TaskSet<Result<()>>>,
    streams: Option<Arc<TaskSet<String>>>,
    units: Arc<PendingUnits>,
    waiters: Arc<Mutex<IndexMap<String, Waiter>>>,
    next_async_id: Arc<AtomicU64>,
}

/// One render or attach pass over one tree. Cloning shares the pass.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PassState>,
}

impl Pipeline {
    pub(crate) fn new(
        env: Arc<Environment>,
        tree: Arc<dyn Tree>,
        mode: Mode,
        streams: Option<Arc<TaskSet<String>>>,
    ) -> Self {
        let deadline = Instant::now() + env.options().timeout();
        Self {
            inner: Arc::new(PassState {
                env,
                tree,
                mode,
                deadline,
                tasks: Arc::new(TaskSet::new()),
                streams,
                units: Arc::new(PendingUnits::default()),
                waiters: Arc::new(Mutex::new(IndexMap::new())),
                next_async_id: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    /// The same pass with a task set of its own, for rendering a subtree
    /// whose continuations are awaited separately.
    pub(crate) fn subpass(&self) -> Self {
        let mut state = (*self.inner).clone();
        state.tasks = Arc::new(TaskSet::new());
        Self {
            inner: Arc::new(state),
        }
    }

    /// The tree being processed.
    pub fn tree(&self) -> &Arc<dyn Tree> {
        &self.inner.tree
    }

    /// Server render or client attach.
    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    /// The engine's expression evaluator.
    pub fn evaluator(&self) -> &Arc<dyn Evaluator> {
        self.inner.env.evaluator()
    }

    /// Services directives can depend on.
    pub fn services(&self) -> &ServiceRegistry {
        self.inner.env.services()
    }

    pub(crate) fn env(&self) -> &Arc<Environment> {
        &self.inner.env
    }

    pub(crate) fn tasks(&self) -> &Arc<TaskSet<Result<()>>> {
        &self.inner.tasks
    }

    pub(crate) fn streams(&self) -> Option<&Arc<TaskSet<String>>> {
        self.inner.streams.as_ref()
    }

    pub(crate) fn units(&self) -> &Arc<PendingUnits> {
        &self.inner.units
    }

    pub(crate) fn waiters(&self) -> &Arc<Mutex<IndexMap<String, Waiter>>> {
        &self.inner.waiters
    }

    pub(crate) fn next_async_id(&self) -> String {
        let id = self.inner.next_async_id.fetch_add(1, Ordering::Relaxed);
        format!("async-{id}")
    }

    /// Time left in the pass budget, `None` once it is spent.
    pub(crate) fn remaining_budget(&self) -> Option<Duration> {
        let remaining = self.inner.deadline.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Await every queued continuation.
    pub(crate) async fn drain(&self) -> Result<()> {
        self.inner.tasks.drain().await
    }

    fn state_of(&self, node: NodeId) -> Option<Arc<NodeState>> {
        self.tree().aux(node)?.downcast::<NodeState>().ok()
    }

    /// Whether `node` has been through this pass.
    pub fn is_processed(&self, node: NodeId) -> bool {
        self.state_of(node).is_some()
    }

    /// Mark `node` processed so discovery skips it.
    pub fn mark_processed(&self, node: NodeId, frame: &Frame) {
        match self.state_of(node) {
            Some(state) => *state.frame.lock() = frame.clone(),
            None => self.tree().set_aux(
                node,
                Arc::new(NodeState {
                    frame: Mutex::new(frame.clone()),
                }),
            ),
        }
    }

    /// The frame a processed node runs with.
    pub fn frame_of(&self, node: NodeId) -> Option<Frame> {
        self.state_of(node).map(|state| state.frame.lock().clone())
    }

    /// Run the pipeline on `node` and, unless it is detached, its subtree.
    pub fn process(&self, node: NodeId, frame: &Frame) -> Result<()> {
        let tree = self.tree();
        match tree.kind(node) {
            Some(NodeKind::Fragment) => return self.process_children(node, frame),
            Some(NodeKind::Element) => {}
            _ => return Ok(()),
        }
        if self.is_processed(node) {
            return Ok(());
        }

        let tag = tree.tag(node).unwrap_or_default();
        let attributes = tree.attributes(node);
        let matched = self.inner.env.registry().discover(&tag, &attributes);

        // Marked before anything runs so re-entrant processing skips it.
        self.mark_processed(node, frame);
        let frame = self.enter_scope(node, frame, &attributes, &matched)?;
        self.mark_processed(node, &frame);

        let parent = tree.parent(node);
        self.run_from(node, frame, Arc::new(matched), 0, parent)
    }

    /// Process each current child of `node`. Templates are inert.
    pub fn process_children(&self, node: NodeId, frame: &Frame) -> Result<()> {
        if self.tree().tag(node).as_deref() == Some("template") {
            return Ok(());
        }
        for child in self.tree().children(node) {
            self.process(child, frame)?;
        }
        Ok(())
    }

    fn enter_scope(
        &self,
        node: NodeId,
        frame: &Frame,
        attributes: &[(String, String)],
        matched: &[Matched],
    ) -> Result<Frame> {
        let data_attribute = &self.inner.env.registry().config().data_attribute;
        if let Some((_, init)) = attributes.iter().find(|(name, _)| name == data_attribute) {
            let locals = if init.trim().is_empty() {
                Map::new()
            } else {
                let value = untrack(|| evaluate_in(self.evaluator().as_ref(), init, frame.scope()))?;
                match value {
                    Value::Object(map) => map,
                    Value::Null => Map::new(),
                    other => {
                        return Err(EngineError::Directive {
                            directive: data_attribute.clone(),
                            node,
                            cause: format!("scope initializer must be an object, got {other}"),
                        })
                    }
                }
            };
            return Ok(frame.with_scope(frame.scope().child(locals)));
        }

        if matched.iter().any(|m| m.directive.wants_own_scope()) {
            return Ok(frame.with_scope(frame.scope().isolated()));
        }
        Ok(frame.clone())
    }

    fn is_detached(&self, node: NodeId, parent: Option<NodeId>) -> bool {
        !self.tree().contains(node) || self.tree().parent(node) != parent
    }

    /// Run matches from `start` on, then bindings and children.
    pub(crate) fn run_from(
        &self,
        node: NodeId,
        mut frame: Frame,
        matched: Arc<Vec<Matched>>,
        start: usize,
        parent: Option<NodeId>,
    ) -> Result<()> {
        if start > 0 && self.is_detached(node, parent) {
            tracing::debug!(node = %node, "node detached while suspended");
            return Ok(());
        }

        for index in start..matched.len() {
            match self.invoke(node, &mut frame, &matched[index])? {
                Step::Continue => {}
                Step::Detached => return Ok(()),
                Step::Settle(pending) => {
                    let pipeline = self.clone();
                    let matched = matched.clone();
                    self.inner.tasks.push(Box::pin(async move {
                        let frame = pending.await?;
                        pipeline.mark_processed(node, &frame);
                        pipeline.run_from(node, frame, matched, index + 1, parent)
                    }));
                    return Ok(());
                }
                Step::Wait(id) => {
                    self.mark_processed(node, &frame);
                    self.inner.waiters.lock().insert(
                        id,
                        Waiter {
                            node,
                            frame,
                            matched,
                            index,
                            parent,
                        },
                    );
                    return Ok(());
                }
            }
            if self.is_detached(node, parent) {
                tracing::debug!(
                    node = %node,
                    directive = matched[index].directive.name(),
                    "node detached, skipping the rest"
                );
                return Ok(());
            }
        }

        self.mark_processed(node, &frame);
        self.apply_bindings(node, &frame)?;
        self.process_children(node, &frame)
    }

    fn invoke(&self, node: NodeId, frame: &mut Frame, matched: &Matched) -> Result<Step> {
        let directive = matched.directive.clone();
        tracing::debug!(directive = directive.name(), node = %node, "running directive");

        for (name, value) in directive.provided() {
            frame.providers = frame.providers.with(name.clone(), value.clone());
        }
        let deps = Resolved::resolve(self, node, frame, matched)?;

        if directive.async_options().is_some() {
            return lifecycle::begin(self, node, frame, matched, deps);
        }

        if let Some(template) = directive.template_markup() {
            self.render_template(node, template)?;
        }
        Ok(match self.run_behavior(node, frame, matched, deps)? {
            Outcome::Continue => Step::Continue,
            Outcome::Detached => Step::Detached,
        })
    }

    /// Put a directive template into `node`. On the client, content that is
    /// already there is the rendered template and is kept.
    pub(crate) fn render_template(&self, node: NodeId, template: &str) -> Result<()> {
        if self.mode() == Mode::Client && !self.tree().children(node).is_empty() {
            return Ok(());
        }
        self.tree().set_inner_markup(node, template)
    }

    pub(crate) fn run_behavior(
        &self,
        node: NodeId,
        frame: &mut Frame,
        matched: &Matched,
        deps: Resolved,
    ) -> Result<Outcome> {
        let Some(behavior) = matched.directive.behavior_fn().cloned() else {
            return Ok(Outcome::Continue);
        };
        let mut invocation = Invocation {
            pipeline: self,
            node,
            frame,
            matched,
            deps,
        };
        behavior(&mut invocation)
    }

    fn apply_bindings(&self, node: NodeId, frame: &Frame) -> Result<()> {
        let prefix = self.inner.env.registry().config().bind_prefix.clone();
        for (attribute, expression) in self.tree().attributes(node) {
            let Some(target) = attribute.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if target.is_empty() {
                continue;
            }

            let tree = self.tree().clone();
            let evaluator = self.evaluator().clone();
            let scope = frame.scope().clone();
            let target = target.to_string();
            watch(frame.effects(), &attribute, node, move || {
                let value = evaluate_in(evaluator.as_ref(), &expression, &scope)?;
                match value {
                    Value::Null | Value::Bool(false) => tree.remove_attribute(node, &target),
                    Value::Bool(true) => tree.set_attribute(node, &target, ""),
                    other => tree.set_attribute(node, &target, &to_text(&other)),
                }
                Ok(())
            })?;
        }
        Ok(())
    }
}

/// Run `f` as an effect in `effects`.
///
/// An error from the first run is returned and the effect is stopped.
/// Later runs have no caller to report to, so their errors are logged.
pub(crate) fn watch<F>(effects: &EffectScope, label: &str, node: NodeId, f: F) -> Result<Effect>
where
    F: Fn() -> Result<()> + Send + Sync + 'static,
{
    let first_error: Arc<Mutex<Option<EngineError>>> = Arc::new(Mutex::new(None));
    let started = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let label_owned = label.to_string();

    let slot = first_error.clone();
    let effect = effects.effect(move || {
        if let Err(err) = f() {
            if started.load(Ordering::Acquire) {
                tracing::error!(directive = %label_owned, node = %node, error = %err, "effect failed");
            } else {
                *slot.lock() = Some(err);
            }
        }
        started.store(true, Ordering::Release);
    });

    let failure = first_error.lock().take();
    match failure {
        Some(err) => {
            effect.stop();
            Err(err)
        }
        None => Ok(effect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::{Directive, DirectiveClass, DirectiveRegistry};
    use crate::engine::Environment;
    use crate::reactive::Store;
    use crate::tree::Document;
    use serde_json::json;

    fn pass(registry: DirectiveRegistry, markup: &str) -> (Document, Pipeline) {
        let document = Document::parse(markup).unwrap();
        let env = Arc::new(Environment::new(registry));
        let pipeline = Pipeline::new(env, Arc::new(document.clone()), Mode::Server, None);
        (document, pipeline)
    }

    fn recorder(name: &str, log: Arc<Mutex<Vec<String>>>) -> Directive {
        let label = name.to_string();
        Directive::new(name).behavior(move |_| {
            log.lock().push(label.clone());
            Ok(Outcome::Continue)
        })
    }

    #[test]
    fn structural_directives_run_before_plain_ones() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = DirectiveRegistry::new();
        registry
            .register(recorder("plain", log.clone()).priority(100))
            .unwrap();
        registry
            .register(recorder("gate", log.clone()).class(DirectiveClass::Conditional))
            .unwrap();

        let (document, pipeline) = pass(registry, r#"<div x-plain x-gate></div>"#);
        let frame = Frame::new(Scope::root(Store::new(json!({}))));
        pipeline.process(document.root(), &frame).unwrap();

        assert_eq!(*log.lock(), vec!["gate".to_string(), "plain".to_string()]);
    }

    #[test]
    fn processed_nodes_are_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = DirectiveRegistry::new();
        registry.register(recorder("mark", log.clone())).unwrap();

        let (document, pipeline) = pass(registry, r#"<p x-mark></p><p x-mark></p>"#);
        let frame = Frame::new(Scope::root(Store::new(json!({}))));
        pipeline.process(document.root(), &frame).unwrap();
        pipeline.process(document.root(), &frame).unwrap();

        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn detaching_stops_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = DirectiveRegistry::new();
        registry
            .register(
                Directive::new("drop")
                    .priority(10)
                    .behavior(|inv| {
                        inv.tree().remove(inv.node());
                        Ok(Outcome::Continue)
                    }),
            )
            .unwrap();
        registry.register(recorder("after", log.clone())).unwrap();

        let (document, pipeline) =
            pass(registry, r#"<div x-drop x-after><span x-after></span></div>"#);
        let frame = Frame::new(Scope::root(Store::new(json!({}))));
        pipeline.process(document.root(), &frame).unwrap();

        assert!(log.lock().is_empty());
        assert_eq!(document.to_markup(), "");
    }

    #[test]
    fn scope_initializer_creates_child_scope() {
        let (document, pipeline) = pass(
            DirectiveRegistry::with_builtins(),
            r#"<div x-data="{&quot;name&quot;: &quot;local&quot;}"><b x-text="name"></b></div><i x-text="name"></i>"#,
        );
        let frame = Frame::new(Scope::root(Store::new(json!({ "name": "root" }))));
        pipeline.process(document.root(), &frame).unwrap();

        assert!(document.to_markup().contains("<b x-text=\"name\">local</b>"));
        assert!(document.to_markup().contains("<i x-text=\"name\">root</i>"));
    }

    #[test]
    fn bindings_follow_state() {
        let store = Store::new(json!({ "active": true, "kind": "wide" }));
        let (document, pipeline) = pass(
            DirectiveRegistry::new(),
            r#"<div :hidden="active" :class="kind"></div>"#,
        );
        let frame = Frame::new(Scope::root(store.clone()));
        pipeline.process(document.root(), &frame).unwrap();
        assert_eq!(
            document.to_markup(),
            r#"<div :hidden="active" :class="kind" hidden class="wide"></div>"#
        );

        store.root().set("active", json!(false));
        assert!(!document.to_markup().contains(" hidden"));
    }

    #[test]
    fn unresolved_dependency_aborts() {
        let mut registry = DirectiveRegistry::new();
        registry
            .register(
                Directive::new("needy")
                    .depends_on("missing")
                    .behavior(|_| Ok(Outcome::Continue)),
            )
            .unwrap();
        let (document, pipeline) = pass(registry, r#"<div x-needy></div>"#);
        let frame = Frame::new(Scope::root(Store::new(json!({}))));

        assert!(matches!(
            pipeline.process(document.root(), &frame),
            Err(EngineError::UnresolvedDependency { .. })
        ));
    }

    #[test]
    fn provided_values_reach_descendants() {
        let seen = Arc::new(Mutex::new(None));
        let mut registry = DirectiveRegistry::new();
        registry
            .register(
                Directive::new("theme")
                    .provide("theme", json!("dark"))
                    .behavior(|_| Ok(Outcome::Continue)),
            )
            .unwrap();
        let sink = seen.clone();
        registry
            .register(Directive::new("themed").depends_on("theme").behavior(move |inv| {
                *sink.lock() = inv.deps().value("theme").cloned();
                Ok(Outcome::Continue)
            }))
            .unwrap();

        let (document, pipeline) = pass(registry, r#"<section x-theme><p x-themed></p></section>"#);
        let frame = Frame::new(Scope::root(Store::new(json!({}))));
        pipeline.process(document.root(), &frame).unwrap();

        assert_eq!(*seen.lock(), Some(json!("dark")));
    }
}
