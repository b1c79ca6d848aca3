//! Render and attach entry points.
//!
//! An [`Engine`] bundles everything a pass needs (directives, services, the
//! expression evaluator and render options) into one immutable
//! [`Environment`]. Engines are cheap to clone and independent of each
//! other, so several can render concurrently with different registries.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use tessera_core::Engine;
//!
//! # tokio_test_block(async {
//! let engine = Engine::builder().build();
//! let html = engine
//!     .render(r#"<p x-text="greeting"></p>"#, json!({ "greeting": "hello" }))
//!     .await
//!     .unwrap();
//! assert_eq!(html, r#"<p x-text="greeting">hello</p>"#);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

use std::any::Any;
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tracing::Instrument;

use crate::config::RenderOptions;
use crate::directive::{DirectiveRegistry, ServiceRegistry};
use crate::error::Result;
use crate::expr::{Evaluator, PathEvaluator};
use crate::lifecycle::{Hydration, StreamPass};
use crate::pipeline::{Frame, Mode, Pipeline, TaskSet};
use crate::reactive::Store;
use crate::scope::Scope;
use crate::tree::{Document, Tree};

/// Everything a pass reads and never changes.
pub struct Environment {
    registry: DirectiveRegistry,
    services: ServiceRegistry,
    evaluator: Arc<dyn Evaluator>,
    options: RenderOptions,
}

impl Environment {
    /// An environment with the default evaluator, no services and default
    /// options.
    pub fn new(registry: DirectiveRegistry) -> Self {
        Self {
            registry,
            services: ServiceRegistry::new(),
            evaluator: Arc::new(PathEvaluator),
            options: RenderOptions::default(),
        }
    }

    /// Registered directives.
    pub fn registry(&self) -> &DirectiveRegistry {
        &self.registry
    }

    /// Registered services.
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Expression evaluator used by every pass.
    pub fn evaluator(&self) -> &Arc<dyn Evaluator> {
        &self.evaluator
    }

    /// Server render options.
    pub fn options(&self) -> &RenderOptions {
        &self.options
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("directives", &self.registry.len())
            .field("services", &self.services)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    registry: Option<DirectiveRegistry>,
    services: ServiceRegistry,
    evaluator: Option<Arc<dyn Evaluator>>,
    options: RenderOptions,
}

impl EngineBuilder {
    /// Directives to use. Defaults to the built-ins.
    pub fn registry(mut self, registry: DirectiveRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Register a service directives can depend on.
    pub fn service<T: Any + Send + Sync>(mut self, name: impl Into<String>, service: T) -> Self {
        self.services.insert(name, service);
        self
    }

    /// Expression evaluator. Defaults to [`PathEvaluator`].
    pub fn evaluator(mut self, evaluator: impl Evaluator + 'static) -> Self {
        self.evaluator = Some(Arc::new(evaluator));
        self
    }

    /// Server render options. Defaults to [`RenderOptions::default`].
    pub fn options(mut self, options: RenderOptions) -> Self {
        self.options = options;
        self
    }

    /// Freeze the settings into an [`Engine`].
    pub fn build(self) -> Engine {
        Engine {
            env: Arc::new(Environment {
                registry: self.registry.unwrap_or_else(DirectiveRegistry::with_builtins),
                services: self.services,
                evaluator: self.evaluator.unwrap_or_else(|| Arc::new(PathEvaluator)),
                options: self.options,
            }),
        }
    }
}

/// Renders markup on the server and attaches to it on the client.
#[derive(Debug, Clone)]
pub struct Engine {
    env: Arc<Environment>,
}

impl Engine {
    /// Start configuring an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// An engine over `registry` with every other setting at its default.
    pub fn new(registry: DirectiveRegistry) -> Self {
        Self::builder().registry(registry).build()
    }

    /// Settings shared by every pass of this engine.
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Render `markup` against `state`, awaiting every block-and-render
    /// directive. Streaming directives are deferred to the client.
    pub async fn render(&self, markup: &str, state: Value) -> Result<String> {
        let options = self.env.options();
        let span = tracing::info_span!(
            "render",
            mode = "server",
            max_depth = options.max_depth,
            timeout_ms = options.timeout_ms
        );

        async move {
            let document = Document::parse(markup)?;
            let pipeline = Pipeline::new(
                self.env.clone(),
                Arc::new(document.clone()),
                Mode::Server,
                None,
            );
            let frame = Frame::new(Scope::root(Store::new(state)));

            let result = match pipeline.process(document.root(), &frame) {
                Ok(()) => pipeline.drain().await,
                Err(err) => Err(err),
            };
            frame.effects().stop();
            result?;

            tracing::debug!(nodes = document.node_count(), "render finished");
            Ok(document.to_markup())
        }
        .instrument(span)
        .await
    }

    /// Render `markup` as a stream of chunks: the document first, then one
    /// replacement unit per streaming directive as each one settles.
    pub fn render_stream(&self, markup: &str, state: Value) -> BoxStream<'static, Result<String>> {
        enum Phase {
            Start(Arc<Environment>, String, Value),
            Units(StreamPass),
            Done,
        }

        let start = Phase::Start(self.env.clone(), markup.to_string(), state);
        stream::unfold(start, |phase| async move {
            match phase {
                Phase::Start(env, markup, state) => {
                    let span = tracing::info_span!(
                        "render_stream",
                        mode = "server",
                        max_depth = env.options().max_depth,
                        timeout_ms = env.options().timeout_ms
                    );
                    match open_stream(env, &markup, state).instrument(span).await {
                        Ok((initial, pass)) => Some((Ok(initial), Phase::Units(pass))),
                        Err(err) => Some((Err(err), Phase::Done)),
                    }
                }
                Phase::Units(mut pass) => pass
                    .next_unit()
                    .await
                    .map(|unit| (Ok(unit), Phase::Units(pass))),
                Phase::Done => None,
            }
        })
        .boxed()
    }

    /// Attach to an already rendered document, keeping it in sync with
    /// `state` from now on.
    pub fn attach(&self, document: &Document, state: &Store) -> Result<Hydration> {
        self.attach_tree(Arc::new(document.clone()), state)
    }

    /// [`attach`](Self::attach) for any [`Tree`].
    pub fn attach_tree(&self, tree: Arc<dyn Tree>, state: &Store) -> Result<Hydration> {
        let span = tracing::info_span!("attach", mode = "client");
        let _entered = span.enter();

        let root = tree.root();
        let pipeline = Pipeline::new(self.env.clone(), tree, Mode::Client, None);
        let frame = Frame::new(Scope::root(state.clone()));
        if let Err(err) = pipeline.process(root, &frame) {
            frame.effects().stop();
            return Err(err);
        }

        let hydration = Hydration::new(pipeline, frame);
        tracing::debug!(waiting = hydration.pending_streams(), "attached");
        Ok(hydration)
    }
}

async fn open_stream(env: Arc<Environment>, markup: &str, state: Value) -> Result<(String, StreamPass)> {
    let document = Document::parse(markup)?;
    let streams = Arc::new(TaskSet::new());
    let pipeline = Pipeline::new(
        env,
        Arc::new(document.clone()),
        Mode::Server,
        Some(streams.clone()),
    );
    let frame = Frame::new(Scope::root(Store::new(state)));
    let mut pass = StreamPass::new(pipeline.clone(), streams, frame.effects().clone());

    let settled = match pipeline.process(document.root(), &frame) {
        Ok(()) => pass.settle_main().await,
        Err(err) => Err(err),
    };
    if let Err(err) = settled {
        frame.effects().stop();
        return Err(err);
    }
    Ok((document.to_markup(), pass))
}

/// Render with the default evaluator and no services.
pub async fn render(
    markup: &str,
    state: Value,
    registry: DirectiveRegistry,
    options: RenderOptions,
) -> Result<String> {
    Engine::builder()
        .registry(registry)
        .options(options)
        .build()
        .render(markup, state)
        .await
}

/// Streaming render with the default evaluator and no services.
pub fn render_stream(
    markup: &str,
    state: Value,
    registry: DirectiveRegistry,
    options: RenderOptions,
) -> BoxStream<'static, Result<String>> {
    Engine::builder()
        .registry(registry)
        .options(options)
        .build()
        .render_stream(markup, state)
}

/// Attach with the default evaluator and no services.
pub fn attach(document: &Document, state: &Store, registry: DirectiveRegistry) -> Result<Hydration> {
    Engine::new(registry).attach(document, state)
}
