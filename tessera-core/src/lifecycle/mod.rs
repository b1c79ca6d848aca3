//! Async Directive Lifecycle
//!
//! Directives with an async initialization and fallback markup go through
//! here instead of running their behavior directly.
//!
//! # Server
//!
//! | strategy | what happens                                       | marker      |
//! |----------|----------------------------------------------------|-------------|
//! | block    | await the load, render the template                | `loaded`    |
//! | block    | load failed or asked for the fallback              | `pending`   |
//! | block    | nesting too deep, pass budget spent, or timed out  | `timeout`   |
//! | skip     | fallback only, the load never runs                 | `pending`   |
//! | stream   | fallback now, replacement unit later               | `streaming` |
//!
//! Only block-and-render counts toward `max_depth` and the pass budget. A
//! streaming directive rendered without a stream to write to is treated as
//! skip.
//!
//! # Client
//!
//! The marker the server left decides how attach resumes a node:
//! `loaded` runs the load again for its side effects and keeps the content,
//! `pending`/`timeout` (or no marker) run the load and swap in the template,
//! marking `error` if it fails, and `streaming` suspends the node until the
//! replacement unit carrying its `data-async-id` is applied. Lower-priority
//! directives, bindings and children only run on the replaced content.

mod hydrate;
mod stream;

pub use hydrate::Hydration;
pub use stream::{failure_unit, parse_units, replacement_unit, ReplacementUnit, UnitState};

pub(crate) use stream::{PendingUnits, StreamPass};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use crate::directive::{AsyncInput, AsyncOptions, Matched, Resolved, SsrStrategy};
use crate::error::{AsyncFailure, EngineError, Result};
use crate::expr::evaluate_in;
use crate::pipeline::{Frame, Mode, Pipeline, Step};
use crate::reactive::untrack;
use crate::tree::NodeId;

/// Attribute carrying the async state of a node.
pub const ASYNC_STATE_ATTR: &str = "data-async-state";

/// Attribute carrying the id a streamed replacement targets.
pub const ASYNC_ID_ATTR: &str = "data-async-id";

/// Attribute of a replacement unit naming its target.
pub const ASYNC_FOR_ATTR: &str = "data-async-for";

/// Marker values of [`ASYNC_STATE_ATTR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsyncState {
    Loaded,
    Pending,
    Streaming,
    Timeout,
    /// Only set on the client, after a failed completion.
    Error,
}

impl AsyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AsyncState::Loaded => "loaded",
            AsyncState::Pending => "pending",
            AsyncState::Streaming => "streaming",
            AsyncState::Timeout => "timeout",
            AsyncState::Error => "error",
        }
    }
}

impl fmt::Display for AsyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AsyncState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "loaded" => Ok(AsyncState::Loaded),
            "pending" => Ok(AsyncState::Pending),
            "streaming" => Ok(AsyncState::Streaming),
            "timeout" => Ok(AsyncState::Timeout),
            "error" => Ok(AsyncState::Error),
            other => Err(EngineError::Markup {
                offset: 0,
                cause: format!("unknown async state `{other}`"),
            }),
        }
    }
}

/// A client node suspended at a streaming directive until its replacement
/// unit arrives.
#[derive(Clone)]
pub(crate) struct Waiter {
    pub(crate) node: NodeId,
    pub(crate) frame: Frame,
    /// Every match on the node, in execution order.
    pub(crate) matched: Arc<Vec<Matched>>,
    /// Position of the streaming directive in `matched`.
    pub(crate) index: usize,
    pub(crate) parent: Option<NodeId>,
}

/// Entry point from the pipeline for a directive with async options.
pub(crate) fn begin(
    pipeline: &Pipeline,
    node: NodeId,
    frame: &mut Frame,
    matched: &Matched,
    deps: Resolved,
) -> Result<Step> {
    let Some(options) = matched.directive.async_options().cloned() else {
        return Ok(Step::Continue);
    };
    match pipeline.mode() {
        Mode::Server => server(pipeline, node, frame, matched, options, deps),
        Mode::Client => client(pipeline, node, frame, matched, options, deps),
    }
}

pub(crate) fn input(
    pipeline: &Pipeline,
    node: NodeId,
    frame: &Frame,
    matched: &Matched,
    deps: Resolved,
) -> Result<AsyncInput> {
    let value = if matched.expression.trim().is_empty() {
        Value::Null
    } else {
        untrack(|| evaluate_in(pipeline.evaluator().as_ref(), &matched.expression, frame.scope()))?
    };
    Ok(AsyncInput {
        node,
        expression: matched.expression.clone(),
        value,
        deps,
    })
}

/// Show the fallback and leave a marker.
pub(crate) fn defer(
    pipeline: &Pipeline,
    node: NodeId,
    options: &AsyncOptions,
    state: AsyncState,
) -> Result<()> {
    let tree = pipeline.tree();
    tree.set_inner_markup(node, options.fallback.as_deref().unwrap_or_default())?;
    tree.set_attribute(node, ASYNC_STATE_ATTR, state.as_str());
    Ok(())
}

/// Render the loaded result: template in, marker `loaded`, value bound,
/// behavior run.
pub(crate) fn complete(
    pipeline: &Pipeline,
    node: NodeId,
    frame: &mut Frame,
    matched: &Matched,
    options: &AsyncOptions,
    value: Value,
    deps: Resolved,
) -> Result<()> {
    let tree = pipeline.tree();
    tree.set_inner_markup(node, matched.directive.template_markup().unwrap_or_default())?;
    tree.set_attribute(node, ASYNC_STATE_ATTR, AsyncState::Loaded.as_str());
    frame.scope().define(&options.bind_as, value);
    pipeline.run_behavior(node, frame, matched, deps)?;
    Ok(())
}

fn server(
    pipeline: &Pipeline,
    node: NodeId,
    frame: &mut Frame,
    matched: &Matched,
    options: AsyncOptions,
    deps: Resolved,
) -> Result<Step> {
    let directive = matched.directive.name();
    match options.strategy {
        SsrStrategy::Skip => {
            defer(pipeline, node, &options, AsyncState::Pending)?;
            Ok(Step::Continue)
        }
        SsrStrategy::Stream => match pipeline.streams().cloned() {
            Some(streams) => {
                stream::start(pipeline, streams, node, frame, matched, options, deps)?;
                Ok(Step::Continue)
            }
            None => {
                tracing::debug!(directive, node = %node, "no stream to write to, deferring to the client");
                defer(pipeline, node, &options, AsyncState::Pending)?;
                Ok(Step::Continue)
            }
        },
        SsrStrategy::Block => block(pipeline, node, frame, matched, options, deps),
    }
}

fn block(
    pipeline: &Pipeline,
    node: NodeId,
    frame: &mut Frame,
    matched: &Matched,
    options: AsyncOptions,
    deps: Resolved,
) -> Result<Step> {
    let directive = matched.directive.name().to_string();
    let depth = frame.async_depth + 1;
    let max_depth = pipeline.env().options().max_depth;
    if depth > max_depth {
        tracing::warn!(directive = %directive, node = %node, depth, max_depth, "async nesting too deep, rendering fallback");
        defer(pipeline, node, &options, AsyncState::Timeout)?;
        return Ok(Step::Continue);
    }
    let Some(remaining) = pipeline.remaining_budget() else {
        tracing::warn!(directive = %directive, node = %node, "render budget spent, rendering fallback");
        defer(pipeline, node, &options, AsyncState::Timeout)?;
        return Ok(Step::Continue);
    };

    let load = (options.load)(input(pipeline, node, frame, matched, deps.clone())?);
    let pipeline = pipeline.clone();
    let matched = matched.clone();
    let mut frame = frame.clone();

    Ok(Step::Settle(
        async move {
            match tokio::time::timeout(remaining, load).await {
                Ok(Ok(value)) => {
                    frame.async_depth = depth;
                    complete(&pipeline, node, &mut frame, &matched, &options, value, deps)?;
                }
                Ok(Err(AsyncFailure::UseFallback)) => {
                    tracing::debug!(directive = %directive, node = %node, "fallback requested");
                    defer(&pipeline, node, &options, AsyncState::Pending)?;
                }
                Ok(Err(AsyncFailure::Failed(cause))) => {
                    tracing::warn!(directive = %directive, node = %node, %cause, "async load failed, rendering fallback");
                    defer(&pipeline, node, &options, AsyncState::Pending)?;
                }
                Err(_) => {
                    tracing::warn!(directive = %directive, node = %node, ?remaining, "async load timed out, rendering fallback");
                    defer(&pipeline, node, &options, AsyncState::Timeout)?;
                }
            }
            Ok::<_, EngineError>(frame)
        }
        .boxed(),
    ))
}

fn client(
    pipeline: &Pipeline,
    node: NodeId,
    frame: &mut Frame,
    matched: &Matched,
    options: AsyncOptions,
    deps: Resolved,
) -> Result<Step> {
    let tree = pipeline.tree();
    let state = tree
        .attribute(node, ASYNC_STATE_ATTR)
        .and_then(|marker| marker.parse::<AsyncState>().ok());

    match state {
        Some(AsyncState::Loaded) => Ok(Step::Settle(rebind(
            pipeline, node, frame.clone(), matched, options, deps,
        )?)),
        Some(AsyncState::Streaming) => match tree.attribute(node, ASYNC_ID_ATTR) {
            Some(id) => {
                tracing::debug!(node = %node, id = %id, "waiting for streamed content");
                Ok(Step::Wait(id))
            }
            None => {
                tracing::warn!(node = %node, "streaming node without an id, completing locally");
                Ok(Step::Settle(finish(pipeline, node, frame.clone(), matched, options, deps)?))
            }
        },
        _ => {
            if tree.children(node).is_empty() {
                tree.set_inner_markup(node, options.fallback.as_deref().unwrap_or_default())?;
            }
            Ok(Step::Settle(finish(pipeline, node, frame.clone(), matched, options, deps)?))
        }
    }
}

/// Client `loaded` path: run the load for its side effects and bind the
/// result, without touching the rendered content.
pub(crate) fn rebind(
    pipeline: &Pipeline,
    node: NodeId,
    mut frame: Frame,
    matched: &Matched,
    options: AsyncOptions,
    deps: Resolved,
) -> Result<BoxFuture<'static, Result<Frame>>> {
    let load = (options.load)(input(pipeline, node, &frame, matched, deps.clone())?);
    let pipeline = pipeline.clone();
    let matched = matched.clone();
    Ok(async move {
        match load.await {
            Ok(value) => {
                frame.scope().define(&options.bind_as, value);
                pipeline.run_behavior(node, &mut frame, &matched, deps)?;
            }
            Err(failure) => {
                tracing::warn!(
                    directive = matched.directive.name(),
                    node = %node,
                    %failure,
                    "async load failed on attach, keeping rendered content"
                );
            }
        }
        Ok::<_, EngineError>(frame)
    }
    .boxed())
}

/// Client completion of work the server did not finish.
pub(crate) fn finish(
    pipeline: &Pipeline,
    node: NodeId,
    mut frame: Frame,
    matched: &Matched,
    options: AsyncOptions,
    deps: Resolved,
) -> Result<BoxFuture<'static, Result<Frame>>> {
    let load = (options.load)(input(pipeline, node, &frame, matched, deps.clone())?);
    let pipeline = pipeline.clone();
    let matched = matched.clone();
    Ok(async move {
        match load.await {
            Ok(value) => complete(&pipeline, node, &mut frame, &matched, &options, value, deps)?,
            Err(AsyncFailure::UseFallback) => {
                tracing::debug!(directive = matched.directive.name(), node = %node, "fallback kept");
            }
            Err(AsyncFailure::Failed(cause)) => {
                tracing::warn!(directive = matched.directive.name(), node = %node, %cause, "async load failed");
                pipeline
                    .tree()
                    .set_attribute(node, ASYNC_STATE_ATTR, AsyncState::Error.as_str());
            }
        }
        Ok::<_, EngineError>(frame)
    }
    .boxed())
}
