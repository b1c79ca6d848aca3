//! Render-then-stream.
//!
//! A streamed directive renders its fallback in the initial output and gets
//! an id. Its load keeps going after the initial chunk is sent; once it
//! settles, the content is rendered into a detached container and emitted
//! as a replacement unit:
//!
//! ```text
//! <template data-async-for="async-0">...content...</template>
//! ```
//!
//! A unit whose load failed carries `data-async-state` (`pending`, or
//! `timeout` when the per-unit limit was hit) and no content, which tells
//! the client to finish the work itself.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::stream::StreamExt;
use futures_util::FutureExt;
use serde_json::{Map, Value};

use super::{defer, input, AsyncState, ASYNC_FOR_ATTR, ASYNC_ID_ATTR, ASYNC_STATE_ATTR};
use crate::directive::{AsyncOptions, Matched, Resolved};
use crate::error::{AsyncFailure, EngineError, Result};
use crate::pipeline::{Frame, Pipeline, Running, TaskSet};
use crate::reactive::EffectScope;
use crate::tree::{escape_attribute, Document, NodeId, Tree};

/// Where a streamed unit stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Streaming,
    Resolved,
    Failed,
    TimedOut,
}

/// Streamed units of one pass, by id.
#[derive(Debug, Default)]
pub(crate) struct PendingUnits {
    units: DashMap<String, UnitState>,
}

impl PendingUnits {
    pub(crate) fn register(&self, id: &str) {
        self.units.insert(id.to_string(), UnitState::Streaming);
    }

    pub(crate) fn settle(&self, id: &str, state: UnitState) {
        if let Some(mut unit) = self.units.get_mut(id) {
            *unit = state;
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self, id: &str) -> Option<UnitState> {
        self.units.get(id).map(|unit| *unit)
    }

    /// Units whose replacement has not been produced yet.
    pub(crate) fn outstanding(&self) -> usize {
        self.units
            .iter()
            .filter(|unit| *unit.value() == UnitState::Streaming)
            .count()
    }
}

/// A parsed replacement unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementUnit {
    /// Id of the node it targets.
    pub id: String,
    /// Set on failure units.
    pub state: Option<AsyncState>,
    /// Replacement content, empty on failure units.
    pub content: String,
}

/// A unit carrying rendered content for `id`.
pub fn replacement_unit(id: &str, content: &str) -> String {
    format!(
        r#"<template {ASYNC_FOR_ATTR}="{}">{content}</template>"#,
        escape_attribute(id)
    )
}

/// A unit telling the client to complete `id` itself.
pub fn failure_unit(id: &str, state: AsyncState) -> String {
    format!(
        r#"<template {ASYNC_FOR_ATTR}="{}" {ASYNC_STATE_ATTR}="{}"></template>"#,
        escape_attribute(id),
        state.as_str()
    )
}

/// Every replacement unit in a chunk, in order.
pub fn parse_units(chunk: &str) -> Result<Vec<ReplacementUnit>> {
    let document = Document::parse(chunk)?;
    let mut units = Vec::new();
    for template in document.elements_by_tag("template") {
        let Some(id) = document.attribute(template, ASYNC_FOR_ATTR) else {
            continue;
        };
        let state = document
            .attribute(template, ASYNC_STATE_ATTR)
            .map(|marker| marker.parse::<AsyncState>())
            .transpose()?;
        units.push(ReplacementUnit {
            id,
            state,
            content: document.inner_markup(template),
        });
    }
    if units.is_empty() {
        return Err(EngineError::Markup {
            offset: 0,
            cause: "chunk holds no replacement unit".to_string(),
        });
    }
    Ok(units)
}

/// Register a streamed unit for `node` and queue its load.
pub(crate) fn start(
    pipeline: &Pipeline,
    streams: Arc<TaskSet<String>>,
    node: NodeId,
    frame: &Frame,
    matched: &Matched,
    options: AsyncOptions,
    deps: Resolved,
) -> Result<()> {
    defer(pipeline, node, &options, AsyncState::Streaming)?;
    let id = pipeline.next_async_id();
    pipeline.tree().set_attribute(node, ASYNC_ID_ATTR, &id);
    pipeline.units().register(&id);
    tracing::debug!(directive = matched.directive.name(), node = %node, id = %id, "streaming");

    let load = (options.load)(input(pipeline, node, frame, matched, deps.clone())?);
    streams.push(
        unit(
            pipeline.clone(),
            id,
            node,
            matched.clone(),
            frame.clone(),
            options,
            load,
            deps,
        )
        .boxed(),
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn unit(
    pipeline: Pipeline,
    id: String,
    node: NodeId,
    matched: Matched,
    frame: Frame,
    options: AsyncOptions,
    load: BoxFuture<'static, std::result::Result<Value, AsyncFailure>>,
    deps: Resolved,
) -> String {
    let loaded = match pipeline.env().options().stream_timeout() {
        Some(limit) => tokio::time::timeout(limit, load).await.ok(),
        None => Some(load.await),
    };
    let directive = matched.directive.name().to_string();

    match loaded {
        Some(Ok(value)) => match render(&pipeline, node, &matched, &frame, &options, value, deps).await {
            Ok(content) => {
                pipeline.units().settle(&id, UnitState::Resolved);
                replacement_unit(&id, &content)
            }
            Err(err) => {
                tracing::warn!(directive = %directive, id = %id, error = %err, "streamed render failed");
                pipeline.units().settle(&id, UnitState::Failed);
                failure_unit(&id, AsyncState::Pending)
            }
        },
        Some(Err(failure)) => {
            if failure.is_fallback_signal() {
                tracing::debug!(directive = %directive, id = %id, "fallback requested");
            } else {
                tracing::warn!(directive = %directive, id = %id, %failure, "streamed load failed");
            }
            pipeline.units().settle(&id, UnitState::Failed);
            failure_unit(&id, AsyncState::Pending)
        }
        None => {
            tracing::warn!(directive = %directive, id = %id, "streamed load timed out");
            pipeline.units().settle(&id, UnitState::TimedOut);
            failure_unit(&id, AsyncState::Timeout)
        }
    }
}

/// Render the template for a loaded value into a detached container and
/// return its content.
async fn render(
    pipeline: &Pipeline,
    node: NodeId,
    matched: &Matched,
    frame: &Frame,
    options: &AsyncOptions,
    value: Value,
    deps: Resolved,
) -> Result<String> {
    let tree = pipeline.tree().clone();
    let tag = tree.tag(node).unwrap_or_else(|| "div".to_string());
    let container = tree.create_element(&tag);
    let mut frame = frame.nested(Map::new());
    let effects: EffectScope = frame.effects().clone();

    let rendered = async {
        let subpass = pipeline.subpass();
        tree.set_inner_markup(container, matched.directive.template_markup().unwrap_or_default())?;
        frame.scope().define(&options.bind_as, value);
        subpass.run_behavior(container, &mut frame, matched, deps)?;
        subpass.process_children(container, &frame)?;
        subpass.drain().await?;
        Ok::<_, EngineError>(tree.inner_markup(container))
    }
    .await;

    effects.stop();
    tree.remove(container);
    rendered
}

/// Drives a streaming pass: the main pass first, streamed units alongside
/// it and after it.
pub(crate) struct StreamPass {
    pipeline: Pipeline,
    streams: Arc<TaskSet<String>>,
    running: Running<String>,
    buffered: VecDeque<String>,
    effects: EffectScope,
}

impl StreamPass {
    pub(crate) fn new(pipeline: Pipeline, streams: Arc<TaskSet<String>>, effects: EffectScope) -> Self {
        Self {
            pipeline,
            streams,
            running: Running::new(),
            buffered: VecDeque::new(),
            effects,
        }
    }

    /// Await the main pass. Units that finish meanwhile are buffered.
    pub(crate) async fn settle_main(&mut self) -> Result<()> {
        let tasks = self.pipeline.tasks().clone();
        let Self {
            streams,
            running,
            buffered,
            ..
        } = self;
        let mut main = Running::new();

        loop {
            tasks.absorb(&mut main);
            streams.absorb(running);
            if main.is_empty() {
                return Ok(());
            }
            tokio::select! {
                biased;
                Some(result) = main.next() => result?,
                Some(chunk) = running.next(), if !running.is_empty() => buffered.push_back(chunk),
                _ = tasks.queued() => {}
                _ = streams.queued() => {}
            }
        }
    }

    /// The next replacement unit, or `None` once every unit was emitted.
    pub(crate) async fn next_unit(&mut self) -> Option<String> {
        if let Some(chunk) = self.buffered.pop_front() {
            return Some(chunk);
        }
        let chunk = self.streams.next(&mut self.running).await;
        if chunk.is_none() {
            tracing::debug!(outstanding = self.pipeline.units().outstanding(), "stream finished");
            self.effects.stop();
        }
        chunk
    }
}

impl Drop for StreamPass {
    /// A consumer that stops reading before the last unit still releases
    /// the pass: stopping its effects drops everything they hold, and units
    /// still queued on the pipeline are moved here to be dropped with it.
    fn drop(&mut self) {
        self.effects.stop();
        self.streams.absorb(&mut self.running);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_parse_back() {
        let chunk = format!(
            "{}{}",
            replacement_unit("async-0", "<p>done</p>"),
            failure_unit("async-1", AsyncState::Timeout)
        );
        let units = parse_units(&chunk).unwrap();
        assert_eq!(
            units,
            vec![
                ReplacementUnit {
                    id: "async-0".into(),
                    state: None,
                    content: "<p>done</p>".into(),
                },
                ReplacementUnit {
                    id: "async-1".into(),
                    state: Some(AsyncState::Timeout),
                    content: String::new(),
                },
            ]
        );
    }

    #[test]
    fn chunk_without_units_is_rejected() {
        assert!(parse_units("<p>plain</p>").is_err());
        assert!(parse_units(r#"<template data-async-for="a" data-async-state="nope"></template>"#).is_err());
    }

    #[test]
    fn pending_units_track_state() {
        let units = PendingUnits::default();
        units.register("async-0");
        units.register("async-1");
        assert_eq!(units.outstanding(), 2);

        units.settle("async-0", UnitState::Resolved);
        units.settle("unknown", UnitState::Failed);
        assert_eq!(units.state("async-0"), Some(UnitState::Resolved));
        assert_eq!(units.state("unknown"), None);
        assert_eq!(units.outstanding(), 1);
    }
}
