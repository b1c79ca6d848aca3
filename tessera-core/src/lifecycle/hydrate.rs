//! Client-side attach handle.

use parking_lot::Mutex;

use super::stream::{parse_units, ReplacementUnit};
use super::{finish, rebind, AsyncState, Waiter, ASYNC_ID_ATTR, ASYNC_STATE_ATTR};
use crate::directive::Resolved;
use crate::error::Result;
use crate::pipeline::{Frame, Pipeline};
use crate::scope::Scope;
use crate::tree::NodeId;

/// A live attach pass.
///
/// Effects created during attach keep the tree in sync with the store until
/// [`stop`](Hydration::stop) is called. Work started by state changes (a
/// `for` rendering a new item with an async directive in it, say) is queued
/// on the pass; [`settle`](Hydration::settle) awaits it.
pub struct Hydration {
    pipeline: Pipeline,
    frame: Frame,
    held: Mutex<Vec<ReplacementUnit>>,
}

impl Hydration {
    pub(crate) fn new(pipeline: Pipeline, frame: Frame) -> Self {
        Self {
            pipeline,
            frame,
            held: Mutex::new(Vec::new()),
        }
    }

    /// Await outstanding async work.
    pub async fn settle(&self) -> Result<()> {
        self.pipeline.drain().await
    }

    /// Apply a chunk of replacement units from a streamed render.
    ///
    /// Units whose target is not attached yet are held and retried after
    /// every later chunk, so out-of-order delivery is fine.
    pub async fn apply_chunk(&self, chunk: &str) -> Result<()> {
        let units = parse_units(chunk)?;
        self.held.lock().extend(units);

        loop {
            let ready = self.take_ready();
            if ready.is_empty() {
                return self.settle().await;
            }
            for (waiter, unit) in ready {
                self.resume(waiter, unit)?;
            }
            self.settle().await?;
        }
    }

    fn take_ready(&self) -> Vec<(Waiter, ReplacementUnit)> {
        let mut held = self.held.lock();
        let mut waiters = self.pipeline.waiters().lock();
        let mut ready = Vec::new();
        let mut kept = Vec::new();
        for unit in held.drain(..) {
            match waiters.shift_remove(&unit.id) {
                Some(waiter) => ready.push((waiter, unit)),
                None => kept.push(unit),
            }
        }
        *held = kept;
        ready
    }

    fn resume(&self, waiter: Waiter, unit: ReplacementUnit) -> Result<()> {
        let Waiter {
            node,
            frame,
            matched,
            index,
            parent,
        } = waiter;
        let tree = self.pipeline.tree();
        if !tree.contains(node) {
            tracing::debug!(id = %unit.id, "streamed target is gone");
            return Ok(());
        }
        let current = &matched[index];
        let Some(options) = current.directive.async_options().cloned() else {
            return Ok(());
        };

        tree.remove_attribute(node, ASYNC_ID_ATTR);
        let deps = Resolved::resolve(&self.pipeline, node, &frame, current)?;
        let pending = match unit.state {
            None => {
                tracing::debug!(id = %unit.id, node = %node, "applying streamed content");
                tree.set_inner_markup(node, &unit.content)?;
                tree.set_attribute(node, ASYNC_STATE_ATTR, AsyncState::Loaded.as_str());
                rebind(&self.pipeline, node, frame, current, options, deps)?
            }
            Some(state) => {
                tracing::debug!(id = %unit.id, node = %node, %state, "server gave up, completing locally");
                tree.set_attribute(node, ASYNC_STATE_ATTR, state.as_str());
                finish(&self.pipeline, node, frame, current, options, deps)?
            }
        };

        let pipeline = self.pipeline.clone();
        self.pipeline.tasks().push(Box::pin(async move {
            let frame = pending.await?;
            pipeline.mark_processed(node, &frame);
            pipeline.run_from(node, frame, matched, index + 1, parent)
        }));
        Ok(())
    }

    /// Nodes still waiting for streamed content.
    pub fn pending_streams(&self) -> usize {
        self.pipeline.waiters().lock().len()
    }

    /// Units received before their target was attached.
    pub fn held_units(&self) -> usize {
        self.held.lock().len()
    }

    /// The pass driving this attach.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The root scope.
    pub fn scope(&self) -> &Scope {
        self.frame.scope()
    }

    /// The frame `node` was processed with.
    pub fn frame_of(&self, node: NodeId) -> Option<Frame> {
        self.pipeline.frame_of(node)
    }

    /// Stop every effect created by this attach.
    pub fn stop(&self) {
        self.frame.effects().stop();
    }
}
