//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever the store
//! paths it read change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately to establish
//!    initial dependencies.
//!
//! 2. When any dependency changes, the store re-runs the effect
//!    synchronously.
//!
//! 3. Before re-running, the effect unregisters every dependency from its
//!    previous run and tracks new ones during execution. Dependency sets
//!    therefore always describe the most recent execution path, which keeps
//!    conditional reads precise.
//!
//! # Self-triggering
//!
//! An effect that writes a path it read is notified while still running.
//! Instead of recursing, the notification sets a flag and the effect runs
//! once more after the current run returns. The loop is bounded by
//! `MAX_SELF_RERUNS`.
//!
//! # Effect Scopes
//!
//! An `EffectScope` owns a batch of effects and nested scopes. Structural
//! directives give each rendered subtree its own scope and stop it before
//! re-rendering, which unregisters every effect of that subtree at once.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::context::ReactiveContext;
use super::store::Dependency;
use super::subscriber::SubscriberId;

/// How many times an effect may re-run itself because of its own writes.
pub const MAX_SELF_RERUNS: usize = 64;

/// Shared state of an effect. Stores hold weak references to it.
pub(crate) struct EffectCore {
    id: SubscriberId,
    run: Box<dyn Fn() + Send + Sync>,
    dependencies: Mutex<Vec<Dependency>>,
    stopped: AtomicBool,
    running: AtomicBool,
    rerun: AtomicBool,
    run_count: AtomicUsize,
}

impl EffectCore {
    pub(crate) fn id(&self) -> SubscriberId {
        self.id
    }

    /// Remember a dependency so it can be dropped before the next run.
    pub(crate) fn record(&self, dependency: Dependency) {
        self.dependencies.lock().push(dependency);
    }

    fn clear_dependencies(&self) {
        let stale = std::mem::take(&mut *self.dependencies.lock());
        for dependency in stale {
            dependency.release(self.id);
        }
    }

    /// Called by a store when a path this effect read was written.
    pub(crate) fn notify(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if self.running.load(Ordering::SeqCst) {
            self.rerun.store(true, Ordering::SeqCst);
            return;
        }
        tracing::trace!(effect = %self.id, "re-running effect");
        self.execute();
    }

    fn execute(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) || self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut passes = 0;
        loop {
            self.clear_dependencies();
            {
                let _ctx = ReactiveContext::enter(self);
                (self.run)();
            }
            self.run_count.fetch_add(1, Ordering::SeqCst);
            passes += 1;

            let again = self.rerun.swap(false, Ordering::SeqCst);
            if !again || self.stopped.load(Ordering::SeqCst) {
                break;
            }
            if passes > MAX_SELF_RERUNS {
                tracing::warn!(effect = %self.id, passes, "effect keeps re-triggering itself, giving up");
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.clear_dependencies();
        }
    }
}

/// A side-effecting computation that runs when its dependencies change.
///
/// # Example
///
/// ```rust,ignore
/// let store = Store::new(json!({ "count": 0 }));
/// let root = store.root();
///
/// let effect = Effect::new(move || {
///     println!("count is {}", root.get("count").value());
/// });
///
/// store.root().set("count", json!(5));  // Prints: "count is 5"
/// ```
#[derive(Clone)]
pub struct Effect {
    core: Arc<EffectCore>,
}

impl Effect {
    /// Create a new effect with the given function.
    ///
    /// The function runs immediately to establish initial dependencies.
    pub fn new<F>(run: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let effect = Self::new_lazy(run);
        effect.execute();
        effect
    }

    /// Create a new effect without running it immediately.
    pub fn new_lazy<F>(run: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            core: Arc::new(EffectCore {
                id: SubscriberId::new(),
                run: Box::new(run),
                dependencies: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
                running: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                run_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Get the subscriber ID of this effect.
    pub fn id(&self) -> SubscriberId {
        self.core.id
    }

    /// Run the effect function now, re-collecting dependencies.
    pub fn execute(&self) {
        self.core.execute();
    }

    /// Stop the effect and unregister it from every store it read.
    ///
    /// After stopping, the effect never runs again.
    pub fn stop(&self) {
        self.core.stop();
    }

    /// Check if the effect has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.core.stopped.load(Ordering::SeqCst)
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.core.run_count.load(Ordering::SeqCst)
    }

    /// Get the number of dependencies recorded by the last run.
    pub fn dependency_count(&self) -> usize {
        self.core.dependencies.lock().len()
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id())
            .field("run_count", &self.run_count())
            .field("dependency_count", &self.dependency_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Default)]
struct ScopeState {
    effects: Vec<Effect>,
    children: Vec<EffectScope>,
    stopped: bool,
}

/// An owned batch of effects that can be stopped atomically.
#[derive(Clone, Default)]
pub struct EffectScope {
    state: Arc<Mutex<ScopeState>>,
}

impl EffectScope {
    /// Create an empty, running scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an effect owned by this scope.
    ///
    /// In a stopped scope the effect is created stopped and never runs.
    pub fn effect<F>(&self, run: F) -> Effect
    where
        F: Fn() + Send + Sync + 'static,
    {
        let effect = Effect::new_lazy(run);
        {
            let mut state = self.state.lock();
            if state.stopped {
                effect.stop();
                return effect;
            }
            state.effects.push(effect.clone());
        }
        effect.execute();
        effect
    }

    /// Create a nested scope that is stopped together with this one.
    ///
    /// Nested scopes stopped on their own are released the next time a
    /// nested scope is created.
    pub fn child(&self) -> EffectScope {
        let child = EffectScope::new();
        let mut state = self.state.lock();
        if state.stopped {
            child.state.lock().stopped = true;
        } else {
            state.children.retain(|existing| !existing.is_stopped());
            state.children.push(child.clone());
        }
        child
    }

    /// Stop every effect and nested scope owned by this scope.
    pub fn stop(&self) {
        let (effects, children) = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            (
                std::mem::take(&mut state.effects),
                std::mem::take(&mut state.children),
            )
        };

        for effect in effects {
            effect.stop();
        }
        for child in children {
            child.stop();
        }
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Number of live effects directly owned by this scope.
    pub fn effect_count(&self) -> usize {
        self.state.lock().effects.len()
    }

    /// Number of nested scopes currently held by this scope.
    pub fn child_count(&self) -> usize {
        self.state.lock().children.len()
    }
}

impl std::fmt::Debug for EffectScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EffectScope")
            .field("effects", &state.effects.len())
            .field("children", &state.children.len())
            .field("stopped", &state.stopped)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn effect_runs_on_creation() {
        let run_count = Arc::new(AtomicI32::new(0));
        let run_count_clone = run_count.clone();

        let _effect = Effect::new(move || {
            run_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(run_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn effect_lazy_does_not_run_on_creation() {
        let run_count = Arc::new(AtomicI32::new(0));
        let run_count_clone = run_count.clone();

        let effect = Effect::new_lazy(move || {
            run_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(run_count.load(Ordering::SeqCst), 0);
        assert_eq!(effect.run_count(), 0);

        effect.execute();
        assert_eq!(run_count.load(Ordering::SeqCst), 1);
        assert_eq!(effect.run_count(), 1);
    }

    #[test]
    fn stopped_effect_does_not_run() {
        let run_count = Arc::new(AtomicI32::new(0));
        let run_count_clone = run_count.clone();

        let effect = Effect::new(move || {
            run_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        effect.stop();
        assert!(effect.is_stopped());

        effect.execute();
        assert_eq!(run_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scope_stops_all_owned_effects() {
        let scope = EffectScope::new();
        let nested = scope.child();

        let a = scope.effect(|| {});
        let b = nested.effect(|| {});
        assert_eq!(scope.effect_count(), 1);

        scope.stop();

        assert!(a.is_stopped());
        assert!(b.is_stopped());
        assert!(nested.is_stopped());
    }

    #[test]
    fn stopped_children_are_released() {
        let scope = EffectScope::new();
        for _ in 0..100 {
            let child = scope.child();
            child.effect(|| {});
            child.stop();
        }
        assert_eq!(scope.child_count(), 1);

        let live = scope.child();
        let grandchild = live.child();
        let _replacement = scope.child();
        assert_eq!(scope.child_count(), 2);

        scope.stop();
        assert!(live.is_stopped());
        assert!(grandchild.is_stopped());
    }

    #[test]
    fn effect_in_stopped_scope_never_runs() {
        let scope = EffectScope::new();
        scope.stop();

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let effect = scope.effect(move || ran_clone.store(true, Ordering::SeqCst));

        assert!(effect.is_stopped());
        assert!(!ran.load(Ordering::SeqCst));
    }
}
