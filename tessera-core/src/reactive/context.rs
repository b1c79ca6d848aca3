//! Reactive Context
//!
//! The reactive context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a store path is read,
//! we can register the current computation as a subscriber of that path.
//!
//! # Implementation
//!
//! We use a thread-local stack to track the currently executing computation.
//! When an effect runs, we push it onto the stack. When it completes, we pop
//! it. An entry without an observer suspends tracking, which is how
//! `untrack` lets a structural directive process a subtree from inside an
//! effect without adopting the subtree's reads.

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use super::effect::EffectCore;
use super::SubscriberId;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the reactive context stack.
#[derive(Clone)]
struct ContextEntry {
    /// The computation collecting reads, or `None` while untracked.
    observer: Option<Weak<EffectCore>>,
}

/// Guard that pops the context when dropped.
///
/// This keeps the stack balanced even if the computation panics.
pub struct ReactiveContext {
    subscriber_id: Option<SubscriberId>,
}

impl ReactiveContext {
    /// Enter a tracking context for the given effect.
    pub(crate) fn enter(effect: &Arc<EffectCore>) -> Self {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry {
                observer: Some(Arc::downgrade(effect)),
            });
        });

        Self {
            subscriber_id: Some(effect.id()),
        }
    }

    /// Enter a context in which reads are not tracked.
    pub fn suspend() -> Self {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry { observer: None });
        });

        Self {
            subscriber_id: None,
        }
    }

    /// Check if reads are currently being tracked.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .map(|entry| entry.observer.is_some())
                .unwrap_or(false)
        })
    }

    /// Get the current subscriber ID, if any.
    pub fn current_subscriber() -> Option<SubscriberId> {
        Self::current().map(|effect| effect.id())
    }

    /// The effect that should receive reads right now.
    pub(crate) fn current() -> Option<Arc<EffectCore>> {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .and_then(|entry| entry.observer.as_ref())
                .and_then(Weak::upgrade)
        })
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            // Catch mismatched enter/exit pairs in debug builds.
            if let Some(entry) = popped {
                let popped_id = entry
                    .observer
                    .as_ref()
                    .and_then(Weak::upgrade)
                    .map(|effect| effect.id());
                debug_assert!(
                    popped_id.is_none() || popped_id == self.subscriber_id,
                    "ReactiveContext mismatch: expected {:?}, got {:?}",
                    self.subscriber_id,
                    popped_id
                );
            }
        });
    }
}

/// Run `f` without tracking any reads it performs.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    let _ctx = ReactiveContext::suspend();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Effect;

    #[test]
    fn context_is_inactive_by_default() {
        assert!(!ReactiveContext::is_active());
        assert!(ReactiveContext::current_subscriber().is_none());
    }

    #[test]
    fn effect_run_is_tracked() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen_clone = seen.clone();

        let effect = Effect::new(move || {
            *seen_clone.lock() = ReactiveContext::current_subscriber();
        });

        assert_eq!(*seen.lock(), Some(effect.id()));
        assert!(!ReactiveContext::is_active());
    }

    #[test]
    fn untrack_suspends_inside_effect() {
        let inner_active = Arc::new(parking_lot::Mutex::new(true));
        let inner_clone = inner_active.clone();

        let _effect = Effect::new(move || {
            assert!(ReactiveContext::is_active());
            *inner_clone.lock() = untrack(ReactiveContext::is_active);
            assert!(ReactiveContext::is_active());
        });

        assert!(!*inner_active.lock());
    }
}
