//! Reactive Primitives
//!
//! This module implements the reactive core: stores, tracked handles,
//! effects and effect scopes.
//!
//! # Concepts
//!
//! ## Stores
//!
//! A Store wraps a plain record. Reading a path through a `Tracked` handle
//! while an effect runs registers that effect under the path; writing the
//! path re-runs exactly the effects registered under it.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change. Directives use effects to keep the tree in sync with
//! state.
//!
//! ## Effect Scopes
//!
//! An EffectScope owns a batch of effects. Stopping it unregisters the whole
//! batch synchronously; this is the only cancellation primitive.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local tracking context to automatically
//! detect dependencies. When a path is read, we check if there is an active
//! tracking context and, if so, register the dependency.

mod context;
mod effect;
mod store;
mod subscriber;

pub use context::{untrack, ReactiveContext};
pub use effect::{Effect, EffectScope, MAX_SELF_RERUNS};
pub use store::{Path, Store, Tracked, LENGTH_KEY, MAX_ARRAY_PADDING};
pub use subscriber::SubscriberId;
