//! Scope Chain
//!
//! A `Scope` is a layered lookup record: a local `Store` plus a link to the
//! parent scope. It gives nested nodes block-scoped variables:
//!
//! - reads check the local record first, then walk the parent chain, ending
//!   at the root state;
//! - writes to a name defined locally stay local;
//! - writes to a name defined only on an ancestor go to that ancestor, so
//!   every scope below it sees the new value;
//! - writes to a name defined nowhere define it locally.
//!
//! Local records are reactive stores of their own, so reading a loop
//! variable inside an effect is tracked the same way as reading root state.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::reactive::{Store, Tracked};

struct ScopeInner {
    locals: Store,
    parent: Option<Scope>,
    depth: usize,
}

/// A node in the scope chain. Cloning shares the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// The root scope over the application state.
    pub fn root(state: Store) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                locals: state,
                parent: None,
                depth: 0,
            }),
        }
    }

    /// A child scope with the given local variables.
    pub fn child(&self, locals: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                locals: Store::new(Value::Object(locals)),
                parent: Some(self.clone()),
                depth: self.inner.depth + 1,
            }),
        }
    }

    /// A child scope with no locals yet.
    pub fn isolated(&self) -> Self {
        self.child(Map::new())
    }

    /// The parent scope, if this is not the root.
    pub fn parent(&self) -> Option<&Scope> {
        self.inner.parent.as_ref()
    }

    /// The store holding this scope's own variables.
    pub fn locals(&self) -> &Store {
        &self.inner.locals
    }

    /// Distance from the root scope.
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    /// Whether two handles point at the same scope.
    pub fn ptr_eq(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn defines(&self, name: &str) -> bool {
        matches!(self.inner.locals.root().peek(), Value::Object(map) if map.contains_key(name))
    }

    /// Resolve `name` to a tracked handle in the nearest scope defining it.
    ///
    /// Each presence check is tracked, so defining a shadowing local later
    /// re-runs readers that fell through to an ancestor.
    pub fn lookup(&self, name: &str) -> Option<Tracked> {
        let mut current = Some(self);
        while let Some(scope) = current {
            let root = scope.inner.locals.root();
            if root.contains(name) {
                return Some(root.get(name));
            }
            current = scope.parent();
        }
        None
    }

    /// Value of `name`, `Null` when undefined.
    pub fn get(&self, name: &str) -> Value {
        self.lookup(name)
            .map(|tracked| tracked.value())
            .unwrap_or(Value::Null)
    }

    /// Whether any scope in the chain defines `name`. Not tracked.
    pub fn contains(&self, name: &str) -> bool {
        self.owner_of(name).is_some()
    }

    /// The nearest scope defining `name`. Not tracked.
    pub fn owner_of(&self, name: &str) -> Option<Scope> {
        let mut current = Some(self);
        while let Some(scope) = current {
            if scope.defines(name) {
                return Some(scope.clone());
            }
            current = scope.parent();
        }
        None
    }

    /// Assign `name`, writing through to the ancestor that defines it.
    pub fn set(&self, name: &str, value: Value) {
        let target = self.owner_of(name).unwrap_or_else(|| self.clone());
        target.inner.locals.root().set(name, value);
    }

    /// Define `name` on this scope, shadowing any ancestor.
    pub fn define(&self, name: &str, value: Value) {
        self.inner.locals.root().set(name, value);
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("depth", &self.inner.depth)
            .field("locals", &self.inner.locals.snapshot())
            .finish()
    }
}
