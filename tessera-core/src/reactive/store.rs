//! Reactive Store
//!
//! A `Store` wraps a plain `serde_json::Value` record. Reads made through a
//! `Tracked` handle while an effect is running subscribe that effect to the
//! path read; writes notify exactly the effects subscribed to the written
//! path.
//!
//! # Paths and granularity
//!
//! Handles are created lazily: `root().get("user").get("name")` walks the
//! record one key at a time without cloning anything. Each step registers an
//! *exact* subscription on the path it reached. Taking a snapshot with
//! `value()` registers a *deep* subscription, because the caller now depends
//! on everything below that path.
//!
//! A write at path `P` notifies:
//!
//! - exact subscribers of `P` and of every path below `P` (the old subtree
//!   was replaced),
//! - deep subscribers of `P` and of every path above `P` (their snapshot
//!   contains `P`).
//!
//! Writing a value structurally equal to the current one notifies nobody.
//! Array operations report the indices they touch plus `length`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use smallvec::SmallVec;

use super::context::ReactiveContext;
use super::effect::EffectCore;
use super::subscriber::SubscriberId;

/// A path from the root of a store to a nested value.
pub type Path = SmallVec<[String; 4]>;

/// Pseudo-key tracked by `len()` and written by array operations.
pub const LENGTH_KEY: &str = "length";

/// How many `Null` slots an index write past the end of an array may add.
pub const MAX_ARRAY_PADDING: usize = 1024;

static STORE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Track {
    Exact,
    Deep,
}

/// A subscription recorded by an effect so it can be dropped later.
pub(crate) struct Dependency {
    store: Weak<StoreInner>,
    path: Path,
    track: Track,
}

impl Dependency {
    pub(crate) fn release(self, subscriber: SubscriberId) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(&self.path, self.track, subscriber);
        }
    }
}

type Subscribers = IndexMap<SubscriberId, Weak<EffectCore>>;

#[derive(Default)]
struct Subscriptions {
    exact: IndexMap<Path, Subscribers>,
    deep: IndexMap<Path, Subscribers>,
}

impl Subscriptions {
    fn table(&mut self, track: Track) -> &mut IndexMap<Path, Subscribers> {
        match track {
            Track::Exact => &mut self.exact,
            Track::Deep => &mut self.deep,
        }
    }

    fn affected_by(&self, written: &Path, into: &mut Subscribers) {
        for (path, subscribers) in &self.exact {
            if path.starts_with(written) {
                extend(into, subscribers);
            }
        }
        for depth in 0..=written.len() {
            if let Some(subscribers) = self.deep.get(&written[..depth]) {
                extend(into, subscribers);
            }
        }
    }
}

fn extend(into: &mut Subscribers, from: &Subscribers) {
    for (id, weak) in from {
        into.entry(*id).or_insert_with(|| weak.clone());
    }
}

pub(crate) struct StoreInner {
    id: u64,
    data: RwLock<Value>,
    subscriptions: Mutex<Subscriptions>,
}

impl StoreInner {
    fn track(self: &Arc<Self>, path: Path, track: Track) {
        let Some(effect) = ReactiveContext::current() else {
            return;
        };

        let fresh = self
            .subscriptions
            .lock()
            .table(track)
            .entry(path.clone())
            .or_default()
            .insert(effect.id(), Arc::downgrade(&effect))
            .is_none();

        if fresh {
            effect.record(Dependency {
                store: Arc::downgrade(self),
                path,
                track,
            });
        }
    }

    fn unsubscribe(&self, path: &Path, track: Track, subscriber: SubscriberId) {
        let mut subscriptions = self.subscriptions.lock();
        let table = subscriptions.table(track);
        if let Some(subscribers) = table.get_mut(path) {
            subscribers.shift_remove(&subscriber);
            if subscribers.is_empty() {
                table.shift_remove(path);
            }
        }
    }

    fn notify(&self, written: &[Path]) {
        if written.is_empty() {
            return;
        }

        let targets = {
            let subscriptions = self.subscriptions.lock();
            let mut targets = Subscribers::new();
            for path in written {
                subscriptions.affected_by(path, &mut targets);
            }
            targets
        };

        // The lock is released before running anything: effects read and
        // subscribe again while they run.
        for (_, weak) in targets {
            if let Some(effect) = weak.upgrade() {
                effect.notify();
            }
        }
    }

    fn subscription_count(&self) -> usize {
        let subscriptions = self.subscriptions.lock();
        subscriptions.exact.values().map(IndexMap::len).sum::<usize>()
            + subscriptions.deep.values().map(IndexMap::len).sum::<usize>()
    }
}

/// A reactive record.
///
/// Cloning a store yields another handle to the same record.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Wrap a plain value.
    pub fn new(value: Value) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                id: STORE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                data: RwLock::new(value),
                subscriptions: Mutex::new(Subscriptions::default()),
            }),
        }
    }

    /// Get the store's unique ID.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// A handle on the whole record.
    pub fn root(&self) -> Tracked {
        Tracked {
            store: self.clone(),
            path: Path::new(),
        }
    }

    /// Copy of the whole record, without tracking.
    pub fn snapshot(&self) -> Value {
        self.inner.data.read().clone()
    }

    /// Number of live subscriptions across all paths.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscription_count()
    }

    fn write<F>(&self, parent: &Path, apply: F)
    where
        F: FnOnce(&mut Value) -> Vec<Path>,
    {
        let written = {
            let mut data = self.inner.data.write();
            match lookup_mut(&mut data, parent) {
                Some(target) => apply(target),
                None => {
                    tracing::debug!(store = self.inner.id, path = ?parent, "write below a missing path ignored");
                    Vec::new()
                }
            }
        };
        self.inner.notify(&written);
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.inner.id)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

/// A lazily created view of one path inside a store.
#[derive(Clone)]
pub struct Tracked {
    store: Store,
    path: Path,
}

impl Tracked {
    /// The store this handle points into.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The path from the store root.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    fn child_path(&self, key: &str) -> Path {
        let mut path = self.path.clone();
        path.push(key.to_string());
        path
    }

    /// Step into `key`, tracking the step.
    pub fn get(&self, key: &str) -> Tracked {
        let path = self.child_path(key);
        self.store.inner.track(path.clone(), Track::Exact);
        Tracked {
            store: self.store.clone(),
            path,
        }
    }

    /// Step into an array index.
    pub fn at(&self, index: usize) -> Tracked {
        self.get(&index.to_string())
    }

    /// Whether `key` exists here. Tracked, so a later definition notifies.
    pub fn contains(&self, key: &str) -> bool {
        self.store.inner.track(self.child_path(key), Track::Exact);
        let data = self.store.inner.data.read();
        match lookup(&data, &self.path) {
            Some(Value::Object(map)) => map.contains_key(key),
            Some(Value::Array(items)) => key.parse::<usize>().is_ok_and(|i| i < items.len()),
            _ => false,
        }
    }

    /// Snapshot of the value here (`Null` when missing), tracked deeply.
    pub fn value(&self) -> Value {
        self.store.inner.track(self.path.clone(), Track::Deep);
        self.peek()
    }

    /// Snapshot without tracking.
    pub fn peek(&self) -> Value {
        let data = self.store.inner.data.read();
        lookup(&data, &self.path).cloned().unwrap_or(Value::Null)
    }

    /// Element count of an array or object, tracked on `length`.
    pub fn len(&self) -> usize {
        self.store.inner.track(self.child_path(LENGTH_KEY), Track::Exact);
        let data = self.store.inner.data.read();
        match lookup(&data, &self.path) {
            Some(Value::Array(items)) => items.len(),
            Some(Value::Object(map)) => map.len(),
            _ => 0,
        }
    }

    /// Whether `len()` is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write `key` below this path.
    ///
    /// Writing an array index past the end pads with `Null`. Indices more
    /// than [`MAX_ARRAY_PADDING`] past the end are ignored.
    pub fn set(&self, key: &str, value: Value) {
        let base = self.path.clone();
        let key = key.to_string();
        self.store.write(&self.path, move |target| match target {
            Value::Object(map) => {
                if map.get(&key) == Some(&value) {
                    return Vec::new();
                }
                let added = map.insert(key.clone(), value).is_none();
                let mut written = vec![join(&base, &key)];
                if added {
                    written.push(join(&base, LENGTH_KEY));
                }
                written
            }
            Value::Array(items) => {
                let Ok(index) = key.parse::<usize>() else {
                    return Vec::new();
                };
                if items.get(index) == Some(&value) {
                    return Vec::new();
                }
                let old_len = items.len();
                if index.saturating_sub(old_len) > MAX_ARRAY_PADDING {
                    tracing::warn!(index, len = old_len, "array index too far past the end, write ignored");
                    return Vec::new();
                }
                if index >= old_len {
                    items.resize(index + 1, Value::Null);
                }
                items[index] = value;
                let mut written = vec![join(&base, &key)];
                if index >= old_len {
                    written.extend((old_len..index).map(|i| join(&base, &i.to_string())));
                    written.push(join(&base, LENGTH_KEY));
                }
                written
            }
            _ => Vec::new(),
        });
    }

    /// Replace the value at this path.
    pub fn replace(&self, value: Value) {
        match self.path.split_last() {
            Some((key, parent)) => Tracked {
                store: self.store.clone(),
                path: parent.iter().cloned().collect(),
            }
            .set(key, value),
            None => {
                let changed = {
                    let mut data = self.store.inner.data.write();
                    if *data == value {
                        false
                    } else {
                        *data = value;
                        true
                    }
                };
                if changed {
                    self.store.inner.notify(&[Path::new()]);
                }
            }
        }
    }

    /// Delete `key`. Readers are notified exactly as for a write.
    pub fn remove(&self, key: &str) {
        if let Ok(index) = key.parse::<usize>() {
            if matches!(self.peek(), Value::Array(_)) {
                self.splice(index, 1, Vec::new());
                return;
            }
        }

        let base = self.path.clone();
        let key = key.to_string();
        self.store.write(&self.path, move |target| match target {
            Value::Object(map) => {
                if map.remove(&key).is_some() {
                    vec![join(&base, &key), join(&base, LENGTH_KEY)]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        });
    }

    /// Append to the array at this path.
    pub fn push(&self, value: Value) {
        let base = self.path.clone();
        self.store.write(&self.path, move |target| match target {
            Value::Array(items) => {
                items.push(value);
                let index = items.len() - 1;
                vec![join(&base, &index.to_string()), join(&base, LENGTH_KEY)]
            }
            _ => Vec::new(),
        });
    }

    /// Remove `delete` items at `start` and insert `insert` in their place.
    ///
    /// Returns the removed items.
    pub fn splice(&self, start: usize, delete: usize, insert: Vec<Value>) -> Vec<Value> {
        let base = self.path.clone();
        let mut removed = Vec::new();
        let removed_ref = &mut removed;
        self.store.write(&self.path, move |target| {
            let Value::Array(items) = target else {
                return Vec::new();
            };
            let start = start.min(items.len());
            let end = start.saturating_add(delete).min(items.len());
            if start == end && insert.is_empty() {
                return Vec::new();
            }
            let old_len = items.len();
            *removed_ref = items.splice(start..end, insert).collect();
            let new_len = items.len();

            let mut written: Vec<Path> = (start..old_len.max(new_len))
                .map(|i| join(&base, &i.to_string()))
                .collect();
            if old_len != new_len {
                written.push(join(&base, LENGTH_KEY));
            }
            written
        });
        removed
    }
}

impl std::fmt::Debug for Tracked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracked")
            .field("store", &self.store.id())
            .field("path", &self.path)
            .finish()
    }
}

fn join(base: &Path, key: &str) -> Path {
    let mut path = base.clone();
    path.push(key.to_string());
    path
}

fn lookup<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |value, key| match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn lookup_mut<'a>(root: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    path.iter().try_fold(root, |value, key| match value {
        Value::Object(map) => map.get_mut(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
