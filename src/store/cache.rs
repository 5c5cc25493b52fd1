//! Concurrent cache of current values and bounded history.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use crate::core::data::{Sample, Value, VarId};
use crate::core::quality::Quality;

/// Maximum number of samples retained per variable.
pub const HISTORY_DEPTH: usize = 100;

#[derive(Debug)]
struct VarEntry {
    name: String,
    current: Option<Sample>,
    history: VecDeque<Sample>,
}

impl VarEntry {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            current: None,
            history: VecDeque::new(),
        }
    }
}

/// Thread-safe mapping `id → {current value, recent history, name}`.
///
/// A single `RwLock` guards the whole map: updates are serialized per id
/// (history order equals publication order), readers never observe torn
/// samples, and [`DataCache::snapshot_all`] is a consistent point-in-time
/// view. Sharded locking is an optimization left for when the snapshot
/// becomes the hot path.
pub struct DataCache {
    inner: RwLock<HashMap<VarId, VarEntry>>,
}

impl DataCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register `id` under `name` without recording a sample.
    ///
    /// Called when a configuration binds, so subscriptions can attach
    /// before the first poll completes. Re-registering an existing id
    /// reassigns its name.
    pub fn register(&self, id: VarId, name: &str) {
        let mut map = self.inner.write().expect("cache lock poisoned");
        map.entry(id)
            .and_modify(|e| {
                if e.name != name {
                    e.name = name.to_string();
                }
            })
            .or_insert_with(|| VarEntry::named(name));
    }

    /// Record a new sample for `id`, upserting the name.
    ///
    /// Appends to history (dropping the oldest entry past
    /// [`HISTORY_DEPTH`]) and replaces the current sample. O(1) amortized.
    pub fn update(&self, id: VarId, name: &str, value: Value, quality: Quality) {
        let sample = Sample::now(value, quality);

        let mut map = self.inner.write().expect("cache lock poisoned");
        let entry = map.entry(id).or_insert_with(|| VarEntry::named(name));

        if entry.name != name {
            entry.name = name.to_string();
        }
        entry.current = Some(sample.clone());
        entry.history.push_back(sample);
        if entry.history.len() > HISTORY_DEPTH {
            entry.history.pop_front();
        }

        tracing::debug!(id, name, quality = %quality, "cache updated");
    }

    /// Latest sample for `id`, if the variable has been sampled at all.
    pub fn current_of(&self, id: VarId) -> Option<Sample> {
        let map = self.inner.read().expect("cache lock poisoned");
        map.get(&id).and_then(|e| e.current.clone())
    }

    /// Up to `n` most recent samples for `id`, oldest first.
    ///
    /// Returns what exists when fewer than `n` samples are stored, and an
    /// empty vector for unknown ids.
    pub fn history_of(&self, id: VarId, n: usize) -> Vec<Sample> {
        let map = self.inner.read().expect("cache lock poisoned");
        match map.get(&id) {
            Some(entry) => {
                let take = n.min(entry.history.len());
                entry
                    .history
                    .iter()
                    .skip(entry.history.len() - take)
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        }
    }

    /// Consistent snapshot of every sampled variable in the compact wire
    /// form `{"<id>": {n, v, t, q}}`.
    ///
    /// Registered-but-never-sampled variables are omitted.
    pub fn snapshot_all(&self) -> serde_json::Value {
        let map = self.inner.read().expect("cache lock poisoned");
        let mut out = serde_json::Map::with_capacity(map.len());
        for (id, entry) in map.iter() {
            let Some(current) = &entry.current else {
                continue;
            };
            out.insert(
                id.to_string(),
                serde_json::json!({
                    "n": entry.name,
                    "v": current.value.to_json(),
                    "t": current.timestamp.timestamp_millis(),
                    "q": current.quality.as_str(),
                }),
            );
        }
        serde_json::Value::Object(out)
    }

    /// Name registered for `id`.
    pub fn name_of(&self, id: VarId) -> Option<String> {
        let map = self.inner.read().expect("cache lock poisoned");
        map.get(&id).map(|e| e.name.clone())
    }

    /// Check whether `id` is known (registered or sampled).
    pub fn exists(&self, id: VarId) -> bool {
        let map = self.inner.read().expect("cache lock poisoned");
        map.contains_key(&id)
    }

    /// Number of known variables.
    pub fn len(&self) -> usize {
        self.inner.read().expect("cache lock poisoned").len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DataCache {
    fn default() -> Self {
        Self::new()
    }
}
