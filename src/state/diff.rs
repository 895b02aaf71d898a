//! DiffEngine — minimal leaf-level writes and deletes between two snapshots.
//!
//! Both snapshots are decomposed at the same depth cap, keyed by path, and
//! compared. Entries absent from the new snapshot become deletes; new or
//! changed entries become writes. The reserved `multiplayer` subtree never
//! appears in a diff.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use serde_json::Value;

use crate::state::path_ops::Leaf;
use crate::RESERVED_FIELD;

/// The result of diffing two snapshots: leaf writes and path deletes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDiff {
    pub writes: Vec<Leaf>,
    pub deletes: Vec<Vec<String>>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}

// ============================================================================
// Diff computation
// ============================================================================

/// Compute the diff between `prev` and `next` with paths capped at `max_len`
/// segments (`z_factor + 1`).
pub fn diff(prev: &Value, next: &Value, max_len: usize) -> StateDiff {
    DiffCache::new(usize::MAX).diff(prev, next, max_len)
}

/// Diff engine with a bounded memo of previous leaf hashes.
///
/// Repeated diffs against an evolving snapshot skip re-hashing unchanged
/// leaves from the previous run. Equal hashes are confirmed with structural
/// equality, so a collision can never suppress a real write.
pub struct DiffCache {
    hashes: HashMap<Vec<String>, u64>,
    capacity: usize,
}

impl DiffCache {
    /// Default bound on memoised leaf hashes.
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new(capacity: usize) -> Self {
        Self {
            hashes: HashMap::new(),
            capacity,
        }
    }

    pub fn diff(&mut self, prev: &Value, next: &Value, max_len: usize) -> StateDiff {
        let prev_leaves = indexed(prev, max_len);
        let next_leaves = indexed(next, max_len);

        let mut out = StateDiff::default();

        for path in prev_leaves.keys() {
            if !next_leaves.contains_key(path) {
                out.deletes.push(path.clone());
            }
        }

        if self.hashes.len() > self.capacity {
            self.hashes.clear();
        }

        let mut next_hashes = HashMap::with_capacity(next_leaves.len());
        for (path, value) in next_leaves {
            let next_hash = value_hash(value);
            let changed = match prev_leaves.get(&path) {
                None => true,
                Some(prev_value) => {
                    let prev_hash = self
                        .hashes
                        .get(&path)
                        .copied()
                        .unwrap_or_else(|| value_hash(prev_value));
                    // Equal hashes are confirmed structurally; maps compare
                    // order-independently, so insertion order is moot.
                    prev_hash != next_hash || **prev_value != *value
                }
            };
            if changed {
                out.writes.push(Leaf {
                    path: path.clone(),
                    value: value.clone(),
                });
            }
            next_hashes.insert(path, next_hash);
        }
        self.hashes = next_hashes;

        out
    }
}

/// Decompose and index a snapshot by path, dropping the reserved subtree.
/// Values are borrowed; only written leaves are cloned.
fn indexed(tree: &Value, max_len: usize) -> HashMap<Vec<String>, &Value> {
    let mut map = HashMap::new();
    let Some(root) = tree.as_object() else {
        return map;
    };
    for (field, value) in root {
        if field == RESERVED_FIELD {
            continue;
        }
        index_walk(value, vec![field.clone()], max_len, &mut map);
    }
    map
}

fn index_walk<'a>(
    value: &'a Value,
    path: Vec<String>,
    max_len: usize,
    out: &mut HashMap<Vec<String>, &'a Value>,
) {
    match value.as_object() {
        Some(map) if !map.is_empty() && path.len() < max_len => {
            for (key, child) in map {
                let mut child_path = path.clone();
                child_path.push(key.clone());
                index_walk(child, child_path, max_len, out);
            }
        }
        _ => {
            out.insert(path, value);
        }
    }
}

// ============================================================================
// Order-independent value hashing
// ============================================================================

/// Hash a JSON value with object keys visited in sorted order, so two maps
/// that differ only in insertion order hash identically.
pub(crate) fn value_hash(value: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_value(value, &mut hasher);
    hasher.finish()
}

fn hash_value(value: &Value, hasher: &mut DefaultHasher) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Number(n) => {
            2u8.hash(hasher);
            n.to_string().hash(hasher);
        }
        Value::String(s) => {
            3u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Array(items) => {
            4u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_value(item, hasher);
            }
        }
        Value::Object(map) => {
            5u8.hash(hasher);
            map.len().hash(hasher);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            for key in keys {
                key.hash(hasher);
                hash_value(&map[key], hasher);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
