//! Pure functions over JSON state trees: leaf extraction at a bounded depth,
//! set/delete by path, and cleanup of emptied intermediate objects.
//!
//! Arrays are always treated as leaves — the decomposition never descends
//! into them, so array elements cannot be addressed by storage keys.

use serde_json::{Map, Value};

/// A decomposed leaf: the path addressing it and the value stored there.
/// Values at maximum-length paths may themselves be whole subtrees.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub path: Vec<String>,
    pub value: Value,
}

// ============================================================================
// Leaf extraction
// ============================================================================

/// Decompose `tree` into leaves whose paths have at most `max_len` segments.
///
/// Depth-first over object entries. A node is emitted as a leaf when its path
/// has reached `max_len`, or when it is anything other than a non-empty
/// object (scalars, arrays, and empty objects all count as leaves). The
/// caller warrants acyclic input; `serde_json::Value` cannot express cycles.
pub fn extract_leaves(tree: &Value, max_len: usize) -> Vec<Leaf> {
    let mut leaves = Vec::new();
    let Some(root) = tree.as_object() else {
        return leaves;
    };
    for (field, value) in root {
        walk(value, vec![field.clone()], max_len, &mut leaves);
    }
    leaves
}

fn walk(value: &Value, path: Vec<String>, max_len: usize, out: &mut Vec<Leaf>) {
    match value.as_object() {
        Some(map) if !map.is_empty() && path.len() < max_len => {
            for (key, child) in map {
                let mut child_path = path.clone();
                child_path.push(key.clone());
                walk(child, child_path, max_len, out);
            }
        }
        _ => out.push(Leaf {
            path,
            value: value.clone(),
        }),
    }
}

// ============================================================================
// Set / get / delete by path
// ============================================================================

/// Set `value` at `path`, creating intermediate objects as needed.
///
/// Non-object intermediates (scalars, arrays) are replaced by fresh objects;
/// the decomposition never descends into arrays, so an array in the way is
/// overwritten rather than indexed into. No-op for an empty path.
pub fn set_value(draft: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = draft;
    for segment in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let map = cursor.as_object_mut().unwrap();
        cursor = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    cursor
        .as_object_mut()
        .unwrap()
        .insert(last.clone(), value);
}

/// Read the value at `path`, if present.
pub fn get_value<'a>(tree: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut cursor = tree;
    for segment in path {
        cursor = cursor.as_object()?.get(segment)?;
    }
    Some(cursor)
}

/// Remove the value at `path`. Returns whether anything was removed.
pub fn delete_value(draft: &mut Value, path: &[String]) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let mut cursor = draft;
    for segment in parents {
        match cursor.as_object_mut().and_then(|m| m.get_mut(segment)) {
            Some(child) => cursor = child,
            None => return false,
        }
    }
    cursor
        .as_object_mut()
        .map(|m| m.remove(last).is_some())
        .unwrap_or(false)
}

/// Walk up from the parent of `path`, removing intermediate objects that a
/// deletion left empty. The top level itself is preserved (an emptied
/// top-level field is removed, but the root object stays).
pub fn cleanup_empty_parents(draft: &mut Value, path: &[String]) {
    // Removing an emptied object can only empty its own parent, so walking
    // from the deepest ancestor upward sees every removable level.
    for depth in (1..path.len()).rev() {
        let ancestor = &path[..depth];
        let is_empty = matches!(
            get_value(draft, ancestor),
            Some(Value::Object(map)) if map.is_empty()
        );
        if !is_empty {
            break;
        }
        delete_value(draft, ancestor);
    }
}

// ============================================================================
// Tests
// ============================================================================
