//! ConflictResolver — three-way divergence detection and resolution.
//!
//! Compares the pre-disconnect snapshot, the freshly hydrated remote
//! snapshot, and the queued mutations. A top-level field conflicts iff the
//! remote moved while we were away (`stale ≠ remote`) and our pending value
//! differs from where it moved to (`pending ≠ remote`).

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::{Map, Value};
use tracing::warn;

use super::types::{Conflict, ConflictStrategy, Mutation, OnConflict, StatePatch};
use crate::state::path_ops::delete_value;
use crate::RESERVED_FIELD;

// ============================================================================
// Detection
// ============================================================================

/// Detect conflicts between the snapshots and the queued mutations.
///
/// Functional patches are resolved against `stale` (the state they were
/// written against). When several mutations touch one field, the last
/// pending value is the one reported.
pub fn detect(stale: &Value, remote: &Value, queue: &[Mutation]) -> Vec<Conflict> {
    let mut conflicts: Vec<Conflict> = Vec::new();

    let mut upsert = |field: &str, pending_value: Option<Value>| {
        let stale_value = stale.get(field).cloned();
        let remote_value = remote.get(field).cloned();
        if stale_value == remote_value || pending_value == remote_value {
            return;
        }
        match conflicts.iter_mut().find(|c| c.field == field) {
            Some(existing) => existing.pending_value = pending_value,
            None => conflicts.push(Conflict {
                field: field.to_string(),
                stale_value,
                remote_value,
                pending_value,
            }),
        }
    };

    for mutation in queue {
        let resolved = mutation.patch.resolve(stale);
        if let Some(partial) = resolved.as_object() {
            for (field, pending) in partial {
                if field == RESERVED_FIELD {
                    continue;
                }
                upsert(field, Some(pending.clone()));
            }
        }
        for path in mutation.patch.deletions() {
            let Some(field) = path.first() else {
                continue;
            };
            if field == RESERVED_FIELD {
                continue;
            }
            upsert(field, pending_after_delete(stale, path));
        }
    }

    conflicts
}

/// The value a top-level field would hold after applying a path deletion to
/// the stale snapshot. A top-level deletion pends `None`.
fn pending_after_delete(stale: &Value, path: &[String]) -> Option<Value> {
    if path.len() == 1 {
        return None;
    }
    let mut field_value = stale.get(&path[0])?.clone();
    let mut draft = Value::Object(Map::new());
    draft
        .as_object_mut()
        .expect("freshly built object")
        .insert(path[0].clone(), field_value.take());
    delete_value(&mut draft, path);
    draft.get(&path[0]).cloned()
}

// ============================================================================
// Strategy selection
// ============================================================================

/// Ask the host policy for a strategy. No policy, or a panicking one, yields
/// `KeepRemote`.
pub fn choose_strategy(on_conflict: Option<&OnConflict>, conflicts: &[Conflict]) -> ConflictStrategy {
    let Some(cb) = on_conflict else {
        return ConflictStrategy::KeepRemote;
    };
    match catch_unwind(AssertUnwindSafe(|| cb(conflicts))) {
        Ok(strategy) => strategy,
        Err(_) => {
            warn!("conflict policy panicked, falling back to keep-remote");
            ConflictStrategy::KeepRemote
        }
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Apply a strategy, producing the mutations to replay against the current
/// (post-hydration) state.
pub fn resolve(
    stale: &Value,
    conflicts: &[Conflict],
    queue: Vec<Mutation>,
    strategy: ConflictStrategy,
) -> Vec<Mutation> {
    match strategy {
        ConflictStrategy::KeepLocal => queue,
        ConflictStrategy::Merge {
            merged_values: Some(values),
        } => {
            let id = queue.last().map(|m| m.id).unwrap_or(0);
            vec![Mutation {
                id,
                timestamp: chrono::Utc::now().timestamp_millis(),
                patch: StatePatch::Value(values),
                replace: false,
            }]
        }
        ConflictStrategy::Merge {
            merged_values: None,
        } => {
            warn!("merge strategy without merged values, falling back to keep-remote");
            keep_remote(stale, conflicts, queue)
        }
        ConflictStrategy::KeepRemote => keep_remote(stale, conflicts, queue),
    }
}

/// Strip conflicting fields from every mutation; drop mutations left empty.
/// Functional patches are materialised against `stale` so fields can be
/// removed from them.
fn keep_remote(stale: &Value, conflicts: &[Conflict], queue: Vec<Mutation>) -> Vec<Mutation> {
    let conflicting: HashSet<&str> = conflicts.iter().map(|c| c.field.as_str()).collect();
    if conflicting.is_empty() {
        return queue;
    }

    let mut resolved = Vec::with_capacity(queue.len());
    for mutation in queue {
        let changes = mutation.patch.resolve(stale);
        let mut stripped = match changes.as_object() {
            Some(map) => map.clone(),
            None => Map::new(),
        };
        stripped.retain(|field, _| !conflicting.contains(field.as_str()));

        let deletions: Vec<Vec<String>> = mutation
            .patch
            .deletions()
            .iter()
            .filter(|path| {
                path.first()
                    .map(|f| !conflicting.contains(f.as_str()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        if stripped.is_empty() && deletions.is_empty() {
            continue;
        }
        let patch = if deletions.is_empty() {
            StatePatch::Value(Value::Object(stripped))
        } else {
            StatePatch::Explicit {
                changes: Value::Object(stripped),
                deletions,
            }
        };
        resolved.push(Mutation {
            id: mutation.id,
            timestamp: mutation.timestamp,
            patch,
            replace: mutation.replace,
        });
    }
    resolved
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn mutation(id: u64, patch: StatePatch) -> Mutation {
        Mutation {
            id,
            timestamp: 1_000 + id as i64,
            patch,
            replace: false,
        }
    }

    fn value_mutation(id: u64, value: Value) -> Mutation {
        mutation(id, StatePatch::Value(value))
    }

    #[test]
    fn three_way_divergence_is_a_conflict() {
        let stale = json!({ "text": "old" });
        let remote = json!({ "text": "remote" });
        let queue = vec![value_mutation(1, json!({ "text": "local" }))];
        let conflicts = detect(&stale, &remote, &queue);
        assert_eq!(
            conflicts,
            vec![Conflict {
                field: "text".into(),
                stale_value: Some(json!("old")),
                remote_value: Some(json!("remote")),
                pending_value: Some(json!("local")),
            }]
        );
    }

    #[test]
    fn unchanged_remote_is_not_a_conflict() {
        let stale = json!({ "text": "old" });
        let remote = json!({ "text": "old" });
        let queue = vec![value_mutation(1, json!({ "text": "local" }))];
        assert!(detect(&stale, &remote, &queue).is_empty());
    }

    #[test]
    fn pending_equal_to_remote_is_not_a_conflict() {
        let stale = json!({ "text": "old" });
        let remote = json!({ "text": "same" });
        let queue = vec![value_mutation(1, json!({ "text": "same" }))];
        assert!(detect(&stale, &remote, &queue).is_empty());
    }

    #[test]
    fn functional_patches_resolve_against_the_stale_snapshot() {
        let stale = json!({ "count": 1 });
        let remote = json!({ "count": 10 });
        let queue = vec![mutation(
            1,
            StatePatch::Fn(Arc::new(|state: &Value| {
                json!({ "count": state["count"].as_i64().unwrap_or(0) + 1 })
            })),
        )];
        let conflicts = detect(&stale, &remote, &queue);
        assert_eq!(conflicts[0].pending_value, Some(json!(2)));
    }

    #[test]
    fn later_mutation_wins_the_pending_value() {
        let stale = json!({ "text": "old" });
        let remote = json!({ "text": "remote" });
        let queue = vec![
            value_mutation(1, json!({ "text": "first" })),
            value_mutation(2, json!({ "text": "second" })),
        ];
        let conflicts = detect(&stale, &remote, &queue);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].pending_value, Some(json!("second")));
    }

    #[test]
    fn field_added_remotely_conflicts_with_top_level_deletion() {
        let stale = json!({ "todo": { "a": 1 } });
        let remote = json!({ "todo": { "a": 2 } });
        let queue = vec![mutation(
            1,
            StatePatch::Explicit {
                changes: json!({}),
                deletions: vec![vec!["todo".into()]],
            },
        )];
        let conflicts = detect(&stale, &remote, &queue);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].pending_value, None);
    }

    #[test]
    fn deep_deletion_pends_the_pruned_subtree() {
        let stale = json!({ "todos": { "t1": 1, "t2": 2 } });
        let remote = json!({ "todos": { "t1": 1, "t2": 2, "t3": 3 } });
        let queue = vec![mutation(
            1,
            StatePatch::Explicit {
                changes: json!({}),
                deletions: vec![vec!["todos".into(), "t1".into()]],
            },
        )];
        let conflicts = detect(&stale, &remote, &queue);
        assert_eq!(conflicts[0].pending_value, Some(json!({ "t2": 2 })));
    }

    #[test]
    fn keep_remote_strips_conflicting_fields_and_drops_empty_mutations() {
        let stale = json!({ "text": "old", "count": 1 });
        let remote = json!({ "text": "remote", "count": 1 });
        let queue = vec![
            value_mutation(1, json!({ "text": "local" })),
            value_mutation(2, json!({ "text": "local2", "count": 5 })),
        ];
        let conflicts = detect(&stale, &remote, &queue);
        let resolved = resolve(&stale, &conflicts, queue, ConflictStrategy::KeepRemote);
        // First mutation emptied out; second keeps only `count`.
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, 2);
        assert_eq!(
            resolved[0].patch.resolve(&json!({})),
            json!({ "count": 5 })
        );
    }

    #[test]
    fn keep_local_replays_the_queue_unchanged() {
        let stale = json!({ "text": "old" });
        let remote = json!({ "text": "remote" });
        let queue = vec![value_mutation(1, json!({ "text": "local" }))];
        let conflicts = detect(&stale, &remote, &queue);
        let resolved = resolve(&stale, &conflicts, queue.clone(), ConflictStrategy::KeepLocal);
        assert_eq!(resolved.len(), 1);
        assert_eq!(
            resolved[0].patch.resolve(&json!({})),
            json!({ "text": "local" })
        );
    }

    #[test]
    fn merge_applies_exactly_the_merged_values() {
        let stale = json!({ "text": "old" });
        let remote = json!({ "text": "remote" });
        let queue = vec![value_mutation(7, json!({ "text": "local" }))];
        let conflicts = detect(&stale, &remote, &queue);
        let resolved = resolve(
            &stale,
            &conflicts,
            queue,
            ConflictStrategy::Merge {
                merged_values: Some(json!({ "text": "remote - local" })),
            },
        );
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, 7);
        assert_eq!(
            resolved[0].patch.resolve(&json!({})),
            json!({ "text": "remote - local" })
        );
    }

    #[test]
    fn merge_without_values_falls_back_to_keep_remote() {
        let stale = json!({ "text": "old" });
        let remote = json!({ "text": "remote" });
        let queue = vec![value_mutation(1, json!({ "text": "local" }))];
        let conflicts = detect(&stale, &remote, &queue);
        let resolved = resolve(
            &stale,
            &conflicts,
            queue,
            ConflictStrategy::Merge {
                merged_values: None,
            },
        );
        assert!(resolved.is_empty());
    }

    #[test]
    fn panicking_policy_falls_back_to_keep_remote() {
        let conflicts = vec![Conflict {
            field: "text".into(),
            stale_value: None,
            remote_value: Some(json!("remote")),
            pending_value: Some(json!("local")),
        }];
        let policy: OnConflict = Arc::new(|_: &[Conflict]| panic!("policy bug"));
        assert_eq!(
            choose_strategy(Some(&policy), &conflicts),
            ConflictStrategy::KeepRemote
        );
        assert_eq!(choose_strategy(None, &conflicts), ConflictStrategy::KeepRemote);
    }

    #[test]
    fn non_conflicting_mutations_pass_through_keep_remote() {
        let stale = json!({ "a": 1 });
        let remote = json!({ "a": 1 });
        let queue = vec![value_mutation(1, json!({ "a": 2 }))];
        let conflicts = detect(&stale, &remote, &queue);
        assert!(conflicts.is_empty());
        let resolved = resolve(&stale, &conflicts, queue, ConflictStrategy::KeepRemote);
        assert_eq!(resolved.len(), 1);
    }
}
