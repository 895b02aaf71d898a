//! Sync-specific types: patch variants, queued mutations, conflicts, and the
//! policy callbacks the host can supply.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

// ============================================================================
// StatePatch — the mutation payload
// ============================================================================

/// The payload of a local mutation.
///
/// `Value` is a plain partial state; `Fn` is resolved against the state it is
/// eventually applied to; `Explicit` carries precomputed changes plus path
/// deletions (produced by conflict resolution and granular delete replay).
#[derive(Clone)]
pub enum StatePatch {
    Value(Value),
    Fn(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
    Explicit {
        changes: Value,
        deletions: Vec<Vec<String>>,
    },
}

impl StatePatch {
    /// Resolve the patch into a concrete partial state against `state`.
    pub fn resolve(&self, state: &Value) -> Value {
        match self {
            StatePatch::Value(v) => v.clone(),
            StatePatch::Fn(f) => f(state),
            StatePatch::Explicit { changes, .. } => changes.clone(),
        }
    }

    /// Path deletions carried by an explicit patch.
    pub fn deletions(&self) -> &[Vec<String>] {
        match self {
            StatePatch::Explicit { deletions, .. } => deletions,
            _ => &[],
        }
    }
}

impl fmt::Debug for StatePatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatePatch::Value(v) => f.debug_tuple("Value").field(v).finish(),
            StatePatch::Fn(_) => f.write_str("Fn(..)"),
            StatePatch::Explicit { changes, deletions } => f
                .debug_struct("Explicit")
                .field("changes", changes)
                .field("deletions", deletions)
                .finish(),
        }
    }
}

impl From<Value> for StatePatch {
    fn from(value: Value) -> Self {
        StatePatch::Value(value)
    }
}

// ============================================================================
// Mutation
// ============================================================================

/// A local mutation buffered in the sync queue.
#[derive(Debug, Clone)]
pub struct Mutation {
    /// Monotonic id assigned by the queue.
    pub id: u64,
    /// Epoch milliseconds at enqueue time.
    pub timestamp: i64,
    pub patch: StatePatch,
    pub replace: bool,
}

// ============================================================================
// Conflicts
// ============================================================================

/// Three-way divergence on one top-level field: the remote moved while we
/// were away, and our pending value differs from where it moved to.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub field: String,
    /// Local value just before disconnect.
    pub stale_value: Option<Value>,
    /// Value observed after re-hydration.
    pub remote_value: Option<Value>,
    /// Value a queued mutation wants to write.
    pub pending_value: Option<Value>,
}

/// Resolution strategy returned by the conflict policy.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictStrategy {
    /// Strip conflicting fields from pending mutations; the remote wins.
    KeepRemote,
    /// Replay pending mutations unchanged; local wins.
    KeepLocal,
    /// Apply one synthesised mutation carrying exactly `merged_values`.
    /// Without values this degrades to `KeepRemote`.
    Merge { merged_values: Option<Value> },
}

// ============================================================================
// Host callbacks
// ============================================================================

/// Observes the reconstructed tree during hydration. Panics are caught and
/// logged, never propagated.
pub type OnHydrate = Arc<dyn Fn(&Value) + Send + Sync>;

/// Chooses a resolution strategy for a batch of conflicts. Panics fall back
/// to `KeepRemote`.
pub type OnConflict = Arc<dyn Fn(&[Conflict]) -> ConflictStrategy + Send + Sync>;
