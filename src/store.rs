//! Host state-store contract and an in-memory implementation.
//!
//! The middleware consumes this narrow interface: read the tree, apply a
//! patch (shallow top-level merge, or whole-tree replace), and observe
//! changes. Setters are synchronous; the orchestrator is the only writer
//! besides the host itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::warn;

use crate::sync::types::StatePatch;

pub type StateListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Listener registration; unsubscribes when dropped.
pub struct StoreSubscription {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl StoreSubscription {
    pub fn new(remove: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for StoreSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StoreSubscription")
    }
}

// ============================================================================
// StateStore
// ============================================================================

/// Observable key/value container owned by the host.
pub trait StateStore: Send + Sync {
    /// Snapshot of the current tree. The root is always an object.
    fn get_state(&self) -> Value;

    /// Apply a patch. Non-replace patches shallow-merge at the top level;
    /// replace swaps the whole tree. Functional patches resolve against the
    /// current state.
    fn set_state(&self, patch: &StatePatch, replace: bool);

    fn subscribe(&self, listener: StateListener) -> StoreSubscription;
}

// ============================================================================
// MemoryStateStore
// ============================================================================

/// In-memory `StateStore` with top-level shallow merge, for tests and demos.
pub struct MemoryStateStore {
    state: Mutex<Value>,
    listeners: Arc<Mutex<HashMap<u64, StateListener>>>,
    next_id: AtomicU64,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::with_initial(Value::Object(Map::new()))
    }

    pub fn with_initial(initial: Value) -> Self {
        Self {
            state: Mutex::new(initial),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    fn notify(&self, state: &Value) {
        let listeners: Vec<StateListener> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(state);
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStateStore {
    fn get_state(&self) -> Value {
        self.state.lock().clone()
    }

    fn set_state(&self, patch: &StatePatch, replace: bool) {
        let updated = {
            let mut state = self.state.lock();
            let resolved = patch.resolve(&state);
            let Some(partial) = resolved.as_object() else {
                warn!("ignoring non-object state patch");
                return;
            };
            if replace {
                *state = Value::Object(partial.clone());
            } else {
                let root = state
                    .as_object_mut()
                    .expect("state root is always an object");
                for (key, value) in partial {
                    root.insert(key.clone(), value.clone());
                }
            }
            state.clone()
        };
        self.notify(&updated);
    }

    fn subscribe(&self, listener: StateListener) -> StoreSubscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().insert(id, listener);
        let listeners = Arc::clone(&self.listeners);
        StoreSubscription::new(move || {
            listeners.lock().remove(&id);
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
