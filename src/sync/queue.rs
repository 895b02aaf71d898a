//! SyncQueue — FIFO of local mutations deferred while disconnected or
//! un-hydrated.
//!
//! `drain` is single-flight: the processing latch rejects overlapping drains,
//! and mutations enqueued while one is running wait for the next drain.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::types::{Mutation, StatePatch};
use crate::error::Result;

pub struct SyncQueue {
    items: Mutex<VecDeque<Mutation>>,
    next_id: AtomicU64,
    processing: AtomicBool,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            processing: AtomicBool::new(false),
        }
    }

    /// Enqueue a mutation; returns its id.
    pub fn push(&self, patch: StatePatch, replace: bool) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mutation = Mutation {
            id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            patch,
            replace,
        };
        self.items.lock().push_back(mutation);
        id
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn peek(&self) -> Option<Mutation> {
        self.items.lock().front().cloned()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Snapshot and empty the queue without applying (conflict resolution
    /// replays through its own path).
    pub fn take_all(&self) -> Vec<Mutation> {
        self.items.lock().drain(..).collect()
    }

    /// Apply every queued mutation in FIFO order.
    ///
    /// The queue is snapshotted and emptied up front; an `apply` error ends
    /// the drain and propagates, and the remaining snapshot items are
    /// dropped — conflict resolution already ran before the drain, so they
    /// are considered applied-or-lost. Returns how many mutations applied.
    pub async fn drain<F, Fut>(&self, mut apply: F) -> Result<usize>
    where
        F: FnMut(Mutation) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.processing.swap(true, Ordering::SeqCst) {
            debug!("drain already in progress, skipping");
            return Ok(0);
        }

        let snapshot: Vec<Mutation> = self.items.lock().drain(..).collect();
        let mut applied = 0;
        let mut outcome = Ok(());
        for mutation in snapshot {
            match apply(mutation).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        // Release the latch on success and error alike.
        self.processing.store(false, Ordering::SeqCst);
        outcome.map(|()| applied)
    }
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
