//! Performance counters surfaced through `metrics()` and the reserved
//! `multiplayer.performanceMetrics` mirror.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

/// Counters owned by one orchestrator. Counting is always on; `profiling`
/// gates only the hydration latency sampling.
#[derive(Debug, Default)]
pub struct Metrics {
    profiling: bool,
    writes: AtomicU64,
    deletes: AtomicU64,
    notifications_applied: AtomicU64,
    conflicts_detected: AtomicU64,
    queue_high_water: AtomicU64,
    hydration_count: AtomicU64,
    hydration_total_ms: AtomicU64,
    last_hydration_ms: AtomicU64,
}

impl Metrics {
    pub fn new(profiling: bool) -> Self {
        Self {
            profiling,
            ..Self::default()
        }
    }

    pub fn record_writes(&self, n: usize) {
        self.writes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_deletes(&self, n: usize) {
        self.deletes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_notification(&self) {
        self.notifications_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflicts(&self, n: usize) {
        self.conflicts_detected.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_queue_len(&self, len: usize) {
        self.queue_high_water.fetch_max(len as u64, Ordering::Relaxed);
    }

    pub fn record_hydration(&self, elapsed: Duration) {
        self.hydration_count.fetch_add(1, Ordering::Relaxed);
        if self.profiling {
            let ms = elapsed.as_millis() as u64;
            self.last_hydration_ms.store(ms, Ordering::Relaxed);
            self.hydration_total_ms.fetch_add(ms, Ordering::Relaxed);
        }
    }

    pub fn hydration_count(&self) -> u64 {
        self.hydration_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = self.hydration_count.load(Ordering::Relaxed);
        let total = self.hydration_total_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            notifications_applied: self.notifications_applied.load(Ordering::Relaxed),
            conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            queue_high_water: self.queue_high_water.load(Ordering::Relaxed),
            hydration_count: count,
            last_hydration_ms: self.last_hydration_ms.load(Ordering::Relaxed),
            avg_hydration_ms: if count > 0 { total / count } else { 0 },
        }
    }
}

/// Point-in-time metrics, serialisable into the reserved subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub writes: u64,
    pub deletes: u64,
    pub notifications_applied: u64,
    pub conflicts_detected: u64,
    pub queue_high_water: u64,
    pub hydration_count: u64,
    pub last_hydration_ms: u64,
    pub avg_hydration_ms: u64,
}

impl MetricsSnapshot {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
