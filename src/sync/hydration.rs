//! Hydrator — reconstruct local state from a namespace range scan.
//!
//! Runs on connect and on explicit re-hydration. Single-flight: calls that
//! arrive while a hydration is in flight coalesce onto it and observe its
//! result. Reconstruction is memoised on a fingerprint of the scanned
//! entries, so re-hydrating an idle namespace skips the rebuild.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::types::OnHydrate;
use crate::error::{Error, Result};
use crate::keys::KeyCodec;
use crate::state::diff::value_hash;
use crate::state::path_ops::set_value;
use crate::storage::remote::RemoteStore;
use crate::RESERVED_FIELD;

/// What a hydration run did.
#[derive(Debug, Clone)]
pub struct HydrationReport {
    /// This call joined an in-flight hydration instead of running its own.
    pub coalesced: bool,
    /// The reconstruction was served from the memo.
    pub reused_memo: bool,
    /// Decoded entries applied.
    pub keys: usize,
    pub elapsed: Duration,
}

#[derive(Clone)]
enum FlightState {
    Pending,
    Done(std::result::Result<(), String>),
}

pub struct Hydrator {
    codec: KeyCodec,
    memo: Mutex<Option<(u64, Value)>>,
    inflight: Mutex<Option<watch::Receiver<FlightState>>>,
}

impl Hydrator {
    pub fn new(codec: KeyCodec) -> Self {
        Self {
            codec,
            memo: Mutex::new(None),
            inflight: Mutex::new(None),
        }
    }

    /// Scan, reconstruct, and hand the draft tree to `apply` exactly once.
    ///
    /// `on_hydrate` observes the draft first; its panics are logged and
    /// swallowed. On error nothing is applied and the caller may retry.
    pub async fn run(
        &self,
        remote: &RemoteStore,
        apply: &(dyn Fn(Value) + Send + Sync),
        on_hydrate: Option<&OnHydrate>,
    ) -> Result<HydrationReport> {
        enum Role {
            Leader(watch::Sender<FlightState>),
            Follower(watch::Receiver<FlightState>),
        }

        let role = {
            let mut inflight = self.inflight.lock();
            match &*inflight {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(FlightState::Pending);
                    *inflight = Some(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => loop {
                let state = rx.borrow().clone();
                if let FlightState::Done(result) = state {
                    return match result {
                        Ok(()) => Ok(HydrationReport {
                            coalesced: true,
                            reused_memo: false,
                            keys: 0,
                            elapsed: Duration::ZERO,
                        }),
                        Err(message) => Err(Error::Hydration(message)),
                    };
                }
                if rx.changed().await.is_err() {
                    return Err(Error::Hydration("hydration aborted".into()));
                }
            },
            Role::Leader(tx) => {
                let result = self.hydrate(remote, apply, on_hydrate).await;
                *self.inflight.lock() = None;
                let summary = match &result {
                    Ok(_) => Ok(()),
                    Err(e) => Err(e.to_string()),
                };
                let _ = tx.send(FlightState::Done(summary));
                result
            }
        }
    }

    async fn hydrate(
        &self,
        remote: &RemoteStore,
        apply: &(dyn Fn(Value) + Send + Sync),
        on_hydrate: Option<&OnHydrate>,
    ) -> Result<HydrationReport> {
        let started = Instant::now();

        let entries = remote
            .range_all()
            .await
            .map_err(|e| Error::Hydration(format!("range scan failed: {e}")))?;

        let mut decoded: Vec<(String, Vec<String>, Value)> = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let Some(parsed) = self.codec.parse(&key) else {
                continue;
            };
            if parsed.path[0] == RESERVED_FIELD {
                continue;
            }
            decoded.push((key, parsed.path, value));
        }
        decoded.sort_by(|a, b| a.0.cmp(&b.0));

        let fingerprint = {
            let mut hasher = DefaultHasher::new();
            for (key, _, value) in &decoded {
                key.hash(&mut hasher);
                value_hash(value).hash(&mut hasher);
            }
            hasher.finish()
        };

        let memoised = {
            let memo = self.memo.lock();
            match &*memo {
                Some((hash, tree)) if *hash == fingerprint => Some(tree.clone()),
                _ => None,
            }
        };
        let reused_memo = memoised.is_some();
        let tree = match memoised {
            Some(tree) => tree,
            None => {
                let mut tree = Value::Object(Map::new());
                for (_, path, value) in &decoded {
                    set_value(&mut tree, path, value.clone());
                }
                *self.memo.lock() = Some((fingerprint, tree.clone()));
                tree
            }
        };

        if let Some(cb) = on_hydrate {
            if catch_unwind(AssertUnwindSafe(|| cb(&tree))).is_err() {
                warn!("onHydrate callback panicked");
            }
        }

        apply(tree);

        let report = HydrationReport {
            coalesced: false,
            reused_memo,
            keys: decoded.len(),
            elapsed: started.elapsed(),
        };
        debug!(
            keys = report.keys,
            reused_memo = report.reused_memo,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "hydration complete"
        );
        Ok(report)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::storage::client::{AuthToken, KvClient};
    use crate::storage::memory::MemoryKvService;
    use crate::storage::retry::RetryConfig;
    use serde_json::json;
    use std::sync::Arc;

    fn codec() -> KeyCodec {
        KeyCodec::new("room", 2)
    }

    fn remote_for(service: &MemoryKvService, client_id: &str) -> RemoteStore {
        RemoteStore::new(
            Arc::new(service.client()),
            vec![format!("{}:*", codec().prefix())],
            codec().range_bounds(),
            client_id.to_string(),
            RetryConfig::default(),
            ClientConfig::default(),
        )
    }

    async fn seed(service: &MemoryKvService) {
        let writer = remote_for(service, "seeder");
        writer
            .connect(&AuthToken {
                token: "t".into(),
            })
            .await
            .unwrap();
        writer.set_item("room-z2:count", &json!(1)).await.unwrap();
        writer
            .set_item("room-z2:todos:t1:title", &json!("buy milk"))
            .await
            .unwrap();
        writer
            .set_item("room-z2:multiplayer:hasHydrated", &json!(true))
            .await
            .unwrap();
        // Foreign namespace noise.
        let client = service.client();
        client
            .connect(&AuthToken {
                token: "t".into(),
            })
            .await
            .unwrap();
        client.set("other-z2:count", &json!(9)).await.unwrap();
    }

    fn collector() -> (Arc<Mutex<Vec<Value>>>, Arc<dyn Fn(Value) + Send + Sync>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&applied);
        let apply: Arc<dyn Fn(Value) + Send + Sync> = Arc::new(move |tree| {
            a.lock().push(tree);
        });
        (applied, apply)
    }

    #[tokio::test]
    async fn reconstructs_tree_and_skips_reserved_and_foreign_keys() {
        let service = MemoryKvService::new();
        seed(&service).await;
        let remote = remote_for(&service, "reader");
        remote
            .connect(&AuthToken {
                token: "t".into(),
            })
            .await
            .unwrap();

        let hydrator = Hydrator::new(codec());
        let (applied, apply) = collector();
        let report = hydrator.run(&remote, apply.as_ref(), None).await.unwrap();

        assert!(!report.coalesced);
        assert!(!report.reused_memo);
        assert_eq!(report.keys, 2);
        let trees = applied.lock();
        assert_eq!(trees.len(), 1);
        assert_eq!(
            trees[0],
            json!({ "count": 1, "todos": { "t1": { "title": "buy milk" } } })
        );
    }

    #[tokio::test]
    async fn second_run_on_idle_namespace_reuses_memo() {
        let service = MemoryKvService::new();
        seed(&service).await;
        let remote = remote_for(&service, "reader");
        remote
            .connect(&AuthToken {
                token: "t".into(),
            })
            .await
            .unwrap();

        let hydrator = Hydrator::new(codec());
        let (applied, apply) = collector();
        let first = hydrator.run(&remote, apply.as_ref(), None).await.unwrap();
        let second = hydrator.run(&remote, apply.as_ref(), None).await.unwrap();

        assert!(!first.reused_memo);
        assert!(second.reused_memo);
        let trees = applied.lock();
        assert_eq!(trees.len(), 2);
        assert_eq!(trees[0], trees[1]);
    }

    #[tokio::test]
    async fn on_hydrate_observes_the_draft_and_panics_are_swallowed() {
        let service = MemoryKvService::new();
        seed(&service).await;
        let remote = remote_for(&service, "reader");
        remote
            .connect(&AuthToken {
                token: "t".into(),
            })
            .await
            .unwrap();

        let hydrator = Hydrator::new(codec());
        let (applied, apply) = collector();
        let observed = Arc::new(Mutex::new(None));
        let o = Arc::clone(&observed);
        let on_hydrate: OnHydrate = Arc::new(move |tree: &Value| {
            *o.lock() = Some(tree.clone());
            panic!("listener bug");
        });
        hydrator
            .run(&remote, apply.as_ref(), Some(&on_hydrate))
            .await
            .unwrap();

        assert!(observed.lock().is_some());
        assert_eq!(applied.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_scan_applies_nothing() {
        let service = MemoryKvService::new();
        let remote = remote_for(&service, "reader");
        // Never connected: the range scan fails.
        let hydrator = Hydrator::new(codec());
        let (applied, apply) = collector();
        let err = hydrator
            .run(&remote, apply.as_ref(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Hydration(_)));
        assert!(applied.lock().is_empty());
    }

    /// Transport whose range scan is slow enough to overlap concurrent runs.
    struct SlowRange<C> {
        inner: C,
    }

    #[async_trait::async_trait]
    impl<C: KvClient> KvClient for SlowRange<C> {
        async fn connect(
            &self,
            auth: &AuthToken,
        ) -> std::result::Result<(), crate::storage::client::KvError> {
            self.inner.connect(auth).await
        }
        async fn disconnect(&self) -> std::result::Result<(), crate::storage::client::KvError> {
            self.inner.disconnect().await
        }
        async fn get(
            &self,
            key: &str,
        ) -> std::result::Result<Option<Value>, crate::storage::client::KvError> {
            self.inner.get(key).await
        }
        async fn set(
            &self,
            key: &str,
            value: &Value,
        ) -> std::result::Result<(), crate::storage::client::KvError> {
            self.inner.set(key, value).await
        }
        async fn delete(
            &self,
            key: &str,
        ) -> std::result::Result<(), crate::storage::client::KvError> {
            self.inner.delete(key).await
        }
        async fn range(
            &self,
            start: &str,
            end: &str,
            limit: Option<usize>,
        ) -> std::result::Result<Vec<(String, Value)>, crate::storage::client::KvError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.range(start, end, limit).await
        }
        fn on_notification(
            &self,
            patterns: Vec<String>,
            listener: crate::storage::client::NotificationListener,
        ) -> crate::storage::client::KvSubscription {
            self.inner.on_notification(patterns, listener)
        }
        fn on_connection(
            &self,
            listener: crate::storage::client::ConnectionListener,
        ) -> crate::storage::client::KvSubscription {
            self.inner.on_connection(listener)
        }
    }

    #[tokio::test]
    async fn concurrent_runs_coalesce() {
        let service = MemoryKvService::new();
        seed(&service).await;
        let remote = RemoteStore::new(
            Arc::new(SlowRange {
                inner: service.client(),
            }),
            vec![format!("{}:*", codec().prefix())],
            codec().range_bounds(),
            "reader".to_string(),
            RetryConfig::default(),
            ClientConfig::default(),
        );
        remote
            .connect(&AuthToken {
                token: "t".into(),
            })
            .await
            .unwrap();

        let hydrator = Hydrator::new(codec());
        let (applied, apply) = collector();
        let (first, second) = tokio::join!(
            hydrator.run(&remote, apply.as_ref(), None),
            hydrator.run(&remote, apply.as_ref(), None),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        // One leader, one coalesced follower; the tree was applied once.
        assert_ne!(first.coalesced, second.coalesced);
        assert_eq!(applied.lock().len(), 1);
    }
}
