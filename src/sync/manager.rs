//! SyncManager — the orchestrator.
//!
//! Routes local mutations and remote notifications through hydration, the
//! sync queue, and conflict resolution, gated by connection state. The
//! manager is the only writer to host state besides the host itself; remote
//! updates never re-enter the publish path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::conflict;
use super::hydration::Hydrator;
use super::queue::SyncQueue;
use super::types::{Mutation, OnConflict, OnHydrate, StatePatch};
use crate::auth::{ApiKeyProvider, TokenCache, TokenProvider, TokenRequest};
use crate::config::{AuthMode, MultiplayerOptions};
use crate::error::{Error, Result};
use crate::filter::{subscription_patterns, FieldFilter};
use crate::keys::KeyCodec;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::state::diff::DiffCache;
use crate::state::path_ops::{cleanup_empty_parents, delete_value, set_value};
use crate::storage::client::{ConnectionState, KvClient, KvSubscription};
use crate::storage::remote::{RemoteChange, RemoteStore};
use crate::store::StateStore;
use crate::RESERVED_FIELD;

pub struct SyncManager {
    codec: KeyCodec,
    remote: RemoteStore,
    hydrator: Hydrator,
    queue: SyncQueue,
    host: Arc<dyn StateStore>,
    tokens: TokenCache,
    publish_filter: FieldFilter,
    subscribe_filter: FieldFilter,
    on_hydrate: Option<OnHydrate>,
    on_conflict: Option<OnConflict>,
    metrics: Metrics,
    max_path_len: usize,

    previous_state: Mutex<Value>,
    diff_cache: Mutex<DiffCache>,
    state_before_disconnection: Mutex<Option<Value>>,
    conn_mirror: Mutex<ConnectionState>,
    has_hydrated: AtomicBool,
    destroyed: AtomicBool,

    /// Serialises the local publish path.
    publish_lock: tokio::sync::Mutex<()>,
    /// Serialises the connect → hydrate → resolve → drain sequence.
    lifecycle_lock: tokio::sync::Mutex<()>,

    weak_self: OnceLock<Weak<SyncManager>>,
    event_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    remote_subs: Mutex<Vec<KvSubscription>>,
}

impl SyncManager {
    /// Build a manager over a host store and transport. Validates options,
    /// wires remote listeners, and spawns the connection event loop (a tokio
    /// runtime must be current). Does not connect.
    pub fn attach(
        host: Arc<dyn StateStore>,
        client: Arc<dyn KvClient>,
        options: MultiplayerOptions,
    ) -> Result<Arc<Self>> {
        options.validate()?;

        let z_factor = options.effective_z_factor();
        let codec = KeyCodec::new(&options.namespace, z_factor);
        let publish_filter =
            FieldFilter::from_options(options.publish_updates_for.as_deref(), &options.sync);
        let subscribe_filter =
            FieldFilter::from_options(options.subscribe_to_updates_for.as_deref(), &options.sync);

        let client_id = uuid::Uuid::new_v4().to_string();
        debug!(
            namespace = %options.namespace,
            url = %options.api_base_url,
            %client_id,
            z_factor,
            "attaching multiplayer store"
        );

        let remote = RemoteStore::new(
            client,
            subscription_patterns(&codec, &subscribe_filter),
            codec.range_bounds(),
            client_id,
            options.retry.clone(),
            options.client.clone(),
        );

        let provider: Arc<dyn TokenProvider> = match &options.auth {
            AuthMode::ApiKey(key) => Arc::new(ApiKeyProvider::new(key.clone())),
            AuthMode::TokenProvider(provider) => Arc::clone(provider),
        };
        let tokens = TokenCache::new(provider, TokenRequest::scoped(&codec, &subscribe_filter));

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ConnectionState>();

        let manager = Arc::new(SyncManager {
            hydrator: Hydrator::new(codec.clone()),
            codec,
            remote,
            queue: SyncQueue::new(),
            host: Arc::clone(&host),
            tokens,
            publish_filter,
            subscribe_filter,
            on_hydrate: options.on_hydrate.clone(),
            on_conflict: options.on_conflict.clone(),
            metrics: Metrics::new(options.profiling),
            max_path_len: z_factor as usize + 1,
            previous_state: Mutex::new(host.get_state()),
            diff_cache: Mutex::new(DiffCache::new(DiffCache::DEFAULT_CAPACITY)),
            state_before_disconnection: Mutex::new(None),
            conn_mirror: Mutex::new(ConnectionState::Disconnected),
            has_hydrated: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            publish_lock: tokio::sync::Mutex::new(()),
            lifecycle_lock: tokio::sync::Mutex::new(()),
            weak_self: OnceLock::new(),
            event_task: Mutex::new(None),
            remote_subs: Mutex::new(Vec::new()),
        });
        let _ = manager.weak_self.set(Arc::downgrade(&manager));

        let weak = Arc::downgrade(&manager);
        let change_sub = manager.remote.on_change(Arc::new(move |change: &RemoteChange| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_remote_change(change);
            }
        }));
        let conn_sub = manager
            .remote
            .on_connection_change(Arc::new(move |state: ConnectionState| {
                let _ = event_tx.send(state);
            }));
        manager.remote_subs.lock().extend([change_sub, conn_sub]);

        let weak = Arc::downgrade(&manager);
        let task = tokio::spawn(async move {
            while let Some(state) = event_rx.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.handle_connection_event(state).await;
            }
        });
        *manager.event_task.lock() = Some(task);

        manager.update_reserved_mirror();
        *manager.previous_state.lock() = manager.host.get_state();

        Ok(manager)
    }

    // ------------------------------------------------------------------
    // Public surface
    // ------------------------------------------------------------------

    pub fn host(&self) -> &Arc<dyn StateStore> {
        &self.host
    }

    pub fn client_id(&self) -> &str {
        self.remote.client_id()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.conn_mirror.lock()
    }

    pub fn has_hydrated(&self) -> bool {
        self.has_hydrated.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn pending_mutations(&self) -> usize {
        self.queue.len()
    }

    /// Apply a local mutation.
    ///
    /// While hydrated and connected the mutation applies to the host and the
    /// resulting diff publishes immediately. Otherwise it queues; when the
    /// connection is fully down this also kicks off a reconnect.
    pub async fn set(&self, patch: StatePatch, replace: bool) -> Result<()> {
        self.ensure_alive()?;
        let state = self.connection_state();
        if !self.has_hydrated()
            || matches!(
                state,
                ConnectionState::Disconnected | ConnectionState::Connecting
            )
        {
            self.queue.push(patch, replace);
            self.metrics.record_queue_len(self.queue.len());
            debug!(queued = self.queue.len(), %state, "buffering mutation");
            if state == ConnectionState::Disconnected {
                self.spawn_reconnect();
            }
            return Ok(());
        }

        self.apply_local(&patch, replace);
        self.publish_changes().await
    }

    /// Connect, hydrate, and replay anything queued. Idempotent while
    /// connected and hydrated.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_alive()?;
        if self.remote.is_connected() && self.has_hydrated() && self.queue.is_empty() {
            return Ok(());
        }
        if !self.remote.is_connected() {
            let token = self.tokens.token().await?;
            self.set_conn_mirror(ConnectionState::Connecting);
            self.update_reserved_mirror();
            if let Err(e) = self.remote.connect(&token).await {
                self.set_conn_mirror(ConnectionState::Disconnected);
                self.update_reserved_mirror();
                return Err(e);
            }
        }
        self.set_conn_mirror(ConnectionState::Connected);
        self.update_reserved_mirror();
        self.on_connected().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.ensure_alive()?;
        self.remote.disconnect().await?;
        self.handle_disconnected();
        Ok(())
    }

    /// Re-run hydration against the current remote contents.
    pub async fn re_hydrate(&self) -> Result<()> {
        self.ensure_alive()?;
        if !self.remote.is_connected() {
            return Err(Error::network("cannot hydrate while disconnected"));
        }
        self.hydrate_once().await
    }

    /// Delete every key in this namespace from the remote store.
    pub async fn clear_storage(&self) -> Result<()> {
        self.ensure_alive()?;
        self.remote.clear().await
    }

    /// Tear down: disconnect, stop the event loop, drop listeners, empty the
    /// queue. Subsequent operations fail with `Error::Destroyed`.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
        self.queue.clear();
        self.remote.destroy().await;
        self.remote_subs.lock().clear();
        self.set_conn_mirror(ConnectionState::Disconnected);
        self.has_hydrated.store(false, Ordering::SeqCst);
        debug!("multiplayer store destroyed");
    }

    // ------------------------------------------------------------------
    // Local mutation path
    // ------------------------------------------------------------------

    fn apply_local(&self, patch: &StatePatch, replace: bool) {
        match patch {
            StatePatch::Explicit { changes, deletions } => {
                if !deletions.is_empty() {
                    let mut draft = self.host.get_state();
                    for path in deletions {
                        if delete_value(&mut draft, path) {
                            cleanup_empty_parents(&mut draft, path);
                        }
                    }
                    self.host.set_state(&StatePatch::Value(draft), true);
                }
                let has_changes = changes.as_object().is_some_and(|m| !m.is_empty());
                if has_changes {
                    self.host
                        .set_state(&StatePatch::Value(changes.clone()), replace);
                }
            }
            other => self.host.set_state(other, replace),
        }
    }

    /// Diff the host state against the last published snapshot and push the
    /// delta. `previous_state` advances only after every write resolves, so a
    /// partial failure re-publishes on the next diff.
    async fn publish_changes(&self) -> Result<()> {
        let _guard = self.publish_lock.lock().await;

        let current = self.host.get_state();
        let diff = {
            let prev = self.previous_state.lock().clone();
            self.diff_cache
                .lock()
                .diff(&prev, &current, self.max_path_len)
        };
        if diff.is_empty() {
            return Ok(());
        }

        let mut writes: Vec<(String, Value)> = Vec::new();
        for leaf in &diff.writes {
            if !self.publish_filter.matches_path(&leaf.path) {
                continue;
            }
            writes.push((self.codec.build(&leaf.path)?, leaf.value.clone()));
        }
        let mut deletes: Vec<String> = Vec::new();
        for path in &diff.deletes {
            if !self.publish_filter.matches_path(path) {
                continue;
            }
            deletes.push(self.codec.build(path)?);
        }

        let write_futs = writes
            .iter()
            .map(|(key, value)| self.remote.set_item(key, value));
        let delete_futs = deletes.iter().map(|key| self.remote.remove_item(key));
        futures::future::try_join_all(write_futs).await?;
        futures::future::try_join_all(delete_futs).await?;

        self.metrics.record_writes(writes.len());
        self.metrics.record_deletes(deletes.len());
        *self.previous_state.lock() = current;
        Ok(())
    }

    async fn apply_mutation(&self, mutation: Mutation) -> Result<()> {
        self.apply_local(&mutation.patch, mutation.replace);
        self.publish_changes().await
    }

    async fn drain_queue(&self) -> Result<usize> {
        let drained = self.queue.drain(|m| self.apply_mutation(m)).await?;
        if drained > 0 {
            debug!(drained, "sync queue drained");
        }
        Ok(drained)
    }

    // ------------------------------------------------------------------
    // Remote notification path
    // ------------------------------------------------------------------

    /// Apply one remote change to host state. Never publishes: the echo has
    /// already been suppressed by the adapter, and `previous_state` advances
    /// with the applied change so the next local diff ignores it.
    fn handle_remote_change(&self, change: &RemoteChange) {
        if self.destroyed() {
            return;
        }
        let Some(parsed) = self.codec.parse(&change.key) else {
            return;
        };
        if !self.subscribe_filter.matches_path(&parsed.path) {
            return;
        }
        let path = parsed.path;
        let field = path[0].clone();

        match &change.value {
            Some(value) => {
                let mut draft = self.host.get_state();
                set_value(&mut draft, &path, value.clone());
                let mut patch = Map::new();
                patch.insert(field.clone(), draft[&field].clone());
                self.host
                    .set_state(&StatePatch::Value(Value::Object(patch)), false);
            }
            None => {
                let mut draft = self.host.get_state();
                if delete_value(&mut draft, &path) {
                    cleanup_empty_parents(&mut draft, &path);
                }
                match draft.get(&field) {
                    // Field survived the cleanup: merge its updated subtree.
                    Some(subtree) if path.len() > 1 => {
                        let mut patch = Map::new();
                        patch.insert(field.clone(), subtree.clone());
                        self.host
                            .set_state(&StatePatch::Value(Value::Object(patch)), false);
                    }
                    // Top-level removal, or the cleanup emptied the field:
                    // only a replace update can drop it from host state.
                    _ => {
                        self.host.set_state(&StatePatch::Value(draft), true);
                    }
                }
            }
        }

        // Advance the published snapshot by the same change, not by a host
        // snapshot: local mutations applied but not yet published must stay
        // out of `previous_state` so a failed publish retries them.
        {
            let mut prev = self.previous_state.lock();
            match &change.value {
                Some(value) => set_value(&mut prev, &path, value.clone()),
                None => {
                    if delete_value(&mut prev, &path) {
                        cleanup_empty_parents(&mut prev, &path);
                    }
                }
            }
        }
        self.metrics.record_notification();
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    async fn handle_connection_event(&self, state: ConnectionState) {
        if self.destroyed() {
            return;
        }
        match state {
            ConnectionState::Connected => {
                if self.set_conn_mirror(ConnectionState::Connected) {
                    self.update_reserved_mirror();
                    if let Err(e) = self.on_connected().await {
                        warn!(error = %e, "post-connect sync failed");
                    }
                }
            }
            ConnectionState::Disconnected => self.handle_disconnected(),
            other => {
                if self.set_conn_mirror(other) {
                    self.update_reserved_mirror();
                }
            }
        }
    }

    /// Hydrate if needed, then resolve conflicts or drain the queue.
    async fn on_connected(&self) -> Result<()> {
        let _guard = self.lifecycle_lock.lock().await;
        if self.destroyed() {
            return Ok(());
        }
        let has_snapshot = self.state_before_disconnection.lock().is_some();
        if self.has_hydrated() && self.queue.is_empty() && !has_snapshot {
            return Ok(());
        }

        if !self.has_hydrated() {
            self.hydrate_once().await?;
        }

        let stale = self.state_before_disconnection.lock().take();
        if !self.queue.is_empty() {
            match stale {
                Some(stale) => self.resolve_and_replay(stale).await?,
                None => {
                    self.drain_queue().await?;
                }
            }
        }
        self.update_reserved_mirror();
        Ok(())
    }

    async fn resolve_and_replay(&self, stale: Value) -> Result<()> {
        let remote_state = self.host.get_state();
        let pending = self.queue.take_all();
        let conflicts = conflict::detect(&stale, &remote_state, &pending);
        if !conflicts.is_empty() {
            self.metrics.record_conflicts(conflicts.len());
            debug!(count = conflicts.len(), "three-way conflicts detected");
        }
        let strategy = conflict::choose_strategy(self.on_conflict.as_ref(), &conflicts);
        let resolved = conflict::resolve(&stale, &conflicts, pending, strategy);
        for mutation in resolved {
            self.apply_mutation(mutation).await?;
        }
        Ok(())
    }

    async fn hydrate_once(&self) -> Result<()> {
        let host = Arc::clone(&self.host);
        let apply = move |tree: Value| {
            host.set_state(&StatePatch::Value(tree), false);
        };
        let report = self
            .hydrator
            .run(&self.remote, &apply, self.on_hydrate.as_ref())
            .await?;

        *self.previous_state.lock() = self.host.get_state();
        self.has_hydrated.store(true, Ordering::SeqCst);
        if !report.coalesced && !report.reused_memo {
            self.metrics.record_hydration(report.elapsed);
        }
        self.update_reserved_mirror();
        Ok(())
    }

    fn handle_disconnected(&self) {
        let was_up = {
            let mut mirror = self.conn_mirror.lock();
            if *mirror == ConnectionState::Disconnected {
                return;
            }
            let was_up = matches!(
                *mirror,
                ConnectionState::Connected | ConnectionState::Reconnecting
            );
            *mirror = ConnectionState::Disconnected;
            was_up
        };
        if was_up {
            *self.state_before_disconnection.lock() = Some(self.host.get_state());
            self.has_hydrated.store(false, Ordering::SeqCst);
            debug!("connection lost, snapshotting pre-disconnect state");
        }
        self.update_reserved_mirror();
    }

    /// Reconnect in the background after a write while disconnected.
    fn spawn_reconnect(&self) {
        let Some(weak) = self.weak_self.get().cloned() else {
            return;
        };
        tokio::spawn(async move {
            let Some(manager) = weak.upgrade() else { return };
            if let Err(e) = manager.connect().await {
                warn!(error = %e, "reconnect-on-write failed");
            }
        });
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    fn set_conn_mirror(&self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        let mut mirror = self.conn_mirror.lock();
        if *mirror == to {
            return false;
        }
        let legal = matches!(
            (*mirror, to),
            (Disconnected, Connecting)
                | (Disconnected, Connected)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
        );
        if legal {
            *mirror = to;
        }
        legal
    }

    /// Mirror connection status, hydration flag, and metrics into the
    /// reserved `multiplayer` field of host state. Never published (the diff
    /// engine filters the reserved subtree).
    fn update_reserved_mirror(&self) {
        let mut reserved = Map::new();
        reserved.insert(
            "connectionState".into(),
            Value::String(self.connection_state().as_str().to_string()),
        );
        reserved.insert("hasHydrated".into(), Value::Bool(self.has_hydrated()));
        reserved.insert(
            "performanceMetrics".into(),
            self.metrics.snapshot().to_value(),
        );
        let mut patch = Map::new();
        patch.insert(RESERVED_FIELD.into(), Value::Object(reserved));
        self.host
            .set_state(&StatePatch::Value(Value::Object(patch)), false);
    }

    fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed() {
            Err(Error::Destroyed)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
