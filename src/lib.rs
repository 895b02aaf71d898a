//! roomsync — multiplayer middleware for observable key/value state.
//!
//! Attaches to a host [`store::StateStore`] and replicates it through a
//! remote key-value service reached over a persistent connection. Any number
//! of peers attach to the same namespace; each applies local mutations
//! through [`MultiplayerStore::set`] and observes remote peers' mutations
//! merged into its own state.
//!
//! State trees are decomposed into flat storage keys up to a configurable
//! depth (the z-factor), diffed leaf-by-leaf on every local mutation, and
//! reassembled on hydration. Mutations issued while disconnected or
//! un-hydrated buffer in a sync queue and replay on reconnect, with
//! three-way conflict resolution when the remote moved in the meantime.
//!
//! The transport ([`storage::KvClient`]) and credential source
//! ([`auth::TokenProvider`]) are host-provided; [`storage::MemoryKvService`]
//! ships for tests and demos.

pub mod auth;
pub mod config;
pub mod error;
pub mod filter;
pub mod keys;
pub mod metrics;
pub mod state;
pub mod storage;
pub mod store;
pub mod sync;

use std::sync::Arc;

use serde_json::Value;

/// Top-level field owned by the middleware: connection status, hydration
/// flag, and performance metrics. Never persisted to the remote store.
pub const RESERVED_FIELD: &str = "multiplayer";

pub use auth::{TokenGrant, TokenProvider, TokenRequest};
pub use config::{
    AuthMode, ClientConfig, MultiplayerOptions, DEFAULT_Z_FACTOR, MAX_Z_FACTOR, MIN_Z_FACTOR,
};
pub use error::{Error, Result};
pub use filter::FieldFilter;
pub use keys::KeyCodec;
pub use metrics::MetricsSnapshot;
pub use storage::{ConnectionState, KvClient, MemoryKvService, RetryConfig};
pub use store::{MemoryStateStore, StateStore};
pub use sync::{Conflict, ConflictStrategy, StatePatch, SyncManager};

// ============================================================================
// MultiplayerStore
// ============================================================================

/// Handle to one multiplayer-enabled store.
///
/// Wraps the orchestrator: local mutations go through [`set`](Self::set),
/// remote updates land in the host store automatically. Dropping the handle
/// does not tear anything down; call [`destroy`](Self::destroy).
pub struct MultiplayerStore {
    manager: Arc<SyncManager>,
}

impl MultiplayerStore {
    /// Attach the middleware to a host store over the given transport.
    ///
    /// Validates options and wires listeners; a tokio runtime must be
    /// current. Does not connect — call [`connect`](Self::connect), or let
    /// the first `set` while disconnected trigger one.
    pub fn attach(
        host: Arc<dyn StateStore>,
        client: Arc<dyn KvClient>,
        options: MultiplayerOptions,
    ) -> Result<Self> {
        Ok(Self {
            manager: SyncManager::attach(host, client, options)?,
        })
    }

    /// Apply a local mutation (top-level shallow merge).
    pub async fn set(&self, patch: impl Into<StatePatch>) -> Result<()> {
        self.manager.set(patch.into(), false).await
    }

    /// Apply a local mutation that replaces the whole tree.
    pub async fn set_replace(&self, patch: impl Into<StatePatch>) -> Result<()> {
        self.manager.set(patch.into(), true).await
    }

    /// Current host state snapshot.
    pub fn state(&self) -> Value {
        self.manager.host().get_state()
    }

    pub async fn connect(&self) -> Result<()> {
        self.manager.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.manager.disconnect().await
    }

    /// Re-run hydration against the current remote contents.
    pub async fn re_hydrate(&self) -> Result<()> {
        self.manager.re_hydrate().await
    }

    /// Delete every key in this namespace from the remote store.
    pub async fn clear_storage(&self) -> Result<()> {
        self.manager.clear_storage().await
    }

    /// Tear down the middleware. Subsequent operations fail with
    /// [`Error::Destroyed`].
    pub async fn destroy(&self) {
        self.manager.destroy().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.connection_state()
    }

    pub fn has_hydrated(&self) -> bool {
        self.manager.has_hydrated()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.manager.metrics()
    }

    /// This peer's unique client id, stamped on every write envelope.
    pub fn client_id(&self) -> &str {
        self.manager.client_id()
    }

    /// Mutations buffered while disconnected or un-hydrated.
    pub fn pending_mutations(&self) -> usize {
        self.manager.pending_mutations()
    }
}
