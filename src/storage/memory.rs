//! In-memory key-value service and client for tests and demos.
//!
//! One [`MemoryKvService`] plays the remote service; any number of
//! [`MemoryKvClient`]s attach to it, each behaving like an independent
//! transport connection. Notifications are delivered synchronously to every
//! connected client — echo suppression is the adapter's job, so the writer
//! hears its own writes too, exactly like the real service.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::client::{
    AuthToken, ConnectionListener, ConnectionState, KvClient, KvError, KvNotification,
    KvSubscription, NotificationListener,
};
use crate::filter::matches_key_pattern;

// ============================================================================
// Service
// ============================================================================

/// Shared in-memory service. Cheap to clone; clones share the same store.
#[derive(Clone, Default)]
pub struct MemoryKvService {
    inner: Arc<ServiceInner>,
}

#[derive(Default)]
struct ServiceInner {
    data: Mutex<BTreeMap<String, Value>>,
    clients: Mutex<Vec<Weak<ClientShared>>>,
    /// Fault injection: when set, writes fail with a retryable error.
    fail_writes: AtomicBool,
    /// Last token presented on any connect, for assertions.
    last_token: Mutex<Option<String>>,
}

impl MemoryKvService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client endpoint attached to this service.
    pub fn client(&self) -> MemoryKvClient {
        let shared = Arc::new(ClientShared::default());
        self.inner.clients.lock().push(Arc::downgrade(&shared));
        MemoryKvClient {
            service: self.clone(),
            shared,
        }
    }

    /// Snapshot of the stored keys and values.
    pub fn dump(&self) -> BTreeMap<String, Value> {
        self.inner.data.lock().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.data.lock().keys().cloned().collect()
    }

    /// Make subsequent writes fail with a retryable transport error.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The token presented on the most recent connect.
    pub fn last_token(&self) -> Option<String> {
        self.inner.last_token.lock().clone()
    }

    /// Drop every client connection, as a service outage would.
    pub fn break_connections(&self) {
        for client in self.connected_clients() {
            client.connected.store(false, Ordering::SeqCst);
            client.emit_connection(ConnectionState::Disconnected);
        }
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), KvError> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(KvError::new("injected write failure"));
        }
        self.inner
            .data
            .lock()
            .insert(key.to_string(), value.clone());
        self.notify(KvNotification {
            key: key.to_string(),
            value: Some(value.clone()),
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(KvError::new("injected write failure"));
        }
        let existed = self.inner.data.lock().remove(key).is_some();
        if existed {
            self.notify(KvNotification {
                key: key.to_string(),
                value: None,
                timestamp: chrono::Utc::now().timestamp_millis(),
            });
        }
        Ok(())
    }

    fn range(&self, start: &str, end: &str, limit: Option<usize>) -> Vec<(String, Value)> {
        let data = self.inner.data.lock();
        let iter = data
            .range(start.to_string()..end.to_string())
            .map(|(k, v)| (k.clone(), v.clone()));
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    /// Fan a notification out to every connected client. Listener snapshots
    /// are taken before delivery so listeners may re-enter the service.
    fn notify(&self, note: KvNotification) {
        for client in self.connected_clients() {
            client.deliver(&note);
        }
    }

    fn connected_clients(&self) -> Vec<Arc<ClientShared>> {
        let mut clients = self.inner.clients.lock();
        clients.retain(|weak| weak.strong_count() > 0);
        clients
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.connected.load(Ordering::SeqCst))
            .collect()
    }
}

// ============================================================================
// Client
// ============================================================================

#[derive(Default)]
struct ClientShared {
    connected: AtomicBool,
    next_id: AtomicU64,
    subs: Mutex<HashMap<u64, (Vec<String>, NotificationListener)>>,
    conn_listeners: Mutex<HashMap<u64, ConnectionListener>>,
}

impl ClientShared {
    fn deliver(&self, note: &KvNotification) {
        let listeners: Vec<(Vec<String>, NotificationListener)> = self
            .subs
            .lock()
            .values()
            .map(|(patterns, listener)| (patterns.clone(), Arc::clone(listener)))
            .collect();
        for (patterns, listener) in listeners {
            let matches = patterns.is_empty()
                || patterns.iter().any(|p| matches_key_pattern(&note.key, p));
            if matches {
                listener(note);
            }
        }
    }

    fn emit_connection(&self, state: ConnectionState) {
        let listeners: Vec<ConnectionListener> =
            self.conn_listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(state);
        }
    }
}

/// One transport connection to a [`MemoryKvService`].
pub struct MemoryKvClient {
    service: MemoryKvService,
    shared: Arc<ClientShared>,
}

impl MemoryKvClient {
    fn ensure_connected(&self) -> Result<(), KvError> {
        if self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KvError::new("not connected"))
        }
    }
}

#[async_trait]
impl KvClient for MemoryKvClient {
    async fn connect(&self, auth: &AuthToken) -> Result<(), KvError> {
        *self.service.inner.last_token.lock() = Some(auth.token.clone());
        if !self.shared.connected.swap(true, Ordering::SeqCst) {
            self.shared.emit_connection(ConnectionState::Connected);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), KvError> {
        if self.shared.connected.swap(false, Ordering::SeqCst) {
            self.shared.emit_connection(ConnectionState::Disconnected);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        self.ensure_connected()?;
        Ok(self.service.inner.data.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), KvError> {
        self.ensure_connected()?;
        self.service.set(key, value)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.ensure_connected()?;
        self.service.delete(key)
    }

    async fn range(
        &self,
        start: &str,
        end: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Value)>, KvError> {
        self.ensure_connected()?;
        Ok(self.service.range(start, end, limit))
    }

    fn on_notification(
        &self,
        patterns: Vec<String>,
        listener: NotificationListener,
    ) -> KvSubscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.subs.lock().insert(id, (patterns, listener));
        let shared = Arc::clone(&self.shared);
        KvSubscription::new(move || {
            shared.subs.lock().remove(&id);
        })
    }

    fn on_connection(&self, listener: ConnectionListener) -> KvSubscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.conn_listeners.lock().insert(id, listener);
        let shared = Arc::clone(&self.shared);
        KvSubscription::new(move || {
            shared.conn_listeners.lock().remove(&id);
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
