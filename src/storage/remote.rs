//! RemoteStore — adapter over the external KV transport.
//!
//! Wraps every write in the client-stamped envelope, suppresses echoes of our
//! own writes, runs all I/O through the retry policy, and maintains the
//! connection state machine that the orchestrator observes.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::client::{
    AuthToken, ConnectionListener, ConnectionState, KvClient, KvNotification, KvSubscription,
};
use super::retry::{RetryConfig, RetryPolicy};
use crate::config::ClientConfig;
use crate::error::{Error, Result};

// ============================================================================
// Envelope
// ============================================================================

/// Wrap a value in the persisted envelope, stamping our client id.
fn wrap(value: &Value, client_id: &str) -> Value {
    json!({
        "value": value,
        "clientId": client_id,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    })
}

/// Unwrap a stored payload. Wrapped envelopes yield their inner value and
/// origin; bare values (foreign writers, older data) pass through unchanged.
fn unwrap(stored: &Value) -> (Value, Option<String>) {
    if let Some(map) = stored.as_object() {
        if map.contains_key("value") && map.contains_key("clientId") {
            let origin = map["clientId"].as_str().map(str::to_string);
            return (map["value"].clone(), origin);
        }
    }
    (stored.clone(), None)
}

// ============================================================================
// Change events
// ============================================================================

/// A remote change after envelope unwrapping and echo suppression.
/// `value: None` means the key was deleted.
#[derive(Debug, Clone)]
pub struct RemoteChange {
    pub key: String,
    pub value: Option<Value>,
    pub timestamp: i64,
}

pub type ChangeListener = Arc<dyn Fn(&RemoteChange) + Send + Sync>;

// ============================================================================
// RemoteStore
// ============================================================================

pub struct RemoteStore {
    inner: Arc<RemoteInner>,
    /// Registrations on the underlying client; dropped on destroy.
    client_subs: Mutex<Vec<KvSubscription>>,
}

struct RemoteInner {
    client: Arc<dyn KvClient>,
    retry: RetryPolicy,
    client_id: String,
    timeouts: ClientConfig,
    /// Namespace range, used by `range_all` and `clear`.
    bounds: (String, String),
    state: Mutex<ConnectionState>,
    change_listeners: Mutex<HashMap<u64, ChangeListener>>,
    conn_listeners: Mutex<HashMap<u64, ConnectionListener>>,
    next_listener: AtomicU64,
    inflight: AtomicUsize,
    inflight_done: Notify,
    destroyed: AtomicBool,
}

impl RemoteStore {
    pub fn new(
        client: Arc<dyn KvClient>,
        subscribe_patterns: Vec<String>,
        bounds: (String, String),
        client_id: String,
        retry: RetryConfig,
        timeouts: ClientConfig,
    ) -> Self {
        let inner = Arc::new(RemoteInner {
            client: Arc::clone(&client),
            retry: RetryPolicy::new(retry),
            client_id,
            timeouts,
            bounds,
            state: Mutex::new(ConnectionState::Disconnected),
            change_listeners: Mutex::new(HashMap::new()),
            conn_listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(0),
            inflight: AtomicUsize::new(0),
            inflight_done: Notify::new(),
            destroyed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let note_sub = client.on_notification(
            subscribe_patterns,
            Arc::new(move |note: &KvNotification| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_notification(note);
                }
            }),
        );

        let weak = Arc::downgrade(&inner);
        let conn_sub = client.on_connection(Arc::new(move |state: ConnectionState| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_client_connection(state);
            }
        }));

        Self {
            inner,
            client_subs: Mutex::new(vec![note_sub, conn_sub]),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe unwrapped remote changes (own writes already suppressed).
    pub fn on_change(&self, listener: ChangeListener) -> KvSubscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        self.inner.change_listeners.lock().insert(id, listener);
        let weak = Arc::downgrade(&self.inner);
        KvSubscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.change_listeners.lock().remove(&id);
            }
        })
    }

    /// Observe connection state transitions.
    pub fn on_connection_change(&self, listener: ConnectionListener) -> KvSubscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        self.inner.conn_listeners.lock().insert(id, listener);
        let weak = Arc::downgrade(&self.inner);
        KvSubscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.conn_listeners.lock().remove(&id);
            }
        })
    }

    pub async fn connect(&self, auth: &AuthToken) -> Result<()> {
        self.ensure_alive()?;
        self.inner.transition(ConnectionState::Connecting);
        let connected = tokio::time::timeout(
            self.inner.timeouts.op_timeout,
            self.inner.client.connect(auth),
        )
        .await;
        match connected {
            Ok(Ok(())) => {
                self.inner.transition(ConnectionState::Connected);
                Ok(())
            }
            Ok(Err(e)) => {
                self.inner.transition(ConnectionState::Disconnected);
                Err(e.into())
            }
            Err(_) => {
                self.inner.transition(ConnectionState::Disconnected);
                Err(Error::Timeout(self.inner.timeouts.op_timeout))
            }
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        let _ = self.inner.client.disconnect().await;
        self.inner.transition(ConnectionState::Disconnected);
        Ok(())
    }

    pub async fn set_item(&self, key: &str, value: &Value) -> Result<()> {
        self.ensure_alive()?;
        let envelope = wrap(value, &self.inner.client_id);
        let _guard = begin_op(&self.inner);
        let inner = &self.inner;
        inner
            .retry
            .run(|| {
                let envelope = envelope.clone();
                async move {
                    inner
                        .with_timeout(inner.client.set(key, &envelope))
                        .await
                }
            })
            .await
    }

    pub async fn remove_item(&self, key: &str) -> Result<()> {
        self.ensure_alive()?;
        let _guard = begin_op(&self.inner);
        let inner = &self.inner;
        inner
            .retry
            .run(|| async move { inner.with_timeout(inner.client.delete(key)).await })
            .await
    }

    /// Range-scan the whole namespace, unwrapping envelopes.
    pub async fn range_all(&self) -> Result<Vec<(String, Value)>> {
        self.ensure_alive()?;
        let _guard = begin_op(&self.inner);
        let inner = &self.inner;
        let (start, end) = inner.bounds.clone();
        let raw = inner
            .retry
            .run(|| {
                let (start, end) = (start.clone(), end.clone());
                async move {
                    inner
                        .with_timeout(inner.client.range(&start, &end, None))
                        .await
                }
            })
            .await?;
        Ok(raw
            .into_iter()
            .map(|(key, stored)| {
                let (value, _) = unwrap(&stored);
                (key, value)
            })
            .collect())
    }

    /// Delete every key in the namespace.
    pub async fn clear(&self) -> Result<()> {
        self.ensure_alive()?;
        let keys: Vec<String> = {
            let _guard = begin_op(&self.inner);
            let inner = &self.inner;
            let (start, end) = inner.bounds.clone();
            inner
                .retry
                .run(|| {
                    let (start, end) = (start.clone(), end.clone());
                    async move {
                        inner
                            .with_timeout(inner.client.range(&start, &end, None))
                            .await
                    }
                })
                .await?
                .into_iter()
                .map(|(key, _)| key)
                .collect()
        };
        for key in keys {
            self.remove_item(&key).await?;
        }
        Ok(())
    }

    /// Wait for in-flight operations (bounded), then disconnect and drop the
    /// client registrations. Idempotent.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let waited = tokio::time::timeout(self.inner.timeouts.close_timeout, async {
            while self.inner.inflight.load(Ordering::SeqCst) > 0 {
                self.inner.inflight_done.notified().await;
            }
        })
        .await;
        if waited.is_err() {
            warn!(
                inflight = self.inner.inflight.load(Ordering::SeqCst),
                "close timed out with operations in flight"
            );
        }
        let _ = self.inner.client.disconnect().await;
        self.inner.transition(ConnectionState::Disconnected);
        self.client_subs.lock().clear();
        self.inner.change_listeners.lock().clear();
        self.inner.conn_listeners.lock().clear();
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            Err(Error::Destroyed)
        } else {
            Ok(())
        }
    }
}

impl RemoteInner {
    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = std::result::Result<T, super::client::KvError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeouts.op_timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout(self.timeouts.op_timeout)),
        }
    }

    /// Apply a state transition if legal; emit to listeners when it changes
    /// the state. Illegal transitions (transport double-reports) are ignored.
    fn transition(&self, to: ConnectionState) {
        use ConnectionState::*;
        let mut state = self.state.lock();
        let from = *state;
        let legal = matches!(
            (from, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
        );
        if !legal {
            if from != to {
                debug!(%from, %to, "ignoring illegal connection transition");
            }
            return;
        }
        *state = to;
        drop(state);
        debug!(%from, %to, "connection state changed");
        let listeners: Vec<ConnectionListener> =
            self.conn_listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(to);
        }
    }

    /// Map transport-reported connection changes onto the state machine.
    /// A drop while connected becomes DISCONNECTED; a transport that starts
    /// recovering reports RECONNECTING, then CONNECTED.
    fn handle_client_connection(&self, reported: ConnectionState) {
        let current = *self.state.lock();
        match (current, reported) {
            // Our own connect()/disconnect() already drove the machine.
            (ConnectionState::Connecting, ConnectionState::Connected) => {}
            (ConnectionState::Disconnected, ConnectionState::Disconnected) => {}
            // A transport that reconnected on its own skips CONNECTING.
            (ConnectionState::Disconnected, ConnectionState::Connected) => {
                self.transition(ConnectionState::Connecting);
                self.transition(ConnectionState::Connected);
            }
            _ => self.transition(reported),
        }
    }

    fn handle_notification(&self, note: &KvNotification) {
        let change = match &note.value {
            None => RemoteChange {
                key: note.key.clone(),
                value: None,
                timestamp: note.timestamp,
            },
            // A raw null payload is a tombstone; an envelope whose inner
            // value is null is a stored null.
            Some(Value::Null) => RemoteChange {
                key: note.key.clone(),
                value: None,
                timestamp: note.timestamp,
            },
            Some(stored) => {
                let (value, origin) = unwrap(stored);
                if origin.as_deref() == Some(self.client_id.as_str()) {
                    return;
                }
                RemoteChange {
                    key: note.key.clone(),
                    value: Some(value),
                    timestamp: note.timestamp,
                }
            }
        };
        let listeners: Vec<ChangeListener> =
            self.change_listeners.lock().values().cloned().collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&change))).is_err() {
                warn!(key = %change.key, "change listener panicked");
            }
        }
    }
}

/// Tracks one in-flight operation for `destroy()`'s bounded wait.
fn begin_op(inner: &Arc<RemoteInner>) -> OpGuard {
    inner.inflight.fetch_add(1, Ordering::SeqCst);
    OpGuard {
        inner: Arc::clone(inner),
    }
}

struct OpGuard {
    inner: Arc<RemoteInner>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        if self.inner.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.inflight_done.notify_waiters();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
