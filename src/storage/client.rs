//! KvClient — the external remote key-value transport seam.
//!
//! Implementations own the persistent bidirectional connection (WebSocket or
//! otherwise) and deliver change notifications for subscribed key patterns.
//! The crate ships [`super::memory::MemoryKvClient`] for tests and demos;
//! production transports are provided by the host.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Error;

// ============================================================================
// Transport errors
// ============================================================================

/// Transport-level error. `retryable` failures go through the retry policy;
/// permanent ones surface immediately.
#[derive(Debug, Clone)]
pub struct KvError {
    pub message: String,
    pub retryable: bool,
}

impl KvError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for KvError {}

impl From<KvError> for Error {
    fn from(e: KvError) -> Self {
        Error::Network {
            message: e.message,
            retryable: e.retryable,
        }
    }
}

// ============================================================================
// Connection state
// ============================================================================

/// Connection lifecycle as reported by the transport:
/// `Disconnected → Connecting → Connected → (Reconnecting → Connected |
/// Disconnected)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Wire/state-mirror spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// A change event for one key. `value: None` means the key was deleted.
/// The value is the stored envelope, unwrapped by the adapter.
#[derive(Debug, Clone)]
pub struct KvNotification {
    pub key: String,
    pub value: Option<Value>,
    /// Epoch milliseconds assigned by the service.
    pub timestamp: i64,
}

pub type NotificationListener = Arc<dyn Fn(&KvNotification) + Send + Sync>;
pub type ConnectionListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Listener registration; unsubscribes when dropped.
pub struct KvSubscription {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl KvSubscription {
    pub fn new(remove: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// A subscription that has nothing to remove.
    pub fn noop() -> Self {
        Self { remove: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for KvSubscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for KvSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KvSubscription")
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Bearer credential handed to the transport on connect.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub token: String,
}

// ============================================================================
// KvClient
// ============================================================================

/// Host-implemented remote key-value transport.
///
/// Mirrors the subscription client of the backing service: connection
/// lifecycle, point reads/writes, lexicographic range scans, and change
/// notifications for keys matching the subscribed patterns.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn connect(&self, auth: &AuthToken) -> Result<(), KvError>;
    async fn disconnect(&self) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, KvError>;
    async fn set(&self, key: &str, value: &Value) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Keys in `[start, end)`, ascending, with an optional limit.
    async fn range(
        &self,
        start: &str,
        end: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Value)>, KvError>;

    /// Deliver notifications for keys matching any of `patterns`
    /// (exact or `*`-suffix) while connected.
    fn on_notification(
        &self,
        patterns: Vec<String>,
        listener: NotificationListener,
    ) -> KvSubscription;

    /// Observe transport connection transitions.
    fn on_connection(&self, listener: ConnectionListener) -> KvSubscription;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_error_maps_to_network_error() {
        let err: Error = KvError::new("reset by peer").into();
        assert!(err.is_retryable());
        let err: Error = KvError::permanent("bad request").into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn connection_state_spelling() {
        assert_eq!(ConnectionState::Disconnected.as_str(), "DISCONNECTED");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "RECONNECTING");
    }

    #[test]
    fn subscription_runs_removal_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = KvSubscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = Arc::clone(&count);
        drop(KvSubscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
