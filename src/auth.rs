//! Token provider seam and the token endpoint's wire shapes.
//!
//! The remote service grants short-lived bearer tokens scoped to a
//! namespace's key patterns. Hosts either hand the middleware a raw API key
//! (trusted environments) or implement [`TokenProvider`] against their token
//! endpoint. [`TokenCache`] refreshes proactively before expiry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::filter::{subscription_patterns, FieldFilter};
use crate::keys::KeyCodec;
use crate::storage::client::AuthToken;

/// Refresh this long before the grant expires.
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(60);

// ============================================================================
// Wire shapes
// ============================================================================

/// Body accepted by the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub namespace: String,
    pub subscribed_keys_and_patterns: Vec<String>,
}

impl TokenRequest {
    /// Build the request implied by a codec and subscribe filter: the
    /// subscription patterns plus the namespace-wide access pattern.
    pub fn scoped(codec: &KeyCodec, filter: &FieldFilter) -> Self {
        let mut patterns = subscription_patterns(codec, filter);
        let access = format!("{}:*", codec.prefix());
        if !patterns.contains(&access) {
            patterns.push(access);
        }
        Self {
            namespace: codec.prefix().to_string(),
            subscribed_keys_and_patterns: patterns,
        }
    }
}

/// Response from the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub namespace: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

// ============================================================================
// TokenProvider
// ============================================================================

/// Host-implemented credential source. Implementations typically POST the
/// request to their token endpoint and return the grant; failures should map
/// to `Error::Authentication`.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn issue(&self, request: &TokenRequest) -> Result<TokenGrant>;
}

/// Provider for deployments that connect with a raw API key. The key never
/// expires, so the cache issues it once.
pub struct ApiKeyProvider {
    key: String,
}

impl ApiKeyProvider {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl TokenProvider for ApiKeyProvider {
    async fn issue(&self, request: &TokenRequest) -> Result<TokenGrant> {
        Ok(TokenGrant {
            namespace: request.namespace.clone(),
            token: self.key.clone(),
            expires_at: None,
        })
    }
}

// ============================================================================
// TokenCache
// ============================================================================

/// Caches the current grant and refreshes it `refresh_buffer` before expiry.
pub struct TokenCache {
    provider: Arc<dyn TokenProvider>,
    request: TokenRequest,
    refresh_buffer: Duration,
    cached: Mutex<Option<TokenGrant>>,
}

impl TokenCache {
    pub fn new(provider: Arc<dyn TokenProvider>, request: TokenRequest) -> Self {
        Self::with_refresh_buffer(provider, request, DEFAULT_REFRESH_BUFFER)
    }

    pub fn with_refresh_buffer(
        provider: Arc<dyn TokenProvider>,
        request: TokenRequest,
        refresh_buffer: Duration,
    ) -> Self {
        Self {
            provider,
            request,
            refresh_buffer,
            cached: Mutex::new(None),
        }
    }

    /// The current credential, refreshed if missing or near expiry.
    pub async fn token(&self) -> Result<AuthToken> {
        if let Some(grant) = self.fresh_grant() {
            return Ok(AuthToken { token: grant.token });
        }
        debug!(namespace = %self.request.namespace, "refreshing access token");
        let grant = self.provider.issue(&self.request).await?;
        let token = grant.token.clone();
        *self.cached.lock() = Some(grant);
        Ok(AuthToken { token })
    }

    /// Drop the cached grant so the next `token()` re-issues.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }

    fn fresh_grant(&self) -> Option<TokenGrant> {
        let cached = self.cached.lock();
        let grant = cached.as_ref()?;
        match grant.expires_at {
            None => Some(grant.clone()),
            Some(expires_at) => {
                let buffer = chrono::Duration::from_std(self.refresh_buffer)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
                (Utc::now() + buffer < expires_at).then(|| grant.clone())
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
