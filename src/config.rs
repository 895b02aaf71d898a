//! Middleware options and construction-time validation.
//!
//! Invalid options are fatal: `MultiplayerStore::attach` validates before any
//! connection is made and returns `Error::Configuration`.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::auth::TokenProvider;
use crate::error::{Error, Result};
use crate::storage::retry::RetryConfig;
use crate::sync::types::{OnConflict, OnHydrate};

/// Default decomposition depth: top-level fields plus two levels of granular
/// keys.
pub const DEFAULT_Z_FACTOR: u8 = 2;
pub const MIN_Z_FACTOR: u8 = 0;
pub const MAX_Z_FACTOR: u8 = 10;

pub const MAX_NAMESPACE_LEN: usize = 100;

// ============================================================================
// Auth mode
// ============================================================================

/// Exactly one credential source. A raw API key suits trusted environments;
/// browsers and untrusted hosts go through a token provider.
#[derive(Clone)]
pub enum AuthMode {
    ApiKey(String),
    TokenProvider(Arc<dyn TokenProvider>),
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::ApiKey(_) => f.write_str("ApiKey(..)"),
            AuthMode::TokenProvider(_) => f.write_str("TokenProvider(..)"),
        }
    }
}

// ============================================================================
// Transport knobs
// ============================================================================

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-operation timeout on remote reads and writes.
    pub op_timeout: Duration,
    /// How long `destroy()` waits for in-flight operations.
    pub close_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// MultiplayerOptions
// ============================================================================

/// Options for one multiplayer store.
#[derive(Clone)]
pub struct MultiplayerOptions {
    /// Logical tenant / room id. Charset `[A-Za-z0-9_-]`, at most 100 chars.
    pub namespace: String,
    /// Remote KV endpoint (http(s) or ws(s) URL).
    pub api_base_url: String,
    pub auth: AuthMode,
    /// Decomposition depth cap; `None` uses [`DEFAULT_Z_FACTOR`].
    pub z_factor: Option<u8>,
    /// Fields to receive remote updates for; `None` means all.
    pub subscribe_to_updates_for: Option<Vec<String>>,
    /// Fields to publish; `None` means all.
    pub publish_updates_for: Option<Vec<String>>,
    /// Shorthand adding fields to both filters.
    pub sync: Vec<String>,
    pub on_hydrate: Option<OnHydrate>,
    pub on_conflict: Option<OnConflict>,
    /// Sample hydration latency into the metrics.
    pub profiling: bool,
    pub retry: RetryConfig,
    pub client: ClientConfig,
}

impl MultiplayerOptions {
    pub fn new(
        namespace: impl Into<String>,
        api_base_url: impl Into<String>,
        auth: AuthMode,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            api_base_url: api_base_url.into(),
            auth,
            z_factor: None,
            subscribe_to_updates_for: None,
            publish_updates_for: None,
            sync: Vec::new(),
            on_hydrate: None,
            on_conflict: None,
            profiling: false,
            retry: RetryConfig::default(),
            client: ClientConfig::default(),
        }
    }

    pub fn effective_z_factor(&self) -> u8 {
        self.z_factor.unwrap_or(DEFAULT_Z_FACTOR)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Configuration("namespace must not be empty".into()));
        }
        if self.namespace.len() > MAX_NAMESPACE_LEN {
            return Err(Error::Configuration(format!(
                "namespace exceeds {MAX_NAMESPACE_LEN} characters"
            )));
        }
        if !namespace_pattern().is_match(&self.namespace) {
            return Err(Error::Configuration(format!(
                "namespace {:?} contains disallowed characters (allowed: A-Z a-z 0-9 _ -)",
                self.namespace
            )));
        }
        validate_url(&self.api_base_url)?;
        if let AuthMode::ApiKey(key) = &self.auth {
            if key.is_empty() {
                return Err(Error::Configuration("apiKey must not be empty".into()));
            }
        }
        if let Some(z) = self.z_factor {
            if !(MIN_Z_FACTOR..=MAX_Z_FACTOR).contains(&z) {
                return Err(Error::Configuration(format!(
                    "zFactor {z} out of range [{MIN_Z_FACTOR}, {MAX_Z_FACTOR}]"
                )));
            }
        }
        Ok(())
    }
}

fn namespace_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static pattern compiles"))
}

fn validate_url(url: &str) -> Result<()> {
    let Some((scheme, rest)) = url.split_once("://") else {
        return Err(Error::Configuration(format!(
            "invalid apiBaseUrl {url:?}: missing scheme"
        )));
    };
    if !matches!(scheme, "http" | "https" | "ws" | "wss") {
        return Err(Error::Configuration(format!(
            "invalid apiBaseUrl scheme {scheme:?} (expected http, https, ws or wss)"
        )));
    }
    if rest.is_empty() || rest.starts_with('/') {
        return Err(Error::Configuration(format!(
            "invalid apiBaseUrl {url:?}: missing host"
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
