//! KeyCodec — bidirectional mapping between path-segment arrays and flat
//! storage keys.
//!
//! Every key is prefixed with the effective namespace, which carries a
//! z-factor discriminator (`{namespace}-z{n}`). Peers configured with
//! different decomposition depths therefore partition into disjoint key
//! ranges and never read each other's coalesced subtrees.

use crate::error::{Error, Result};

/// Separator between the namespace prefix and path segments, and between
/// segments themselves.
pub const KEY_SEPARATOR: char = ':';

/// Sentinel appended to the range start to form an exclusive upper bound.
/// Lexicographically above any escaped segment character.
const RANGE_SENTINEL: char = '\u{00FF}';

// ============================================================================
// KeyCodec
// ============================================================================

/// Builds and parses storage keys for one namespace.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    prefix: String,
}

impl KeyCodec {
    /// Create a codec for `namespace` at decomposition depth `z_factor`.
    /// The caller validates the namespace (see `config`).
    pub fn new(namespace: &str, z_factor: u8) -> Self {
        Self {
            prefix: format!("{namespace}-z{z_factor}"),
        }
    }

    /// The effective namespace prefix, discriminator included.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build a storage key from path segments: `{prefix}:seg1:…:segN`.
    /// Segments are escaped so user keys containing the separator round-trip.
    pub fn build(&self, path: &[String]) -> Result<String> {
        if path.is_empty() {
            return Err(Error::Configuration(
                "cannot build a storage key from an empty path".into(),
            ));
        }
        let mut key = String::with_capacity(self.prefix.len() + path.len() * 8);
        key.push_str(&self.prefix);
        for segment in path {
            key.push(KEY_SEPARATOR);
            key.push_str(&escape_segment(segment));
        }
        Ok(key)
    }

    /// Parse a storage key back into path segments.
    ///
    /// Returns `None` for keys outside this codec's namespace (foreign
    /// prefixes, other z-factors) and for keys with empty segments.
    pub fn parse(&self, key: &str) -> Option<ParsedKey> {
        let rest = key.strip_prefix(&self.prefix)?;
        let rest = rest.strip_prefix(KEY_SEPARATOR)?;
        if rest.is_empty() {
            return None;
        }
        let mut path = Vec::new();
        for raw in rest.split(KEY_SEPARATOR) {
            if raw.is_empty() {
                return None;
            }
            path.push(unescape_segment(raw));
        }
        let is_granular = path.len() > 1;
        Some(ParsedKey { path, is_granular })
    }

    /// Half-open lexicographic range covering every key in this namespace.
    pub fn range_bounds(&self) -> (String, String) {
        let start = format!("{}{}", self.prefix, KEY_SEPARATOR);
        let end = format!("{start}{RANGE_SENTINEL}");
        (start, end)
    }
}

/// A storage key decoded into its path segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub path: Vec<String>,
    /// True when the key addresses below the top level.
    pub is_granular: bool,
}

// ============================================================================
// Segment escaping
// ============================================================================

/// Escape `%` and the separator so `unescape_segment` is a left inverse.
fn escape_segment(segment: &str) -> String {
    if !segment.contains(['%', KEY_SEPARATOR]) {
        return segment.to_string();
    }
    let mut out = String::with_capacity(segment.len() + 4);
    for ch in segment.chars() {
        match ch {
            '%' => out.push_str("%25"),
            KEY_SEPARATOR => out.push_str("%3A"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_segment(segment: &str) -> String {
    if !segment.contains('%') {
        return segment.to_string();
    }
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let hex: String = chars.clone().take(2).collect();
        match hex.as_str() {
            "25" => {
                out.push('%');
                chars.next();
                chars.next();
            }
            "3A" | "3a" => {
                out.push(KEY_SEPARATOR);
                chars.next();
                chars.next();
            }
            _ => out.push(ch),
        }
    }
    out
}

// ============================================================================
// Tests
// ============================================================================
