//! Per-field allow-lists for publishing and subscribing, plus the key-pattern
//! matching used for token scoping and subscription checks.
//!
//! Filters operate on top-level fields: an allowed field admits every path
//! rooted at it. Key patterns support exact match and a `*` suffix wildcard
//! (`ns:todos:*` matches the field key itself and anything below it).

use crate::keys::{KeyCodec, KEY_SEPARATOR};
use crate::RESERVED_FIELD;

// ============================================================================
// FieldFilter
// ============================================================================

/// Allow-list over top-level state fields. `None` admits every field except
/// the reserved subtree.
#[derive(Debug, Clone, Default)]
pub struct FieldFilter {
    allow: Option<Vec<String>>,
}

impl FieldFilter {
    /// Admit all non-reserved fields.
    pub fn all() -> Self {
        Self { allow: None }
    }

    /// Admit only the listed fields. A trailing `:*` on an entry is accepted
    /// and stripped, so `todos` and `todos:*` configure the same field.
    pub fn from_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut allow: Vec<String> = fields
            .into_iter()
            .map(|f| {
                let f = f.into();
                match f.strip_suffix(":*") {
                    Some(base) => base.to_string(),
                    None => f,
                }
            })
            .filter(|f| !f.is_empty() && f != RESERVED_FIELD)
            .collect();
        allow.sort_unstable();
        allow.dedup();
        Self { allow: Some(allow) }
    }

    /// Merge explicit fields with the `sync` shorthand list; `None` + empty
    /// shorthand stays "all fields".
    pub fn from_options(fields: Option<&[String]>, sync: &[String]) -> Self {
        match (fields, sync.is_empty()) {
            (None, true) => Self::all(),
            (None, false) => Self::from_fields(sync.iter().cloned()),
            (Some(explicit), _) => {
                Self::from_fields(explicit.iter().chain(sync.iter()).cloned())
            }
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.allow.is_none()
    }

    /// Whether a top-level field passes the filter.
    pub fn matches_field(&self, field: &str) -> bool {
        if field == RESERVED_FIELD {
            return false;
        }
        match &self.allow {
            None => true,
            Some(allow) => allow.iter().any(|f| f == field),
        }
    }

    /// Whether a decomposed path passes the filter (judged by its first
    /// segment).
    pub fn matches_path(&self, path: &[String]) -> bool {
        path.first().is_some_and(|field| self.matches_field(field))
    }

    /// The configured fields, if restricted.
    pub fn fields(&self) -> Option<&[String]> {
        self.allow.as_deref()
    }
}

// ============================================================================
// Key patterns
// ============================================================================

/// Match a storage key against a pattern: exact equality, or a `*` suffix
/// that matches the pattern's stem itself and any key below it.
pub fn matches_key_pattern(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        None => key == pattern,
        Some(stem) => {
            key.starts_with(stem)
                || stem
                    .strip_suffix(KEY_SEPARATOR)
                    .is_some_and(|bare| key == bare)
        }
    }
}

/// Build the subscription key patterns this filter implies for a namespace.
/// Used both for the adapter's subscription and for token scoping.
pub fn subscription_patterns(codec: &KeyCodec, filter: &FieldFilter) -> Vec<String> {
    let prefix = codec.prefix();
    match filter.fields() {
        None => vec![format!("{prefix}{KEY_SEPARATOR}*")],
        Some(fields) => fields
            .iter()
            .map(|f| format!("{prefix}{KEY_SEPARATOR}{f}{KEY_SEPARATOR}*"))
            .collect(),
    }
}

// ============================================================================
// Tests
// ============================================================================
