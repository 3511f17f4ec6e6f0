//! Domain model types for Sigilkeep.
//!
//! This module defines the identifiers shared by every component:
//! - [`BackendId`] - Discriminant that selects a secret backend (e.g., "vault")
//! - [`SecretRef`] - A parsed `${backend:name[#version]}` reference
//! - [`CacheKey`] - `(backend, name, version-or-latest)` key of the resolution cache

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SecretError;

/// Version label used in cache keys when a reference does not pin a version.
pub const LATEST: &str = "latest";

/// Identifier for a secret backend (e.g., "aws", "azure", "vault").
///
/// Backend IDs are the discriminant in a secret reference and are normalized
/// to lowercase.
///
/// # Examples
///
/// ```
/// use sigilkeep_core::BackendId;
///
/// let vault = BackendId::new("Vault");
/// assert_eq!(vault.as_str(), "vault");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendId(String);

impl BackendId {
    /// Create a new backend ID.
    ///
    /// The ID is normalized to lowercase.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().to_lowercase())
    }

    /// Get the backend ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BackendId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for BackendId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// A parsed secret reference.
///
/// # Format
///
/// `${backend:name}` or `${backend:name#version}`. An absent version (or the
/// literal `latest`) means the latest version.
///
/// # Examples
///
/// ```
/// use sigilkeep_core::SecretRef;
///
/// let r = SecretRef::parse("${vault:db/password#3}").unwrap();
/// assert_eq!(r.backend.as_str(), "vault");
/// assert_eq!(r.name, "db/password");
/// assert_eq!(r.version.as_deref(), Some("3"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    /// Backend discriminant.
    pub backend: BackendId,

    /// Backend-specific secret name.
    pub name: String,

    /// Pinned version, `None` for latest.
    pub version: Option<String>,
}

impl SecretRef {
    /// Create a reference to the latest version of a secret.
    pub fn new(backend: impl Into<BackendId>, name: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            name: name.into(),
            version: None,
        }
    }

    /// Pin the reference to a specific version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        self.version = if version == LATEST { None } else { Some(version) };
        self
    }

    /// Parse a `${backend:name[#version]}` reference.
    pub fn parse(reference: &str) -> Result<Self, SecretError> {
        let invalid = |message: &str| SecretError::InvalidReference {
            reference: reference.to_string(),
            message: message.to_string(),
        };

        let body = reference
            .trim()
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(|| invalid("expected ${backend:name[#version]}"))?;

        let (backend, path) = body
            .split_once(':')
            .ok_or_else(|| invalid("missing ':' between backend and name"))?;

        if backend.is_empty() {
            return Err(invalid("backend cannot be empty"));
        }

        let (name, version) = match path.rsplit_once('#') {
            Some((_, "")) => return Err(invalid("version cannot be empty")),
            Some((name, version)) => (name, Some(version)),
            None => (path, None),
        };

        if name.is_empty() {
            return Err(invalid("name cannot be empty"));
        }

        let mut secret_ref = Self::new(backend, name);
        if let Some(version) = version {
            secret_ref = secret_ref.with_version(version);
        }
        Ok(secret_ref)
    }

    /// The cache key this reference resolves through.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(
            self.backend.clone(),
            self.name.clone(),
            self.version.clone(),
        )
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "${{{}:{}#{}}}", self.backend, self.name, version),
            None => write!(f, "${{{}:{}}}", self.backend, self.name),
        }
    }
}

impl FromStr for SecretRef {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Check if a string is exactly one secret reference.
pub fn is_reference(s: &str) -> bool {
    let s = s.trim();
    s.starts_with("${") && s.ends_with('}') && s[2..].find("${").is_none()
}

/// Locate every `${...}` span inside a string.
///
/// Returns byte ranges including the delimiters. Unterminated spans are
/// ignored.
pub fn find_references(text: &str) -> Vec<std::ops::Range<usize>> {
    let mut spans = Vec::new();
    let mut offset = 0;
    while let Some(start) = text[offset..].find("${") {
        let start = offset + start;
        match text[start..].find('}') {
            Some(len) => {
                let end = start + len + 1;
                spans.push(start..end);
                offset = end;
            }
            None => break,
        }
    }
    spans
}

/// Key of an entry in the resolution cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub backend: BackendId,
    pub name: String,
    /// Pinned version, `None` for latest.
    pub version: Option<String>,
}

impl CacheKey {
    pub fn new(backend: BackendId, name: impl Into<String>, version: Option<String>) -> Self {
        Self {
            backend,
            name: name.into(),
            version,
        }
    }

    /// Key for the latest version of a secret.
    pub fn latest(backend: impl Into<BackendId>, name: impl Into<String>) -> Self {
        Self::new(backend.into(), name, None)
    }

    /// Version label, `"latest"` when unpinned.
    pub fn version_label(&self) -> &str {
        self.version.as_deref().unwrap_or(LATEST)
    }

    /// Whether this key belongs to the given secret, regardless of version.
    pub fn matches(&self, backend: &BackendId, name: &str) -> bool {
        &self.backend == backend && self.name == name
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.backend, self.name, self.version_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_id_normalization() {
        let id = BackendId::new("AWS");
        assert_eq!(id.as_str(), "aws");
    }

    #[test]
    fn test_parse_valid_references() {
        let cases = vec![
            ("${aws:prod/api-key}", "aws", "prod/api-key", None),
            ("${vault:db/password#3}", "vault", "db/password", Some("3")),
            ("${azure:tls-cert#latest}", "azure", "tls-cert", None),
            ("  ${Vault:a:b}  ", "vault", "a:b", None),
            ("${vault:name#with#hash#v2}", "vault", "name#with#hash", Some("v2")),
        ];

        for (input, backend, name, version) in cases {
            let r = SecretRef::parse(input).unwrap();
            assert_eq!(r.backend.as_str(), backend, "backend mismatch for {}", input);
            assert_eq!(r.name, name, "name mismatch for {}", input);
            assert_eq!(r.version.as_deref(), version, "version mismatch for {}", input);
        }
    }

    #[test]
    fn test_parse_invalid_references() {
        let cases = vec![
            "vault:db/password",
            "${vault}",
            "${:name}",
            "${vault:}",
            "${vault:name#}",
            "${vault:name",
        ];

        for input in cases {
            let result = SecretRef::parse(input);
            assert!(
                matches!(result, Err(SecretError::InvalidReference { .. })),
                "expected error for {}",
                input
            );
        }
    }

    #[test]
    fn test_display_matches_syntax() {
        let r = SecretRef::new("vault", "db").with_version("7");
        assert_eq!(r.to_string(), "${vault:db#7}");
        assert_eq!(SecretRef::new("aws", "key").to_string(), "${aws:key}");
    }

    #[test]
    fn test_cache_key_labels() {
        let key = SecretRef::parse("${vault:db}").unwrap().cache_key();
        assert_eq!(key.version_label(), "latest");
        assert_eq!(key.to_string(), "vault:db#latest");
        assert!(key.matches(&BackendId::new("vault"), "db"));
        assert!(!key.matches(&BackendId::new("vault"), "db2"));
    }

    #[test]
    fn test_find_references() {
        let text = "postgres://${vault:db/user}:${vault:db/pass#2}@host/${unterminated";
        let spans = find_references(text);
        assert_eq!(spans.len(), 2);
        assert_eq!(&text[spans[0].clone()], "${vault:db/user}");
        assert_eq!(&text[spans[1].clone()], "${vault:db/pass#2}");

        assert!(is_reference("${aws:x}"));
        assert!(!is_reference("prefix ${aws:x}"));
    }
}
