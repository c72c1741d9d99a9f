//! Secret string type with automatic zeroization
//!
//! [`SecretString`] serializes as `[REDACTED]` so secrets never leak through
//! API views or logs. Records that must round-trip the real value through
//! the durable store opt in with `#[serde(with = "crate::secret::persisted")]`.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Placeholder written wherever a secret would otherwise appear
pub const REDACTED: &str = "[REDACTED]";

/// Secret string with automatic memory zeroization
///
/// The value is only reachable inside a closure passed to
/// [`expose_secret`](SecretString::expose_secret).
///
/// ```
/// use custodian_broker::SecretString;
///
/// let secret = SecretString::new("key-material");
/// assert_eq!(secret.expose_secret(|s| s.len()), 12);
/// assert_eq!(format!("{secret:?}"), "[REDACTED]");
/// ```
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretString {
    inner: String,
}

impl SecretString {
    /// Creates a new secret from any string-like value
    pub fn new<S: Into<String>>(s: S) -> Self {
        Self { inner: s.into() }
    }

    /// Accesses the secret value within a closure scope
    pub fn expose_secret<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        f(&self.inner)
    }

    /// Length without exposing content
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Emptiness without exposing content
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl Eq for SecretString {}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretString::new)
    }
}

/// Serde adapter that writes the real value, for durable records only
pub mod persisted {
    use super::SecretString;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes the exposed value
    pub fn serialize<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        secret.expose_secret(|value| serializer.serialize_str(value))
    }

    /// Deserializes a plain string into a secret
    pub fn deserialize<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretString::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Stored {
        #[serde(with = "persisted")]
        value: SecretString,
    }

    #[test]
    fn test_debug_and_display_are_redacted() {
        let secret = SecretString::new("hunter2");
        assert_eq!(format!("{secret:?}"), REDACTED);
        assert_eq!(secret.to_string(), REDACTED);
    }

    #[test]
    fn test_default_serialization_is_redacted() {
        let json = serde_json::to_string(&SecretString::new("hunter2")).unwrap();
        assert_eq!(json, "\"[REDACTED]\"");
    }

    #[test]
    fn test_persisted_adapter_keeps_value() {
        let stored = Stored {
            value: SecretString::new("hunter2"),
        };
        let json = serde_json::to_string(&stored).unwrap();
        assert!(json.contains("hunter2"));

        let back: Stored = serde_json::from_str(&json).unwrap();
        assert_eq!(back.value, SecretString::new("hunter2"));
    }

    #[test]
    fn test_len_without_exposing() {
        let secret = SecretString::new("12345");
        assert_eq!(secret.len(), 5);
        assert!(!secret.is_empty());
        assert!(SecretString::new("").is_empty());
    }
}
