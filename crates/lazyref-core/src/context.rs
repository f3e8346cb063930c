//! Connection context keys.
//!
//! A `ConnectionContextKey` says which logical data source and credentials a
//! lazy reference must be materialized against. A process may hold proxies
//! bound to several data sources at once, so the key travels with every
//! `ReferenceHandle` instead of being looked up from a process-wide default.

use crate::error::{ConfigError, Error, Result};
use crate::identity::is_valid_name;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Immutable (alias, principal, credential) routing key.
///
/// Equality and hashing cover all three fields. The credential is never shown
/// by `Debug` or `Display`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionContextKey {
    alias: String,
    #[serde(default)]
    principal: String,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    credential: Option<String>,
}

impl ConnectionContextKey {
    /// Create a key for `alias` connecting as `principal`, with no credential.
    pub fn new(alias: impl Into<String>, principal: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            principal: principal.into(),
            credential: None,
        }
    }

    /// Set the credential. An empty credential is treated as absent.
    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        let credential = credential.into();
        self.credential = if credential.is_empty() {
            None
        } else {
            Some(credential)
        };
        self
    }

    /// Parse a connection profile from JSON.
    ///
    /// ```
    /// use lazyref_core::ConnectionContextKey;
    ///
    /// let key = ConnectionContextKey::from_json(
    ///     r#"{"alias": "default", "principal": "sa", "credential": ""}"#,
    /// )
    /// .unwrap();
    /// assert_eq!(key, ConnectionContextKey::new("default", "sa"));
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let key: Self = serde_json::from_str(json)?;
        key.validate()
    }

    /// Check that the alias is a usable name.
    pub fn validate(self) -> Result<Self> {
        if is_valid_name(&self.alias) {
            Ok(self)
        } else {
            Err(Error::Config(ConfigError::new(format!(
                "invalid connection alias '{}'",
                self.alias
            ))))
        }
    }

    /// Logical data source alias.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Principal (user) the connection is opened as.
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Credential, if any.
    pub fn credential_value(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    /// Does this key carry a credential?
    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }
}

/// An empty credential deserializes as absent, like `credential("")`.
fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let credential = Option::<String>::deserialize(deserializer)?;
    Ok(credential.filter(|c| !c.is_empty()))
}

impl fmt::Debug for ConnectionContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContextKey")
            .field("alias", &self.alias)
            .field("principal", &self.principal)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Display for ConnectionContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.principal, self.alias)
    }
}
