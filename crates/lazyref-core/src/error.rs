//! Error types for identity and materialization operations.

use crate::identity::ObjectIdentity;
use std::fmt;

/// The primary error type for all lazyref operations.
#[derive(Debug)]
pub enum Error {
    /// Malformed identity construction input
    InvalidIdentity(IdentityError),
    /// A lazy reference or collection could not be materialized
    Materialization(MaterializationError),
    /// Collection bookkeeping recorded a member as both added and removed
    InconsistentRemoval(RemovalError),
    /// Configuration errors
    Config(ConfigError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct IdentityError {
    pub kind: IdentityErrorKind,
    /// Entity kind the identity was being built for (may be empty).
    pub entity_kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityErrorKind {
    /// Entity kind name is empty or not a valid identifier
    InvalidKind,
    /// No key values were supplied
    EmptyKey,
    /// A key component has a type that cannot take part in an identity
    UnsupportedValue,
    /// A textual identity or token could not be parsed
    Malformed,
    /// An in-place edit changed a tracked member's key
    KeyChanged,
}

#[derive(Debug)]
pub struct MaterializationError {
    pub kind: MaterializationErrorKind,
    /// Identity whose load failed, when the failure concerns a single object.
    pub identity: Option<ObjectIdentity>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializationErrorKind {
    /// Backing row does not exist
    NotFound,
    /// Store was temporarily unavailable (retry may succeed)
    TransientFailure,
    /// Connection context lacks permission for the load
    Unauthorized,
}

#[derive(Debug, Clone)]
pub struct RemovalError {
    pub identity: ObjectIdentity,
    pub relation: String,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl IdentityError {
    pub fn new(
        kind: IdentityErrorKind,
        entity_kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            entity_kind: entity_kind.into(),
            message: message.into(),
        }
    }
}

impl MaterializationError {
    /// Create an error of the given kind with no identity attached.
    pub fn new(kind: MaterializationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            identity: None,
            message: message.into(),
            source: None,
        }
    }

    /// The row behind `identity` does not exist.
    pub fn not_found(identity: &ObjectIdentity) -> Self {
        Self {
            kind: MaterializationErrorKind::NotFound,
            identity: Some(identity.clone()),
            message: format!("no row found for {identity}"),
            source: None,
        }
    }

    /// The store failed in a way that may succeed on retry.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(MaterializationErrorKind::TransientFailure, message)
    }

    /// The connection context is not permitted to load the object.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(MaterializationErrorKind::Unauthorized, message)
    }

    /// Attach the identity the failure concerns, unless one is already set.
    #[must_use]
    pub fn with_identity(mut self, identity: &ObjectIdentity) -> Self {
        if self.identity.is_none() {
            self.identity = Some(identity.clone());
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == MaterializationErrorKind::NotFound
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == MaterializationErrorKind::TransientFailure
    }
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

impl Error {
    /// Is this a transient materialization failure that a later call may clear?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Materialization(m) if m.is_retryable())
    }

    /// Did a materialization fail because the backing row is missing?
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Materialization(m) if m.is_not_found())
    }

    /// Get the materialization failure kind, if this is one.
    pub fn materialization_kind(&self) -> Option<MaterializationErrorKind> {
        match self {
            Error::Materialization(m) => Some(m.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidIdentity(e) => write!(f, "Invalid identity: {}", e),
            Error::Materialization(e) => write!(f, "Materialization failed: {}", e),
            Error::InconsistentRemoval(e) => write!(f, "Inconsistent removal: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Materialization(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entity_kind.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} (kind '{}')", self.message, self.entity_kind)
        }
    }
}

impl fmt::Display for MaterializationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MaterializationErrorKind::NotFound => "not found",
            MaterializationErrorKind::TransientFailure => "transient failure",
            MaterializationErrorKind::Unauthorized => "unauthorized",
        };
        f.write_str(name)
    }
}

impl fmt::Display for MaterializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identity {
            Some(identity) => write!(f, "{} for {}: {}", self.kind, identity, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl fmt::Display for RemovalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is recorded as both added to and removed from '{}'",
            self.identity, self.relation
        )
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IdentityError {}

impl std::error::Error for MaterializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl From<IdentityError> for Error {
    fn from(err: IdentityError) -> Self {
        Error::InvalidIdentity(err)
    }
}

impl From<MaterializationError> for Error {
    fn from(err: MaterializationError) -> Self {
        Error::Materialization(err)
    }
}

impl From<RemovalError> for Error {
    fn from(err: RemovalError) -> Self {
        Error::InconsistentRemoval(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for lazyref operations.
pub type Result<T> = std::result::Result<T, Error>;
