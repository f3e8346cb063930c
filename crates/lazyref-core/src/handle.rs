//! Reference handles: the indirection unit shared by all lazy wrappers.
//!
//! A `ReferenceHandle` binds an `ObjectIdentity` and a `ConnectionContextKey`
//! to an `EntityLoader`, and caches the loaded object once a load succeeds.
//!
//! # State machine
//!
//! - `Pending` → `Materialized` when a load succeeds (at most once per handle).
//! - `Pending` → `Pending` when a load fails; the next `resolve()` retries.
//!
//! There is no way back to `Pending`: once cached, the value is authoritative
//! for the handle's lifetime even if the backing row changes.
//!
//! # Concurrent first access
//!
//! `resolve()` takes a per-handle load gate before calling the loader. A caller
//! that arrives while a load is in flight blocks on the gate and then finds the
//! cached value, so at most one external load runs per handle at any time. If
//! the in-flight load fails, the waiting caller performs its own attempt.

use crate::context::ConnectionContextKey;
use crate::error::{Error, MaterializationError, Result};
use crate::identity::ObjectIdentity;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Result of a single-object load: `Ok(None)` when the row is missing.
pub type LoadResult<E> = std::result::Result<Option<E>, MaterializationError>;

/// Store-layer collaborator that loads one object by identity.
///
/// `Ok(None)` means the row does not exist; the handle reports it as a
/// `NotFound` materialization failure.
pub trait EntityLoader<E>: Send + Sync {
    fn load_by_identity(
        &self,
        identity: &ObjectIdentity,
        context: &ConnectionContextKey,
    ) -> LoadResult<E>;
}

impl<E, F> EntityLoader<E> for F
where
    F: Fn(&ObjectIdentity, &ConnectionContextKey) -> LoadResult<E> + Send + Sync,
{
    fn load_by_identity(
        &self,
        identity: &ObjectIdentity,
        context: &ConnectionContextKey,
    ) -> LoadResult<E> {
        self(identity, context)
    }
}

/// Materialization state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializationState {
    Pending,
    Materialized,
}

pub struct ReferenceHandle<E> {
    identity: ObjectIdentity,
    context: Arc<ConnectionContextKey>,
    loader: Option<Arc<dyn EntityLoader<E>>>,
    value: OnceLock<E>,
    gate: Mutex<()>,
    attempts: AtomicUsize,
}

impl<E> ReferenceHandle<E> {
    /// Create a pending handle.
    pub fn new(
        identity: ObjectIdentity,
        context: Arc<ConnectionContextKey>,
        loader: Arc<dyn EntityLoader<E>>,
    ) -> Self {
        Self {
            identity,
            context,
            loader: Some(loader),
            value: OnceLock::new(),
            gate: Mutex::new(()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Create a handle that is already materialized with `entity`.
    pub fn materialized(
        identity: ObjectIdentity,
        context: Arc<ConnectionContextKey>,
        entity: E,
    ) -> Self {
        let value = OnceLock::new();
        let _ = value.set(entity);
        Self {
            identity,
            context,
            loader: None,
            value,
            gate: Mutex::new(()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Return the cached object, loading it first if the handle is pending.
    ///
    /// A failed load propagates as `Error::Materialization` and leaves the
    /// handle pending, so calling again retries.
    #[tracing::instrument(level = "trace", skip(self), fields(identity = %self.identity))]
    pub fn resolve(&self) -> Result<&E> {
        if let Some(entity) = self.value.get() {
            return Ok(entity);
        }

        let _guard = match self.gate.lock() {
            Ok(guard) => guard,
            // A loader panicked while holding the gate; the cache is untouched,
            // so it is safe to carry on.
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(entity) = self.value.get() {
            tracing::trace!("Reference materialized by a concurrent caller");
            return Ok(entity);
        }

        let Some(loader) = &self.loader else {
            return Err(Error::Custom(format!(
                "reference handle for {} has neither a value nor a loader",
                self.identity
            )));
        };

        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(
            kind = self.identity.kind(),
            context = %self.context,
            attempt,
            "Materializing reference"
        );

        match loader.load_by_identity(&self.identity, &self.context) {
            Ok(Some(entity)) => Ok(self.value.get_or_init(|| entity)),
            Ok(None) => {
                tracing::debug!(attempt, "Reference target not found");
                Err(Error::Materialization(MaterializationError::not_found(
                    &self.identity,
                )))
            }
            Err(e) => {
                tracing::debug!(attempt, kind = %e.kind, "Reference materialization failed");
                Err(Error::Materialization(e.with_identity(&self.identity)))
            }
        }
    }

    /// Mutable access to the object, loading it first if needed.
    pub fn resolve_mut(&mut self) -> Result<&mut E> {
        if self.value.get().is_none() {
            self.resolve()?;
        }
        let identity = &self.identity;
        self.value.get_mut().ok_or_else(|| {
            Error::Custom(format!("reference handle for {identity} lost its value"))
        })
    }

    /// Consume the handle and return the object, loading it first if needed.
    pub fn into_value(self) -> Result<E> {
        if self.value.get().is_none() {
            self.resolve()?;
        }
        let Self {
            identity, value, ..
        } = self;
        value.into_inner().ok_or_else(|| {
            Error::Custom(format!("reference handle for {identity} lost its value"))
        })
    }

    /// The cached object, without loading.
    pub fn get(&self) -> Option<&E> {
        self.value.get()
    }

    pub fn state(&self) -> MaterializationState {
        if self.value.get().is_some() {
            MaterializationState::Materialized
        } else {
            MaterializationState::Pending
        }
    }

    pub fn is_materialized(&self) -> bool {
        self.value.get().is_some()
    }

    /// Identity of the referenced object.
    pub fn identity(&self) -> &ObjectIdentity {
        &self.identity
    }

    /// Connection context loads are issued against.
    pub fn context(&self) -> &Arc<ConnectionContextKey> {
        &self.context
    }

    /// Number of loader calls made so far (successful or not).
    pub fn load_attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}

impl<E: fmt::Debug> fmt::Debug for ReferenceHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceHandle")
            .field("identity", &self.identity)
            .field("context", &self.context)
            .field("state", &self.state())
            .field("value", &self.value.get())
            .field("load_attempts", &self.load_attempts())
            .finish_non_exhaustive()
    }
}
