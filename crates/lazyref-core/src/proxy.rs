//! Single-object lazy reference proxies.
//!
//! A `LazyReferenceProxy<E>` is installed in place of a relationship field's
//! real value. It is either `Direct` (the object is already in memory) or
//! `Lazy` (a `ReferenceHandle` that loads on first access). Callers program
//! against the accessors below and cannot tell the variants apart except by
//! asking (`is_lazy`, `is_materialized`).
//!
//! # Example
//!
//! ```ignore
//! struct Article {
//!     product_group: LazyReferenceProxy<ProductGroup>,
//! }
//!
//! // First access loads the group through the handle's loader.
//! let name = article.product_group.with(|g| g.name.clone())?;
//!
//! // Identity is known without loading.
//! let group_id = article.product_group.identity()?;
//! ```

use crate::context::ConnectionContextKey;
use crate::error::Result;
use crate::handle::{EntityLoader, ReferenceHandle};
use crate::identity::{Entity, ObjectIdentity};
use crate::value::Value;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// A stand-in for one related object.
pub enum LazyReferenceProxy<E> {
    /// The real object, held directly.
    Direct(E),
    /// A handle that materializes the object on first access.
    Lazy(ReferenceHandle<E>),
}

impl<E> LazyReferenceProxy<E> {
    /// Wrap an object that is already in memory.
    pub fn direct(entity: E) -> Self {
        Self::Direct(entity)
    }

    /// Create a lazy proxy for `identity`.
    pub fn lazy(
        identity: ObjectIdentity,
        context: Arc<ConnectionContextKey>,
        loader: Arc<dyn EntityLoader<E>>,
    ) -> Self {
        Self::Lazy(ReferenceHandle::new(identity, context, loader))
    }

    /// Borrow the real object, materializing it if needed.
    pub fn get(&self) -> Result<&E> {
        match self {
            Self::Direct(entity) => Ok(entity),
            Self::Lazy(handle) => handle.resolve(),
        }
    }

    /// Mutably borrow the real object, materializing it if needed.
    pub fn get_mut(&mut self) -> Result<&mut E> {
        match self {
            Self::Direct(entity) => Ok(entity),
            Self::Lazy(handle) => handle.resolve_mut(),
        }
    }

    /// Run `f` against the real object.
    pub fn with<R>(&self, f: impl FnOnce(&E) -> R) -> Result<R> {
        self.get().map(f)
    }

    /// Run a fallible `f` against the real object.
    pub fn try_with<R>(&self, f: impl FnOnce(&E) -> Result<R>) -> Result<R> {
        f(self.get()?)
    }

    /// Consume the proxy and return the real object.
    pub fn into_inner(self) -> Result<E> {
        match self {
            Self::Direct(entity) => Ok(entity),
            Self::Lazy(handle) => handle.into_value(),
        }
    }

    /// The object if it is available without a load.
    pub fn peek(&self) -> Option<&E> {
        match self {
            Self::Direct(entity) => Some(entity),
            Self::Lazy(handle) => handle.get(),
        }
    }

    /// Is the real object available without a load?
    pub fn is_materialized(&self) -> bool {
        match self {
            Self::Direct(_) => true,
            Self::Lazy(handle) => handle.is_materialized(),
        }
    }

    /// Was this proxy constructed as a lazy reference?
    pub fn is_lazy(&self) -> bool {
        matches!(self, Self::Lazy(_))
    }

    /// The underlying handle, for the lazy variant.
    pub fn handle(&self) -> Option<&ReferenceHandle<E>> {
        match self {
            Self::Direct(_) => None,
            Self::Lazy(handle) => Some(handle),
        }
    }
}

impl<E: Entity> LazyReferenceProxy<E> {
    /// Create a lazy proxy from foreign-key column values of the owning row.
    pub fn from_foreign_key(
        values: &[Value],
        context: Arc<ConnectionContextKey>,
        loader: Arc<dyn EntityLoader<E>>,
    ) -> Result<Self> {
        let identity = ObjectIdentity::from_values(E::KIND, values)?;
        Ok(Self::lazy(identity, context, loader))
    }

    /// Identity of the referenced object. Never triggers a load.
    pub fn identity(&self) -> Result<ObjectIdentity> {
        match self {
            Self::Direct(entity) => entity.identity(),
            Self::Lazy(handle) => Ok(handle.identity().clone()),
        }
    }
}

impl<E> From<E> for LazyReferenceProxy<E> {
    fn from(entity: E) -> Self {
        Self::Direct(entity)
    }
}

impl<E: fmt::Debug> fmt::Debug for LazyReferenceProxy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(entity) => f.debug_tuple("Direct").field(entity).finish(),
            Self::Lazy(handle) => f.debug_tuple("Lazy").field(handle).finish(),
        }
    }
}

impl<E: Serialize> Serialize for LazyReferenceProxy<E> {
    /// Serializes the object if it is materialized, `null` otherwise.
    /// Serialization never triggers a load.
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.peek() {
            Some(entity) => entity.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }
}
