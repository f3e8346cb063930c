//! Core types for lazyref.
//!
//! This crate provides object identity and lazy reference materialization:
//!
//! - `ObjectIdentity` for value-based, cross-path-consistent entity identity
//! - `ConnectionContextKey` naming the store and principal a load runs under
//! - `UniqueIdGenerator` for process-unique key tokens
//! - `ReferenceHandle` and `LazyReferenceProxy` for single-object references
//! - `LazyCollectionProxy` for to-many relationships with change tracking

pub mod collection;
pub mod context;
pub mod error;
pub mod handle;
pub mod identity;
pub mod proxy;
pub mod relation;
pub mod uid;
pub mod value;

pub use collection::{CollectionChanges, LazyCollectionProxy, MemberLoader};
pub use context::ConnectionContextKey;
pub use error::{
    ConfigError, Error, IdentityError, IdentityErrorKind, MaterializationError,
    MaterializationErrorKind, RemovalError, Result,
};
pub use handle::{EntityLoader, LoadResult, MaterializationState, ReferenceHandle};
pub use identity::{Entity, KeyValue, ObjectIdentity};
pub use proxy::LazyReferenceProxy;
pub use relation::{LinkTableInfo, RelationDescriptor, RelationshipKind};
pub use uid::{UniqueId, UniqueIdGenerator};
pub use value::Value;
