//! lazyref - object identity and lazy reference materialization.
//!
//! lazyref provides the pieces a persistence layer needs to stand in for
//! related objects without loading them:
//!
//! - Value-based identities that agree no matter which path produced them
//! - Process-unique key generation
//! - Single-object references that load on first access, at most once
//! - Collections that track additions and removals before and after loading
//! - An identity map and a link flush pass
//!
//! # Quick Start
//!
//! ```ignore
//! use lazyref::prelude::*;
//!
//! struct ProductGroup {
//!     id: i64,
//!     name: String,
//! }
//!
//! impl Entity for ProductGroup {
//!     const KIND: &'static str = "ProductGroup";
//!
//!     fn key_values(&self) -> Vec<Value> {
//!         vec![Value::BigInt(self.id)]
//!     }
//! }
//!
//! let factory = ProxyFactory::for_context(ConnectionContextKey::new("default", "sa"))?;
//!
//! // Built from the foreign-key column of an Article row; nothing is loaded yet.
//! let group = factory.reference_from_foreign_key::<ProductGroup>(&[Value::Int(7)], loader)?;
//!
//! // First access runs the loader under the factory's connection context.
//! println!("{}", group.with(|g| g.name.clone())?);
//! ```

pub use lazyref_core::{
    CollectionChanges, ConfigError, ConnectionContextKey, Entity, EntityLoader, Error,
    IdentityError, IdentityErrorKind, KeyValue, LazyCollectionProxy, LazyReferenceProxy,
    LinkTableInfo, LoadResult, MaterializationError, MaterializationErrorKind,
    MaterializationState, MemberLoader, ObjectIdentity, ReferenceHandle, RelationDescriptor,
    RelationshipKind, RemovalError, Result, UniqueId, UniqueIdGenerator, Value,
};
pub use lazyref_session::{
    EntityReadGuard, EntityRef, EntityWriteGuard, FactoryConfig, FlushResult, IdentityMap,
    LinkApplier, LinkOp, ProxyFactory, flush_collection, flush_collection_since, plan_link_ops,
};

/// Commonly used items.
pub mod prelude {
    pub use crate::{
        CollectionChanges, ConnectionContextKey, Entity, EntityLoader, Error, FactoryConfig,
        IdentityMap, LazyCollectionProxy, LazyReferenceProxy, LinkApplier, LinkOp, LoadResult,
        MaterializationError, MemberLoader, ObjectIdentity, ProxyFactory, RelationDescriptor,
        RelationshipKind, Result, UniqueIdGenerator, Value,
    };
}
