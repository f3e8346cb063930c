//! Session-level services for lazyref.
//!
//! `lazyref-session` sits between the proxies in `lazyref-core` and the store:
//!
//! - **Identity map**: one shared in-memory instance per `ObjectIdentity`, with
//!   relationships kept as identity edges.
//! - **Flush pass**: turns collection change sets into ordered link/unlink
//!   operations for a store-side `LinkApplier`.
//! - **Proxy factory**: binds proxies to an explicit connection context and
//!   mints identities from generated ids.
//!
//! # Example
//!
//! ```ignore
//! let mut factory = ProxyFactory::for_context(ConnectionContextKey::new("default", "sa"))?;
//!
//! let mut projects = factory.collection::<Project>(person_id, PROJECTS, loader)?;
//! projects.remove_identity(&old_project);
//! projects.add(new_project)?;
//!
//! // Unlinks first, then links; tracking clears only if the store accepts them.
//! factory.flush(&mut projects, &mut store)?;
//! ```

pub mod factory;
pub mod flush;
pub mod identity_map;

pub use factory::{FactoryConfig, ProxyFactory};
pub use flush::{
    FlushResult, LinkApplier, LinkOp, flush_collection, flush_collection_since, plan_link_ops,
};
pub use identity_map::{EntityReadGuard, EntityRef, EntityWriteGuard, IdentityMap};
