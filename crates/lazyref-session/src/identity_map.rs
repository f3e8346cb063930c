//! Identity map: one shared in-memory instance per `ObjectIdentity`.
//!
//! Entities are stored as type-erased `Arc<RwLock<E>>`, so getting the same
//! identity twice returns two handles to the same object and a change made
//! through one is visible through the other.
//!
//! Relationships between entries are kept as identity edges
//! (`owner --relation--> member`), never as object links, which keeps the
//! graph free of reference cycles.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//!
//! let group = map.insert(ProductGroup { id: 1, name: "Tools".into() })?;
//! let again = map.get::<ProductGroup>(&group_id).unwrap();
//! assert!(Arc::ptr_eq(&group, &again));
//!
//! map.relate(&group_id, "articles", article_id);
//! assert!(map.related(&group_id, "articles").contains(&article_id));
//! ```

use crate::flush::{LinkApplier, LinkOp};
use lazyref_core::{Entity, Error, ObjectIdentity, Result, Value};
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// A reference to an object in the identity map.
pub type EntityRef<E> = Arc<RwLock<E>>;

/// A guard for reading an object from the identity map.
pub type EntityReadGuard<'a, E> = std::sync::RwLockReadGuard<'a, E>;

/// A guard for writing to an object in the identity map.
pub type EntityWriteGuard<'a, E> = std::sync::RwLockWriteGuard<'a, E>;

/// Type-erased entry. Actually stores `Arc<RwLock<E>>` for some `E`.
struct IdentityEntry {
    arc: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

type EdgeKey = (ObjectIdentity, &'static str);

#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectIdentity, IdentityEntry>,
    edges: HashMap<EdgeKey, BTreeSet<ObjectIdentity>>,
}

impl IdentityMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entity.
    ///
    /// If the identity is already present, the existing reference is returned
    /// and `entity` is dropped. Fails if the identity cannot be built or is
    /// registered for a different Rust type.
    #[tracing::instrument(level = "trace", skip_all, fields(kind = E::KIND))]
    pub fn insert<E>(&mut self, entity: E) -> Result<EntityRef<E>>
    where
        E: Entity + Send + Sync + 'static,
    {
        let identity = entity.identity()?;
        if let Some(existing) = self.lookup::<E>(&identity)? {
            tracing::trace!(identity = %identity, "Identity map hit on insert");
            return Ok(existing);
        }

        let arc: EntityRef<E> = Arc::new(RwLock::new(entity));
        self.entries.insert(
            identity,
            IdentityEntry {
                arc: Box::new(Arc::clone(&arc)),
                type_name: std::any::type_name::<E>(),
            },
        );
        Ok(arc)
    }

    /// Get the shared reference for `identity`.
    ///
    /// Returns `None` if absent or registered for a different type.
    pub fn get<E>(&self, identity: &ObjectIdentity) -> Option<EntityRef<E>>
    where
        E: Send + Sync + 'static,
    {
        let entry = self.entries.get(identity)?;
        entry.arc.downcast_ref::<EntityRef<E>>().map(Arc::clone)
    }

    /// Get by primary-key values of an entity kind.
    pub fn get_by_key<E>(&self, key_values: &[Value]) -> Result<Option<EntityRef<E>>>
    where
        E: Entity + Send + Sync + 'static,
    {
        let identity = ObjectIdentity::from_values(E::KIND, key_values)?;
        Ok(self.get(&identity))
    }

    /// Get the existing reference for the entity's identity, or insert it.
    pub fn get_or_insert<E>(&mut self, entity: E) -> Result<EntityRef<E>>
    where
        E: Entity + Send + Sync + 'static,
    {
        self.insert(entity)
    }

    /// Get the reference for `identity`, or build the entity with `make` and
    /// insert it. `make` is not called on a hit.
    pub fn get_or_insert_with<E, F>(
        &mut self,
        identity: &ObjectIdentity,
        make: F,
    ) -> Result<EntityRef<E>>
    where
        E: Entity + Send + Sync + 'static,
        F: FnOnce() -> Result<E>,
    {
        if let Some(existing) = self.lookup::<E>(identity)? {
            return Ok(existing);
        }
        let entity = make()?;
        let built = entity.identity()?;
        if &built != identity {
            return Err(Error::Custom(format!(
                "entity built for {identity} reports identity {built}"
            )));
        }
        self.insert(entity)
    }

    /// Replace the stored value in place. Returns `false` if absent.
    pub fn update<E>(&mut self, entity: E) -> Result<bool>
    where
        E: Entity + Send + Sync + 'static,
    {
        let identity = entity.identity()?;
        let Some(arc) = self.lookup::<E>(&identity)? else {
            return Ok(false);
        };
        *arc.write().unwrap_or_else(PoisonError::into_inner) = entity;
        Ok(true)
    }

    /// Clone the current value out of the map.
    pub fn snapshot<E>(&self, identity: &ObjectIdentity) -> Option<E>
    where
        E: Clone + Send + Sync + 'static,
    {
        let arc = self.get::<E>(identity)?;
        let guard = arc.read().unwrap_or_else(PoisonError::into_inner);
        Some(guard.clone())
    }

    pub fn contains(&self, identity: &ObjectIdentity) -> bool {
        self.entries.contains_key(identity)
    }

    /// Remove an entry and its outgoing relationship edges.
    ///
    /// Edges from other owners that point at `identity` are left alone; they
    /// are unlinked by the flush pass like any other removal.
    pub fn remove(&mut self, identity: &ObjectIdentity) -> bool {
        self.edges.retain(|(owner, _), _| owner != identity);
        self.entries.remove(identity).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.edges.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identities of all entries of one entity kind.
    pub fn identities_of_kind<'a>(
        &'a self,
        kind: &'a str,
    ) -> impl Iterator<Item = &'a ObjectIdentity> + 'a {
        self.entries.keys().filter(move |id| id.kind() == kind)
    }

    /// Record `owner --relation--> member`. Returns `false` if already present.
    pub fn relate(
        &mut self,
        owner: &ObjectIdentity,
        relation: &'static str,
        member: ObjectIdentity,
    ) -> bool {
        self.edges
            .entry((owner.clone(), relation))
            .or_default()
            .insert(member)
    }

    /// Drop `owner --relation--> member`. Returns `false` if it was absent.
    pub fn unrelate(
        &mut self,
        owner: &ObjectIdentity,
        relation: &'static str,
        member: &ObjectIdentity,
    ) -> bool {
        let key = (owner.clone(), relation);
        let Some(members) = self.edges.get_mut(&key) else {
            return false;
        };
        let removed = members.remove(member);
        if members.is_empty() {
            self.edges.remove(&key);
        }
        removed
    }

    /// Members related to `owner` through `relation`.
    pub fn related(
        &self,
        owner: &ObjectIdentity,
        relation: &'static str,
    ) -> BTreeSet<ObjectIdentity> {
        self.edges
            .get(&(owner.clone(), relation))
            .cloned()
            .unwrap_or_default()
    }

    fn lookup<E>(&self, identity: &ObjectIdentity) -> Result<Option<EntityRef<E>>>
    where
        E: Send + Sync + 'static,
    {
        let Some(entry) = self.entries.get(identity) else {
            return Ok(None);
        };
        match entry.arc.downcast_ref::<EntityRef<E>>() {
            Some(arc) => Ok(Some(Arc::clone(arc))),
            None => Err(Error::Custom(format!(
                "{identity} is registered as {}, not {}",
                entry.type_name,
                std::any::type_name::<E>()
            ))),
        }
    }
}

/// Applying link operations to the map keeps its relationship edges in step
/// with what was flushed to the store.
impl LinkApplier for IdentityMap {
    fn apply(&mut self, ops: &[LinkOp]) -> Result<usize> {
        let mut applied = 0;
        for op in ops {
            let changed = match op {
                LinkOp::Link {
                    relation,
                    owner,
                    member,
                } => self.relate(owner, relation.name, member.clone()),
                LinkOp::Unlink {
                    relation,
                    owner,
                    member,
                } => self.unrelate(owner, relation.name, member),
            };
            if changed {
                applied += 1;
            }
        }
        tracing::trace!(applied, total = ops.len(), "Applied link ops to identity map");
        Ok(applied)
    }
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("entries", &self.entries.len())
            .field("edges", &self.edges.len())
            .finish()
    }
}
