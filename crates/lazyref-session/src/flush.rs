//! Link flush pass for lazy collections.
//!
//! Turns a collection's recorded membership changes into link/unlink
//! operations and hands them to a `LinkApplier`, the store-side collaborator
//! that writes them. Ordering:
//!
//! - UNLINK first, so a member moved between owners never violates a
//!   uniqueness constraint on the link table
//! - LINK after, both in identity order for deterministic statements
//!
//! The collection's tracking window is cleared only after the applier
//! reports success.

use lazyref_core::{
    CollectionChanges, Entity, LazyCollectionProxy, ObjectIdentity, RelationDescriptor, Result,
    Value,
};

/// A pending link operation for one member of a to-many relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    /// Insert a link (relationship).
    Link {
        relation: RelationDescriptor,
        /// Owning side.
        owner: ObjectIdentity,
        /// Member being linked.
        member: ObjectIdentity,
    },
    /// Delete a link (relationship).
    Unlink {
        relation: RelationDescriptor,
        owner: ObjectIdentity,
        member: ObjectIdentity,
    },
}

impl LinkOp {
    /// Create a link operation.
    pub fn link(
        relation: RelationDescriptor,
        owner: ObjectIdentity,
        member: ObjectIdentity,
    ) -> Self {
        Self::Link {
            relation,
            owner,
            member,
        }
    }

    /// Create an unlink operation.
    pub fn unlink(
        relation: RelationDescriptor,
        owner: ObjectIdentity,
        member: ObjectIdentity,
    ) -> Self {
        Self::Unlink {
            relation,
            owner,
            member,
        }
    }

    pub fn relation(&self) -> &RelationDescriptor {
        match self {
            LinkOp::Link { relation, .. } | LinkOp::Unlink { relation, .. } => relation,
        }
    }

    pub fn owner(&self) -> &ObjectIdentity {
        match self {
            LinkOp::Link { owner, .. } | LinkOp::Unlink { owner, .. } => owner,
        }
    }

    pub fn member(&self) -> &ObjectIdentity {
        match self {
            LinkOp::Link { member, .. } | LinkOp::Unlink { member, .. } => member,
        }
    }

    /// Check if this is a link (insert) operation.
    pub fn is_link(&self) -> bool {
        matches!(self, LinkOp::Link { .. })
    }

    /// Check if this is an unlink (delete) operation.
    pub fn is_unlink(&self) -> bool {
        matches!(self, LinkOp::Unlink { .. })
    }

    /// Link table name, for many-to-many relationships.
    pub fn table(&self) -> Option<&'static str> {
        self.relation().link_table.map(|info| info.table_name)
    }

    /// Link-table column/value pairs identifying the row this op touches.
    ///
    /// Owner key values pair with the local columns and member key values with
    /// the remote columns, in key order. Empty for relationships without a
    /// link table.
    pub fn link_row(&self) -> Vec<(&'static str, Value)> {
        let Some(info) = self.relation().link_table else {
            return Vec::new();
        };
        let owner = self.owner().to_values();
        let member = self.member().to_values();
        info.local_columns
            .iter()
            .copied()
            .zip(owner)
            .chain(info.remote_columns.iter().copied().zip(member))
            .collect()
    }
}

/// Store-side collaborator that applies link operations.
///
/// Returns the number of operations applied. An `Err` means nothing may be
/// assumed written; the collection keeps its tracked changes.
pub trait LinkApplier {
    fn apply(&mut self, ops: &[LinkOp]) -> Result<usize>;
}

impl<F> LinkApplier for F
where
    F: FnMut(&[LinkOp]) -> Result<usize>,
{
    fn apply(&mut self, ops: &[LinkOp]) -> Result<usize> {
        self(ops)
    }
}

/// Build the ordered operation list for a set of collection changes.
pub fn plan_link_ops(
    owner: &ObjectIdentity,
    relation: &RelationDescriptor,
    changes: &CollectionChanges,
) -> Vec<LinkOp> {
    let unlinks = changes
        .removed
        .iter()
        .map(|member| LinkOp::unlink(*relation, owner.clone(), member.clone()));
    let links = changes
        .added
        .iter()
        .map(|member| LinkOp::link(*relation, owner.clone(), member.clone()));
    unlinks.chain(links).collect()
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of links written.
    pub linked: usize,
    /// Number of links deleted.
    pub unlinked: usize,
    /// Number of operations the applier reported as applied.
    pub applied: usize,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of operations issued.
    pub fn total(&self) -> usize {
        self.linked + self.unlinked
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Accumulate another result into this one.
    pub fn merge(&mut self, other: FlushResult) {
        self.linked += other.linked;
        self.unlinked += other.unlinked;
        self.applied += other.applied;
    }
}

/// Flush a collection's changes relative to its load-time baseline.
pub fn flush_collection<E, A>(
    collection: &mut LazyCollectionProxy<E>,
    applier: &mut A,
) -> Result<FlushResult>
where
    E: Entity,
    A: LinkApplier + ?Sized,
{
    let changes = collection.changes()?;
    apply_changes(collection, &changes, applier)
}

/// Flush a collection's changes relative to an explicit `baseline`, the
/// membership the store last saw.
pub fn flush_collection_since<'a, E, A, I>(
    collection: &mut LazyCollectionProxy<E>,
    baseline: I,
    applier: &mut A,
) -> Result<FlushResult>
where
    E: Entity,
    A: LinkApplier + ?Sized,
    I: IntoIterator<Item = &'a ObjectIdentity>,
{
    let changes = collection.changes_since(baseline)?;
    apply_changes(collection, &changes, applier)
}

#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(owner = %collection.parent(), relation = collection.relation().name)
)]
fn apply_changes<E, A>(
    collection: &mut LazyCollectionProxy<E>,
    changes: &CollectionChanges,
    applier: &mut A,
) -> Result<FlushResult>
where
    E: Entity,
    A: LinkApplier + ?Sized,
{
    if changes.is_empty() {
        collection.mark_flushed();
        return Ok(FlushResult::new());
    }

    let ops = plan_link_ops(collection.parent(), collection.relation(), changes);
    tracing::debug!(
        unlinks = changes.removed.len(),
        links = changes.added.len(),
        "Flushing collection changes"
    );

    let applied = applier.apply(&ops).inspect_err(|e| {
        tracing::debug!(error = %e, "Link applier failed; keeping tracked changes");
    })?;

    collection.mark_flushed();
    Ok(FlushResult {
        linked: changes.added.len(),
        unlinked: changes.removed.len(),
        applied,
    })
}
