//! Lazy, removal-aware collection proxies.
//!
//! A `LazyCollectionProxy<E>` stands in for a to-many relationship field. It
//! defers the bulk load of its members until first traversal, and records
//! additions and removals as they happen so the flush pass can issue minimal
//! link/unlink statements instead of re-diffing the whole collection.
//!
//! # Bookkeeping rules
//!
//! - Membership is set-like: members are compared by `ObjectIdentity`.
//! - `remove` before the load records the identity in the removed set; when
//!   the loader later returns that member it is filtered out.
//! - `add` before the load queues the member; it is merged into the loaded
//!   sequence unless the loader already returned it.
//! - `add` after `remove` of the same identity cancels the removal, and
//!   `remove` after `add` cancels the addition. Neither shows up in
//!   `changes_since`.
//! - Recorded removals stay recorded until `mark_flushed` ends the tracking
//!   window.

use crate::context::ConnectionContextKey;
use crate::error::{
    Error, IdentityError, IdentityErrorKind, MaterializationError, RemovalError, Result,
};
use crate::identity::{Entity, ObjectIdentity};
use crate::relation::RelationDescriptor;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Store-layer collaborator that bulk-loads the members of one relation.
pub trait MemberLoader<E>: Send + Sync {
    fn load_members(
        &self,
        parent: &ObjectIdentity,
        relation: &RelationDescriptor,
        context: &ConnectionContextKey,
    ) -> std::result::Result<Vec<E>, MaterializationError>;
}

impl<E, F> MemberLoader<E> for F
where
    F: Fn(
            &ObjectIdentity,
            &RelationDescriptor,
            &ConnectionContextKey,
        ) -> std::result::Result<Vec<E>, MaterializationError>
        + Send
        + Sync,
{
    fn load_members(
        &self,
        parent: &ObjectIdentity,
        relation: &RelationDescriptor,
        context: &ConnectionContextKey,
    ) -> std::result::Result<Vec<E>, MaterializationError> {
        self(parent, relation, context)
    }
}

/// Net membership changes to hand to the flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionChanges {
    /// Members to link.
    pub added: BTreeSet<ObjectIdentity>,
    /// Members to unlink.
    pub removed: BTreeSet<ObjectIdentity>,
}

impl CollectionChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Total number of link + unlink operations.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len()
    }
}

/// A member together with its identity, computed once on entry.
struct Member<E> {
    identity: ObjectIdentity,
    entity: E,
}

pub struct LazyCollectionProxy<E> {
    parent: ObjectIdentity,
    relation: RelationDescriptor,
    context: Arc<ConnectionContextKey>,
    loader: Option<Arc<dyn MemberLoader<E>>>,
    /// Materialized view; `None` until the first successful load.
    members: Option<Vec<Member<E>>>,
    /// Identities returned by the store at load time.
    baseline: BTreeSet<ObjectIdentity>,
    /// Additions made before the load.
    pending: Vec<Member<E>>,
    added: BTreeSet<ObjectIdentity>,
    removed: BTreeSet<ObjectIdentity>,
}

impl<E: Entity> LazyCollectionProxy<E> {
    /// Create an unloaded collection for `relation` of `parent`.
    pub fn new(
        parent: ObjectIdentity,
        relation: RelationDescriptor,
        context: Arc<ConnectionContextKey>,
        loader: Arc<dyn MemberLoader<E>>,
    ) -> Self {
        Self {
            parent,
            relation,
            context,
            loader: Some(loader),
            members: None,
            baseline: BTreeSet::new(),
            pending: Vec::new(),
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    /// Create a collection whose members are already known (e.g. eager load
    /// or a freshly constructed owner). The given members form the baseline.
    pub fn loaded(
        parent: ObjectIdentity,
        relation: RelationDescriptor,
        context: Arc<ConnectionContextKey>,
        members: Vec<E>,
    ) -> Result<Self> {
        let mut proxy = Self {
            parent,
            relation,
            context,
            loader: None,
            members: None,
            baseline: BTreeSet::new(),
            pending: Vec::new(),
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        };
        proxy.install(members)?;
        Ok(proxy)
    }

    /// Load the members if that has not happened yet.
    ///
    /// A failed load propagates and leaves the collection unloaded with its
    /// tracked changes intact, so calling again retries.
    #[tracing::instrument(
        level = "debug",
        skip(self),
        fields(parent = %self.parent, relation = self.relation.name)
    )]
    pub fn ensure_loaded(&mut self) -> Result<()> {
        if self.members.is_some() {
            return Ok(());
        }
        let Some(loader) = &self.loader else {
            return Err(Error::Custom(format!(
                "collection '{}' of {} has no member loader",
                self.relation.name, self.parent
            )));
        };

        let loaded = loader
            .load_members(&self.parent, &self.relation, &self.context)
            .map_err(|e| Error::Materialization(e.with_identity(&self.parent)))?;
        self.install(loaded)
    }

    fn install(&mut self, loaded: Vec<E>) -> Result<()> {
        let mut incoming = Vec::with_capacity(loaded.len());
        for entity in loaded {
            incoming.push(Member {
                identity: entity.identity()?,
                entity,
            });
        }

        let fetched = incoming.len();
        let mut baseline = BTreeSet::new();
        let mut view: Vec<Member<E>> = Vec::with_capacity(fetched + self.pending.len());
        for member in incoming {
            if !baseline.insert(member.identity.clone()) {
                continue;
            }
            if self.removed.contains(&member.identity) {
                continue;
            }
            view.push(member);
        }

        for member in std::mem::take(&mut self.pending) {
            if view.iter().any(|m| m.identity == member.identity) {
                continue;
            }
            view.push(member);
        }

        // Additions of rows the store already links are not changes.
        self.added.retain(|id| !baseline.contains(id));

        tracing::debug!(
            fetched,
            visible = view.len(),
            removed = self.removed.len(),
            "Collection materialized"
        );
        self.baseline = baseline;
        self.members = Some(view);
        Ok(())
    }

    /// Iterate the members, loading them first if needed.
    pub fn iterate(&mut self) -> Result<impl Iterator<Item = &E>> {
        self.ensure_loaded()?;
        Ok(self.loaded_members().iter().map(|m| &m.entity))
    }

    /// Edit the member named by `identity` in place, loading the collection
    /// first if needed. Returns `Ok(None)` if it is not a member.
    ///
    /// Members are tracked by key, so `f` must not change the key. If it
    /// does, the edit is rolled back and a `KeyChanged` error is returned.
    /// Re-keying a member is a `remove` followed by an `add`.
    pub fn with_member_mut<R>(
        &mut self,
        identity: &ObjectIdentity,
        f: impl FnOnce(&mut E) -> R,
    ) -> Result<Option<R>>
    where
        E: Clone,
    {
        self.ensure_loaded()?;
        let Some(member) = self
            .members
            .as_deref_mut()
            .and_then(|view| view.iter_mut().find(|m| &m.identity == identity))
        else {
            return Ok(None);
        };

        let before = member.entity.clone();
        let out = f(&mut member.entity);
        let rekeyed = match member.entity.identity() {
            Ok(after) if after == member.identity => return Ok(Some(out)),
            Ok(after) => Error::InvalidIdentity(IdentityError::new(
                IdentityErrorKind::KeyChanged,
                E::KIND,
                format!("member {} was re-keyed to {after} in place", member.identity),
            )),
            Err(e) => e,
        };
        member.entity = before;
        Err(rekeyed)
    }

    fn loaded_members(&self) -> &[Member<E>] {
        self.members.as_deref().unwrap_or_default()
    }

    /// Number of members, loading them first if needed.
    pub fn len(&mut self) -> Result<usize> {
        self.ensure_loaded()?;
        Ok(self.loaded_members().len())
    }

    /// Is the collection empty? Loads it first if needed.
    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Is `identity` a member? Loads the collection first if needed.
    pub fn contains(&mut self, identity: &ObjectIdentity) -> Result<bool> {
        self.ensure_loaded()?;
        Ok(self.loaded_members().iter().any(|m| &m.identity == identity))
    }

    /// Add a member. Returns `false` if it was already present.
    pub fn add(&mut self, member: E) -> Result<bool> {
        let identity = member.identity()?;

        let present = match &self.members {
            Some(view) => view.iter().any(|m| m.identity == identity),
            None => self.pending.iter().any(|m| m.identity == identity),
        };
        if present {
            return Ok(false);
        }

        if self.removed.remove(&identity) {
            tracing::trace!(member = %identity, "Re-add cancels recorded removal");
        } else {
            self.added.insert(identity.clone());
        }

        let entry = Member {
            identity,
            entity: member,
        };
        match &mut self.members {
            Some(view) => view.push(entry),
            None => self.pending.push(entry),
        }
        Ok(true)
    }

    /// Remove a member. See [`remove_identity`](Self::remove_identity).
    pub fn remove(&mut self, member: &E) -> Result<bool> {
        let identity = member.identity()?;
        Ok(self.remove_identity(&identity))
    }

    /// Remove the member named by `identity` without loading the collection.
    ///
    /// Returns `true` if anything changed. Removing something that is neither
    /// loaded nor pending from a loaded collection is a no-op.
    pub fn remove_identity(&mut self, identity: &ObjectIdentity) -> bool {
        if self.added.remove(identity) {
            tracing::trace!(member = %identity, "Remove cancels recorded addition");
            match &mut self.members {
                Some(view) => view.retain(|m| &m.identity != identity),
                None => self.pending.retain(|m| &m.identity != identity),
            }
            return true;
        }

        match &mut self.members {
            Some(view) => {
                let Some(pos) = view.iter().position(|m| &m.identity == identity) else {
                    return false;
                };
                view.remove(pos);
                self.removed.insert(identity.clone());
                true
            }
            None => {
                self.pending.retain(|m| &m.identity != identity);
                self.removed.insert(identity.clone())
            }
        }
    }

    /// Verify that no identity is recorded as both added and removed.
    pub fn check_consistency(&self) -> Result<()> {
        match self.added.intersection(&self.removed).next() {
            Some(identity) => Err(Error::InconsistentRemoval(RemovalError {
                identity: identity.clone(),
                relation: self.relation.name.to_string(),
            })),
            None => Ok(()),
        }
    }

    /// Net changes relative to `baseline`, the membership the store last saw.
    ///
    /// `added` holds recorded additions absent from `baseline`; `removed`
    /// holds every recorded removal.
    pub fn changes_since<'a, I>(&self, baseline: I) -> Result<CollectionChanges>
    where
        I: IntoIterator<Item = &'a ObjectIdentity>,
    {
        self.check_consistency()?;
        let baseline: BTreeSet<&ObjectIdentity> = baseline.into_iter().collect();
        Ok(CollectionChanges {
            added: self
                .added
                .iter()
                .filter(|id| !baseline.contains(id))
                .cloned()
                .collect(),
            removed: self.removed.clone(),
        })
    }

    /// Net changes relative to the membership observed at load time.
    pub fn changes(&self) -> Result<CollectionChanges> {
        self.changes_since(&self.baseline)
    }

    /// End the tracking window after a successful flush.
    ///
    /// Clears recorded additions and removals. If loaded, the current
    /// membership becomes the new baseline.
    pub fn mark_flushed(&mut self) {
        self.added.clear();
        self.removed.clear();
        if let Some(view) = &self.members {
            self.baseline = view.iter().map(|m| m.identity.clone()).collect();
        }
    }

    /// Consume the proxy and return the members, loading them first if needed.
    pub fn into_vec(mut self) -> Result<Vec<E>> {
        self.ensure_loaded()?;
        Ok(self
            .members
            .take()
            .unwrap_or_default()
            .into_iter()
            .map(|m| m.entity)
            .collect())
    }
}

impl<E> LazyCollectionProxy<E> {
    pub fn is_loaded(&self) -> bool {
        self.members.is_some()
    }

    pub fn parent(&self) -> &ObjectIdentity {
        &self.parent
    }

    pub fn relation(&self) -> &RelationDescriptor {
        &self.relation
    }

    pub fn context(&self) -> &Arc<ConnectionContextKey> {
        &self.context
    }

    /// Members added before the load, not yet merged.
    pub fn pending_additions(&self) -> impl Iterator<Item = &E> {
        self.pending.iter().map(|m| &m.entity)
    }

    /// Identities recorded as added in the current tracking window.
    pub fn added_identities(&self) -> &BTreeSet<ObjectIdentity> {
        &self.added
    }

    /// Identities recorded as removed in the current tracking window.
    pub fn removed_identities(&self) -> &BTreeSet<ObjectIdentity> {
        &self.removed
    }

    /// Identities the store returned at load time (empty until loaded).
    pub fn baseline(&self) -> &BTreeSet<ObjectIdentity> {
        &self.baseline
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

impl<E> fmt::Debug for LazyCollectionProxy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyCollectionProxy")
            .field("parent", &self.parent)
            .field("relation", &self.relation.name)
            .field("context", &self.context)
            .field("loaded", &self.members.as_ref().map(Vec::len))
            .field("pending", &self.pending.len())
            .field("added", &self.added)
            .field("removed", &self.removed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::RelationshipKind;
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct Article {
        id: i64,
        stock: u32,
    }

    fn article(id: i64) -> Article {
        Article { id, stock: 0 }
    }

    impl Entity for Article {
        const KIND: &'static str = "Article";

        fn key_values(&self) -> Vec<Value> {
            vec![Value::BigInt(self.id)]
        }
    }

    const ARTICLES: RelationDescriptor = RelationDescriptor::new(
        "articles",
        "ProductGroup",
        "Article",
        RelationshipKind::OneToMany,
    );

    fn id(n: i64) -> ObjectIdentity {
        ObjectIdentity::new("Article", [n]).unwrap()
    }

    fn parent() -> ObjectIdentity {
        ObjectIdentity::new("ProductGroup", [1_i64]).unwrap()
    }

    fn collection(rows: Vec<i64>, calls: Arc<AtomicUsize>) -> LazyCollectionProxy<Article> {
        let loader: Arc<dyn MemberLoader<Article>> = Arc::new(
            move |_: &ObjectIdentity,
                  _: &RelationDescriptor,
                  _: &ConnectionContextKey|
                  -> std::result::Result<Vec<Article>, MaterializationError> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(rows.iter().map(|&id| article(id)).collect())
            },
        );
        LazyCollectionProxy::new(
            parent(),
            ARTICLES,
            Arc::new(ConnectionContextKey::new("default", "sa")),
            loader,
        )
    }

    fn ids(proxy: &mut LazyCollectionProxy<Article>) -> Vec<i64> {
        proxy.iterate().unwrap().map(|a| a.id).collect()
    }

    fn set(ns: &[i64]) -> BTreeSet<ObjectIdentity> {
        ns.iter().map(|&n| id(n)).collect()
    }

    #[test]
    fn loads_once_on_first_traversal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut proxy = collection(vec![1, 2, 3], calls.clone());
        assert!(!proxy.is_loaded());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(ids(&mut proxy), vec![1, 2, 3]);
        assert_eq!(ids(&mut proxy), vec![1, 2, 3]);
        assert_eq!(proxy.len().unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.baseline(), &set(&[1, 2, 3]));
    }

    #[test]
    fn removal_before_load_filters_loaded_member() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut proxy = collection(vec![1, 2, 3], calls.clone());

        assert!(proxy.remove(&article(2)).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(ids(&mut proxy), vec![1, 3]);
        assert!(!proxy.contains(&id(2)).unwrap());
        assert_eq!(proxy.changes().unwrap().removed, set(&[2]));
    }

    #[test]
    fn add_before_load_is_merged() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut proxy = collection(vec![1, 2], calls);

        assert!(proxy.add(article(9)).unwrap());
        assert!(!proxy.add(article(9)).unwrap());
        assert_eq!(proxy.pending_additions().count(), 1);

        assert_eq!(ids(&mut proxy), vec![1, 2, 9]);
        assert_eq!(proxy.pending_additions().count(), 0);
        assert_eq!(proxy.changes().unwrap().added, set(&[9]));
    }

    #[test]
    fn add_of_already_linked_row_is_not_a_change() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut proxy = collection(vec![1, 2], calls);

        proxy.add(article(2)).unwrap();
        assert_eq!(ids(&mut proxy), vec![1, 2]);
        assert!(proxy.changes().unwrap().is_empty());
    }

    #[test]
    fn remove_then_add_before_load_nets_out() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut proxy = collection(vec![1, 2, 3], calls);

        proxy.remove(&article(2)).unwrap();
        proxy.add(article(2)).unwrap();

        let changes = proxy.changes_since(&set(&[1, 2, 3])).unwrap();
        assert!(changes.is_empty(), "{changes:?}");
        assert_eq!(ids(&mut proxy), vec![1, 2, 3]);
    }

    #[test]
    fn add_then_remove_after_load_nets_out() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut proxy = collection(vec![1, 2, 3], calls);
        proxy.ensure_loaded().unwrap();

        proxy.add(article(7)).unwrap();
        assert!(proxy.remove(&article(7)).unwrap());

        assert_eq!(ids(&mut proxy), vec![1, 2, 3]);
        assert!(proxy.changes().unwrap().is_empty());
        assert!(!proxy.has_pending_changes());
    }

    #[test]
    fn remove_of_absent_member_after_load_is_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut proxy = collection(vec![1], calls);
        proxy.ensure_loaded().unwrap();

        assert!(!proxy.remove(&article(99)).unwrap());
        assert!(proxy.changes().unwrap().is_empty());
    }

    #[test]
    fn remove_and_add_against_baseline() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut proxy = collection(vec![1, 2, 3], calls);

        proxy.remove(&article(2)).unwrap();
        proxy.add(article(4)).unwrap();

        let changes = proxy.changes_since(&set(&[1, 2, 3])).unwrap();
        assert_eq!(changes.added, set(&[4]));
        assert_eq!(changes.removed, set(&[2]));
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn failed_load_keeps_tracking_and_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let loader: Arc<dyn MemberLoader<Article>> = Arc::new(
            move |_: &ObjectIdentity,
                  _: &RelationDescriptor,
                  _: &ConnectionContextKey|
                  -> std::result::Result<Vec<Article>, MaterializationError> {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(MaterializationError::transient("store busy"));
                }
                Ok(vec![article(1), article(2)])
            },
        );
        let mut proxy = LazyCollectionProxy::new(
            parent(),
            ARTICLES,
            Arc::new(ConnectionContextKey::new("default", "sa")),
            loader,
        );
        proxy.remove(&article(1)).unwrap();

        let err = proxy.ensure_loaded().unwrap_err();
        assert!(err.is_retryable());
        assert!(!proxy.is_loaded());
        assert_eq!(proxy.removed_identities(), &set(&[1]));

        assert_eq!(ids(&mut proxy), vec![2]);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn mark_flushed_resets_window() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut proxy = collection(vec![1, 2], calls);
        proxy.remove(&article(1)).unwrap();
        proxy.add(article(5)).unwrap();
        proxy.ensure_loaded().unwrap();

        proxy.mark_flushed();
        assert!(proxy.changes().unwrap().is_empty());
        assert_eq!(proxy.baseline(), &set(&[2, 5]));
    }

    #[test]
    fn inconsistent_bookkeeping_is_reported() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut proxy = collection(vec![], calls);
        proxy.added.insert(id(3));
        proxy.removed.insert(id(3));

        match proxy.changes() {
            Err(Error::InconsistentRemoval(e)) => {
                assert_eq!(e.identity, id(3));
                assert_eq!(e.relation, "articles");
            }
            other => panic!("expected InconsistentRemoval, got {other:?}"),
        }
    }

    #[test]
    fn preloaded_collection_never_calls_loader() {
        let mut proxy = LazyCollectionProxy::loaded(
            parent(),
            ARTICLES,
            Arc::new(ConnectionContextKey::new("default", "sa")),
            vec![article(1), article(1), article(2)],
        )
        .unwrap();
        assert!(proxy.is_loaded());
        assert_eq!(ids(&mut proxy), vec![1, 2]);
    }

    #[test]
    fn member_edits_apply_in_place() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut proxy = collection(vec![1, 2], calls);

        let stock = proxy
            .with_member_mut(&id(2), |a| {
                a.stock = 5;
                a.stock
            })
            .unwrap();
        assert_eq!(stock, Some(5));
        assert_eq!(proxy.with_member_mut(&id(9), |a| a.stock).unwrap(), None);
        assert!(proxy.changes().unwrap().is_empty());

        let articles = proxy.into_vec().unwrap();
        assert_eq!(articles[1], Article { id: 2, stock: 5 });
    }

    #[test]
    fn rekeying_a_member_in_place_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut proxy = collection(vec![1], calls);

        let err = proxy.with_member_mut(&id(1), |a| a.id = 11).unwrap_err();
        match err {
            Error::InvalidIdentity(e) => assert_eq!(e.kind, IdentityErrorKind::KeyChanged),
            other => panic!("expected KeyChanged, got {other:?}"),
        }

        // The edit was rolled back, so membership stays keyed by the original id.
        assert!(!proxy.remove(&article(11)).unwrap());
        assert!(proxy.add(article(11)).unwrap());
        assert_eq!(ids(&mut proxy), vec![1, 11]);
        assert_eq!(proxy.changes().unwrap().added, set(&[11]));
        assert!(proxy.remove(&article(1)).unwrap());
        assert_eq!(ids(&mut proxy), vec![11]);
    }
}
