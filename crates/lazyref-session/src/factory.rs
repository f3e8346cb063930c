//! Proxy factory and its configuration.
//!
//! A `ProxyFactory` is the explicit home for what would otherwise be process
//! globals: the connection context proxies are bound to, the identity map and
//! the unique-id generator. Build one per data source.
//!
//! # Example
//!
//! ```ignore
//! let config = FactoryConfig::from_json(r#"{
//!     "context": {"alias": "default", "principal": "sa"},
//!     "uid_namespace": "shop"
//! }"#)?;
//! let mut factory = ProxyFactory::new(config)?;
//!
//! let group = factory.reference::<ProductGroup>(group_id, loader.clone())?;
//! let articles = factory.collection::<Article>(group_id, ARTICLES, member_loader)?;
//! ```

use crate::flush::{FlushResult, LinkApplier, LinkOp, flush_collection};
use crate::identity_map::{EntityRef, IdentityMap};
use lazyref_core::{
    ConfigError, ConnectionContextKey, Entity, EntityLoader, Error, IdentityError,
    IdentityErrorKind, LazyCollectionProxy, LazyReferenceProxy, MemberLoader, ObjectIdentity,
    RelationDescriptor, Result, UniqueId, UniqueIdGenerator, Value,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError};

/// Configuration for `ProxyFactory`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Connection context every proxy built by the factory is bound to.
    pub context: ConnectionContextKey,
    /// Whether `reference` returns a direct proxy for identities already in
    /// the identity map.
    pub use_identity_map: bool,
    /// Prefix for generated key values (`namespace:token`).
    pub uid_namespace: Option<String>,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            context: ConnectionContextKey::new("default", ""),
            use_identity_map: true,
            uid_namespace: None,
        }
    }
}

impl FactoryConfig {
    #[must_use]
    pub fn new(context: ConnectionContextKey) -> Self {
        Self {
            context,
            ..Self::default()
        }
    }

    /// Parse a factory configuration from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()
    }

    /// Check the context alias and namespace.
    pub fn validate(mut self) -> Result<Self> {
        self.context = self.context.validate()?;
        if self.uid_namespace.as_deref() == Some("") {
            self.uid_namespace = None;
        }
        Ok(self)
    }

    /// Set the connection context (builder pattern).
    #[must_use]
    pub fn context(mut self, context: ConnectionContextKey) -> Self {
        self.context = context;
        self
    }

    /// Enable/disable identity-map lookups (builder pattern).
    #[must_use]
    pub fn use_identity_map(mut self, value: bool) -> Self {
        self.use_identity_map = value;
        self
    }

    /// Set the generated-key namespace (builder pattern).
    #[must_use]
    pub fn uid_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.uid_namespace = Some(namespace.into());
        self
    }
}

/// Builds reference and collection proxies bound to one connection context.
#[derive(Debug)]
pub struct ProxyFactory {
    config: FactoryConfig,
    context: Arc<ConnectionContextKey>,
    identity_map: IdentityMap,
    ids: UniqueIdGenerator,
}

impl ProxyFactory {
    /// Create a factory. Fails on an invalid alias or namespace.
    pub fn new(config: FactoryConfig) -> Result<Self> {
        let config = config.validate()?;
        let ids = match &config.uid_namespace {
            Some(ns) => UniqueIdGenerator::with_namespace(ns.clone())?,
            None => UniqueIdGenerator::new(),
        };
        tracing::debug!(
            context = %config.context,
            use_identity_map = config.use_identity_map,
            "Created proxy factory"
        );
        Ok(Self {
            context: Arc::new(config.context.clone()),
            config,
            identity_map: IdentityMap::new(),
            ids,
        })
    }

    /// Create a factory with default settings for `context`.
    pub fn for_context(context: ConnectionContextKey) -> Result<Self> {
        Self::new(FactoryConfig::new(context))
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// The shared context handed to every proxy.
    pub fn context(&self) -> &Arc<ConnectionContextKey> {
        &self.context
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub fn identity_map_mut(&mut self) -> &mut IdentityMap {
        &mut self.identity_map
    }

    /// Put an in-memory entity into the identity map.
    pub fn register<E>(&mut self, entity: E) -> Result<EntityRef<E>>
    where
        E: Entity + Send + Sync + 'static,
    {
        self.identity_map.insert(entity)
    }

    /// Build a single-object proxy for `identity`.
    ///
    /// With identity-map lookups enabled, a registered entity yields a direct
    /// proxy holding a detached copy of its current state; otherwise the proxy
    /// is lazy.
    ///
    /// The copy does not write through. Edits made with `get_mut` on a direct
    /// proxy stay in the proxy; to change the shared instance, write through
    /// the `EntityRef` from `identity_map().get::<E>()`.
    #[tracing::instrument(level = "trace", skip(self, loader), fields(identity = %identity))]
    pub fn reference<E>(
        &self,
        identity: ObjectIdentity,
        loader: Arc<dyn EntityLoader<E>>,
    ) -> Result<LazyReferenceProxy<E>>
    where
        E: Entity + Clone + Send + Sync + 'static,
    {
        expect_kind(&identity, E::KIND)?;
        if self.config.use_identity_map {
            if let Some(shared) = self.identity_map.get::<E>(&identity) {
                tracing::trace!("Identity map hit; returning direct proxy");
                let entity = shared.read().unwrap_or_else(PoisonError::into_inner).clone();
                return Ok(LazyReferenceProxy::direct(entity));
            }
        }
        Ok(LazyReferenceProxy::lazy(
            identity,
            Arc::clone(&self.context),
            loader,
        ))
    }

    /// Build a single-object proxy from the owning row's foreign-key values.
    pub fn reference_from_foreign_key<E>(
        &self,
        values: &[Value],
        loader: Arc<dyn EntityLoader<E>>,
    ) -> Result<LazyReferenceProxy<E>>
    where
        E: Entity + Clone + Send + Sync + 'static,
    {
        let identity = ObjectIdentity::from_values(E::KIND, values)?;
        self.reference(identity, loader)
    }

    /// Build a collection proxy for `relation` of `parent`.
    ///
    /// The proxy is unloaded unless the relation is marked `lazy(false)`, in
    /// which case the members are loaded before it is returned. Only to-many
    /// relations can back a collection.
    pub fn collection<E>(
        &self,
        parent: ObjectIdentity,
        relation: RelationDescriptor,
        loader: Arc<dyn MemberLoader<E>>,
    ) -> Result<LazyCollectionProxy<E>>
    where
        E: Entity,
    {
        expect_kind(&parent, relation.owner_kind)?;
        if !relation.kind.is_collection() {
            return Err(Error::Config(ConfigError::new(format!(
                "relation '{}' is {:?}, not a to-many relation",
                relation.name, relation.kind
            ))));
        }
        if E::KIND != relation.member_kind {
            return Err(Error::Config(ConfigError::new(format!(
                "relation '{}' holds {} members, not {}",
                relation.name,
                relation.member_kind,
                E::KIND
            ))));
        }
        let mut collection =
            LazyCollectionProxy::new(parent, relation, Arc::clone(&self.context), loader);
        if !relation.lazy {
            tracing::trace!(relation = relation.name, "Eager relation; loading members");
            collection.ensure_loaded()?;
        }
        Ok(collection)
    }

    /// Mint a fresh single-key identity for a new `E`.
    pub fn new_identity<E: Entity>(&self) -> Result<ObjectIdentity> {
        ObjectIdentity::new(E::KIND, [self.ids.next_value()])
    }

    /// Next raw token from the factory's generator.
    pub fn next_id(&self) -> UniqueId {
        self.ids.next()
    }

    /// Flush a collection through `store`, then mirror the applied link
    /// operations into the identity map's relationship edges.
    pub fn flush<E, A>(
        &mut self,
        collection: &mut LazyCollectionProxy<E>,
        store: &mut A,
    ) -> Result<FlushResult>
    where
        E: Entity,
        A: LinkApplier + ?Sized,
    {
        let mut mirrored = Mirrored {
            store,
            map: &mut self.identity_map,
        };
        flush_collection(collection, &mut mirrored)
    }
}

/// Applies to the store first and to the identity map only on success.
struct Mirrored<'a, A: ?Sized> {
    store: &'a mut A,
    map: &'a mut IdentityMap,
}

impl<A: LinkApplier + ?Sized> LinkApplier for Mirrored<'_, A> {
    fn apply(&mut self, ops: &[LinkOp]) -> Result<usize> {
        let applied = self.store.apply(ops)?;
        self.map.apply(ops)?;
        Ok(applied)
    }
}

fn expect_kind(identity: &ObjectIdentity, kind: &str) -> Result<()> {
    if identity.kind() == kind {
        return Ok(());
    }
    Err(Error::InvalidIdentity(IdentityError::new(
        IdentityErrorKind::InvalidKind,
        kind,
        format!("expected a {kind} identity, got {identity}"),
    )))
}
