//! Relation descriptors.
//!
//! A `RelationDescriptor` is the static description of one relationship field:
//! which entity kinds it connects, its cardinality, and (for many-to-many) the
//! link table carrying the membership rows. Collection proxies hand it to the
//! bulk loader and the flush pass, which turn it into queries and link
//! statements. The mapping layer that produces these is out of scope here.

/// The type of relationship between two entity kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RelationshipKind {
    /// One-to-one: `Person` has one `Address`.
    OneToOne,
    /// Many-to-one: many `Article`s belong to one `ProductGroup`.
    #[default]
    ManyToOne,
    /// One-to-many: one `ProductGroup` has many `Article`s.
    OneToMany,
    /// Many-to-many: `Person`s have many `Project`s via a link table.
    ManyToMany,
}

impl RelationshipKind {
    /// Does this relationship hold a collection on the owning side?
    pub const fn is_collection(self) -> bool {
        matches!(self, RelationshipKind::OneToMany | RelationshipKind::ManyToMany)
    }
}

/// Information about a link table for many-to-many relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"person_project"`).
    pub table_name: &'static str,

    /// Columns in the link table pointing to the owner, in owner key order.
    pub local_columns: &'static [&'static str],

    /// Columns in the link table pointing to the member, in member key order.
    pub remote_columns: &'static [&'static str],
}

impl LinkTableInfo {
    /// Create a link-table definition.
    ///
    /// Column order matters: `local_columns` must match the owner identity's
    /// key order and `remote_columns` the member identity's key order.
    #[must_use]
    pub const fn new(
        table_name: &'static str,
        local_columns: &'static [&'static str],
        remote_columns: &'static [&'static str],
    ) -> Self {
        Self {
            table_name,
            local_columns,
            remote_columns,
        }
    }
}

/// Metadata about one relationship field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelationDescriptor {
    /// Name of the relationship field on the owner (e.g., `"articles"`).
    pub name: &'static str,

    /// Entity kind of the owning side.
    pub owner_kind: &'static str,

    /// Entity kind of the related side.
    pub member_kind: &'static str,

    /// Cardinality.
    pub kind: RelationshipKind,

    /// Foreign-key columns on the member pointing back at the owner (one-to-many).
    pub remote_keys: &'static [&'static str],

    /// Link table for many-to-many relationships.
    pub link_table: Option<LinkTableInfo>,

    /// Whether the collection is left unloaded until first traversal. When
    /// false, `ProxyFactory::collection` loads the members up front.
    pub lazy: bool,
}

impl RelationDescriptor {
    /// Create a relationship with required fields. Lazy by default.
    #[must_use]
    pub const fn new(
        name: &'static str,
        owner_kind: &'static str,
        member_kind: &'static str,
        kind: RelationshipKind,
    ) -> Self {
        Self {
            name,
            owner_kind,
            member_kind,
            kind,
            remote_keys: &[],
            link_table: None,
            lazy: true,
        }
    }

    /// Set the member-side foreign key columns (one-to-many).
    #[must_use]
    pub const fn remote_keys(mut self, keys: &'static [&'static str]) -> Self {
        self.remote_keys = keys;
        self
    }

    /// Set the link table metadata (many-to-many).
    #[must_use]
    pub const fn link_table(mut self, info: LinkTableInfo) -> Self {
        self.link_table = Some(info);
        self
    }

    /// Enable/disable lazy installation.
    #[must_use]
    pub const fn lazy(mut self, value: bool) -> Self {
        self.lazy = value;
        self
    }

    /// Is membership stored in a link table rather than a member foreign key?
    pub const fn is_many_to_many(&self) -> bool {
        self.link_table.is_some()
    }
}
