//! Composite-key object identity.
//!
//! An `ObjectIdentity` names one persisted row across caches, transactions and
//! proxies: an entity kind plus the ordered primary-key values. It is built
//! without consulting the store, and must compare equal whether the key values
//! came from a freshly inserted row or from a foreign-key column of another row.
//! Integer widths are therefore normalized on the way in.
//!
//! Identities are immutable and cheap to clone (the key material lives behind
//! an `Arc`), so every cache and proxy holds its own handle to the same data.

use crate::error::{Error, IdentityError, IdentityErrorKind, Result};
use crate::value::Value;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

/// Pattern for entity kind names and connection aliases.
const NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_.:$]*$";

fn name_regex() -> &'static Regex {
    static NAME: OnceLock<Regex> = OnceLock::new();
    NAME.get_or_init(|| Regex::new(NAME_PATTERN).expect("name pattern should compile"))
}

/// Check that `name` is usable as an entity kind or connection alias.
pub(crate) fn is_valid_name(name: &str) -> bool {
    name_regex().is_match(name)
}

/// One normalized primary-key component.
///
/// All integer widths collapse to `Int`, so `Value::Int(42)` and
/// `Value::BigInt(42)` produce the same component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyValue {
    Bool(bool),
    Int(i64),
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Uuid([u8; 16]),
}

impl KeyValue {
    /// Convert back into a column value (integers come back as `BigInt`).
    pub fn to_value(&self) -> Value {
        match self {
            KeyValue::Bool(b) => Value::Bool(*b),
            KeyValue::Int(i) => Value::BigInt(*i),
            KeyValue::Decimal(s) => Value::Decimal(s.clone()),
            KeyValue::Text(s) => Value::Text(s.clone()),
            KeyValue::Bytes(b) => Value::Bytes(b.clone()),
            KeyValue::Uuid(u) => Value::Uuid(*u),
        }
    }

    /// Get the integer payload, if this is an integer component.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            KeyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            KeyValue::Bool(_) => 1,
            KeyValue::Int(_) => 2,
            KeyValue::Decimal(_) => 3,
            KeyValue::Text(_) => 4,
            KeyValue::Bytes(_) => 5,
            KeyValue::Uuid(_) => 6,
        }
    }
}

impl TryFrom<Value> for KeyValue {
    type Error = IdentityError;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        if let Some(i) = value.as_i64() {
            return Ok(KeyValue::Int(i));
        }
        match value {
            Value::Bool(b) => Ok(KeyValue::Bool(b)),
            Value::Decimal(s) => Ok(KeyValue::Decimal(s)),
            Value::Text(s) => Ok(KeyValue::Text(s)),
            Value::Bytes(b) => Ok(KeyValue::Bytes(b)),
            Value::Uuid(u) => Ok(KeyValue::Uuid(u)),
            other => Err(IdentityError::new(
                IdentityErrorKind::UnsupportedValue,
                "",
                format!("{} cannot be used as a key component", other.type_name()),
            )),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Bool(b) => write!(f, "{b}"),
            KeyValue::Int(i) => write!(f, "{i}"),
            KeyValue::Decimal(s) => write!(f, "{s}"),
            KeyValue::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            KeyValue::Bytes(b) => {
                f.write_str("x'")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                f.write_str("'")
            }
            KeyValue::Uuid(u) => {
                for (i, byte) in u.iter().enumerate() {
                    if matches!(i, 4 | 6 | 8 | 10) {
                        f.write_str("-")?;
                    }
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

struct IdentityInner {
    kind: Box<str>,
    keys: Box<[KeyValue]>,
    hash: u64,
}

/// Hash kind and key components; computed once at construction.
fn hash_identity(kind: &str, keys: &[KeyValue]) -> u64 {
    let mut hasher = DefaultHasher::new();
    kind.hash(&mut hasher);
    keys.len().hash(&mut hasher);
    for key in keys {
        key.tag().hash(&mut hasher);
        key.hash(&mut hasher);
    }
    hasher.finish()
}

/// A comparable, hashable composite key naming one persisted instance.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "IdentityRepr", into = "IdentityRepr")]
pub struct ObjectIdentity {
    inner: Arc<IdentityInner>,
}

impl ObjectIdentity {
    /// Build an identity from an entity kind and its ordered key values.
    ///
    /// Fails with `InvalidIdentity` if the kind is not a valid name, no key
    /// values are given, or a value cannot take part in a key (NULL, floats,
    /// JSON).
    ///
    /// ```
    /// use lazyref_core::{ObjectIdentity, Value};
    ///
    /// let inserted = ObjectIdentity::new("Article", [42_i32]).unwrap();
    /// let referenced = ObjectIdentity::from_values("Article", &[Value::BigInt(42)]).unwrap();
    /// assert_eq!(inserted, referenced);
    /// ```
    pub fn new<I, V>(kind: impl Into<String>, keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let kind = kind.into();
        if !is_valid_name(&kind) {
            return Err(Error::InvalidIdentity(IdentityError::new(
                IdentityErrorKind::InvalidKind,
                kind,
                "entity kind must be a non-empty identifier",
            )));
        }

        let mut normalized = Vec::new();
        for value in keys {
            let key = KeyValue::try_from(value.into()).map_err(|mut e| {
                e.entity_kind.clone_from(&kind);
                Error::InvalidIdentity(e)
            })?;
            normalized.push(key);
        }

        Self::from_keys(kind, normalized)
    }

    /// Build an identity from values read out of a row (e.g. a foreign-key column).
    pub fn from_values(kind: impl Into<String>, values: &[Value]) -> Result<Self> {
        Self::new(kind, values.iter().cloned())
    }

    /// Build an identity from already-normalized key components.
    pub fn from_keys(kind: impl Into<String>, keys: Vec<KeyValue>) -> Result<Self> {
        let kind = kind.into();
        if !is_valid_name(&kind) {
            return Err(Error::InvalidIdentity(IdentityError::new(
                IdentityErrorKind::InvalidKind,
                kind,
                "entity kind must be a non-empty identifier",
            )));
        }
        if keys.is_empty() {
            return Err(Error::InvalidIdentity(IdentityError::new(
                IdentityErrorKind::EmptyKey,
                kind,
                "identity requires at least one key value",
            )));
        }

        let hash = hash_identity(&kind, &keys);
        Ok(Self {
            inner: Arc::new(IdentityInner {
                kind: kind.into_boxed_str(),
                keys: keys.into_boxed_slice(),
                hash,
            }),
        })
    }

    /// The entity kind discriminator.
    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// The ordered, normalized key components.
    pub fn keys(&self) -> &[KeyValue] {
        &self.inner.keys
    }

    /// Is this a composite (multi-column) key?
    pub fn is_composite(&self) -> bool {
        self.inner.keys.len() > 1
    }

    /// The precomputed hash; stable for the lifetime of the process.
    pub fn hash_code(&self) -> u64 {
        self.inner.hash
    }

    /// Key components as column values, in key order.
    pub fn to_values(&self) -> Vec<Value> {
        self.inner.keys.iter().map(KeyValue::to_value).collect()
    }

    /// Do both handles point at the same allocation?
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for ObjectIdentity {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        self.inner.hash == other.inner.hash
            && self.inner.kind == other.inner.kind
            && self.inner.keys == other.inner.keys
    }
}

impl Eq for ObjectIdentity {}

impl Hash for ObjectIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.inner.hash);
    }
}

impl PartialOrd for ObjectIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner
            .kind
            .cmp(&other.inner.kind)
            .then_with(|| self.inner.keys.cmp(&other.inner.keys))
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.inner.kind)?;
        for (i, key) in self.inner.keys.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}")?;
        }
        f.write_str("]")
    }
}

impl fmt::Debug for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectIdentity")
            .field("kind", &self.inner.kind)
            .field("keys", &self.inner.keys)
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityRepr {
    kind: String,
    keys: Vec<KeyValue>,
}

impl TryFrom<IdentityRepr> for ObjectIdentity {
    type Error = Error;

    fn try_from(repr: IdentityRepr) -> Result<Self> {
        Self::from_keys(repr.kind, repr.keys)
    }
}

impl From<ObjectIdentity> for IdentityRepr {
    fn from(identity: ObjectIdentity) -> Self {
        Self {
            kind: identity.inner.kind.to_string(),
            keys: identity.inner.keys.to_vec(),
        }
    }
}

/// A persisted domain object that can name its own identity.
///
/// `KIND` is the entity-kind discriminator; `key_values` returns the primary
/// key in declaration order.
pub trait Entity {
    /// Entity kind discriminator (e.g. `"Article"`).
    const KIND: &'static str;

    /// Primary-key values, in key order.
    fn key_values(&self) -> Vec<Value>;

    /// Build this object's identity.
    fn identity(&self) -> Result<ObjectIdentity> {
        ObjectIdentity::new(Self::KIND, self.key_values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashSet};

    fn hash_of(id: &ObjectIdentity) -> u64 {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn insert_path_equals_foreign_key_path() {
        let inserted = ObjectIdentity::new("Article", [Value::Int(42)]).unwrap();
        let read_back = ObjectIdentity::from_values("Article", &[Value::BigInt(42)]).unwrap();

        assert_eq!(inserted, read_back);
        assert_eq!(inserted.hash_code(), read_back.hash_code());
        assert_eq!(hash_of(&inserted), hash_of(&read_back));
        assert!(!inserted.shares_storage(&read_back));
    }

    #[test]
    fn kind_participates_in_equality() {
        let article = ObjectIdentity::new("Article", [1_i64]).unwrap();
        let group = ObjectIdentity::new("ProductGroup", [1_i64]).unwrap();
        assert_ne!(article, group);
    }

    #[test]
    fn key_order_matters() {
        let a = ObjectIdentity::new("Role", [Value::from(1_i64), Value::from("x")]).unwrap();
        let b = ObjectIdentity::new("Role", [Value::from("x"), Value::from(1_i64)]).unwrap();
        assert_ne!(a, b);
        assert!(a.is_composite());
    }

    #[test]
    fn equality_laws() {
        let a = ObjectIdentity::new("Person", [Value::from(7_i32), Value::from("eu")]).unwrap();
        let b = ObjectIdentity::new("Person", [Value::from(7_i64), Value::from("eu")]).unwrap();
        let c = ObjectIdentity::from_keys(
            "Person",
            vec![KeyValue::Int(7), KeyValue::Text("eu".into())],
        )
        .unwrap();

        assert_eq!(a, a);
        assert_eq!(a, b);
        assert_eq!(b, a);
        assert_eq!(b, c);
        assert_eq!(a, c);
        assert_eq!(hash_of(&a), hash_of(&c));
        assert_eq!(a.cmp(&c), Ordering::Equal);
    }

    #[test]
    fn rejects_empty_key() {
        let err = ObjectIdentity::new("Article", Vec::<Value>::new()).unwrap_err();
        match err {
            Error::InvalidIdentity(e) => assert_eq!(e.kind, IdentityErrorKind::EmptyKey),
            other => panic!("expected InvalidIdentity, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unsupported_components() {
        for bad in [
            Value::Null,
            Value::Double(1.5),
            Value::Float(0.0),
            Value::Json(serde_json::json!([1])),
        ] {
            let err = ObjectIdentity::new("Article", [bad]).unwrap_err();
            match err {
                Error::InvalidIdentity(e) => {
                    assert_eq!(e.kind, IdentityErrorKind::UnsupportedValue);
                    assert_eq!(e.entity_kind, "Article");
                }
                other => panic!("expected InvalidIdentity, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_bad_kind_names() {
        for kind in ["", "1Article", "has space", "semi;colon"] {
            assert!(ObjectIdentity::new(kind, [1_i64]).is_err(), "{kind:?}");
        }
        assert!(ObjectIdentity::new("org.apache.Article$Inner", [1_i64]).is_ok());
    }

    #[test]
    fn usable_as_set_key() {
        let mut hashed = HashSet::new();
        let mut ordered = BTreeSet::new();
        for key in [3_i64, 1, 2, 1] {
            let id = ObjectIdentity::new("Article", [key]).unwrap();
            hashed.insert(id.clone());
            ordered.insert(id);
        }
        assert_eq!(hashed.len(), 3);
        let keys: Vec<i64> = ordered
            .iter()
            .map(|id| id.keys()[0].as_i64().unwrap())
            .collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn display_is_readable() {
        let id = ObjectIdentity::new("Role", [Value::from(5_i64), Value::from("o'neil")]).unwrap();
        assert_eq!(id.to_string(), "Role[5, 'o''neil']");
    }

    #[test]
    fn serde_round_trip_revalidates() {
        let id = ObjectIdentity::new("Article", [Value::from(9_i64), Value::from("a")]).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        let back: ObjectIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);

        let empty = r#"{"kind":"Article","keys":[]}"#;
        assert!(serde_json::from_str::<ObjectIdentity>(empty).is_err());
    }

    struct Article {
        id: i32,
    }

    impl Entity for Article {
        const KIND: &'static str = "Article";

        fn key_values(&self) -> Vec<Value> {
            vec![Value::Int(self.id)]
        }
    }

    #[test]
    fn entity_identity() {
        let id = Article { id: 42 }.identity().unwrap();
        assert_eq!(id, ObjectIdentity::new("Article", [42_i64]).unwrap());
        assert_eq!(id.to_values(), vec![Value::BigInt(42)]);
    }
}
