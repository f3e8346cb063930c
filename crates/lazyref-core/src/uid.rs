//! Process-unique identifier generation.
//!
//! Used as a primary-key source where the store cannot assign keys
//! synchronously. A token combines three parts:
//!
//! - the generator's start time in milliseconds since the Unix epoch
//! - 64 bits of node entropy drawn once per generator (random, folded with the process id)
//! - a per-generator counter, incremented atomically on every `next()`
//!
//! Two generators never share node entropy except by a 2^-64 accident, and a
//! single generator never repeats a counter value, so tokens are unique across
//! threads, generator instances and processes.

use crate::error::{ConfigError, Error, IdentityError, IdentityErrorKind, Result};
use crate::identity::is_valid_name;
use crate::value::Value;
use rand::Rng;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// An opaque, globally unique token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueId {
    millis: u64,
    node: u64,
    sequence: u64,
}

impl UniqueId {
    /// Length of `to_bytes()` output.
    pub const BYTE_LEN: usize = 24;

    /// Generator start time (ms since the Unix epoch).
    pub fn millis(&self) -> u64 {
        self.millis
    }

    /// Node entropy of the generator that produced this id.
    pub fn node(&self) -> u64 {
        self.node
    }

    /// Counter value within the producing generator.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Big-endian byte form: millis, node, sequence.
    pub fn to_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut out = [0u8; Self::BYTE_LEN];
        out[..8].copy_from_slice(&self.millis.to_be_bytes());
        out[8..16].copy_from_slice(&self.node.to_be_bytes());
        out[16..].copy_from_slice(&self.sequence.to_be_bytes());
        out
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:012x}-{:016x}-{:016x}",
            self.millis, self.node, self.sequence
        )
    }
}

impl FromStr for UniqueId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || {
            Error::InvalidIdentity(IdentityError::new(
                IdentityErrorKind::Malformed,
                "",
                format!("'{s}' is not a unique id"),
            ))
        };

        let mut parts = s.split('-');
        let (Some(millis), Some(node), Some(sequence), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        if node.len() != 16 || sequence.len() != 16 {
            return Err(malformed());
        }

        Ok(Self {
            millis: u64::from_str_radix(millis, 16).map_err(|_| malformed())?,
            node: u64::from_str_radix(node, 16).map_err(|_| malformed())?,
            sequence: u64::from_str_radix(sequence, 16).map_err(|_| malformed())?,
        })
    }
}

impl From<UniqueId> for Value {
    fn from(id: UniqueId) -> Self {
        Value::Text(id.to_string())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn draw_node_entropy() -> u64 {
    let random: u64 = rand::thread_rng().r#gen();
    random ^ u64::from(std::process::id()).rotate_left(32)
}

/// Generator of `UniqueId` tokens.
///
/// `next()` takes `&self` and is safe to call from many threads; the only
/// shared state is the generator's own atomic counter.
pub struct UniqueIdGenerator {
    millis: u64,
    node: u64,
    counter: AtomicU64,
    namespace: Option<String>,
}

impl UniqueIdGenerator {
    /// Create a generator with fresh node entropy.
    pub fn new() -> Self {
        let generator = Self {
            millis: now_millis(),
            node: draw_node_entropy(),
            counter: AtomicU64::new(0),
            namespace: None,
        };
        tracing::debug!(
            millis = generator.millis,
            node = format_args!("{:016x}", generator.node),
            "Created unique id generator"
        );
        generator
    }

    /// Create a generator whose `next_value()` output is prefixed with `namespace:`.
    pub fn with_namespace(namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        if !is_valid_name(&namespace) {
            return Err(Error::Config(ConfigError::new(format!(
                "invalid unique id namespace '{namespace}'"
            ))));
        }
        let mut generator = Self::new();
        generator.namespace = Some(namespace);
        Ok(generator)
    }

    /// Produce the next token.
    pub fn next(&self) -> UniqueId {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed);
        UniqueId {
            millis: self.millis,
            node: self.node,
            sequence,
        }
    }

    /// Produce the next token as a text key value, prefixed by the namespace if set.
    pub fn next_value(&self) -> Value {
        let id = self.next();
        match &self.namespace {
            Some(ns) => Value::Text(format!("{ns}:{id}")),
            None => Value::from(id),
        }
    }

    /// Number of tokens issued so far.
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl Default for UniqueIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UniqueIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueIdGenerator")
            .field("millis", &self.millis)
            .field("node", &format_args!("{:016x}", self.node))
            .field("issued", &self.issued())
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn hundred_thousand_tokens_are_distinct() {
        let generator = UniqueIdGenerator::new();
        let ids: HashSet<UniqueId> = (0..100_000).map(|_| generator.next()).collect();
        assert_eq!(ids.len(), 100_000);
        assert_eq!(generator.issued(), 100_000);
    }

    #[test]
    fn concurrent_callers_never_collide() {
        let generator = Arc::new(UniqueIdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let generator = Arc::clone(&generator);
                std::thread::spawn(move || {
                    (0..5_000).map(|_| generator.next()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(all.len(), 40_000);
    }

    #[test]
    fn separate_generators_do_not_overlap() {
        let a = UniqueIdGenerator::new();
        let b = UniqueIdGenerator::new();
        assert_ne!(a.node, b.node);
        let first_a = a.next();
        let first_b = b.next();
        assert_eq!(first_a.sequence(), first_b.sequence());
        assert_ne!(first_a, first_b);
    }

    #[test]
    fn text_form_parses_back() {
        let generator = UniqueIdGenerator::new();
        let id = generator.next();
        let text = id.to_string();
        assert_eq!(text.parse::<UniqueId>().unwrap(), id);

        assert!("nope".parse::<UniqueId>().is_err());
        assert!("1-2-3".parse::<UniqueId>().is_err());
        assert!(format!("{text}-extra").parse::<UniqueId>().is_err());
    }

    #[test]
    fn bytes_are_big_endian_parts() {
        let id = UniqueId {
            millis: 1,
            node: 2,
            sequence: 3,
        };
        let bytes = id.to_bytes();
        assert_eq!(bytes[7], 1);
        assert_eq!(bytes[15], 2);
        assert_eq!(bytes[23], 3);
    }

    #[test]
    fn namespaced_values() {
        let generator = UniqueIdGenerator::with_namespace("article").unwrap();
        let value = generator.next_value();
        assert!(value.as_str().unwrap().starts_with("article:"));
        assert!(UniqueIdGenerator::with_namespace("no spaces").is_err());
    }
}
