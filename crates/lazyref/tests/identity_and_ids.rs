use lazyref::prelude::*;
use lazyref::{IdentityErrorKind, KeyValue, UniqueId};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

struct Article {
    id: i32,
}

impl Entity for Article {
    const KIND: &'static str = "Article";

    fn key_values(&self) -> Vec<Value> {
        vec![Value::Int(self.id)]
    }
}

fn hash_of<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[test]
fn inserted_row_and_foreign_key_agree() {
    let inserted = Article { id: 42 }.identity().unwrap();
    let read_back = ObjectIdentity::from_values("Article", &[Value::BigInt(42)]).unwrap();

    assert_eq!(inserted, read_back);
    assert_eq!(hash_of(&inserted), hash_of(&read_back));
    assert_eq!(inserted.to_string(), "Article[42]");
}

#[test]
fn equality_laws_over_sample() {
    let samples: Vec<ObjectIdentity> = vec![
        ObjectIdentity::new("Article", [1_i64]).unwrap(),
        ObjectIdentity::new("Article", [Value::SmallInt(1)]).unwrap(),
        ObjectIdentity::new("Article", [2_i64]).unwrap(),
        ObjectIdentity::new("Role", [Value::BigInt(1), Value::Text("admin".into())]).unwrap(),
        ObjectIdentity::new("Role", [Value::Int(1), Value::Text("admin".into())]).unwrap(),
        ObjectIdentity::new("Role", [Value::Int(1), Value::Text("guest".into())]).unwrap(),
    ];

    for a in &samples {
        assert_eq!(a, a);
        for b in &samples {
            assert_eq!(a == b, b == a);
            if a == b {
                assert_eq!(hash_of(a), hash_of(b));
            }
            for c in &samples {
                if a == b && b == c {
                    assert_eq!(a, c);
                }
            }
        }
    }
}

#[test]
fn identities_work_as_map_keys() {
    let mut cache: HashMap<ObjectIdentity, &str> = HashMap::new();
    cache.insert(ObjectIdentity::new("Article", [7_i64]).unwrap(), "seven");
    let probe = ObjectIdentity::from_values("Article", &[Value::TinyInt(7)]).unwrap();
    assert_eq!(cache.get(&probe), Some(&"seven"));

    let ordered: BTreeSet<ObjectIdentity> = [3_i64, 1, 2]
        .into_iter()
        .map(|n| ObjectIdentity::new("Article", [n]).unwrap())
        .collect();
    let keys: Vec<i64> = ordered.iter().filter_map(|id| id.keys()[0].as_i64()).collect();
    assert_eq!(keys, vec![1, 2, 3]);
}

#[test]
fn malformed_input_is_invalid_identity() {
    let empty: [Value; 0] = [];
    for result in [
        ObjectIdentity::new("Article", empty),
        ObjectIdentity::new("Article", [Value::Null]),
        ObjectIdentity::new("Article", [Value::Double(1.5)]),
        ObjectIdentity::new("", [1_i64]),
    ] {
        match result {
            Err(Error::InvalidIdentity(_)) => {}
            other => panic!("expected InvalidIdentity, got {other:?}"),
        }
    }

    match ObjectIdentity::new("Article", [Value::Null]) {
        Err(Error::InvalidIdentity(e)) => assert_eq!(e.kind, IdentityErrorKind::UnsupportedValue),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn composite_keys_keep_order() {
    let id = ObjectIdentity::from_keys(
        "Role",
        vec![KeyValue::Int(5), KeyValue::Text("o'neil".into())],
    )
    .unwrap();
    assert!(id.is_composite());
    assert_eq!(id.to_string(), "Role[5, 'o''neil']");

    let swapped = ObjectIdentity::from_keys(
        "Role",
        vec![KeyValue::Text("o'neil".into()), KeyValue::Int(5)],
    )
    .unwrap();
    assert_ne!(id, swapped);
}

#[test]
fn hundred_thousand_tokens_distinct() {
    let generator = UniqueIdGenerator::new();
    let tokens: HashSet<UniqueId> = (0..100_000).map(|_| generator.next()).collect();
    assert_eq!(tokens.len(), 100_000);
}

#[test]
fn tokens_distinct_across_threads_and_generators() {
    let generators = [Arc::new(UniqueIdGenerator::new()), Arc::new(UniqueIdGenerator::new())];
    let mut workers = Vec::new();
    for generator in &generators {
        for _ in 0..4 {
            let generator = Arc::clone(generator);
            workers.push(std::thread::spawn(move || {
                (0..2_000).map(|_| generator.next()).collect::<Vec<_>>()
            }));
        }
    }

    let mut seen = HashSet::new();
    for worker in workers {
        for token in worker.join().unwrap() {
            assert!(seen.insert(token));
        }
    }
    assert_eq!(seen.len(), 16_000);
}

#[test]
fn generated_token_is_a_key_component() {
    let generator = UniqueIdGenerator::new();
    let token = generator.next();
    let id = ObjectIdentity::new("Article", [token]).unwrap();
    let parsed: UniqueId = match &id.keys()[0] {
        KeyValue::Text(text) => text.parse().unwrap(),
        other => panic!("expected text key, got {other:?}"),
    };
    assert_eq!(parsed, token);
}

#[test]
fn context_keys_route_by_all_fields() {
    let a = ConnectionContextKey::new("default", "sa").credential("secret");
    let b = ConnectionContextKey::new("default", "sa").credential("other");
    let c = ConnectionContextKey::new("default", "sa").credential("secret");
    assert_ne!(a, b);
    assert_eq!(a, c);
    assert_eq!(hash_of(&a), hash_of(&c));
    assert!(!format!("{a:?}").contains("secret"));
    assert_eq!(a.to_string(), "sa@default");
}
