use std::collections::BTreeMap;
use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};

use loam::{Database, DbConfig};

fn small_db(dir: &tempfile::TempDir) -> Arc<Database> {
    // tiny regions so inserts exercise rollover and evacuation
    Database::open(
        dir.path().join("db"),
        DbConfig::builder().initial_region_size(4 * 4096).build(),
    )
    .unwrap()
}

#[test]
fn insert_get_remove() {
    let dir = tempfile::tempdir().unwrap();
    let db = small_db(&dir);
    let mut ws = db.start_write_session().unwrap();

    assert_eq!(ws.upsert(b"apple", b"red").unwrap(), -1);
    assert_eq!(ws.get(b"apple").as_deref(), Some(&b"red"[..]));
    assert_eq!(ws.upsert(b"apple", b"green").unwrap(), 3);
    assert_eq!(ws.get(b"apple").as_deref(), Some(&b"green"[..]));
    assert_eq!(ws.remove(b"apple").unwrap(), 5);
    assert_eq!(ws.get(b"apple"), None);
    assert_eq!(ws.remove(b"apple").unwrap(), -1);
}

#[test]
fn prefix_collapse() {
    let dir = tempfile::tempdir().unwrap();
    let db = small_db(&dir);
    let mut ws = db.start_write_session().unwrap();

    assert_eq!(ws.upsert(b"abc", b"1").unwrap(), -1);
    assert_eq!(ws.upsert(b"abd", b"2").unwrap(), -1);
    assert_eq!(ws.get(b"abc").as_deref(), Some(&b"1"[..]));
    assert_eq!(ws.get(b"abd").as_deref(), Some(&b"2"[..]));

    assert_eq!(ws.remove(b"abc").unwrap(), 1);
    assert_eq!(ws.get(b"abc"), None);

    // the tree collapsed back to a single leaf
    let it = ws.first();
    assert_eq!(it.key().unwrap(), b"abd");
    assert_eq!(it.value().unwrap(), b"2");
    let mut it = ws.first();
    it.next();
    assert!(!it.valid());
    ws.validate().unwrap();
}

#[test]
fn iteration_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = small_db(&dir);
    let mut ws = db.start_write_session().unwrap();

    for k in ["b", "c", "a", "d"] {
        ws.upsert(k.as_bytes(), k.as_bytes()).unwrap();
    }

    let mut it = ws.first();
    for expected in ["a", "b", "c", "d"] {
        assert!(it.valid());
        assert_eq!(it.key().unwrap(), expected.as_bytes());
        assert_eq!(it.value().unwrap(), expected.as_bytes());
        it.next();
    }
    assert!(!it.valid());

    let mut it = ws.last();
    for expected in ["d", "c", "b", "a"] {
        assert!(it.valid());
        assert_eq!(it.key().unwrap(), expected.as_bytes());
        it.prev();
    }
    assert!(!it.valid());
}

#[test]
fn empty_key_at_root() {
    let dir = tempfile::tempdir().unwrap();
    let db = small_db(&dir);
    let mut ws = db.start_write_session().unwrap();

    assert_eq!(ws.upsert(b"", b"root value").unwrap(), -1);
    assert_eq!(ws.upsert(b"a", b"leaf").unwrap(), -1);
    assert_eq!(ws.get(b"").as_deref(), Some(&b"root value"[..]));
    assert_eq!(ws.get(b"a").as_deref(), Some(&b"leaf"[..]));

    // the empty key iterates first
    let it = ws.first();
    assert_eq!(it.key().unwrap(), b"");
    assert_eq!(it.value().unwrap(), b"root value");

    assert_eq!(ws.remove(b"").unwrap(), 10);
    assert_eq!(ws.get(b""), None);
    assert_eq!(ws.get(b"a").as_deref(), Some(&b"leaf"[..]));
}

#[test]
fn last_nibble_divergence() {
    // 0x61 and 0x62 in the third byte differ only in the final 6-bit
    // nibble, so these keys collapse into the deepest possible inner node
    let dir = tempfile::tempdir().unwrap();
    let db = small_db(&dir);
    let mut ws = db.start_write_session().unwrap();

    assert_eq!(ws.upsert(b"aaa", b"1").unwrap(), -1);
    assert_eq!(ws.upsert(b"aab", b"2").unwrap(), -1);
    assert_eq!(ws.get(b"aaa").as_deref(), Some(&b"1"[..]));
    assert_eq!(ws.get(b"aab").as_deref(), Some(&b"2"[..]));

    assert_eq!(ws.remove(b"aaa").unwrap(), 1);
    assert_eq!(ws.get(b"aab").as_deref(), Some(&b"2"[..]));
    let it = ws.first();
    assert_eq!(it.key().unwrap(), b"aab");
}

#[test]
fn inner_value_collapse() {
    // three-byte groups keep nibble prefixes aligned with byte prefixes,
    // so "abc" terminates exactly at an inner node above "abcdef"
    let dir = tempfile::tempdir().unwrap();
    let db = small_db(&dir);
    let mut ws = db.start_write_session().unwrap();

    ws.upsert(b"abc", b"v1").unwrap();
    ws.upsert(b"abcdef", b"v2").unwrap();
    assert_eq!(ws.get(b"abc").as_deref(), Some(&b"v1"[..]));
    assert_eq!(ws.get(b"abcdef").as_deref(), Some(&b"v2"[..]));

    // removing the only branch leaves the inner value as a leaf
    assert_eq!(ws.remove(b"abcdef").unwrap(), 2);
    assert_eq!(ws.get(b"abc").as_deref(), Some(&b"v1"[..]));
    let it = ws.first();
    assert_eq!(it.key().unwrap(), b"abc");
    ws.validate().unwrap();

    // and the other way: removing the inner value collapses into the child
    ws.upsert(b"abcdef", b"v2").unwrap();
    assert_eq!(ws.remove(b"abc").unwrap(), 2);
    assert_eq!(ws.get(b"abcdef").as_deref(), Some(&b"v2"[..]));
    assert_eq!(ws.get(b"abc"), None);
    let it = ws.first();
    assert_eq!(it.key().unwrap(), b"abcdef");
    ws.validate().unwrap();
}

#[test]
fn find_and_lower_bound() {
    let dir = tempfile::tempdir().unwrap();
    let db = small_db(&dir);
    let mut ws = db.start_write_session().unwrap();

    let keys: &[&[u8]] = &[b"abc", b"abcdef", b"abd", b"b", b"ba", b"zzz"];
    for k in keys {
        ws.upsert(k, k).unwrap();
    }

    for k in keys {
        let it = ws.find(k);
        assert!(it.valid(), "find {:?}", k);
        assert_eq!(it.key().unwrap(), *k);
        assert_eq!(it.value().unwrap(), *k);
    }
    assert!(!ws.find(b"ab").valid());
    assert!(!ws.find(b"zzzz").valid());

    let it = ws.lower_bound(b"");
    assert_eq!(it.key().unwrap(), b"abc");
    let it = ws.lower_bound(b"abc");
    assert_eq!(it.key().unwrap(), b"abc");
    let it = ws.lower_bound(b"abca");
    assert_eq!(it.key().unwrap(), b"abcdef");
    let it = ws.lower_bound(b"abe");
    assert_eq!(it.key().unwrap(), b"b");
    let it = ws.lower_bound(b"c");
    assert_eq!(it.key().unwrap(), b"zzz");
    assert!(!ws.lower_bound(b"zzzz").valid());
}

#[test]
fn last_with_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let db = small_db(&dir);
    let mut ws = db.start_write_session().unwrap();

    // three-byte prefixes align exactly with nibble boundaries
    for k in ["abc", "abcd", "abcz", "abd", "xyz"] {
        ws.upsert(k.as_bytes(), k.as_bytes()).unwrap();
    }
    let it = ws.last_with_prefix(b"abc");
    assert_eq!(it.key().unwrap(), b"abcz");
    let it = ws.last_with_prefix(b"xyz");
    assert_eq!(it.key().unwrap(), b"xyz");
    assert!(!ws.last_with_prefix(b"abq").valid());
}

#[test]
fn model_equivalence_fuzz() {
    let dir = tempfile::tempdir().unwrap();
    let db = small_db(&dir);
    let mut ws = db.start_write_session().unwrap();
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(42);

    let keygen = |rng: &mut StdRng| -> Vec<u8> {
        let len = rng.gen_range(0..8);
        (0..len).map(|_| rng.gen_range(b'a'..b'f')).collect()
    };

    for round in 0..40 {
        for _ in 0..100 {
            let key = keygen(&mut rng);
            if rng.gen_bool(0.7) {
                let len = rng.gen_range(0..200);
                let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                let expected = model.get(&key).map(|v| v.len() as i32).unwrap_or(-1);
                assert_eq!(ws.upsert(&key, &value).unwrap(), expected);
                model.insert(key, value);
            } else {
                let expected = model.get(&key).map(|v| v.len() as i32).unwrap_or(-1);
                assert_eq!(ws.remove(&key).unwrap(), expected);
                model.remove(&key);
            }
        }

        // spot-check lookups
        for (k, v) in model.iter().take(50) {
            assert_eq!(ws.get(k).as_deref(), Some(&v[..]), "round {}", round);
        }
        assert_eq!(ws.get(b"not-in-the-model"), None);
    }

    // full forward iteration matches the model's order
    let mut it = ws.first();
    for (k, v) in model.iter() {
        assert!(it.valid());
        assert_eq!(it.key().unwrap(), *k);
        assert_eq!(it.value().unwrap(), *v);
        it.next();
    }
    assert!(!it.valid());

    // and backwards
    let mut it = ws.last();
    for (k, _) in model.iter().rev() {
        assert!(it.valid());
        assert_eq!(it.key().unwrap(), *k);
        it.prev();
    }
    assert!(!it.valid());

    ws.validate().unwrap();
}

#[test]
fn large_values_and_limits() {
    let dir = tempfile::tempdir().unwrap();
    let db = small_db(&dir);
    let mut ws = db.start_write_session().unwrap();

    // larger than a region would ever hold in one piece is still refused
    let huge = vec![0u8; 17 * 1024 * 1024];
    assert!(ws.upsert(b"big", &huge).is_err());

    // values spanning multiple alignment classes round-trip
    for len in [0usize, 1, 7, 8, 9, 255, 256, 4095] {
        let key = format!("len{}", len);
        let value: Vec<u8> = (0..len).map(|i| i as u8).collect();
        ws.upsert(key.as_bytes(), &value).unwrap();
        assert_eq!(ws.get(key.as_bytes()).unwrap(), value);
    }
}
