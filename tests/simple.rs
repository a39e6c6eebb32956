use stripemap::{CursorError, Options, StripeMap};

#[test]
fn insert_get() {
    const ITER: i32 = 1024;
    let map = StripeMap::new();

    for i in 0..ITER {
        map.insert(i, i + 7);
    }

    for i in 0..ITER {
        assert_eq!(map.get(&i), Some(i + 7));
    }
}

#[test]
fn insert_returns_previous() {
    let map = StripeMap::new();

    assert_eq!(map.insert("a", 1), None);
    assert_eq!(map.insert("a", 2), Some(1));
    assert_eq!(map.get("a"), Some(2));
}

#[test]
fn insert_if_absent_keeps_existing() {
    let map = StripeMap::new();

    assert_eq!(map.insert_if_absent("a", 1), None);
    assert_eq!(map.insert_if_absent("a", 2), Some(1));
    assert_eq!(map.get("a"), Some(1));
}

#[test]
fn insert_remove() {
    const ITER: i32 = 1024;
    let map = StripeMap::with_capacity(ITER as usize);

    for i in 0..ITER {
        map.insert(i, i + 7);
    }

    for i in 0..ITER {
        assert_eq!(map.remove(&i), Some(i + 7));
    }

    assert!(map.is_empty());
}

#[test]
fn remove_missing_is_none() {
    let map: StripeMap<i32, i32> = StripeMap::new();

    assert_eq!(map.remove(&3), None);
}

#[test]
fn remove_if_equals_checks_the_value() {
    let map = StripeMap::new();
    map.insert("a", 1);

    assert!(!map.remove_if_equals("a", &2));
    assert_eq!(map.get("a"), Some(1));

    assert!(map.remove_if_equals("a", &1));
    assert_eq!(map.get("a"), None);
}

#[test]
fn replace_requires_a_binding() {
    let map = StripeMap::new();

    assert_eq!(map.replace("a", 1), None);
    assert!(!map.contains_key("a"));

    map.insert("a", 1);
    assert_eq!(map.replace("a", 5), Some(1));
    // replacing with the same value again returns that value
    assert_eq!(map.replace("a", 5), Some(5));
}

#[test]
fn replace_if_equals_checks_the_value() {
    let map = StripeMap::new();
    map.insert("a", 1);

    assert!(!map.replace_if_equals("a", &9, 2));
    assert_eq!(map.get("a"), Some(1));

    assert!(map.replace_if_equals("a", &1, 2));
    assert_eq!(map.get("a"), Some(2));

    assert!(!map.replace_if_equals("missing", &1, 2));
}

#[test]
fn clear_is_idempotent() {
    let map = StripeMap::new();
    for i in 0..256 {
        map.insert(i, i);
    }

    map.clear();
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);

    map.clear();
    assert!(map.is_empty());

    map.insert(1, 1);
    assert_eq!(map.len(), 1);
}

#[test]
fn contains_value_walks_every_chain() {
    let map = StripeMap::new();
    map.insert(1, 10);
    map.insert(2, 20);

    assert!(map.contains_value(&10));
    assert!(map.contains_value(&20));
    assert!(!map.contains_value(&30));
}

#[test]
fn len_tracks_mutations() {
    let map = StripeMap::new();
    assert!(map.is_empty());

    for i in 0..100 {
        map.insert(i, i);
    }
    assert_eq!(map.len(), 100);

    for i in 0..50 {
        map.remove(&i);
    }
    assert_eq!(map.len(), 50);
}

#[test]
fn iteration_is_complete_and_distinct() {
    let map = StripeMap::new();
    for i in 0..256 {
        map.insert(i, i * 2);
    }

    let mut keys: Vec<i32> = map.keys().collect();
    keys.sort_unstable();
    assert_eq!(keys, (0..256).collect::<Vec<_>>());

    let mut entries: Vec<(i32, i32)> = map.iter().collect();
    entries.sort_unstable();
    assert!(entries.iter().all(|&(k, v)| v == k * 2));
    assert_eq!(entries.len(), 256);
}

#[test]
fn cursor_remove_needs_a_current_entry() {
    let map = StripeMap::new();
    map.insert(1, 10);
    map.insert(2, 20);

    let mut iter = map.iter();
    assert_eq!(iter.remove_last(), Err(CursorError::NoCurrentEntry));

    let (key, value) = iter.next().unwrap();
    assert_eq!(iter.remove_last(), Ok(Some(value)));
    assert_eq!(iter.remove_last(), Err(CursorError::NoCurrentEntry));
    drop(iter);

    assert!(!map.contains_key(&key));
    assert_eq!(map.len(), 1);
}

#[test]
fn cursor_survives_removal_mid_iteration() {
    let map = StripeMap::new();
    for i in 1..=100 {
        map.insert(i, i);
    }

    let mut seen = std::collections::HashSet::new();
    let mut removed = false;
    for (key, _) in map.iter() {
        assert!(seen.insert(key), "cursor returned {key} twice");
        if !removed {
            map.remove(&50);
            removed = true;
        }
    }

    // every key present throughout the iteration shows up exactly once
    assert!(seen.len() >= 99);
}

#[test]
fn growth_in_a_single_partition() {
    let map = StripeMap::with_options_and_hasher(
        Options {
            initial_capacity: 16,
            load_factor: 0.75,
            concurrency_level: 1,
        },
        std::collections::hash_map::RandomState::new(),
    );
    assert_eq!(map.partition_count(), 1);

    for i in 0..500 {
        map.insert(i, i);
    }

    assert_eq!(map.len(), 500);
    for i in 0..500 {
        assert_eq!(map.get(&i), Some(i));
    }
}

#[test]
fn write_through_reestablishes_binding() {
    let map = StripeMap::new();
    map.insert("k", 1);
    map.remove("k");

    // writing through after the node went away re-creates the binding
    assert_eq!(map.insert("k", 2), None);
    assert_eq!(map.get("k"), Some(2));
}

#[test]
fn from_iterator_and_extend() {
    let mut map: StripeMap<i32, i32> = (0..64).map(|i| (i, i)).collect();
    assert_eq!(map.len(), 64);

    map.extend((64..128).map(|i| (i, i)));
    assert_eq!(map.len(), 128);
    for i in 0..128 {
        assert_eq!(map.get(&i), Some(i));
    }
}

#[test]
fn debug_formats_as_a_map() {
    let map: StripeMap<i32, i32> = StripeMap::new();
    assert_eq!(format!("{map:?}"), "{}");

    map.insert(1, 2);
    assert_eq!(format!("{map:?}"), "{1: 2}");
}

#[cfg(feature = "serde")]
#[test]
fn serde_roundtrip_preserves_contents() {
    let map = StripeMap::new();
    for i in 0..64 {
        map.insert(i, i * 3);
    }

    let json = serde_json::to_string(&map).unwrap();
    let restored: StripeMap<i32, i32> = serde_json::from_str(&json).unwrap();

    assert_eq!(restored.len(), 64);
    for i in 0..64 {
        assert_eq!(restored.get(&i), Some(i * 3));
    }
}
