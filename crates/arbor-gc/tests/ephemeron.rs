//! Ephemeron tables: values live exactly as long as their keys.

use std::sync::atomic::{AtomicUsize, Ordering};

use arbor_gc::{Collector, EphemeronTable, Gc, GcConfig, Member, Persistent, Trace};

fn collector() -> Collector {
    Collector::new(GcConfig::default().without_heuristics())
}

#[derive(Trace)]
struct Key {
    index: usize,
}

#[derive(Trace)]
struct Value {
    index: usize,
    next: Member<Key>,
}

#[derive(Trace)]
struct Registry {
    table: EphemeronTable<Key, Gc<Value>>,
    first: Member<Key>,
}

const CHAIN: usize = 100;

/// Builds `key_i -> value_i -> key_{i+1}` with only `key_0` strongly held.
fn build_chain() -> (Persistent<Registry>, Vec<Gc<Key>>, Vec<Gc<Value>>) {
    let keys: Vec<Gc<Key>> = (0..CHAIN).map(|index| Gc::new(Key { index })).collect();
    let values: Vec<Gc<Value>> = (0..CHAIN)
        .map(|index| {
            Gc::new(Value {
                index,
                next: keys.get(index + 1).map_or_else(Member::empty, |k| Member::new(*k)),
            })
        })
        .collect();
    let registry = Gc::new(Registry {
        table: EphemeronTable::new(),
        first: Member::new(keys[0]),
    });
    // Insert back to front so a single in-order pass cannot reach the end.
    for index in (0..CHAIN).rev() {
        registry.table.insert(keys[index], values[index]);
    }
    (Persistent::new(registry), keys, values)
}

#[test]
fn test_chain_survives_through_fixed_point() {
    let collector = collector();
    let thread = collector.attach_current_thread();
    let (registry, keys, _values) = build_chain();

    let outcome = thread.collect_garbage(
        arbor_gc::StackState::NoHeapPointersOnStack,
        arbor_gc::SweepKind::Eager,
        arbor_gc::GcReason::ForcedGc,
    );
    assert!(outcome.metrics().unwrap().ephemeron_passes > 2);

    let registry = registry.get().unwrap();
    assert_eq!(registry.table.len(), CHAIN);
    for (index, key) in keys.iter().enumerate() {
        assert_eq!(key.index, index);
        assert_eq!(registry.table.get(key).unwrap().index, index);
    }
}

#[test]
fn test_breaking_the_chain_clears_exactly_the_suffix() {
    const BREAK_AT: usize = 37;

    let collector = collector();
    let thread = collector.attach_current_thread();
    let (registry, keys, values) = build_chain();

    // value_{k-1} no longer reaches key_k.
    values[BREAK_AT - 1].next.set(None);
    thread.collect_all_garbage();

    let registry = registry.get().unwrap();
    assert_eq!(registry.table.len(), BREAK_AT);
    for key in &keys[..BREAK_AT] {
        assert!(registry.table.contains_key(key));
    }
    for key in &keys[BREAK_AT..] {
        assert!(!registry.table.contains_key(key));
    }
}

static VALUES_FINALIZED: AtomicUsize = AtomicUsize::new(0);

#[derive(Trace)]
struct Tracked;

impl Drop for Tracked {
    fn drop(&mut self) {
        VALUES_FINALIZED.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Trace)]
struct Cache {
    table: EphemeronTable<Key, Gc<Tracked>>,
}

#[test]
fn test_value_dies_with_key_and_not_before() {
    let collector = collector();
    let thread = collector.attach_current_thread();

    let cache = Persistent::new(Gc::new(Cache {
        table: EphemeronTable::new(),
    }));
    let key = Gc::new(Key { index: 0 });
    let key_root = Persistent::new(key);
    cache.get().unwrap().table.insert(key, Gc::new(Tracked));

    thread.collect_all_garbage();
    assert_eq!(VALUES_FINALIZED.load(Ordering::SeqCst), 0);
    assert_eq!(cache.get().unwrap().table.len(), 1);

    drop(key_root);
    thread.collect_all_garbage();
    assert_eq!(VALUES_FINALIZED.load(Ordering::SeqCst), 1);
    assert!(cache.get().unwrap().table.is_empty());
}

#[test]
fn test_value_does_not_keep_its_own_key_alive() {
    #[derive(Trace)]
    struct SelfRef {
        key: Member<Key>,
    }

    #[derive(Trace)]
    struct Map {
        table: EphemeronTable<Key, Gc<SelfRef>>,
    }

    let collector = collector();
    let thread = collector.attach_current_thread();
    let map = Persistent::new(Gc::new(Map {
        table: EphemeronTable::new(),
    }));
    let key = Gc::new(Key { index: 9 });
    map.get()
        .unwrap()
        .table
        .insert(key, Gc::new(SelfRef { key: Member::new(key) }));

    thread.collect_all_garbage();
    assert!(map.get().unwrap().table.is_empty());
}
