//! `#[derive(Trace)]` on structs, tuples, enums and generic types.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use arbor_gc::{Collector, Gc, GcConfig, Member, Persistent, Trace, WeakMember};

static LEAVES: AtomicUsize = AtomicUsize::new(0);

#[derive(Trace)]
struct Leaf(u32);

impl Drop for Leaf {
    fn drop(&mut self) {
        LEAVES.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Trace)]
struct Named {
    first: Member<Leaf>,
    rest: Vec<Gc<Leaf>>,
    #[arbor_gc(skip)]
    untraced: Mutex<u32>,
}

#[derive(Trace)]
struct Tuple(Gc<Leaf>, Option<Gc<Leaf>>, u64);

#[derive(Trace)]
enum Shape {
    Empty,
    One(Gc<Leaf>),
    Pair { left: Gc<Leaf>, right: Gc<Leaf> },
    Weak(WeakMember<Leaf>),
}

#[derive(Trace)]
struct Wrapper<T> {
    inner: T,
}

#[derive(Trace)]
#[arbor_gc(crate = arbor_gc)]
struct WithCratePath {
    leaf: Gc<Leaf>,
}

fn leaf(value: u32) -> Gc<Leaf> {
    Gc::new(Leaf(value))
}

#[test]
fn test_derived_impls_trace_every_field() {
    let collector = Collector::new(GcConfig::default().without_heuristics());
    let thread = collector.attach_current_thread();

    let named = Persistent::new(Gc::new(Named {
        first: Member::new(leaf(1)),
        rest: vec![leaf(2), leaf(3)],
        untraced: Mutex::new(7),
    }));
    let tuple = Persistent::new(Gc::new(Tuple(leaf(4), Some(leaf(5)), 6)));
    let shapes = Persistent::new(Gc::new(vec![
        Shape::Empty,
        Shape::One(leaf(7)),
        Shape::Pair {
            left: leaf(8),
            right: leaf(9),
        },
        Shape::Weak(WeakMember::new(leaf(10))),
    ]));
    let wrapped = Persistent::new(Gc::new(Wrapper {
        inner: (leaf(11), Member::new(leaf(12))),
    }));
    let pathed = Persistent::new(Gc::new(WithCratePath { leaf: leaf(13) }));

    thread.collect_all_garbage();
    // Only the weakly held leaf is gone.
    assert_eq!(LEAVES.load(Ordering::SeqCst), 1);

    let named = named.get().unwrap();
    assert_eq!(named.first.get().unwrap().0, 1);
    assert_eq!(named.rest.iter().map(|l| l.0).collect::<Vec<_>>(), [2, 3]);
    assert_eq!(*named.untraced.lock().unwrap(), 7);

    let tuple = tuple.get().unwrap();
    assert_eq!((tuple.0 .0, tuple.1.unwrap().0, tuple.2), (4, 5, 6));

    let shapes = shapes.get().unwrap();
    assert!(matches!(shapes[1], Shape::One(l) if l.0 == 7));
    assert!(matches!(shapes[2], Shape::Pair { left, right } if left.0 == 8 && right.0 == 9));
    assert!(matches!(&shapes[3], Shape::Weak(weak) if weak.get().is_none()));

    let wrapped = wrapped.get().unwrap();
    assert_eq!(wrapped.inner.0 .0, 11);
    assert_eq!(wrapped.inner.1.get().unwrap().0, 12);
    assert_eq!(pathed.get().unwrap().leaf.0, 13);
}

struct Opaque {
    counter: Mutex<u32>,
}

arbor_gc::static_collect!(Opaque);

#[test]
fn test_static_collect_for_leaf_types() {
    let collector = Collector::new(GcConfig::default().without_heuristics());
    let thread = collector.attach_current_thread();
    let opaque = Persistent::new(Gc::new(Opaque {
        counter: Mutex::new(1),
    }));
    *opaque.get().unwrap().counter.lock().unwrap() += 1;
    thread.collect_all_garbage();
    assert_eq!(*opaque.get().unwrap().counter.lock().unwrap(), 2);
}
