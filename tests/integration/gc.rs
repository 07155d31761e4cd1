//! GC end-to-end tests
//!
//! Allocate through the public API, collect and check the reclaimed bytes.

use skyrt::runtime::gc::{GCConfig, GarbageCollector, TypeInfo, HEADER_SIZE, WORD_SIZE};
use std::sync::Arc;

fn manual() -> GCConfig {
    GCConfig {
        background: false,
        ..GCConfig::default()
    }
}

#[test]
fn test_unrooted_objects_are_reclaimed() {
    let gc = GarbageCollector::new(manual());
    let ty = Arc::new(TypeInfo::new("blob", 64));

    let mut rooted = Vec::new();
    for i in 0..1000 {
        let ptr = gc.try_alloc(64, &ty).unwrap();
        if i < 10 {
            gc.add_root(ptr);
            rooted.push(ptr);
        }
    }
    let before = gc.stats();
    assert_eq!(before.objects, 1000);
    assert_eq!(before.heap_used, 1000 * (64 + HEADER_SIZE));

    assert!(gc.collect());
    let after = gc.stats();
    assert_eq!(after.collections, before.collections + 1);
    assert_eq!(before.heap_used - after.heap_used, 990 * (64 + HEADER_SIZE));
    assert_eq!(after.objects, 10);
    assert!(rooted.iter().all(|&ptr| gc.is_live(ptr)));
    assert_eq!(after.next_gc, gc.trigger_size());
}

#[test]
fn test_linked_list_survives_through_root() {
    let gc = GarbageCollector::new(manual());
    let node = Arc::new(TypeInfo::with_pointers("node", 2 * WORD_SIZE, &[0]));

    let head = gc.alloc_rooted(2 * WORD_SIZE, &node).unwrap();
    let mut tail = head;
    let mut chain = vec![head];
    for _ in 0..50 {
        let next = gc.try_alloc(2 * WORD_SIZE, &node).unwrap();
        gc.write_pointer(tail, 0, Some(next));
        chain.push(next);
        tail = next;
    }
    let garbage = gc.try_alloc(2 * WORD_SIZE, &node).unwrap();

    gc.collect();
    assert!(chain.iter().all(|&ptr| gc.is_live(ptr)));
    assert!(!gc.is_live(garbage));

    // Dropping the root releases the whole chain.
    gc.remove_root(head);
    gc.collect();
    assert_eq!(gc.stats().objects, 0);
    assert_eq!(gc.stats().heap_used, 0);
}
