//! GC 单元测试
//!
//! 测试垃圾回收器的分配、标记、清扫和自适应调优

use crate::runtime::gc::{
    GCConfig, GCOptimizer, GCState, GarbageCollector, GcPtr, TypeInfo, HEADER_SIZE, WORD_SIZE,
};
use crate::runtime::memory::AllocError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn manual_config() -> GCConfig {
    GCConfig {
        background: false,
        mark_workers: 2,
        ..GCConfig::default()
    }
}

fn leaf(size: usize) -> Arc<TypeInfo> {
    Arc::new(TypeInfo::new("leaf", size))
}

/// A two-word node whose first word points at another node.
fn node() -> Arc<TypeInfo> {
    Arc::new(TypeInfo::with_pointers("node", 2 * WORD_SIZE, &[0]))
}

#[cfg(test)]
mod type_info_tests {
    use super::*;

    #[test]
    fn test_pointer_map() {
        let ty = TypeInfo::with_pointers("pair", 4 * WORD_SIZE, &[1, 3, 9]);
        assert!(!ty.is_pointer(0));
        assert!(ty.is_pointer(1));
        assert!(ty.is_pointer(3));
        // out of range indices are dropped
        assert!(!ty.is_pointer(9));
        assert_eq!(ty.pointer_words().collect::<Vec<_>>(), vec![1, 3]);
        assert!(ty.has_pointers());
    }

    #[test]
    fn test_wide_pointer_map() {
        let ty = TypeInfo::with_pointers("wide", 100 * WORD_SIZE, &[0, 64, 99]);
        assert_eq!(ty.pointer_words().collect::<Vec<_>>(), vec![0, 64, 99]);
    }

    #[test]
    fn test_plain_type() {
        let ty = TypeInfo::new("bytes", 24);
        assert_eq!(ty.name(), "bytes");
        assert_eq!(ty.size(), 24);
        assert!(!ty.has_pointers());
    }

    #[test]
    fn test_header_size() {
        assert_eq!(HEADER_SIZE % 16, 0);
        assert!(HEADER_SIZE >= 3 * WORD_SIZE);
    }
}

#[cfg(test)]
mod alloc_tests {
    use super::*;

    #[test]
    fn test_alloc_accounts_header() {
        let gc = GarbageCollector::new(manual_config());
        let ty = leaf(64);
        gc.alloc(64, &ty);
        let stats = gc.stats();
        assert_eq!(stats.heap_used, 64 + HEADER_SIZE);
        assert_eq!(stats.objects, 1);
        assert_eq!(stats.heap_size, 64 * 1024);
    }

    #[test]
    fn test_alloc_is_zeroed_and_writable() {
        let gc = GarbageCollector::new(manual_config());
        let ty = leaf(32);
        let obj = gc.alloc(32, &ty);
        assert_eq!(gc.read_word(obj, 0), 0);
        gc.write_word(obj, 3, 0xdead);
        assert_eq!(gc.read_word(obj, 3), 0xdead);
        assert_eq!(obj.addr() % 16, 0);
    }

    #[test]
    fn test_large_object_gets_own_arena() {
        let gc = GarbageCollector::new(manual_config());
        let ty = leaf(200 * 1024);
        gc.alloc(200 * 1024, &ty);
        assert_eq!(gc.stats().heap_size, 200 * 1024 + HEADER_SIZE);
    }

    #[test]
    fn test_heap_limit() {
        let gc = GarbageCollector::new(GCConfig {
            arena_size: 1024,
            max_heap_size: 2048,
            ..manual_config()
        });
        let ty = leaf(512);
        let mut ok = 0;
        let err = loop {
            match gc.try_alloc(512, &ty) {
                Ok(_) => ok += 1,
                Err(err) => break err,
            }
        };
        assert_eq!(ok, 2);
        assert!(matches!(err, AllocError::HeapLimit { limit: 2048, .. }));
    }

    #[test]
    fn test_try_alloc_size_overflow() {
        let gc = GarbageCollector::new(manual_config());
        let ty = leaf(16);

        for size in [usize::MAX, usize::MAX - 3, usize::MAX - 15] {
            assert_eq!(
                gc.try_alloc(size, &ty).unwrap_err(),
                AllocError::OutOfMemory { requested: size }
            );
        }
        assert!(matches!(
            gc.try_alloc(usize::MAX / 2, &ty),
            Err(AllocError::HeapLimit { .. })
        ));

        let stats = gc.stats();
        assert_eq!(stats.objects, 0);
        assert_eq!(stats.heap_used, 0);
        assert_eq!(stats.heap_size, 0);
        assert_eq!(stats.total_allocated, 0);

        let obj = gc.try_alloc(16, &ty).unwrap();
        assert_eq!(gc.read_word(obj, 0), 0);
    }

    #[test]
    #[should_panic(expected = "heap limit exceeded")]
    fn test_alloc_exhaustion_is_fatal() {
        let gc = GarbageCollector::new(GCConfig {
            arena_size: 1024,
            max_heap_size: 1024,
            ..manual_config()
        });
        gc.alloc(4096, &leaf(4096));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_word_bounds() {
        let gc = GarbageCollector::new(manual_config());
        let obj = gc.alloc(16, &leaf(16));
        gc.read_word(obj, 2);
    }
}

#[cfg(test)]
mod collect_tests {
    use super::*;

    #[test]
    fn test_unrooted_objects_are_reclaimed() {
        let gc = GarbageCollector::new(manual_config());
        let ty = leaf(64);
        let kept = gc.alloc(64, &ty);
        let dropped: Vec<GcPtr> = (0..5).map(|_| gc.alloc(64, &ty)).collect();
        gc.add_root(kept);

        assert!(gc.collect());

        assert!(gc.is_live(kept));
        assert!(dropped.iter().all(|&p| !gc.is_live(p)));
        let stats = gc.stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.heap_used, 64 + HEADER_SIZE);
        assert_eq!(stats.free_blocks, 5);
        assert_eq!(stats.total_freed, 5 * (64 + HEADER_SIZE) as u64);
        assert_eq!(gc.state(), GCState::Idle);
    }

    #[test]
    fn test_reachable_through_pointers_survive() {
        let gc = GarbageCollector::new(manual_config());
        let ty = node();
        let head = gc.alloc(ty.size(), &ty);
        let mut tail = head;
        let mut chain = vec![head];
        for _ in 0..20 {
            let next = gc.alloc(ty.size(), &ty);
            gc.write_pointer(tail, 0, Some(next));
            chain.push(next);
            tail = next;
        }
        let orphan = gc.alloc(ty.size(), &ty);
        gc.add_root(head);

        gc.collect();

        assert!(chain.iter().all(|&p| gc.is_live(p)));
        assert!(!gc.is_live(orphan));
        assert_eq!(gc.read_pointer(head, 0), Some(chain[1]));
        assert_eq!(gc.read_pointer(tail, 0), None);
    }

    #[test]
    fn test_cycles_are_collected() {
        let gc = GarbageCollector::new(manual_config());
        let ty = node();
        let a = gc.alloc(ty.size(), &ty);
        let b = gc.alloc(ty.size(), &ty);
        gc.write_pointer(a, 0, Some(b));
        gc.write_pointer(b, 0, Some(a));
        gc.collect();
        assert!(!gc.is_live(a));
        assert!(!gc.is_live(b));
    }

    #[test]
    fn test_survivors_stay_live_across_cycles() {
        let gc = GarbageCollector::new(manual_config());
        let ty = leaf(16);
        let root = gc.alloc(16, &ty);
        gc.add_root(root);
        for _ in 0..3 {
            gc.collect();
            assert!(gc.is_live(root));
        }
        gc.remove_root(root);
        gc.collect();
        assert!(!gc.is_live(root));
        assert_eq!(gc.stats().collections, 4);
        assert_eq!(gc.pause_history().len(), 4);
    }

    #[test]
    fn test_free_list_reuse() {
        let gc = GarbageCollector::new(manual_config());
        let ty = leaf(64);
        let freed: Vec<usize> = (0..4).map(|_| gc.alloc(64, &ty).addr()).collect();
        gc.collect();
        let heap_size = gc.stats().heap_size;

        // a smaller request fits a freed block (first fit, no split)
        let small = leaf(16);
        let reused = gc.alloc(16, &small);
        assert!(freed.contains(&reused.addr()));
        assert_eq!(gc.read_word(reused, 0), 0);
        assert_eq!(gc.stats().heap_used, 64 + HEADER_SIZE);
        assert_eq!(gc.stats().free_blocks, 3);
        assert_eq!(gc.stats().heap_size, heap_size);
    }

    #[test]
    fn test_disabled_collector_does_nothing() {
        let gc = GarbageCollector::new(manual_config());
        let obj = gc.alloc(16, &leaf(16));
        gc.disable();
        assert!(!gc.collect());
        assert!(gc.is_live(obj));
        gc.enable();
        assert!(gc.collect());
        assert!(!gc.is_live(obj));
    }

    #[test]
    fn test_concurrent_collect_calls() {
        let gc = GarbageCollector::new(manual_config());
        let ty = leaf(64);
        for _ in 0..1000 {
            gc.alloc(64, &ty);
        }
        let ran: usize = (0..4)
            .map(|_| {
                let gc = gc.clone();
                thread::spawn(move || gc.collect())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert!(ran >= 1);
        assert_eq!(gc.stats().collections, ran as u64);
        assert_eq!(gc.stats().heap_used, 0);
    }

    #[test]
    fn test_alloc_while_collecting() {
        let gc = GarbageCollector::new(manual_config());
        let ty = leaf(32);
        let roots: Vec<GcPtr> = (0..200)
            .map(|_| {
                let p = gc.alloc(32, &ty);
                gc.add_root(p);
                p
            })
            .collect();

        let mutator = {
            let gc = gc.clone();
            let ty = ty.clone();
            thread::spawn(move || {
                (0..500)
                    .map(|_| gc.alloc_rooted(32, &ty).unwrap())
                    .collect::<Vec<_>>()
            })
        };
        for _ in 0..5 {
            gc.collect();
        }
        let fresh = mutator.join().unwrap();
        gc.collect();

        assert!(roots.iter().chain(fresh.iter()).all(|&p| gc.is_live(p)));
    }
}

#[cfg(test)]
mod pacing_tests {
    use super::*;

    #[test]
    fn test_trigger_after_cycle() {
        let gc = GarbageCollector::new(GCConfig {
            initial_trigger: 1024,
            ..manual_config()
        });
        let ty = leaf(1024);
        for _ in 0..4 {
            let p = gc.alloc(1024, &ty);
            gc.add_root(p);
        }
        assert!(gc.should_collect());
        gc.collect();
        let used = gc.stats().heap_used;
        assert_eq!(gc.stats().next_gc, used * 2);
        assert!(!gc.should_collect());
    }

    #[test]
    fn test_trigger_floor() {
        let gc = GarbageCollector::new(manual_config());
        gc.collect();
        assert_eq!(gc.trigger_size(), gc.config().initial_trigger);
    }

    #[test]
    fn test_set_gc_percent() {
        let gc = GarbageCollector::new(GCConfig {
            initial_trigger: 0,
            ..manual_config()
        });
        let ty = leaf(1024);
        let p = gc.alloc(1024, &ty);
        gc.add_root(p);
        let used = gc.stats().heap_used;

        gc.set_gc_percent(300);
        assert_eq!(gc.trigger_size(), used * 3);
        gc.set_gc_percent(0);
        assert_eq!(gc.trigger_size(), used * 3);

        gc.collect();
        assert_eq!(gc.trigger_size(), used * 3);
    }

    #[test]
    fn test_background_monitor_collects() {
        let gc = GarbageCollector::new(GCConfig {
            background: true,
            initial_trigger: 4096,
            monitor_interval: Duration::from_millis(10),
            ..manual_config()
        });
        let ty = leaf(1024);
        for _ in 0..16 {
            gc.alloc(1024, &ty);
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while gc.stats().collections == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(gc.stats().collections >= 1);
        gc.stop();
        gc.stop();
    }

    #[test]
    fn test_long_pause_counter() {
        let gc = GarbageCollector::new(GCConfig {
            max_pause: Duration::ZERO,
            ..manual_config()
        });
        gc.alloc(16, &leaf(16));
        gc.collect();
        assert!(gc.stats().long_pauses >= 1);
    }
}

#[cfg(test)]
mod optimizer_tests {
    use super::*;

    #[test]
    fn test_slow_pauses_raise_threshold() {
        let opt = GCOptimizer::with_threshold(Duration::from_millis(1), 1000);
        assert_eq!(opt.record_pause(Duration::from_millis(50)), Some(1100));
        let stats = opt.stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.last_pause, Duration::from_millis(50));
        assert_eq!(stats.avg_pause, Duration::from_millis(5));
    }

    #[test]
    fn test_fast_pauses_lower_threshold() {
        let opt = GCOptimizer::with_threshold(Duration::from_millis(10), 1000);
        assert_eq!(opt.record_pause(Duration::from_millis(1)), Some(950));
        assert_eq!(opt.record_pause(Duration::from_millis(1)), Some(902));
    }

    #[test]
    fn test_moving_average() {
        let opt = GCOptimizer::new(Duration::from_secs(1));
        for _ in 0..100 {
            opt.record_pause(Duration::from_millis(100));
        }
        let avg = opt.stats().avg_pause;
        assert!(avg > Duration::from_millis(99) && avg <= Duration::from_millis(100));
    }

    #[test]
    fn test_disabled_optimizer() {
        let opt = GCOptimizer::default();
        opt.disable();
        assert!(!opt.is_enabled());
        assert_eq!(opt.record_pause(Duration::from_millis(1)), None);
        opt.enable();
        assert!(opt.record_pause(Duration::from_millis(1)).is_some());
    }

    #[test]
    fn test_optimize_sets_trigger_once_per_cycle() {
        let gc = GarbageCollector::new(manual_config());
        let opt = GCOptimizer::new(Duration::from_secs(10));
        assert_eq!(opt.optimize(&gc), None);

        gc.collect();
        let threshold = opt.optimize(&gc).unwrap();
        assert_eq!(threshold, 10 * 1024 * 1024 * 95 / 100);
        assert_eq!(gc.trigger_size(), threshold);
        assert_eq!(gc.stats().collections, 1);

        // no new cycle, nothing to learn
        assert_eq!(opt.optimize(&gc), None);

        opt.set_target_pause(Duration::ZERO);
        gc.collect();
        assert!(opt.optimize(&gc).unwrap() > threshold);
    }
}

#[cfg(test)]
mod alloc_props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn allocations_are_disjoint(sizes in prop::collection::vec(1usize..600, 1..80)) {
            let gc = GarbageCollector::new(GCConfig { arena_size: 4096, ..manual_config() });
            let ty = leaf(8);
            let mut spans: Vec<(usize, usize)> = sizes
                .iter()
                .map(|&size| (gc.alloc(size, &ty).addr(), size))
                .collect();
            spans.sort();
            for pair in spans.windows(2) {
                prop_assert!(pair[0].0 + pair[0].1 + HEADER_SIZE <= pair[1].0);
            }
        }
    }
}
