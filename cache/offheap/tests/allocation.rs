//! Allocation scenarios across the three placement strategies.
//!
//! These go through the public manager API and check the accounting,
//! reuse and merge behavior each strategy promises.

#![cfg(not(feature = "loom"))]

use offheap_cache::{
    AllocError, Allocator, AllocatorKind, CoalescingAllocator, Expiry, MemoryManager,
    OnExhaustion, PayloadTag, PolicyKind, Pointer,
};

fn manager(strategy: AllocatorKind, regions: usize, size: usize) -> MemoryManager {
    MemoryManager::builder()
        .strategy(strategy)
        .regions(regions)
        .region_size(size)
        .build()
        .expect("failed to build manager")
}

fn store(mm: &MemoryManager, len: usize, byte: u8) -> Option<Pointer> {
    mm.store(&vec![byte; len], Expiry::never())
        .expect("store returned an error")
}

/// Live ranges within each region never overlap.
fn assert_disjoint(mm: &MemoryManager) {
    for region in mm.regions() {
        let mut ranges: Vec<_> = region
            .live_pointers()
            .iter()
            .map(|p| (p.segment, p.start, p.end))
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            let (sa, _, ea) = pair[0];
            let (sb, bb, _) = pair[1];
            assert!(
                sa != sb || ea < bb,
                "overlapping ranges in region {}: {:?}",
                region.buffer_id(),
                pair
            );
        }
    }
}

// =============================================================================
// Bump
// =============================================================================

#[test]
fn test_bump_fill_free_reuse() {
    let mm = manager(AllocatorKind::Bump, 1, 40);

    let ptrs: Vec<_> = (0..4).map(|i| store(&mm, 10, i).unwrap()).collect();
    assert_eq!(mm.used(), 40);

    assert_eq!(store(&mm, 10, 9), None);

    mm.free(&ptrs[1]).unwrap();
    assert_eq!(mm.used(), 30);

    let p = store(&mm, 10, 7).expect("freed range was not reused");
    assert_eq!(mm.used(), 40);
    assert_eq!(mm.info(&p).unwrap().start, 10);
    assert_eq!(mm.retrieve(&p).unwrap(), vec![7; 10]);

    for (i, ptr) in ptrs.iter().enumerate() {
        if i != 1 {
            assert_eq!(mm.retrieve(ptr).unwrap(), vec![i as u8; 10]);
        }
    }
    assert_disjoint(&mm);
}

#[test]
fn test_bump_update_semantics() {
    let mm = manager(AllocatorKind::Bump, 1, 64);
    let p = store(&mm, 10, 1).unwrap();

    assert_eq!(
        mm.update(&p, &[2; 11]),
        Err(AllocError::CapacityExceeded {
            requested: 11,
            capacity: 10
        })
    );
    assert_eq!(mm.retrieve(&p).unwrap(), vec![1; 10]);

    let q = mm.update(&p, &[3; 4]).unwrap();
    assert_eq!(mm.retrieve(&q).unwrap(), vec![3; 4]);
    assert_eq!(mm.used(), 4);
}

// =============================================================================
// Coalescing
// =============================================================================

#[test]
fn test_coalescing_full_merge_any_order() {
    let orders: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];

    for order in orders {
        let mm = manager(AllocatorKind::Coalescing, 1, 100);
        let ptrs = [
            store(&mm, 30, 1).unwrap(),
            store(&mm, 20, 2).unwrap(),
            store(&mm, 50, 3).unwrap(),
        ];
        assert_eq!(mm.used(), 100);

        for idx in order {
            mm.free(&ptrs[idx]).unwrap();
        }
        assert_eq!(mm.used(), 0);

        let full = store(&mm, 100, 4).unwrap_or_else(|| panic!("no full merge for {order:?}"));
        assert_eq!(mm.retrieve(&full).unwrap(), vec![4; 100]);
    }
}

#[test]
fn test_coalescing_update_shorter_returns_exact_payload() {
    let mm = manager(AllocatorKind::Coalescing, 1, 64);
    let p = mm.store(b"hello world", Expiry::never()).unwrap().unwrap();
    let q = mm.update(&p, b"hi").unwrap();
    assert_eq!(q, p);
    assert_eq!(mm.retrieve(&p).unwrap(), b"hi");
    assert_eq!(mm.info(&p).unwrap().capacity(), 11);
}

#[test]
fn test_coalescing_index_stays_consistent() {
    let alloc = CoalescingAllocator::new(0, 256).unwrap();
    let mut live = Vec::new();
    for i in 0..16u8 {
        live.push(
            alloc
                .store(&vec![i; 16], Expiry::never(), PayloadTag::NONE)
                .unwrap(),
        );
    }
    // Free every other pointer, then the rest.
    for p in live.iter().step_by(2) {
        alloc.free(p).unwrap();
        alloc.check().unwrap();
    }
    assert_eq!(alloc.free_ranges().len(), 8);
    for p in live.iter().skip(1).step_by(2) {
        alloc.free(p).unwrap();
        alloc.check().unwrap();
    }
    assert_eq!(alloc.free_ranges(), vec![(0, 255)]);
}

// =============================================================================
// Slab
// =============================================================================

#[test]
fn test_slab_routing_through_manager() {
    let mm = MemoryManager::builder()
        .strategy(AllocatorKind::Slab)
        .region_size(4096)
        .slot_sizes(vec![64, 256, 1024])
        .build()
        .unwrap();

    let small = mm.store(&[1; 10], Expiry::never()).unwrap().unwrap();
    let medium = mm.store(&[2; 100], Expiry::never()).unwrap().unwrap();
    let large = mm.store(&[3; 1000], Expiry::never()).unwrap().unwrap();

    assert_eq!(mm.info(&small).unwrap().capacity(), 64);
    assert_eq!(mm.info(&medium).unwrap().capacity(), 256);
    assert_eq!(mm.info(&large).unwrap().capacity(), 1024);
    assert_eq!(mm.used(), 64 + 256 + 1024);

    assert_eq!(
        mm.store(&[4; 1025], Expiry::never()),
        Err(AllocError::OversizedRequest {
            requested: 1025,
            limit: 1024
        })
    );

    for p in [small, medium, large] {
        mm.free(&p).unwrap();
    }
    assert_eq!(mm.used(), 0);
}

#[test]
fn test_slab_fallthrough_is_opt_in() {
    let strict = MemoryManager::builder()
        .strategy(AllocatorKind::Slab)
        .region_size(256)
        .slot_sizes(vec![64, 128])
        .build()
        .unwrap();
    let lenient = MemoryManager::builder()
        .strategy(AllocatorKind::Slab)
        .region_size(256)
        .slot_sizes(vec![64, 128])
        .allow_larger_slab(true)
        .build()
        .unwrap();

    for mm in [&strict, &lenient] {
        store(mm, 8, 1).unwrap();
        store(mm, 8, 1).unwrap();
    }
    assert_eq!(store(&strict, 8, 1), None);
    let p = store(&lenient, 8, 1).unwrap();
    assert_eq!(lenient.info(&p).unwrap().capacity(), 128);
}

// =============================================================================
// Properties shared by every strategy
// =============================================================================

const STRATEGIES: [AllocatorKind; 3] = [
    AllocatorKind::Bump,
    AllocatorKind::Coalescing,
    AllocatorKind::Slab,
];

fn any_manager(strategy: AllocatorKind) -> MemoryManager {
    MemoryManager::builder()
        .strategy(strategy)
        .regions(2)
        .region_size(2048)
        .slot_sizes(vec![32, 128])
        .build()
        .unwrap()
}

#[test]
fn test_no_leak_after_freeing_everything() {
    for strategy in STRATEGIES {
        let mm = any_manager(strategy);
        let mut ptrs = Vec::new();
        for i in 0..40usize {
            if let Some(p) = store(&mm, 1 + i % 100, i as u8) {
                ptrs.push(p);
            }
        }
        assert!(!ptrs.is_empty());
        assert_disjoint(&mm);
        for p in &ptrs {
            assert!(mm.free(p).unwrap() > 0, "{strategy}: free released nothing");
        }
        assert_eq!(mm.used(), 0, "{strategy}: bytes leaked");
    }
}

#[test]
fn test_double_free_is_idempotent() {
    for strategy in STRATEGIES {
        let mm = any_manager(strategy);
        let keep = store(&mm, 20, 1).unwrap();
        let p = store(&mm, 20, 2).unwrap();
        let used = mm.used();

        let freed = mm.free(&p).unwrap();
        assert!(freed > 0);
        assert_eq!(mm.free(&p).unwrap(), 0, "{strategy}");
        assert_eq!(mm.used(), used - freed as u64, "{strategy}");
        assert_eq!(mm.retrieve(&p), Err(AllocError::StalePointer), "{strategy}");
        assert_eq!(mm.retrieve(&keep).unwrap(), vec![1; 20]);
    }
}

#[test]
fn test_update_too_large_leaves_pointer_untouched() {
    for strategy in STRATEGIES {
        let mm = any_manager(strategy);
        let p = store(&mm, 32, 5).unwrap();
        let capacity = mm.info(&p).unwrap().capacity();
        let err = mm.update(&p, &vec![6; capacity + 1]).unwrap_err();
        assert!(matches!(err, AllocError::CapacityExceeded { .. }), "{strategy}");
        assert_eq!(mm.retrieve(&p).unwrap(), vec![5; 32], "{strategy}");

        let q = mm.update(&p, &[7; 3]).unwrap();
        assert_eq!(mm.retrieve(&q).unwrap(), vec![7; 3], "{strategy}");
    }
}

#[test]
fn test_payload_tag_round_trips() {
    for strategy in STRATEGIES {
        let mm = any_manager(strategy);
        let p = mm
            .store_tagged(b"typed", Expiry::never(), PayloadTag(42))
            .unwrap()
            .unwrap();
        assert_eq!(mm.info(&p).unwrap().payload_tag, PayloadTag(42));
        let a = mm.allocate(PayloadTag(7), 12, Expiry::never()).unwrap().unwrap();
        assert_eq!(mm.info(&a).unwrap().payload_tag, PayloadTag(7));
        assert_eq!(mm.info(&a).unwrap().len, 12);
    }
}

// =============================================================================
// Policies
// =============================================================================

#[test]
fn test_round_robin_spreads_stores() {
    let mm = MemoryManager::builder()
        .regions(3)
        .region_size(1024)
        .policy(PolicyKind::RoundRobin)
        .build()
        .unwrap();

    let regions: Vec<_> = (0..6)
        .map(|_| store(&mm, 8, 0).unwrap().buffer_id())
        .collect();
    assert_eq!(regions, vec![0, 1, 2, 0, 1, 2]);
}

#[test]
fn test_round_robin_gives_up_after_max_allocations() {
    let mm = MemoryManager::builder()
        .regions(3)
        .region_size(16)
        .policy(PolicyKind::RoundRobin)
        .max_allocations(2)
        .on_exhaustion(OnExhaustion::Error)
        .build()
        .unwrap();

    assert_eq!(store(&mm, 16, 0).unwrap().buffer_id(), 0);
    assert_eq!(store(&mm, 16, 0).unwrap().buffer_id(), 1);
    mm.free(&store(&mm, 16, 0).unwrap()).unwrap();
    // Region 2 is empty again, but the two attempts land on 0 and 1.
    assert_eq!(
        mm.store(&[0; 16], Expiry::never()),
        Err(AllocError::OutOfSpace { requested: 16 })
    );
}

#[test]
fn test_sequential_fills_in_order() {
    let mm = MemoryManager::builder()
        .regions(3)
        .region_size(32)
        .policy(PolicyKind::Sequential)
        .build()
        .unwrap();

    let regions: Vec<_> = (0..6)
        .map(|_| store(&mm, 16, 0).unwrap().buffer_id())
        .collect();
    assert_eq!(regions, vec![0, 0, 1, 1, 2, 2]);
    assert_eq!(store(&mm, 16, 0), None);
}
