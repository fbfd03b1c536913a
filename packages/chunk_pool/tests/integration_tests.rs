//! Integration tests for `chunk_pool` exercising the public API end to end.
//!
//! A counting allocator observes every request the pool makes to its backend, which lets the
//! tests verify chunk growth and shrinking from the outside.

#![allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::array;
use std::cell::Cell;
use std::ptr::NonNull;

use chunk_pool::{ChunkAllocator, ChunkPool, Error, PoolFlags};
use new_zealand::nz;

/// Forwards to the system allocator while counting requests, with an optional budget after
/// which every request fails.
#[derive(Debug, Default)]
struct CountingAllocator {
    allocations: Cell<usize>,
    deallocations: Cell<usize>,
    budget: Cell<Option<usize>>,
}

impl CountingAllocator {
    fn with_budget(budget: usize) -> Self {
        let allocator = Self::default();
        allocator.budget.set(Some(budget));
        allocator
    }

    fn outstanding(&self) -> usize {
        self.allocations.get() - self.deallocations.get()
    }
}

impl ChunkAllocator for CountingAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if self
            .budget
            .get()
            .is_some_and(|budget| self.allocations.get() >= budget)
        {
            return None;
        }

        self.allocations.set(self.allocations.get() + 1);
        NonNull::new(unsafe { System.alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.deallocations.set(self.deallocations.get() + 1);
        unsafe { System.dealloc(ptr.as_ptr(), layout) };
    }
}

#[test]
fn allocate_free_cycle_with_second_chunk() {
    let mut pool = ChunkPool::builder()
        .element_size(16)
        .initial_elements(4)
        .elements_per_chunk(nz!(4))
        .allow_iteration()
        .build();

    let elements: Vec<_> = (0..6).map(|_| pool.allocate()).collect();

    assert_eq!(pool.len(), 6);
    assert_eq!(pool.chunk_count(), 2);

    // Free the second and fourth allocations.
    unsafe {
        pool.free(elements[1]);
        pool.free(elements[3]);
    }

    assert_eq!(pool.len(), 4);

    let live: Vec<_> = pool.iter().collect();
    assert_eq!(live, vec![elements[0], elements[2], elements[4], elements[5]]);

    for element in live {
        unsafe { pool.free(element) };
    }

    assert_eq!(pool.len(), 0);
    assert_eq!(pool.chunk_count(), 1);
}

#[test]
fn array_export_matches_written_patterns() {
    let mut pool = ChunkPool::builder()
        .element_size(16)
        .elements_per_chunk(nz!(2))
        .allow_iteration()
        .build();

    let mut expected = Vec::new();

    for index in 0..5_u8 {
        let element = pool.allocate();
        let pattern: [u8; 16] = array::from_fn(|offset| index * 16 + offset as u8);

        unsafe { element.cast::<[u8; 16]>().write_unaligned(pattern) };
        expected.extend_from_slice(&pattern);
    }

    let exported = pool.to_array();

    assert_eq!(exported.len(), 5 * 16);
    assert_eq!(exported, expected);
}

#[test]
fn table_export_after_frees_and_reuse() {
    let mut pool = ChunkPool::builder()
        .element_size(32)
        .elements_per_chunk(nz!(4))
        .allow_iteration()
        .build();

    let elements: Vec<_> = (0..10).map(|_| pool.allocate()).collect();

    unsafe {
        pool.free(elements[8]);
        pool.free(elements[2]);
    }

    // Reuses the most recently freed slot, which sits in the first chunk.
    let reused = pool.allocate();
    assert_eq!(reused, elements[2]);

    let table = pool.to_table();
    let mut expected = elements.clone();
    expected.remove(8);

    assert_eq!(table, expected);
    assert_eq!(table.len(), pool.len());

    for index in 0..pool.len() {
        assert_eq!(pool.find(index), Some(table[index]));
    }
    assert_eq!(pool.find(pool.len()), None);
}

#[test]
fn drained_pool_keeps_one_chunk_and_needs_no_backend_memory() {
    let allocator = CountingAllocator::default();

    let mut pool = ChunkPool::builder()
        .element_size(24)
        .elements_per_chunk(nz!(4))
        .allow_iteration()
        .build_in(&allocator);

    assert_eq!(allocator.allocations.get(), 1);

    let elements: Vec<_> = (0..11).map(|_| pool.allocate()).collect();

    assert_eq!(pool.chunk_count(), 3);
    assert_eq!(allocator.outstanding(), 3);

    // Free in an order unrelated to allocation order.
    for index in [5, 0, 10, 3, 7, 1, 9, 2, 8, 4, 6] {
        unsafe { pool.free(elements[index]) };
    }

    assert_eq!(pool.chunk_count(), 1);
    assert_eq!(allocator.outstanding(), 1);
    assert_eq!(pool.iter().count(), 0);

    let requests_before = allocator.allocations.get();

    // A full chunk's worth of allocations fits in the retained chunk.
    let again: Vec<_> = (0..4).map(|_| pool.allocate()).collect();

    assert_eq!(allocator.allocations.get(), requests_before);
    assert!(again.iter().all(|element| elements.contains(element)));

    drop(pool);
    assert_eq!(allocator.outstanding(), 0);
}

#[test]
fn clear_returns_chunks_to_backend() {
    let allocator = CountingAllocator::default();

    let mut pool = ChunkPool::builder()
        .element_size(16)
        .elements_per_chunk(nz!(8))
        .build_in(&allocator);

    for _ in 0..50 {
        _ = pool.allocate();
    }

    assert_eq!(allocator.outstanding(), 7);

    pool.clear();

    assert_eq!(allocator.outstanding(), 1);
    assert!(pool.is_empty());

    let element = pool.allocate_zeroed();
    let bytes = unsafe { element.cast::<[u8; 16]>().read_unaligned() };
    assert_eq!(bytes, [0; 16]);
}

#[test]
fn initial_elements_are_preallocated() {
    let allocator = CountingAllocator::default();

    let mut pool = ChunkPool::builder()
        .element_size(16)
        .initial_elements(100)
        .elements_per_chunk(nz!(32))
        .build_in(&allocator);

    assert_eq!(allocator.allocations.get(), 4);
    assert_eq!(pool.capacity(), 128);

    for _ in 0..128 {
        _ = pool.allocate();
    }

    assert_eq!(allocator.allocations.get(), 4);

    _ = pool.allocate();

    assert_eq!(allocator.allocations.get(), 5);
}

#[test]
fn try_build_reports_exhausted_backend() {
    let allocator = CountingAllocator::with_budget(2);

    let result = ChunkPool::builder()
        .element_size(16)
        .initial_elements(30)
        .elements_per_chunk(nz!(10))
        .try_build_in(&allocator);

    let Err(Error::AllocationFailed { layout }) = result else {
        panic!("building a pool beyond the backend budget must fail");
    };

    assert_eq!(layout.size(), 160);

    // The chunks obtained before the failure were returned.
    assert_eq!(allocator.outstanding(), 0);
}

#[test]
fn try_allocate_reports_exhausted_backend() {
    let allocator = CountingAllocator::with_budget(1);

    let mut pool = ChunkPool::builder()
        .element_size(16)
        .elements_per_chunk(nz!(2))
        .allow_iteration()
        .build_in(&allocator);

    let a = pool.try_allocate().unwrap();
    let b = pool.try_allocate_zeroed().unwrap();

    assert!(matches!(
        pool.try_allocate(),
        Err(Error::AllocationFailed { .. })
    ));

    // A failed allocation leaves the pool untouched.
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.chunk_count(), 1);
    assert_eq!(pool.to_table(), vec![a, b]);

    unsafe { pool.free(a) };
    assert_eq!(pool.try_allocate().unwrap(), a);
}

#[test]
fn system_allocator_flag_is_honored() {
    let mut pool = ChunkPool::builder()
        .element_size_of::<u64>()
        .flags(PoolFlags::USE_SYSTEM_ALLOCATOR)
        .build();

    assert_eq!(pool.flags(), PoolFlags::USE_SYSTEM_ALLOCATOR);
    assert!(!pool.allows_iteration());

    let element = pool.allocate();
    unsafe {
        element.cast::<u64>().write_unaligned(u64::MAX);
        assert_eq!(element.cast::<u64>().read_unaligned(), u64::MAX);
        pool.free(element);
    }
}

#[test]
fn independent_pools_do_not_interfere() {
    let mut small = ChunkPool::builder()
        .element_size(16)
        .allow_iteration()
        .build();
    let mut large = ChunkPool::builder()
        .element_size(256)
        .allow_iteration()
        .build();

    let s = small.allocate();
    let l = large.allocate();

    assert!(small.contains(s));
    assert!(!small.contains(l));
    assert!(large.contains(l));
    assert!(!large.contains(s));

    unsafe { small.free(s) };

    assert_eq!(small.len(), 0);
    assert_eq!(large.to_table(), vec![l]);
}

#[test]
fn odd_element_size_keeps_elements_apart() {
    let mut pool = ChunkPool::builder()
        .element_size(21)
        .elements_per_chunk(nz!(5))
        .allow_iteration()
        .build();

    let elements: Vec<_> = (0..12).map(|_| pool.allocate()).collect();

    for (index, element) in elements.iter().enumerate() {
        unsafe { element.as_ptr().write_bytes(index as u8, 21) };
    }

    let exported = pool.to_array();

    for (index, bytes) in exported.chunks_exact(21).enumerate() {
        assert!(bytes.iter().all(|byte| *byte == index as u8));
    }
}
