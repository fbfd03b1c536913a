//! Property tests for pool invariants under arbitrary allocate/free interleavings.
//!
//! Each test replays a random sequence of operations against a pool and a simple model of the
//! live elements, checking the pool against the model after every step.

#![allow(
    clippy::undocumented_unsafe_blocks,
    clippy::arithmetic_side_effects,
    clippy::integer_division,
    clippy::modulo_arithmetic,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]

use std::collections::HashSet;
use std::num::NonZero;
use std::ptr::NonNull;

use chunk_pool::ChunkPool;
use proptest::prelude::*;

#[derive(Clone, Copy, Debug)]
enum Op {
    Allocate,

    /// Frees the live element at this position in the model, modulo the live count.
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Allocate),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

fn iterable_pool(element_size: usize, per_chunk: usize) -> ChunkPool {
    ChunkPool::builder()
        .element_size(element_size)
        .elements_per_chunk(NonZero::new(per_chunk).unwrap())
        .allow_iteration()
        .build()
}

/// Applies one operation to both the pool and the model of live elements.
fn apply(pool: &mut ChunkPool, live: &mut Vec<NonNull<u8>>, op: Op) {
    match op {
        Op::Allocate => {
            let element = pool.allocate();
            assert!(!live.contains(&element), "allocate returned a live element");
            live.push(element);
        }
        Op::Free(selector) => {
            if live.is_empty() {
                return;
            }

            let element = live.swap_remove(selector % live.len());
            unsafe { pool.free(element) };
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    #[cfg_attr(miri, ignore = "proptest case counts are too slow under Miri")]
    fn len_tracks_allocations_minus_frees(
        element_size in 1_usize..64,
        per_chunk in 1_usize..9,
        ops in proptest::collection::vec(op(), 0..200),
    ) {
        let mut pool = iterable_pool(element_size, per_chunk);
        let mut live = Vec::new();

        for op in ops {
            apply(&mut pool, &mut live, op);

            prop_assert_eq!(pool.len(), live.len());
            prop_assert_eq!(pool.is_empty(), live.is_empty());
            prop_assert!(pool.capacity() >= pool.len());

            if live.is_empty() {
                prop_assert_eq!(pool.chunk_count(), 1);
            }
        }
    }

    #[test]
    #[cfg_attr(miri, ignore = "proptest case counts are too slow under Miri")]
    fn iteration_yields_exactly_the_live_elements(
        per_chunk in 1_usize..9,
        ops in proptest::collection::vec(op(), 0..200),
    ) {
        let mut pool = iterable_pool(16, per_chunk);
        let mut live = Vec::new();

        for op in ops {
            apply(&mut pool, &mut live, op);
        }

        let iterated: Vec<_> = pool.iter().collect();
        prop_assert_eq!(iterated.len(), pool.len());

        let iterated_set: HashSet<_> = iterated.iter().copied().collect();
        let live_set: HashSet<_> = live.iter().copied().collect();

        prop_assert_eq!(iterated_set.len(), iterated.len(), "iteration yielded duplicates");
        prop_assert_eq!(iterated_set, live_set);

        for (index, element) in iterated.iter().enumerate() {
            prop_assert_eq!(pool.find(index), Some(*element));
        }

        prop_assert_eq!(pool.to_table(), iterated);
    }

    #[test]
    #[cfg_attr(miri, ignore = "proptest case counts are too slow under Miri")]
    fn freed_memory_is_reused(
        per_chunk in 1_usize..9,
        count in 1_usize..50,
        seed in any::<u64>(),
    ) {
        let mut pool = iterable_pool(32, per_chunk);

        // Keep one element alive so that freeing does not shrink the pool.
        let anchor = pool.allocate();

        let mut elements: Vec<_> = (0..count).map(|_| pool.allocate()).collect();
        let freed: HashSet<_> = elements.iter().copied().collect();
        let chunks_before = pool.chunk_count();

        // Free in a pseudo-random order derived from the seed.
        let mut state = seed;
        while !elements.is_empty() {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let index = usize::try_from(state >> 33).unwrap() % elements.len();
            let element = elements.swap_remove(index);
            unsafe { pool.free(element) };
        }

        prop_assert_eq!(pool.len(), 1);
        prop_assert_eq!(pool.to_table(), vec![anchor]);

        // Freed slots sit at the front of the free list, so they are handed out again before
        // any slot that was never used.
        let again: HashSet<_> = (0..count).map(|_| pool.allocate()).collect();

        prop_assert_eq!(pool.chunk_count(), chunks_before);
        prop_assert_eq!(again, freed);
    }
}
