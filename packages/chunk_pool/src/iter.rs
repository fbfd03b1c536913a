use std::iter::FusedIterator;
use std::ptr::NonNull;

use crate::{ChunkAllocator, ChunkPool};

/// Iterator over the live elements of a [`ChunkPool`], created by [`ChunkPool::iter()`].
///
/// Elements are yielded in chunk allocation order, then by position within the chunk. The pool
/// cannot be modified while the iterator exists, so it yields exactly [`ChunkPool::len()`]
/// elements.
#[derive(Debug)]
pub struct Iter<'a, A: ChunkAllocator> {
    pool: &'a ChunkPool<A>,

    chunk_index: usize,
    slot_index: usize,

    /// Live elements not yet yielded. Once zero, the remaining slots need not be scanned.
    remaining: usize,
}

impl<'a, A: ChunkAllocator> Iter<'a, A> {
    pub(crate) fn new(pool: &'a ChunkPool<A>) -> Self {
        Self {
            pool,
            chunk_index: 0,
            slot_index: 0,
            remaining: pool.len(),
        }
    }
}

impl<A: ChunkAllocator> Iterator for Iter<'_, A> {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        let slots_per_chunk = self.pool.elements_per_chunk().get();

        while self.remaining > 0 {
            let chunk = self.pool.chunks().get(self.chunk_index)?;

            if self.slot_index >= slots_per_chunk {
                self.chunk_index = self.chunk_index.wrapping_add(1);
                self.slot_index = 0;
                continue;
            }

            let slot = chunk.slot(self.slot_index);
            self.slot_index = self.slot_index.wrapping_add(1);

            // SAFETY: The slot lies within one of the pool's chunks, whose memory is fully
            // initialized from the moment the chunk is created. The pool is borrowed, so no
            // element can be freed or allocated underneath us.
            if unsafe { slot.is_tagged_free() } {
                continue;
            }

            // Cannot underflow because we checked that remaining > 0.
            self.remaining = self.remaining.wrapping_sub(1);

            return Some(slot.ptr());
        }

        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<A: ChunkAllocator> ExactSizeIterator for Iter<'_, A> {}

impl<A: ChunkAllocator> FusedIterator for Iter<'_, A> {}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::iter::FusedIterator;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::Iter;
    use crate::{Backend, ChunkPool};

    assert_impl_all!(Iter<'_, Backend>: Iterator, ExactSizeIterator, FusedIterator);
    assert_not_impl_any!(Iter<'_, Backend>: Send, Sync);

    fn iterable_pool() -> ChunkPool {
        ChunkPool::builder()
            .element_size(16)
            .elements_per_chunk(nz!(3))
            .allow_iteration()
            .build()
    }

    #[test]
    fn empty_pool_yields_nothing() {
        let pool = iterable_pool();

        let mut iter = pool.iter();
        assert_eq!(iter.len(), 0);
        assert_eq!(iter.next(), None);
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn skips_free_slots_across_chunks() {
        let mut pool = iterable_pool();

        let elements: Vec<_> = (0..8).map(|_| pool.allocate()).collect();

        for index in [0, 2, 3, 7] {
            unsafe { pool.free(elements[index]) };
        }

        let live: Vec<_> = pool.iter().collect();
        assert_eq!(live, vec![elements[1], elements[4], elements[5], elements[6]]);
    }

    #[test]
    fn order_follows_position_not_allocation_time() {
        let mut pool = iterable_pool();

        let a = pool.allocate();
        let b = pool.allocate();
        let c = pool.allocate();

        unsafe { pool.free(a) };

        // Reuses the slot of a, which precedes b in the chunk.
        let d = pool.allocate();
        assert_eq!(d, a);

        assert_eq!(pool.iter().collect::<Vec<_>>(), vec![d, b, c]);
    }

    #[test]
    fn len_counts_down() {
        let mut pool = iterable_pool();

        for _ in 0..5 {
            _ = pool.allocate();
        }

        let mut iter = pool.iter();
        assert_eq!(iter.len(), 5);

        _ = iter.next();
        _ = iter.next();
        assert_eq!(iter.len(), 3);
        assert_eq!(iter.size_hint(), (3, Some(3)));

        assert_eq!(iter.by_ref().count(), 3);
        assert_eq!(iter.len(), 0);
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn pool_reference_is_into_iterator() {
        let mut pool = iterable_pool();

        let a = pool.allocate();
        let b = pool.allocate();

        let mut seen = Vec::new();
        for element in &pool {
            seen.push(element);
        }

        assert_eq!(seen, vec![a, b]);
    }

    #[test]
    fn live_element_contents_do_not_confuse_iteration() {
        let mut pool = iterable_pool();

        let element = pool.allocate();

        // Overwriting the link portion of a live element is fine; only the tag matters.
        unsafe { element.as_ptr().write_bytes(0, 8) };

        assert_eq!(pool.iter().collect::<Vec<_>>(), vec![element]);
    }
}
