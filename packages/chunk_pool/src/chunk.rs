use std::alloc::Layout;
use std::num::NonZero;
use std::ptr::NonNull;

use tracing::trace;

use crate::{ChunkAllocator, Error, FREE_TAG, Result, Slot};

/// Layout calculations shared by every chunk of a pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ChunkLayout {
    /// Stride between neighboring slots, which is also the size of an element.
    element_size: usize,

    /// Number of slots in each chunk.
    capacity: NonZero<usize>,

    /// Memory layout of the whole chunk as requested from the backend.
    layout: Layout,
}

impl ChunkLayout {
    /// Calculates the layout of a chunk holding `capacity` elements of `element_size` bytes.
    ///
    /// Chunks are aligned to `usize`, so every slot is word-aligned when the element size is a
    /// multiple of the word size.
    ///
    /// # Panics
    ///
    /// Panics if the element size is zero or if the chunk size overflows.
    #[must_use]
    pub(crate) fn calculate(element_size: usize, capacity: NonZero<usize>) -> Self {
        assert!(element_size > 0, "chunk elements must have non-zero size");

        let size = element_size
            .checked_mul(capacity.get())
            .expect("chunk byte size cannot overflow for reasonable element sizes and counts");

        let layout = Layout::from_size_align(size, align_of::<usize>())
            .expect("chunk byte size must not exceed isize::MAX");

        Self {
            element_size,
            capacity,
            layout,
        }
    }

    #[must_use]
    pub(crate) fn element_size(&self) -> usize {
        self.element_size
    }

    #[must_use]
    pub(crate) fn capacity(&self) -> NonZero<usize> {
        self.capacity
    }

    #[must_use]
    pub(crate) fn layout(&self) -> Layout {
        self.layout
    }
}

/// One contiguous block of backend memory, partitioned into fixed-size slots.
///
/// The chunk does not know which of its slots are free; that knowledge lives in the free list
/// threaded through the slots by the owning pool. The chunk does not remember its allocator
/// either, so it must be returned via [`release()`](Self::release) - dropping a chunk leaks
/// its memory.
///
/// # Out of band access
///
/// The chunk never creates references to its memory, so it is valid for callers to access slot
/// memory via pointers while the chunk itself is borrowed.
#[derive(Debug)]
pub(crate) struct Chunk {
    /// Start of the chunk memory, which is also the first slot.
    first_slot: NonNull<u8>,

    layout: ChunkLayout,
}

impl Chunk {
    /// Obtains memory for a new chunk from the allocator.
    ///
    /// The memory is zero-filled so every byte of every slot is initialized from the start.
    /// The caller must thread the slots into a free list before handing any of them out.
    pub(crate) fn new<A: ChunkAllocator>(layout: ChunkLayout, allocator: &A) -> Result<Self> {
        let memory_layout = layout.layout();

        let first_slot = allocator
            .allocate(memory_layout)
            .ok_or(Error::AllocationFailed {
                layout: memory_layout,
            })?;

        // SAFETY: The allocator just gave us a block of memory_layout.size() bytes.
        unsafe {
            first_slot.as_ptr().write_bytes(0, memory_layout.size());
        }

        trace!(
            bytes = memory_layout.size(),
            elements = layout.capacity().get(),
            "obtained chunk from backend"
        );

        Ok(Self { first_slot, layout })
    }

    /// Returns the slot at the given index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    #[must_use]
    pub(crate) fn slot(&self, index: usize) -> Slot {
        assert!(
            index < self.layout.capacity().get(),
            "slot {index} index out of bounds in chunk of capacity {}",
            self.layout.capacity()
        );

        // Guarded by the bounds check above, so the offset is within the chunk.
        // This cannot overflow because that would imply the chunk extends beyond virtual memory.
        let offset = index.wrapping_mul(self.layout.element_size());

        // SAFETY: first_slot is valid from our allocation in new() and the offset is within
        // the chunk due to the bounds check above.
        Slot::new(unsafe { self.first_slot.byte_add(offset) })
    }

    /// Returns the index of the slot that starts at `ptr`, or `None` if `ptr` is not the start
    /// of a slot in this chunk.
    #[must_use]
    #[allow(
        clippy::arithmetic_side_effects,
        clippy::integer_division,
        reason = "element size is non-zero and the offset is bounds checked"
    )]
    pub(crate) fn index_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = ptr
            .as_ptr()
            .addr()
            .checked_sub(self.first_slot.as_ptr().addr())?;

        if offset >= self.layout.layout().size() {
            return None;
        }

        let element_size = self.layout.element_size();

        if offset % element_size != 0 {
            return None;
        }

        Some(offset / element_size)
    }

    /// Links every slot of the chunk into a free list, in slot order, with the last slot
    /// pointing at `tail`. Returns the first slot, which is the new head of the list.
    ///
    /// If `tag` is set, every slot is also tagged as free.
    ///
    /// # Safety
    ///
    /// No slot of this chunk may be handed out to a caller; all of them are overwritten.
    #[must_use]
    pub(crate) unsafe fn thread_free_list(&self, tail: Option<Slot>, tag: bool) -> Slot {
        let capacity = self.layout.capacity().get();

        for index in 0..capacity {
            let slot = self.slot(index);

            // Cannot overflow because index < capacity.
            let next_index = index.wrapping_add(1);
            let next = if next_index < capacity {
                Some(self.slot(next_index))
            } else {
                tail
            };

            // SAFETY: The slot lies within our chunk and the caller guarantees it is not
            // handed out, so we may overwrite its leading bytes.
            unsafe {
                slot.set_next(next);
            }

            if tag {
                // SAFETY: As above.
                unsafe {
                    slot.set_tag(FREE_TAG);
                }
            }
        }

        self.slot(0)
    }

    /// Returns the chunk memory to the allocator.
    ///
    /// # Safety
    ///
    /// The allocator must be the one the chunk was created with.
    pub(crate) unsafe fn release<A: ChunkAllocator>(self, allocator: &A) {
        let memory_layout = self.layout.layout();

        // SAFETY: The memory came from allocator.allocate() with this layout in new(), as
        // guaranteed by the caller, and consuming self ensures it is released only once.
        unsafe {
            allocator.deallocate(self.first_slot, memory_layout);
        }

        trace!(bytes = memory_layout.size(), "returned chunk to backend");
    }
}

// SAFETY: Chunk contains a raw pointer but it is used purely to address the chunk's own
// allocation, which is not tied to any thread.
unsafe impl Send for Chunk {}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use new_zealand::nz;

    use super::*;
    use crate::{Backend, IN_USE_TAG};

    #[test]
    fn layout_calculation_basic() {
        let layout = ChunkLayout::calculate(16, nz!(4));

        assert_eq!(layout.element_size(), 16);
        assert_eq!(layout.capacity().get(), 4);
        assert_eq!(layout.layout().size(), 64);
        assert_eq!(layout.layout().align(), align_of::<usize>());
    }

    #[test]
    fn layout_calculation_odd_element_size() {
        let layout = ChunkLayout::calculate(20, nz!(3));

        assert_eq!(layout.layout().size(), 60);
    }

    #[test]
    #[should_panic]
    fn layout_calculation_zero_size_panics() {
        _ = ChunkLayout::calculate(0, nz!(4));
    }

    #[test]
    #[should_panic]
    fn layout_calculation_overflow_panics() {
        _ = ChunkLayout::calculate(usize::MAX, nz!(2));
    }

    #[test]
    fn new_chunk_is_zeroed() {
        let backend = Backend::Global;
        let chunk = Chunk::new(ChunkLayout::calculate(24, nz!(5)), &backend).unwrap();

        for offset in 0..24 * 5 {
            assert_eq!(unsafe { chunk.first_slot.as_ptr().add(offset).read() }, 0);
        }

        unsafe { chunk.release(&backend) };
    }

    #[test]
    fn slots_are_strided_by_element_size() {
        let backend = Backend::Global;
        let chunk = Chunk::new(ChunkLayout::calculate(20, nz!(4)), &backend).unwrap();

        let base = chunk.slot(0).ptr().as_ptr().addr();
        for index in 0..4 {
            assert_eq!(chunk.slot(index).ptr().as_ptr().addr(), base + index * 20);
        }

        unsafe { chunk.release(&backend) };
    }

    #[test]
    #[should_panic]
    fn slot_out_of_bounds_panics() {
        let backend = Backend::Global;
        let chunk = Chunk::new(ChunkLayout::calculate(16, nz!(4)), &backend).unwrap();

        // Leaks the chunk, which is acceptable in a panicking test.
        _ = chunk.slot(4);
    }

    #[test]
    fn index_of_recognizes_slot_boundaries() {
        let backend = Backend::Global;
        let chunk = Chunk::new(ChunkLayout::calculate(16, nz!(4)), &backend).unwrap();
        let base = chunk.slot(0).ptr();

        assert_eq!(chunk.index_of(base), Some(0));
        assert_eq!(chunk.index_of(chunk.slot(3).ptr()), Some(3));

        // Interior of a slot.
        assert_eq!(chunk.index_of(unsafe { base.add(5) }), None);

        // One past the end.
        assert_eq!(chunk.index_of(unsafe { base.add(64) }), None);

        // Before the start.
        let other = Chunk::new(ChunkLayout::calculate(16, nz!(4)), &backend).unwrap();
        let mut outside = 0_u64;
        assert_eq!(chunk.index_of(NonNull::from(&mut outside).cast()), None);
        assert_eq!(other.index_of(base), None);

        unsafe {
            chunk.release(&backend);
            other.release(&backend);
        }
    }

    #[test]
    fn thread_free_list_links_slots_in_order() {
        let backend = Backend::Global;
        let chunk = Chunk::new(ChunkLayout::calculate(16, nz!(3)), &backend).unwrap();

        let head = unsafe { chunk.thread_free_list(None, false) };
        assert_eq!(head, chunk.slot(0));

        unsafe {
            assert_eq!(chunk.slot(0).next(), Some(chunk.slot(1)));
            assert_eq!(chunk.slot(1).next(), Some(chunk.slot(2)));
            assert_eq!(chunk.slot(2).next(), None);

            // Tagging was not requested.
            assert!(!chunk.slot(0).is_tagged_free());
        }

        unsafe { chunk.release(&backend) };
    }

    #[test]
    fn thread_free_list_continues_into_tail() {
        let backend = Backend::Global;
        let layout = ChunkLayout::calculate(16, nz!(2));
        let first = Chunk::new(layout, &backend).unwrap();
        let second = Chunk::new(layout, &backend).unwrap();

        let tail = unsafe { second.thread_free_list(None, true) };
        let head = unsafe { first.thread_free_list(Some(tail), true) };

        assert_eq!(head, first.slot(0));

        unsafe {
            assert_eq!(first.slot(1).next(), Some(second.slot(0)));

            for slot in [first.slot(0), first.slot(1), second.slot(0), second.slot(1)] {
                assert!(slot.is_tagged_free());
            }
        }

        unsafe {
            first.release(&backend);
            second.release(&backend);
        }
    }

    #[test]
    fn thread_free_list_retags_used_slots() {
        let backend = Backend::Global;
        let chunk = Chunk::new(ChunkLayout::calculate(16, nz!(2)), &backend).unwrap();

        unsafe {
            chunk.slot(1).set_tag(IN_USE_TAG);
            _ = chunk.thread_free_list(None, true);
            assert!(chunk.slot(1).is_tagged_free());

            chunk.release(&backend);
        }
    }

    #[test]
    fn allocation_failure_is_reported() {
        struct Exhausted;

        impl ChunkAllocator for Exhausted {
            fn allocate(&self, _layout: Layout) -> Option<NonNull<u8>> {
                None
            }

            unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
                unreachable!("nothing was ever allocated");
            }
        }

        let layout = ChunkLayout::calculate(16, nz!(8));
        let result = Chunk::new(layout, &Exhausted);

        assert!(matches!(
            result,
            Err(Error::AllocationFailed { layout: l }) if l == layout.layout()
        ));
    }
}
