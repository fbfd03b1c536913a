use std::alloc::handle_alloc_error;
use std::mem;
use std::num::NonZero;
use std::ptr::{self, NonNull};
use std::thread;

use new_zealand::nz;
use tracing::debug;

use crate::{
    Backend, Chunk, ChunkAllocator, ChunkLayout, ChunkPoolBuilder, DropPolicy, Error,
    FREE_NODE_SIZE, FREE_TAG, IN_USE_TAG, Iter, PoolFlags, Result, Slot,
};

/// The smallest element size a pool will use. Smaller requested sizes are rounded up to this,
/// as every free element must be able to host a free-list link and tag.
pub const MIN_ELEMENT_SIZE: usize = 2 * size_of::<usize>();

/// Number of elements per chunk used when the builder is not told otherwise.
#[cfg(not(miri))]
pub const DEFAULT_ELEMENTS_PER_CHUNK: NonZero<usize> = nz!(512);

/// Number of elements per chunk used when the builder is not told otherwise.
// Under Miri, we use smaller chunks because Miri test runtime scales by memory usage.
#[cfg(miri)]
pub const DEFAULT_ELEMENTS_PER_CHUNK: NonZero<usize> = nz!(16);

/// A memory pool that hands out untyped elements of a single fixed size.
///
/// Memory is obtained from a [`ChunkAllocator`] in chunks of
/// [`elements_per_chunk()`](Self::elements_per_chunk) elements. Unused elements form a free
/// list that is threaded through the unused memory itself, so allocating and freeing an element
/// are O(1) and need no bookkeeping memory.
///
/// # Memory Management
///
/// The pool grows by one chunk whenever it runs out of free elements. It never shrinks while
/// elements are live, but as soon as the last live element is freed (or the pool is
/// [cleared](Self::clear)) every chunk except the first is returned to the backend. An idle
/// pool therefore holds exactly one chunk.
///
/// # Iteration
///
/// Pools built with [`PoolFlags::ALLOW_ITERATION`] tag every free element so that
/// [`iter()`](Self::iter), [`find()`](Self::find) and the export methods can walk the chunks
/// and skip free elements. Iteration order is chunk allocation order, then position within the
/// chunk - not the order in which elements were allocated.
///
/// A live element whose bytes at the tag position happen to equal the free tag is
/// indistinguishable from a free element. Callers that rely on iteration must not store the
/// value `u32::from_le_bytes(*b"free")` at byte offset `size_of::<usize>()` of an element.
///
/// # Examples
///
/// ```rust
/// use chunk_pool::ChunkPool;
///
/// let mut pool = ChunkPool::builder()
///     .element_size(16)
///     .elements_per_chunk(std::num::NonZero::new(4).unwrap())
///     .allow_iteration()
///     .build();
///
/// let elements: Vec<_> = (0..6).map(|_| pool.allocate()).collect();
/// assert_eq!(pool.len(), 6);
/// assert_eq!(pool.chunk_count(), 2);
///
/// for element in elements {
///     // SAFETY: Each element came from this pool and is freed exactly once.
///     unsafe { pool.free(element) };
/// }
///
/// // Draining the pool returns all but the first chunk to the backend.
/// assert_eq!(pool.chunk_count(), 1);
/// ```
///
/// # Thread Safety
///
/// The pool is thread-mobile ([`Send`]) and can be moved between threads, but it is not
/// thread-safe ([`Sync`]) and cannot be shared between threads without additional
/// synchronization.
#[derive(Debug)]
pub struct ChunkPool<A: ChunkAllocator = Backend> {
    /// Geometry shared by all chunks: element size, elements per chunk and chunk memory layout.
    layout: ChunkLayout,

    flags: PoolFlags,

    allocator: A,

    /// Chunks in allocation order. The first chunk is retained for the lifetime of the pool.
    chunks: Vec<Chunk>,

    /// Head of the free list threaded through the unused slots of `chunks`.
    free_head: Option<Slot>,

    /// Number of elements currently handed out.
    length: usize,

    drop_policy: DropPolicy,
}

impl ChunkPool {
    /// Creates a builder for configuring and constructing a [`ChunkPool`].
    ///
    /// You must specify an element size using either `.element_size()` or
    /// `.element_size_of::<T>()` before calling `.build()`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use chunk_pool::ChunkPool;
    ///
    /// let pool = ChunkPool::builder().element_size(48).build();
    ///
    /// assert_eq!(pool.len(), 0);
    /// assert!(pool.is_empty());
    /// assert_eq!(pool.element_size(), 48);
    /// ```
    #[inline]
    pub fn builder() -> ChunkPoolBuilder {
        ChunkPoolBuilder::new()
    }
}

impl<A: ChunkAllocator> ChunkPool<A> {
    /// Creates a new pool and eagerly allocates enough chunks for `initial_elements`.
    ///
    /// This method is used internally by the builder to construct the actual pool.
    pub(crate) fn new_inner(
        requested_element_size: usize,
        initial_elements: usize,
        elements_per_chunk: NonZero<usize>,
        flags: PoolFlags,
        drop_policy: DropPolicy,
        allocator: A,
    ) -> Result<Self> {
        let element_size = effective_element_size(requested_element_size, flags);
        let layout = ChunkLayout::calculate(element_size, elements_per_chunk);

        let chunks_needed = initial_elements.div_ceil(elements_per_chunk.get()).max(1);

        let mut pool = Self {
            layout,
            flags,
            allocator,
            chunks: Vec::new(),
            free_head: None,
            length: 0,
            drop_policy,
        };

        // If a chunk allocation fails, dropping the partially built pool releases the
        // chunks obtained so far.
        for _ in 0..chunks_needed {
            let chunk = Chunk::new(layout, &pool.allocator)?;
            pool.chunks.push(chunk);
        }

        // Threading back to front makes the free list run through the chunks in allocation
        // order, so that early allocations are served from the earliest chunk.
        let tag = pool.allows_iteration();
        let mut head = None;

        for chunk in pool.chunks.iter().rev() {
            // SAFETY: The chunks are brand new, so none of their slots are handed out.
            head = Some(unsafe { chunk.thread_free_list(head, tag) });
        }

        pool.free_head = head;

        debug!(
            element_size,
            elements_per_chunk = elements_per_chunk.get(),
            chunks = chunks_needed,
            ?flags,
            "created chunk pool"
        );

        Ok(pool)
    }

    /// The size of each element in bytes.
    ///
    /// This may be larger than the size requested from the builder, as every element must be
    /// able to hold a free-list link while it is not in use.
    ///
    /// # Example
    ///
    /// ```rust
    /// use chunk_pool::{ChunkPool, MIN_ELEMENT_SIZE};
    ///
    /// let pool = ChunkPool::builder().element_size(1).build();
    /// assert_eq!(pool.element_size(), MIN_ELEMENT_SIZE);
    /// ```
    #[must_use]
    #[inline]
    pub fn element_size(&self) -> usize {
        self.layout.element_size()
    }

    /// The number of elements in each chunk.
    #[must_use]
    #[inline]
    pub fn elements_per_chunk(&self) -> NonZero<usize> {
        self.layout.capacity()
    }

    /// The size of each chunk in bytes, equal to the element size times the elements per chunk.
    #[must_use]
    #[inline]
    pub fn chunk_byte_size(&self) -> usize {
        self.layout.layout().size()
    }

    /// The flags the pool was created with.
    #[must_use]
    #[inline]
    pub fn flags(&self) -> PoolFlags {
        self.flags
    }

    /// Whether the pool was created with [`PoolFlags::ALLOW_ITERATION`].
    #[must_use]
    #[inline]
    pub fn allows_iteration(&self) -> bool {
        self.flags.contains(PoolFlags::ALLOW_ITERATION)
    }

    /// The number of elements currently allocated from the pool.
    ///
    /// # Example
    ///
    /// ```rust
    /// use chunk_pool::ChunkPool;
    ///
    /// let mut pool = ChunkPool::builder().element_size(16).build();
    /// assert_eq!(pool.len(), 0);
    ///
    /// let element = pool.allocate();
    /// assert_eq!(pool.len(), 1);
    ///
    /// // SAFETY: The element came from this pool and is freed exactly once.
    /// unsafe { pool.free(element) };
    /// assert_eq!(pool.len(), 0);
    /// ```
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether no elements are currently allocated from the pool.
    ///
    /// An empty pool still holds one chunk of memory.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The number of chunks the pool currently holds.
    #[must_use]
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// The number of elements the pool can hand out without obtaining more memory,
    /// including the elements that are already allocated.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        // Overflow here would imply capacity is greater than virtual memory - impossible.
        self.chunks
            .len()
            .wrapping_mul(self.layout.capacity().get())
    }

    /// Allocates an element and returns a pointer to it.
    ///
    /// The contents of the element are unspecified; use
    /// [`allocate_zeroed()`](Self::allocate_zeroed) if you need zeroed memory. The pointer
    /// remains valid until it is passed to [`free()`](Self::free), the pool is
    /// [cleared](Self::clear) or the pool is dropped.
    ///
    /// If the pool has no free element, it obtains one new chunk from its allocator. Failure of
    /// the allocator is treated like any other out-of-memory condition via
    /// [`std::alloc::handle_alloc_error()`]; use [`try_allocate()`](Self::try_allocate) to
    /// handle it instead.
    ///
    /// # Example
    ///
    /// ```rust
    /// use chunk_pool::ChunkPool;
    ///
    /// let mut pool = ChunkPool::builder().element_size_of::<u128>().build();
    ///
    /// let element = pool.allocate();
    ///
    /// // SAFETY: The element is live and at least 16 bytes long.
    /// unsafe {
    ///     element.cast::<u128>().write_unaligned(42);
    ///     assert_eq!(element.cast::<u128>().read_unaligned(), 42);
    /// }
    /// ```
    #[must_use]
    pub fn allocate(&mut self) -> NonNull<u8> {
        match self.try_allocate() {
            Ok(ptr) => ptr,
            Err(Error::AllocationFailed { layout }) => handle_alloc_error(layout),
        }
    }

    /// Allocates an element, returning an error if the pool needed a new chunk and the
    /// allocator could not provide one.
    ///
    /// Apart from error handling, this behaves like [`allocate()`](Self::allocate).
    pub fn try_allocate(&mut self) -> Result<NonNull<u8>> {
        let slot = match self.free_head {
            Some(slot) => slot,
            None => self.add_chunk()?,
        };

        // SAFETY: The slot is the head of the free list, so it is a free slot in one of our
        // chunks and its leading bytes hold the free-list node.
        self.free_head = unsafe { slot.next() };

        if self.allows_iteration() {
            // SAFETY: As above. The tag is overwritten before the slot is handed out.
            unsafe {
                slot.set_tag(IN_USE_TAG);
            }
        }

        // This can never overflow since that would mean the pool is greater than virtual memory.
        self.length = self.length.wrapping_add(1);

        Ok(slot.ptr())
    }

    /// Allocates an element and fills it with zero bytes.
    ///
    /// # Example
    ///
    /// ```rust
    /// use chunk_pool::ChunkPool;
    ///
    /// let mut pool = ChunkPool::builder().element_size(32).build();
    ///
    /// let element = pool.allocate_zeroed();
    ///
    /// // SAFETY: The element is live and 32 bytes long.
    /// let bytes = unsafe { element.cast::<[u8; 32]>().read_unaligned() };
    /// assert_eq!(bytes, [0; 32]);
    /// ```
    #[must_use]
    pub fn allocate_zeroed(&mut self) -> NonNull<u8> {
        match self.try_allocate_zeroed() {
            Ok(ptr) => ptr,
            Err(Error::AllocationFailed { layout }) => handle_alloc_error(layout),
        }
    }

    /// Allocates an element and fills it with zero bytes, returning an error if the allocator
    /// could not provide a needed chunk.
    pub fn try_allocate_zeroed(&mut self) -> Result<NonNull<u8>> {
        let ptr = self.try_allocate()?;

        // SAFETY: The element was just handed out to us and is element_size() bytes long.
        unsafe {
            ptr.as_ptr().write_bytes(0, self.element_size());
        }

        Ok(ptr)
    }

    /// Returns an element to the pool.
    ///
    /// The element memory becomes available for future allocations. If this was the last live
    /// element, every chunk except the first is returned to the allocator.
    ///
    /// # Panics
    ///
    /// Panics if the pool has no live elements.
    ///
    /// In debug builds, panics if `ptr` is not the start of an element of this pool, or if the
    /// pool allows iteration and the element is already free (double free). Release builds do
    /// not perform these checks.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `ptr` was returned by an allocation method of this pool,
    /// has not been freed since, and has not been invalidated by [`clear()`](Self::clear).
    /// The caller must not access the element memory after this call.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        assert!(
            self.length > 0,
            "attempted to free {ptr:p} into a pool that has no live elements"
        );

        #[cfg(debug_assertions)]
        assert!(
            self.contains(ptr),
            "attempted to free {ptr:p}, which is not an element of this pool"
        );

        let slot = Slot::new(ptr);

        if self.allows_iteration() {
            // SAFETY: The caller guarantees the pointer is a live element of this pool, so its
            // leading bytes are pool memory and initialized.
            debug_assert!(
                !unsafe { slot.is_tagged_free() },
                "attempted to free {ptr:p}, which is already free"
            );

            // SAFETY: As above. The caller gives up access to the element with this call.
            unsafe {
                slot.set_tag(FREE_TAG);
            }
        }

        // SAFETY: As above.
        unsafe {
            slot.set_next(self.free_head);
        }

        self.free_head = Some(slot);

        // Cannot wrap around because we asserted above that there is at least one live element.
        self.length = self.length.wrapping_sub(1);

        if self.length == 0 {
            let released = self.reset_to_first_chunk();

            if released > 0 {
                debug!(released, "pool drained, released all chunks except the first");
            }
        }
    }

    /// Frees every element at once and returns every chunk except the first to the allocator.
    ///
    /// All pointers previously handed out by the pool become invalid. The pool remains usable.
    ///
    /// # Example
    ///
    /// ```rust
    /// use chunk_pool::ChunkPool;
    ///
    /// let mut pool = ChunkPool::builder()
    ///     .element_size(16)
    ///     .elements_per_chunk(std::num::NonZero::new(2).unwrap())
    ///     .build();
    ///
    /// for _ in 0..5 {
    ///     _ = pool.allocate();
    /// }
    /// assert_eq!(pool.chunk_count(), 3);
    ///
    /// pool.clear();
    ///
    /// assert!(pool.is_empty());
    /// assert_eq!(pool.chunk_count(), 1);
    /// ```
    pub fn clear(&mut self) {
        let dropped_elements = self.length;
        let released = self.reset_to_first_chunk();
        self.length = 0;

        debug!(dropped_elements, released, "cleared chunk pool");
    }

    /// Whether `ptr` is the start of an element slot in one of the pool's chunks.
    ///
    /// This says nothing about whether the element is currently allocated. The check scans
    /// every chunk, so it takes time proportional to [`chunk_count()`](Self::chunk_count).
    /// [`free()`](Self::free) performs the same check in debug builds.
    ///
    /// # Example
    ///
    /// ```rust
    /// use chunk_pool::ChunkPool;
    ///
    /// let mut pool = ChunkPool::builder().element_size(16).build();
    /// let element = pool.allocate();
    ///
    /// assert!(pool.contains(element));
    ///
    /// let mut unrelated = 0_u128;
    /// assert!(!pool.contains(std::ptr::NonNull::from(&mut unrelated).cast()));
    /// ```
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.chunks
            .iter()
            .any(|chunk| chunk.index_of(ptr).is_some())
    }

    /// Returns an iterator over pointers to every live element.
    ///
    /// Elements are visited in chunk allocation order, then by position within the chunk.
    ///
    /// # Panics
    ///
    /// Panics if the pool was not created with [`PoolFlags::ALLOW_ITERATION`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use chunk_pool::ChunkPool;
    ///
    /// let mut pool = ChunkPool::builder().element_size(16).allow_iteration().build();
    ///
    /// let a = pool.allocate();
    /// let b = pool.allocate();
    /// let c = pool.allocate();
    ///
    /// // SAFETY: b came from this pool and is freed exactly once.
    /// unsafe { pool.free(b) };
    ///
    /// assert_eq!(pool.iter().collect::<Vec<_>>(), vec![a, c]);
    /// ```
    pub fn iter(&self) -> Iter<'_, A> {
        self.assert_iteration_allowed("iter()");

        Iter::new(self)
    }

    /// Returns the live element at position `index` in iteration order, or `None` if
    /// `index >= len()`.
    ///
    /// This walks the pool from the start, so it takes time proportional to `index`.
    ///
    /// # Panics
    ///
    /// Panics if the pool was not created with [`PoolFlags::ALLOW_ITERATION`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use chunk_pool::ChunkPool;
    ///
    /// let mut pool = ChunkPool::builder().element_size(16).allow_iteration().build();
    ///
    /// let a = pool.allocate();
    /// let b = pool.allocate();
    ///
    /// assert_eq!(pool.find(0), Some(a));
    /// assert_eq!(pool.find(1), Some(b));
    /// assert_eq!(pool.find(2), None);
    /// ```
    #[must_use]
    pub fn find(&self, index: usize) -> Option<NonNull<u8>> {
        self.assert_iteration_allowed("find()");

        if index >= self.length {
            return None;
        }

        self.iter().nth(index)
    }

    /// Fills `table` with pointers to every live element, in iteration order.
    ///
    /// # Panics
    ///
    /// Panics if the pool was not created with [`PoolFlags::ALLOW_ITERATION`] or if the length
    /// of `table` is not equal to [`len()`](Self::len).
    pub fn copy_to_table(&self, table: &mut [NonNull<u8>]) {
        self.assert_iteration_allowed("copy_to_table()");

        assert!(
            table.len() == self.length,
            "table has room for {} element pointers but the pool has {} live elements",
            table.len(),
            self.length
        );

        for (entry, element) in table.iter_mut().zip(self.iter()) {
            *entry = element;
        }
    }

    /// Returns a newly allocated table of pointers to every live element, in iteration order.
    ///
    /// # Panics
    ///
    /// Panics if the pool was not created with [`PoolFlags::ALLOW_ITERATION`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use chunk_pool::ChunkPool;
    ///
    /// let mut pool = ChunkPool::builder().element_size(16).allow_iteration().build();
    ///
    /// let a = pool.allocate();
    /// let b = pool.allocate();
    ///
    /// assert_eq!(pool.to_table(), vec![a, b]);
    /// ```
    #[must_use]
    pub fn to_table(&self) -> Vec<NonNull<u8>> {
        self.assert_iteration_allowed("to_table()");

        self.iter().collect()
    }

    /// Copies the bytes of every live element into `array`, back to back in iteration order.
    ///
    /// # Panics
    ///
    /// Panics if the pool was not created with [`PoolFlags::ALLOW_ITERATION`] or if the length
    /// of `array` is not equal to `len() * element_size()`.
    pub fn copy_to_array(&self, array: &mut [u8]) {
        self.assert_iteration_allowed("copy_to_array()");

        let element_size = self.element_size();

        let expected_len = self
            .length
            .checked_mul(element_size)
            .expect("live elements cannot exceed the size of virtual memory");

        assert!(
            array.len() == expected_len,
            "array has room for {} bytes but the pool has {} live elements of {} bytes each",
            array.len(),
            self.length,
            element_size
        );

        for (destination, element) in array.chunks_exact_mut(element_size).zip(self.iter()) {
            // SAFETY: The element is live, so it points to element_size() initialized bytes
            // of pool memory, and the destination is a distinct slice of the same length.
            unsafe {
                ptr::copy_nonoverlapping(
                    element.as_ptr(),
                    destination.as_mut_ptr(),
                    element_size,
                );
            }
        }
    }

    /// Returns a newly allocated buffer holding the bytes of every live element, back to back
    /// in iteration order.
    ///
    /// # Panics
    ///
    /// Panics if the pool was not created with [`PoolFlags::ALLOW_ITERATION`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use chunk_pool::ChunkPool;
    ///
    /// let mut pool = ChunkPool::builder().element_size(16).allow_iteration().build();
    ///
    /// let element = pool.allocate();
    ///
    /// // SAFETY: The element is live and 16 bytes long.
    /// unsafe { element.cast::<[u8; 16]>().write_unaligned([7; 16]) };
    ///
    /// assert_eq!(pool.to_array(), vec![7; 16]);
    /// ```
    #[must_use]
    pub fn to_array(&self) -> Vec<u8> {
        self.assert_iteration_allowed("to_array()");

        let len = self
            .length
            .checked_mul(self.element_size())
            .expect("live elements cannot exceed the size of virtual memory");

        let mut array = vec![0; len];
        self.copy_to_array(&mut array);
        array
    }

    pub(crate) fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    fn assert_iteration_allowed(&self, operation: &str) {
        assert!(
            self.allows_iteration(),
            "{operation} requires a pool created with PoolFlags::ALLOW_ITERATION"
        );
    }

    /// Obtains a new chunk, appends it to the chunk list and threads its slots in front of the
    /// current free list. Returns the new free list head.
    fn add_chunk(&mut self) -> Result<Slot> {
        let chunk = Chunk::new(self.layout, &self.allocator)?;

        // SAFETY: The chunk is brand new, so none of its slots are handed out.
        let head = unsafe { chunk.thread_free_list(self.free_head, self.allows_iteration()) };

        self.chunks.push(chunk);
        self.free_head = Some(head);

        Ok(head)
    }

    /// Releases every chunk except the first and rebuilds the free list in the first chunk.
    /// Returns the number of chunks released.
    ///
    /// Every element of the pool is considered free afterwards; the caller is responsible for
    /// the live element count.
    fn reset_to_first_chunk(&mut self) -> usize {
        let released = self.chunks.len().saturating_sub(1);

        if released > 0 {
            for chunk in self.chunks.drain(1..) {
                // SAFETY: Every chunk in the pool was created with our allocator.
                unsafe {
                    chunk.release(&self.allocator);
                }
            }
        }

        let tag = self.allows_iteration();

        // SAFETY: The caller considers every element free, so no slot is handed out.
        self.free_head = self
            .chunks
            .first()
            .map(|first| unsafe { first.thread_free_list(None, tag) });

        released
    }

    /// Verifies that the free list and the live element count agree with each other.
    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(test)]
    pub(crate) fn integrity_check(&self) {
        let capacity = self.capacity();
        let mut free_count: usize = 0;
        let mut cursor = self.free_head;

        while let Some(slot) = cursor {
            assert!(
                free_count < capacity,
                "free list is longer than the pool capacity {capacity}, it must contain a cycle"
            );

            assert!(
                self.contains(slot.ptr()),
                "free list entry {:p} is not a slot of this pool",
                slot.ptr()
            );

            if self.allows_iteration() {
                // SAFETY: The slot is part of one of our chunks, as verified above.
                assert!(
                    unsafe { slot.is_tagged_free() },
                    "free list entry {:p} is not tagged as free",
                    slot.ptr()
                );
            }

            free_count = free_count.wrapping_add(1);

            // SAFETY: As above.
            cursor = unsafe { slot.next() };
        }

        assert!(
            free_count.wrapping_add(self.length) == capacity,
            "{free_count} free and {} live elements do not add up to capacity {capacity}",
            self.length
        );

        if self.allows_iteration() {
            let tagged_live = self
                .chunks
                .iter()
                .flat_map(|chunk| {
                    (0..self.layout.capacity().get()).map(move |index| chunk.slot(index))
                })
                // SAFETY: The slot is part of one of our chunks.
                .filter(|slot| !unsafe { slot.is_tagged_free() })
                .count();

            assert!(
                tagged_live == self.length,
                "{tagged_live} slots are tagged live but the pool has {} live elements",
                self.length
            );
        }
    }
}

impl<'a, A: ChunkAllocator> IntoIterator for &'a ChunkPool<A> {
    type Item = NonNull<u8>;
    type IntoIter = Iter<'a, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<A: ChunkAllocator> Drop for ChunkPool<A> {
    fn drop(&mut self) {
        let live_elements = self.length;

        for chunk in mem::take(&mut self.chunks) {
            // SAFETY: Every chunk in the pool was created with our allocator.
            unsafe {
                chunk.release(&self.allocator);
            }
        }

        // We do this check at the end so we clean up the memory first. Mostly to make Miri happy.
        //
        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if !thread::panicking() && matches!(self.drop_policy, DropPolicy::MustNotDropElements) {
            assert!(
                live_elements == 0,
                "dropped a ChunkPool with {live_elements} live elements - this is forbidden by DropPolicy::MustNotDropElements"
            );
        }
    }
}

// SAFETY: The raw pointers in the pool (chunk memory and the free list head) only address
// memory owned by the pool itself, which is not tied to any thread. All access is guarded by
// &self/&mut self, so moving the pool to another thread together with its allocator is sound.
unsafe impl<A: ChunkAllocator + Send> Send for ChunkPool<A> {}

/// Rounds a requested element size up to what the free list needs.
fn effective_element_size(requested: usize, flags: PoolFlags) -> usize {
    let size = requested.max(MIN_ELEMENT_SIZE);

    if flags.contains(PoolFlags::ALLOW_ITERATION) {
        size.max(FREE_NODE_SIZE)
    } else {
        size
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::cell::Cell;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(ChunkPool: Send, std::fmt::Debug);
    assert_not_impl_any!(ChunkPool: Sync);

    fn iterable_pool(element_size: usize, per_chunk: usize) -> ChunkPool {
        ChunkPool::builder()
            .element_size(element_size)
            .elements_per_chunk(NonZero::new(per_chunk).unwrap())
            .allow_iteration()
            .build()
    }

    #[test]
    fn smoke_test() {
        let mut pool = iterable_pool(16, 4);

        assert_eq!(pool.len(), 0);
        assert!(pool.is_empty());
        assert_eq!(pool.chunk_count(), 1);
        assert_eq!(pool.capacity(), 4);

        let a = pool.allocate();
        let b = pool.allocate();
        let c = pool.allocate();

        assert_eq!(pool.len(), 3);
        assert!(!pool.is_empty());

        unsafe {
            a.cast::<u64>().write_unaligned(1);
            b.cast::<u64>().write_unaligned(2);
            c.cast::<u64>().write_unaligned(3);
        }

        unsafe { pool.free(b) };
        pool.integrity_check();

        // The most recently freed element is reused first.
        let d = pool.allocate();
        assert_eq!(d, b);

        unsafe {
            assert_eq!(a.cast::<u64>().read_unaligned(), 1);
            assert_eq!(c.cast::<u64>().read_unaligned(), 3);
        }

        pool.integrity_check();
    }

    #[test]
    fn element_size_is_clamped_to_minimum() {
        let pool = ChunkPool::builder().element_size(1).build();
        assert_eq!(pool.element_size(), MIN_ELEMENT_SIZE);

        let pool = ChunkPool::builder().element_size(3).allow_iteration().build();
        assert_eq!(pool.element_size(), MIN_ELEMENT_SIZE.max(FREE_NODE_SIZE));

        let pool = ChunkPool::builder().element_size(100).build();
        assert_eq!(pool.element_size(), 100);
    }

    #[test]
    fn chunk_byte_size_is_product() {
        let pool = iterable_pool(24, 10);

        assert_eq!(pool.elements_per_chunk().get(), 10);
        assert_eq!(pool.chunk_byte_size(), 240);
    }

    #[test]
    fn initial_chunks_round_up() {
        let cases = [(0, 1), (1, 1), (4, 1), (5, 2), (8, 2), (9, 3)];

        for (initial_elements, expected_chunks) in cases {
            let pool = ChunkPool::builder()
                .element_size(16)
                .elements_per_chunk(nz!(4))
                .initial_elements(initial_elements)
                .build();

            assert_eq!(
                pool.chunk_count(),
                expected_chunks,
                "initial_elements = {initial_elements}"
            );
        }
    }

    #[test]
    fn preallocated_chunks_are_used_in_order() {
        let mut pool = ChunkPool::builder()
            .element_size(16)
            .elements_per_chunk(nz!(2))
            .initial_elements(6)
            .allow_iteration()
            .build();

        assert_eq!(pool.chunk_count(), 3);

        let elements: Vec<_> = (0..6).map(|_| pool.allocate()).collect();

        // No further chunks were needed.
        assert_eq!(pool.chunk_count(), 3);

        for (index, element) in elements.iter().enumerate() {
            let chunk_index = index / 2;
            assert_eq!(pool.chunks[chunk_index].index_of(*element), Some(index % 2));
        }

        pool.integrity_check();
    }

    #[test]
    fn fill_chunk_before_allocating_next() {
        let mut pool = iterable_pool(16, 4);

        for _ in 0..4 {
            _ = pool.allocate();
        }

        assert_eq!(pool.chunk_count(), 1);
        assert!(pool.free_head.is_none());

        _ = pool.allocate();

        assert_eq!(pool.chunk_count(), 2);
        pool.integrity_check();
    }

    #[test]
    fn allocate_zeroed_clears_previous_contents() {
        let mut pool = iterable_pool(40, 4);

        let element = pool.allocate();
        unsafe { element.as_ptr().write_bytes(0xEE, 40) };
        unsafe { pool.free(element) };

        // Keep one element live so the freed one is reused without a reset.
        let keep = pool.allocate();
        let zeroed = pool.allocate_zeroed();

        let bytes = unsafe { zeroed.cast::<[u8; 40]>().read_unaligned() };
        assert_eq!(bytes, [0; 40]);

        unsafe {
            pool.free(keep);
            pool.free(zeroed);
        }
    }

    #[test]
    fn draining_shrinks_to_first_chunk() {
        let mut pool = iterable_pool(16, 2);
        let first_chunk_start = pool.chunks[0].slot(0).ptr();

        let elements: Vec<_> = (0..7).map(|_| pool.allocate()).collect();
        assert_eq!(pool.chunk_count(), 4);

        for element in elements {
            unsafe { pool.free(element) };
        }

        assert_eq!(pool.chunk_count(), 1);
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.chunks[0].slot(0).ptr(), first_chunk_start);
        pool.integrity_check();

        // The retained chunk serves the next allocations from its start.
        assert_eq!(pool.allocate(), first_chunk_start);
    }

    #[test]
    fn partial_free_does_not_shrink() {
        let mut pool = iterable_pool(16, 2);

        let elements: Vec<_> = (0..5).map(|_| pool.allocate()).collect();
        assert_eq!(pool.chunk_count(), 3);

        for element in &elements[..4] {
            unsafe { pool.free(*element) };
        }

        assert_eq!(pool.chunk_count(), 3);
        pool.integrity_check();
    }

    #[test]
    fn clear_resets_to_one_chunk() {
        let mut pool = iterable_pool(16, 3);

        for _ in 0..10 {
            _ = pool.allocate();
        }
        assert_eq!(pool.chunk_count(), 4);

        pool.clear();

        assert!(pool.is_empty());
        assert_eq!(pool.chunk_count(), 1);
        assert_eq!(pool.iter().count(), 0);
        pool.integrity_check();

        // The pool is fully usable after clearing.
        let a = pool.allocate();
        let b = pool.allocate();
        assert_eq!(pool.to_table(), vec![a, b]);
        pool.integrity_check();
    }

    #[test]
    fn clear_without_iteration() {
        let mut pool = ChunkPool::builder()
            .element_size(16)
            .elements_per_chunk(nz!(2))
            .build();

        for _ in 0..5 {
            _ = pool.allocate();
        }

        pool.clear();

        assert!(pool.is_empty());
        assert_eq!(pool.chunk_count(), 1);
        pool.integrity_check();
    }

    #[test]
    fn contains_recognizes_own_elements_only() {
        let mut pool = iterable_pool(16, 2);
        let mut other = iterable_pool(16, 2);

        let mine = pool.allocate();
        let theirs = other.allocate();

        assert!(pool.contains(mine));
        assert!(!pool.contains(theirs));
        assert!(!pool.contains(unsafe { mine.add(1) }));
    }

    #[test]
    fn find_returns_elements_in_iteration_order() {
        let mut pool = iterable_pool(16, 2);

        let elements: Vec<_> = (0..5).map(|_| pool.allocate()).collect();
        unsafe { pool.free(elements[1]) };

        assert_eq!(pool.find(0), Some(elements[0]));
        assert_eq!(pool.find(1), Some(elements[2]));
        assert_eq!(pool.find(3), Some(elements[4]));
        assert_eq!(pool.find(4), None);
        assert_eq!(pool.find(usize::MAX), None);
    }

    #[test]
    fn find_on_empty_pool_is_none() {
        let pool = iterable_pool(16, 2);

        assert_eq!(pool.find(0), None);
    }

    #[test]
    fn copy_to_table_fills_exactly() {
        let mut pool = iterable_pool(16, 4);

        let elements: Vec<_> = (0..3).map(|_| pool.allocate()).collect();

        let mut table = vec![NonNull::dangling(); 3];
        pool.copy_to_table(&mut table);

        assert_eq!(table, elements);
    }

    #[test]
    #[should_panic]
    fn copy_to_table_wrong_length_panics() {
        let mut pool = iterable_pool(16, 4);
        _ = pool.allocate();

        let mut table = vec![NonNull::dangling(); 2];
        pool.copy_to_table(&mut table);
    }

    #[test]
    fn copy_to_array_copies_element_bytes() {
        let mut pool = iterable_pool(16, 2);

        for value in 0..3_u8 {
            let element = pool.allocate();
            unsafe { element.as_ptr().write_bytes(value, 16) };
        }

        let mut array = vec![0xFF; 48];
        pool.copy_to_array(&mut array);

        assert_eq!(&array[..16], &[0; 16]);
        assert_eq!(&array[16..32], &[1; 16]);
        assert_eq!(&array[32..], &[2; 16]);
    }

    #[test]
    #[should_panic]
    fn copy_to_array_wrong_length_panics() {
        let mut pool = iterable_pool(16, 2);
        _ = pool.allocate();

        let mut array = vec![0; 15];
        pool.copy_to_array(&mut array);
    }

    #[test]
    fn exports_of_empty_pool_are_empty() {
        let pool = iterable_pool(16, 2);

        assert!(pool.to_table().is_empty());
        assert!(pool.to_array().is_empty());
    }

    #[test]
    #[should_panic]
    fn iter_without_iteration_flag_panics() {
        let pool = ChunkPool::builder().element_size(16).build();
        _ = pool.iter();
    }

    #[test]
    #[should_panic]
    fn find_without_iteration_flag_panics() {
        let pool = ChunkPool::builder().element_size(16).build();
        _ = pool.find(0);
    }

    #[test]
    #[should_panic]
    fn to_array_without_iteration_flag_panics() {
        let pool = ChunkPool::builder().element_size(16).build();
        _ = pool.to_array();
    }

    #[test]
    #[should_panic]
    fn to_table_without_iteration_flag_panics() {
        let pool = ChunkPool::builder().element_size(16).build();
        _ = pool.to_table();
    }

    #[test]
    #[should_panic]
    fn free_into_empty_pool_panics() {
        let mut pool = iterable_pool(16, 2);
        let element = pool.allocate();
        unsafe { pool.free(element) };

        unsafe { pool.free(element) };
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn double_free_is_detected() {
        let mut pool = iterable_pool(16, 2);

        let element = pool.allocate();
        let _keep = pool.allocate();

        unsafe { pool.free(element) };
        unsafe { pool.free(element) };
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn free_of_foreign_pointer_is_detected() {
        let mut pool = iterable_pool(16, 2);
        let mut other = iterable_pool(16, 2);

        let _mine = pool.allocate();
        let theirs = other.allocate();

        unsafe { pool.free(theirs) };
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn free_of_interior_pointer_is_detected() {
        let mut pool = iterable_pool(16, 2);

        let element = pool.allocate();

        unsafe { pool.free(element.add(4)) };
    }

    #[test]
    fn drop_with_no_live_elements_does_not_panic_if_policy_must_not_drop() {
        let mut pool = ChunkPool::builder()
            .element_size(16)
            .drop_policy(DropPolicy::MustNotDropElements)
            .build();

        let element = pool.allocate();
        unsafe { pool.free(element) };

        drop(pool);
    }

    #[test]
    #[should_panic]
    fn drop_with_live_elements_panics_if_policy_must_not_drop() {
        let mut pool = ChunkPool::builder()
            .element_size(16)
            .drop_policy(DropPolicy::MustNotDropElements)
            .build();

        _ = pool.allocate();

        drop(pool);
    }

    #[test]
    fn drop_with_live_elements_is_fine_by_default() {
        let mut pool = iterable_pool(16, 2);

        for _ in 0..5 {
            _ = pool.allocate();
        }

        drop(pool);
    }

    #[test]
    fn drop_releases_every_chunk() {
        #[derive(Default)]
        struct Tracking {
            outstanding: Cell<usize>,
        }

        impl ChunkAllocator for Tracking {
            fn allocate(&self, layout: std::alloc::Layout) -> Option<NonNull<u8>> {
                self.outstanding.set(self.outstanding.get() + 1);
                Backend::Global.allocate(layout)
            }

            unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: std::alloc::Layout) {
                self.outstanding.set(self.outstanding.get() - 1);
                unsafe { Backend::Global.deallocate(ptr, layout) };
            }
        }

        let tracking = Tracking::default();

        {
            let mut pool = ChunkPool::builder()
                .element_size(16)
                .elements_per_chunk(nz!(2))
                .build_in(&tracking);

            for _ in 0..9 {
                _ = pool.allocate();
            }

            assert_eq!(tracking.outstanding.get(), 5);
        }

        assert_eq!(tracking.outstanding.get(), 0);
    }

    #[test]
    fn system_backend_works() {
        let mut pool = ChunkPool::builder()
            .element_size(16)
            .elements_per_chunk(nz!(2))
            .use_system_allocator()
            .allow_iteration()
            .build();

        let elements: Vec<_> = (0..5).map(|_| pool.allocate()).collect();
        assert_eq!(pool.to_table(), elements);

        for element in elements {
            unsafe { pool.free(element) };
        }

        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn pool_can_move_between_threads() {
        let mut pool = iterable_pool(16, 2);
        _ = pool.allocate();

        let handle = std::thread::spawn(move || {
            _ = pool.allocate();
            pool.len()
        });

        assert_eq!(handle.join().unwrap(), 2);
    }
}
