use std::alloc::handle_alloc_error;
use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;

use crate::{
    Backend, ChunkAllocator, ChunkPool, DEFAULT_ELEMENTS_PER_CHUNK, DropPolicy, Error, PoolFlags,
};

/// Builder for creating an instance of [`ChunkPool`].
///
/// [`ChunkPool`] requires the element size to be specified at construction time.
/// Use either `.element_size()` to provide a size in bytes or `.element_size_of::<T>()` to use
/// the size of the provided type.
///
/// The element size is mandatory, whereas other settings are optional.
///
/// # Examples
///
/// Using a size in bytes:
///
/// ```
/// use chunk_pool::ChunkPool;
///
/// let pool = ChunkPool::builder().element_size(64).build();
/// ```
///
/// Using the size of a type, with every optional setting:
///
/// ```
/// use std::num::NonZero;
///
/// use chunk_pool::{ChunkPool, DropPolicy, PoolFlags};
///
/// let pool = ChunkPool::builder()
///     .element_size_of::<[u32; 8]>()
///     .initial_elements(1000)
///     .elements_per_chunk(NonZero::new(256).unwrap())
///     .flags(PoolFlags::ALLOW_ITERATION | PoolFlags::USE_SYSTEM_ALLOCATOR)
///     .drop_policy(DropPolicy::MustNotDropElements)
///     .build();
///
/// assert_eq!(pool.chunk_count(), 4);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing pool configuration to happen on different threads than where the pool is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[derive(Debug)]
#[must_use]
pub struct ChunkPoolBuilder {
    element_size: Option<usize>,
    initial_elements: usize,
    elements_per_chunk: NonZero<usize>,
    flags: PoolFlags,
    drop_policy: DropPolicy,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl ChunkPoolBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            element_size: None,
            initial_elements: 0,
            elements_per_chunk: DEFAULT_ELEMENTS_PER_CHUNK,
            flags: PoolFlags::empty(),
            drop_policy: DropPolicy::default(),
            _not_sync: PhantomData,
        }
    }

    /// Sets the size in bytes of the elements handed out by the pool.
    ///
    /// Sizes smaller than [`MIN_ELEMENT_SIZE`][crate::MIN_ELEMENT_SIZE] are rounded up to it.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use chunk_pool::ChunkPool;
    ///
    /// let pool = ChunkPool::builder().element_size(24).build();
    /// assert_eq!(pool.element_size(), 24);
    /// ```
    #[inline]
    pub fn element_size(mut self, size: usize) -> Self {
        assert!(size > 0, "ChunkPool must have non-zero element size");
        self.element_size = Some(size);
        self
    }

    /// Sets the element size to the size of `T`.
    ///
    /// The pool does not align elements for `T`; access element memory with unaligned reads and
    /// writes unless the element size is a multiple of the required alignment.
    ///
    /// # Panics
    ///
    /// Panics if `T` is a zero-sized type.
    ///
    /// # Examples
    ///
    /// ```
    /// use chunk_pool::ChunkPool;
    ///
    /// let pool = ChunkPool::builder().element_size_of::<[u64; 3]>().build();
    /// assert_eq!(pool.element_size(), 24);
    /// ```
    #[inline]
    pub fn element_size_of<T>(self) -> Self {
        self.element_size(size_of::<T>())
    }

    /// Sets the number of elements the pool should be able to hold without obtaining more
    /// memory after creation. Chunks for them are allocated eagerly when the pool is built.
    ///
    /// The pool always starts with at least one chunk, even if this is zero (the default).
    #[inline]
    pub fn initial_elements(mut self, count: usize) -> Self {
        self.initial_elements = count;
        self
    }

    /// Sets the number of elements in each chunk.
    ///
    /// Larger chunks mean fewer calls to the memory backend, at the cost of more memory held
    /// by an idle pool. Defaults to [`DEFAULT_ELEMENTS_PER_CHUNK`].
    #[inline]
    pub fn elements_per_chunk(mut self, count: NonZero<usize>) -> Self {
        self.elements_per_chunk = count;
        self
    }

    /// Replaces the pool flags with the given set.
    ///
    /// # Examples
    ///
    /// ```
    /// use chunk_pool::{ChunkPool, PoolFlags};
    ///
    /// let pool = ChunkPool::builder()
    ///     .element_size(16)
    ///     .flags(PoolFlags::ALLOW_ITERATION)
    ///     .build();
    ///
    /// assert!(pool.allows_iteration());
    /// ```
    #[inline]
    pub fn flags(mut self, flags: PoolFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Enables [`PoolFlags::ALLOW_ITERATION`], making [`ChunkPool::iter()`],
    /// [`ChunkPool::find()`] and the export methods available.
    #[inline]
    pub fn allow_iteration(mut self) -> Self {
        self.flags.insert(PoolFlags::ALLOW_ITERATION);
        self
    }

    /// Enables [`PoolFlags::USE_SYSTEM_ALLOCATOR`], making [`build()`](Self::build) obtain chunks
    /// from the operating system allocator instead of the Rust global allocator.
    #[inline]
    pub fn use_system_allocator(mut self) -> Self {
        self.flags.insert(PoolFlags::USE_SYSTEM_ALLOCATOR);
        self
    }

    /// Sets the [drop policy][DropPolicy] for the pool. This governs how
    /// to treat remaining elements in the pool when the pool is dropped.
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds the pool with the specified configuration, obtaining chunks from the backend
    /// selected by the flags.
    ///
    /// # Panics
    ///
    /// Panics if no element size has been set using either
    /// [`element_size`](Self::element_size) or [`element_size_of`](Self::element_size_of).
    ///
    /// If the backend cannot provide the initial chunks, this is treated like any other
    /// out-of-memory condition via [`std::alloc::handle_alloc_error()`].
    #[must_use]
    #[inline]
    pub fn build(self) -> ChunkPool {
        let backend = Backend::from_flags(self.flags);
        self.build_in(backend)
    }

    /// Builds the pool with the specified configuration, returning an error if the backend
    /// cannot provide the initial chunks.
    ///
    /// # Panics
    ///
    /// Panics if no element size has been set.
    #[inline]
    pub fn try_build(self) -> crate::Result<ChunkPool> {
        let backend = Backend::from_flags(self.flags);
        self.try_build_in(backend)
    }

    /// Builds the pool with the specified configuration, obtaining chunks from a custom
    /// allocator. [`PoolFlags::USE_SYSTEM_ALLOCATOR`] has no effect on such a pool.
    ///
    /// # Panics
    ///
    /// Panics if no element size has been set.
    ///
    /// If the allocator cannot provide the initial chunks, this is treated like any other
    /// out-of-memory condition via [`std::alloc::handle_alloc_error()`].
    #[must_use]
    pub fn build_in<A: ChunkAllocator>(self, allocator: A) -> ChunkPool<A> {
        match self.try_build_in(allocator) {
            Ok(pool) => pool,
            Err(Error::AllocationFailed { layout }) => handle_alloc_error(layout),
        }
    }

    /// Builds the pool with the specified configuration, obtaining chunks from a custom
    /// allocator and returning an error if it cannot provide the initial chunks.
    ///
    /// # Panics
    ///
    /// Panics if no element size has been set.
    pub fn try_build_in<A: ChunkAllocator>(self, allocator: A) -> crate::Result<ChunkPool<A>> {
        let element_size = self.element_size.expect(
            "element size must be set using .element_size() or .element_size_of::<T>() before building the pool",
        );

        ChunkPool::new_inner(
            element_size,
            self.initial_elements,
            self.elements_per_chunk,
            self.flags,
            self.drop_policy,
            allocator,
        )
    }
}

#[cfg(test)]
mod tests {
    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(ChunkPoolBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(ChunkPoolBuilder: Sync);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = ChunkPoolBuilder::new();

        assert!(builder.element_size.is_none());
        assert_eq!(builder.initial_elements, 0);
        assert_eq!(builder.elements_per_chunk, DEFAULT_ELEMENTS_PER_CHUNK);
        assert_eq!(builder.flags, PoolFlags::empty());
        assert_eq!(builder.drop_policy, DropPolicy::default());
    }

    #[test]
    fn element_size_of_uses_type_size() {
        let builder = ChunkPoolBuilder::new().element_size_of::<[u16; 5]>();
        assert_eq!(builder.element_size, Some(10));
    }

    #[test]
    fn element_size_can_be_overridden() {
        let builder = ChunkPoolBuilder::new()
            .element_size_of::<u64>()
            .element_size(40);
        assert_eq!(builder.element_size, Some(40));
    }

    #[test]
    #[should_panic]
    fn zero_element_size_panics() {
        _ = ChunkPoolBuilder::new().element_size(0);
    }

    #[test]
    #[should_panic]
    fn zero_sized_type_panics() {
        _ = ChunkPoolBuilder::new().element_size_of::<()>();
    }

    #[test]
    #[should_panic]
    fn build_without_element_size_panics() {
        let _pool = ChunkPoolBuilder::new().build();
    }

    #[test]
    fn flag_shortcuts_accumulate() {
        let builder = ChunkPoolBuilder::new()
            .allow_iteration()
            .use_system_allocator();
        assert_eq!(
            builder.flags,
            PoolFlags::ALLOW_ITERATION | PoolFlags::USE_SYSTEM_ALLOCATOR
        );

        // Explicit flags replace whatever was set before.
        let builder = builder.flags(PoolFlags::empty());
        assert_eq!(builder.flags, PoolFlags::empty());
    }

    #[test]
    fn settings_reach_the_pool() {
        let pool = ChunkPoolBuilder::new()
            .element_size(48)
            .initial_elements(7)
            .elements_per_chunk(nz!(3))
            .allow_iteration()
            .build();

        assert_eq!(pool.element_size(), 48);
        assert_eq!(pool.elements_per_chunk(), nz!(3));
        assert_eq!(pool.chunk_count(), 3);
        assert_eq!(pool.flags(), PoolFlags::ALLOW_ITERATION);
        assert!(pool.is_empty());
    }

    #[test]
    fn try_build_succeeds_with_working_backend() {
        let pool = ChunkPoolBuilder::new()
            .element_size(16)
            .use_system_allocator()
            .try_build()
            .unwrap();

        assert_eq!(pool.chunk_count(), 1);
    }
}
