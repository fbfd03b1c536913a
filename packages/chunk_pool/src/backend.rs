use std::alloc::{self, GlobalAlloc, Layout, System};
use std::ptr::NonNull;

use crate::PoolFlags;

/// A source of raw memory for pool chunks.
///
/// The pool only ever asks its allocator for whole chunks; individual elements are carved out
/// of those chunks without involving the allocator.
///
/// # Examples
///
/// ```
/// use std::alloc::{Layout, System, GlobalAlloc};
/// use std::cell::Cell;
/// use std::ptr::NonNull;
///
/// use chunk_pool::{ChunkAllocator, ChunkPool};
///
/// #[derive(Default)]
/// struct CountingAllocator {
///     chunks: Cell<usize>,
/// }
///
/// impl ChunkAllocator for CountingAllocator {
///     fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
///         self.chunks.set(self.chunks.get() + 1);
///         // SAFETY: The pool never requests zero-sized chunks.
///         NonNull::new(unsafe { System.alloc(layout) })
///     }
///
///     unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
///         self.chunks.set(self.chunks.get() - 1);
///         // SAFETY: Forwarding the caller's guarantee that this memory came from `allocate()`.
///         unsafe { System.dealloc(ptr.as_ptr(), layout) };
///     }
/// }
///
/// let allocator = CountingAllocator::default();
/// let pool = ChunkPool::builder().element_size(16).build_in(&allocator);
///
/// assert_eq!(allocator.chunks.get(), 1);
/// drop(pool);
/// assert_eq!(allocator.chunks.get(), 0);
/// ```
pub trait ChunkAllocator {
    /// Allocates a block of memory described by `layout`, returning `None` if the memory
    /// cannot be provided.
    ///
    /// The pool never requests zero-sized blocks.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns a block of memory to the allocator.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `ptr` was returned by [`allocate()`](Self::allocate) on
    /// this allocator with the same `layout` and has not been deallocated since.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

impl<A: ChunkAllocator + ?Sized> ChunkAllocator for &A {
    #[inline]
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe { (**self).deallocate(ptr, layout) }
    }
}

/// The built-in chunk allocators, selected via [`PoolFlags::USE_SYSTEM_ALLOCATOR`].
///
/// The choice has no effect on pool semantics; it only decides where chunk memory comes from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum Backend {
    /// The Rust global allocator (`#[global_allocator]`). This is the default.
    #[default]
    Global,

    /// The operating system allocator, [`std::alloc::System`], bypassing any custom
    /// global allocator registered by the application.
    System,
}

impl Backend {
    /// Selects the backend requested by a set of pool flags.
    ///
    /// # Examples
    ///
    /// ```
    /// use chunk_pool::{Backend, PoolFlags};
    ///
    /// assert_eq!(Backend::from_flags(PoolFlags::empty()), Backend::Global);
    /// assert_eq!(
    ///     Backend::from_flags(PoolFlags::USE_SYSTEM_ALLOCATOR),
    ///     Backend::System
    /// );
    /// ```
    #[must_use]
    pub fn from_flags(flags: PoolFlags) -> Self {
        if flags.contains(PoolFlags::USE_SYSTEM_ALLOCATOR) {
            Self::System
        } else {
            Self::Global
        }
    }
}

impl ChunkAllocator for Backend {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        assert!(
            layout.size() > 0,
            "chunk allocators cannot provide zero-sized blocks"
        );

        let ptr = match self {
            // SAFETY: We asserted above that the layout is not zero-sized.
            Self::Global => unsafe { alloc::alloc(layout) },
            // SAFETY: We asserted above that the layout is not zero-sized.
            Self::System => unsafe { System.alloc(layout) },
        };

        NonNull::new(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        match self {
            // SAFETY: The caller guarantees that the block came from `allocate()` on this
            // backend with the same layout, which used the global allocator.
            Self::Global => unsafe { alloc::dealloc(ptr.as_ptr(), layout) },
            // SAFETY: The caller guarantees that the block came from `allocate()` on this
            // backend with the same layout, which used the system allocator.
            Self::System => unsafe { System.dealloc(ptr.as_ptr(), layout) },
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Backend: Send, Sync, Copy, std::fmt::Debug);

    #[test]
    fn from_flags_selects_backend() {
        assert_eq!(Backend::from_flags(PoolFlags::empty()), Backend::Global);
        assert_eq!(
            Backend::from_flags(PoolFlags::ALLOW_ITERATION),
            Backend::Global
        );
        assert_eq!(
            Backend::from_flags(PoolFlags::USE_SYSTEM_ALLOCATOR | PoolFlags::ALLOW_ITERATION),
            Backend::System
        );
    }

    #[test]
    fn both_backends_round_trip() {
        let layout = Layout::from_size_align(256, 8).unwrap();

        for backend in [Backend::Global, Backend::System] {
            let ptr = backend.allocate(layout).unwrap();
            assert_eq!(ptr.as_ptr().addr() % layout.align(), 0);

            unsafe {
                ptr.as_ptr().write_bytes(0xAB, layout.size());
                assert_eq!(ptr.as_ptr().add(255).read(), 0xAB);
                backend.deallocate(ptr, layout);
            }
        }
    }

    #[test]
    fn reference_forwards_to_backend() {
        let layout = Layout::from_size_align(64, 8).unwrap();
        let backend = Backend::System;
        let by_ref = &backend;

        let ptr = by_ref.allocate(layout).unwrap();
        unsafe { by_ref.deallocate(ptr, layout) };
    }

    #[test]
    #[should_panic]
    fn zero_sized_allocation_panics() {
        let layout = Layout::from_size_align(0, 1).unwrap();
        _ = Backend::Global.allocate(layout);
    }
}
