use bitflags::bitflags;

bitflags! {
    /// Behavior flags fixed at pool creation.
    ///
    /// # Examples
    ///
    /// ```
    /// use chunk_pool::{ChunkPool, PoolFlags};
    ///
    /// let pool = ChunkPool::builder()
    ///     .element_size(24)
    ///     .flags(PoolFlags::ALLOW_ITERATION | PoolFlags::USE_SYSTEM_ALLOCATOR)
    ///     .build();
    ///
    /// assert!(pool.flags().contains(PoolFlags::ALLOW_ITERATION));
    /// ```
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct PoolFlags: u32 {
        /// Tags every free element so the pool can tell free and live elements apart.
        ///
        /// Required by [`iter()`][crate::ChunkPool::iter], [`find()`][crate::ChunkPool::find]
        /// and the export methods. Also enables double-free detection in debug builds.
        const ALLOW_ITERATION = 0b0000_0001;

        /// Obtains chunk memory from [`std::alloc::System`] instead of the Rust global allocator.
        ///
        /// Ignored when the pool is built with a custom [`ChunkAllocator`][crate::ChunkAllocator].
        const USE_SYSTEM_ALLOCATOR = 0b0000_0010;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_empty() {
        assert!(PoolFlags::default().is_empty());
    }

    #[test]
    fn flags_are_distinct() {
        let both = PoolFlags::ALLOW_ITERATION | PoolFlags::USE_SYSTEM_ALLOCATOR;

        assert!(both.contains(PoolFlags::ALLOW_ITERATION));
        assert!(both.contains(PoolFlags::USE_SYSTEM_ALLOCATOR));
        assert_ne!(PoolFlags::ALLOW_ITERATION, PoolFlags::USE_SYSTEM_ALLOCATOR);
    }
}
