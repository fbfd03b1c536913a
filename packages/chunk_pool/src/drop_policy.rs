/// Determines pool behavior when the pool is dropped while elements are still allocated.
///
/// By default, the pool silently releases all of its memory when it is dropped.
///
/// # Examples
///
/// ```
/// use chunk_pool::{ChunkPool, DropPolicy};
///
/// // The drop policy is set at pool creation time.
/// let pool = ChunkPool::builder()
///     .element_size(32)
///     .drop_policy(DropPolicy::MustNotDropElements)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The pool releases all chunks when dropped, even if elements are still allocated.
    /// Any pointers to those elements become dangling. This is the default.
    #[default]
    MayDropElements,

    /// The pool will panic if it still has allocated elements when it is dropped.
    ///
    /// This may be valuable if pointers to pool elements are stored elsewhere and the owner
    /// wants a loud failure when the pool goes away before those pointers are released.
    MustNotDropElements,
}
