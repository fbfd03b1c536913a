use std::alloc::Layout;

use thiserror::Error;

/// Errors that can occur when a pool obtains memory from its backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The backend could not provide the memory for a new chunk.
    #[error(
        "chunk allocation failed: backend could not provide {} bytes aligned to {}",
        .layout.size(),
        .layout.align()
    )]
    AllocationFailed {
        /// The layout of the chunk that could not be allocated.
        layout: Layout,
    },
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn allocation_failed_describes_layout() {
        let layout = Layout::from_size_align(4096, 8).unwrap();
        let error = Error::AllocationFailed { layout };

        let message = error.to_string();
        assert!(message.contains("4096"));
        assert!(message.contains('8'));
    }

    #[test]
    fn allocation_failed_is_error() {
        let layout = Layout::from_size_align(64, 8).unwrap();
        let result: Result<()> = Err(Error::AllocationFailed { layout });

        assert!(matches!(
            result,
            Err(Error::AllocationFailed { layout: l }) if l == layout
        ));
    }
}
