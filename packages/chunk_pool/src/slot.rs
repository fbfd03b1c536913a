use std::mem;
use std::ptr::{self, NonNull};

/// Tag stored in the leading bytes of every free slot of a pool that allows iteration.
pub(crate) const FREE_TAG: u32 = u32::from_le_bytes(*b"free");

/// Tag written over [`FREE_TAG`] when a slot is handed out to a caller.
pub(crate) const IN_USE_TAG: u32 = 0x7FFF_FFFF;

/// Memory layout of the free-list node that overlays the start of every free slot.
///
/// The node is never materialized as a value. Element sizes are arbitrary, so slots are not
/// guaranteed to be aligned for this type and all field access goes through [`Slot`] with
/// unaligned reads and writes.
#[repr(C)]
#[allow(
    dead_code,
    reason = "only used to describe the memory layout of a free slot"
)]
pub(crate) struct FreeNode {
    next: *mut u8,
    tag: u32,
}

/// Number of bytes at the start of a slot that the free list may overwrite.
pub(crate) const FREE_NODE_SIZE: usize = size_of::<FreeNode>();

const TAG_OFFSET: usize = mem::offset_of!(FreeNode, tag);

/// A pointer to the start of one element-sized slot inside a chunk.
///
/// Accessors that touch the free-list node are `unsafe` because the slot carries no proof that
/// the memory behind it is still owned by a pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Slot(NonNull<u8>);

impl Slot {
    #[must_use]
    pub(crate) fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    #[must_use]
    pub(crate) fn ptr(self) -> NonNull<u8> {
        self.0
    }

    /// Reads the free-list link stored in this slot.
    ///
    /// # Safety
    ///
    /// The slot must point to at least [`FREE_NODE_SIZE`] initialized bytes owned by a pool.
    #[must_use]
    pub(crate) unsafe fn next(self) -> Option<Self> {
        // SAFETY: Forwarding the caller's guarantee that the leading bytes are valid for reads.
        let next = unsafe { self.0.as_ptr().cast::<*mut u8>().read_unaligned() };

        NonNull::new(next).map(Self)
    }

    /// Writes the free-list link stored in this slot.
    ///
    /// # Safety
    ///
    /// The slot must point to at least [`FREE_NODE_SIZE`] bytes owned by a pool and not
    /// currently handed out to a caller.
    pub(crate) unsafe fn set_next(self, next: Option<Self>) {
        let next = next.map_or(ptr::null_mut(), |slot| slot.0.as_ptr());

        // SAFETY: Forwarding the caller's guarantee that the leading bytes are valid for writes.
        unsafe {
            self.0.as_ptr().cast::<*mut u8>().write_unaligned(next);
        }
    }

    /// Reads the free/in-use tag stored in this slot.
    ///
    /// # Safety
    ///
    /// The slot must point to at least [`FREE_NODE_SIZE`] initialized bytes owned by a pool.
    #[must_use]
    pub(crate) unsafe fn tag(self) -> u32 {
        // SAFETY: TAG_OFFSET is within FREE_NODE_SIZE and the caller guarantees those bytes
        // are valid for reads.
        unsafe {
            self.0
                .as_ptr()
                .add(TAG_OFFSET)
                .cast::<u32>()
                .read_unaligned()
        }
    }

    /// Writes the free/in-use tag stored in this slot.
    ///
    /// # Safety
    ///
    /// The slot must point to at least [`FREE_NODE_SIZE`] bytes owned by a pool.
    pub(crate) unsafe fn set_tag(self, tag: u32) {
        // SAFETY: TAG_OFFSET is within FREE_NODE_SIZE and the caller guarantees those bytes
        // are valid for writes.
        unsafe {
            self.0
                .as_ptr()
                .add(TAG_OFFSET)
                .cast::<u32>()
                .write_unaligned(tag);
        }
    }

    /// Whether the slot is tagged as free. Only meaningful in pools that allow iteration.
    ///
    /// # Safety
    ///
    /// Same as [`tag()`](Self::tag).
    #[must_use]
    pub(crate) unsafe fn is_tagged_free(self) -> bool {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe { self.tag() == FREE_TAG }
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_distinct() {
        assert_ne!(FREE_TAG, IN_USE_TAG);
        assert_eq!(FREE_TAG.to_le_bytes(), *b"free");
    }

    #[test]
    fn node_fits_in_minimum_element() {
        assert!(FREE_NODE_SIZE <= 2 * size_of::<usize>());
        assert!(TAG_OFFSET + size_of::<u32>() <= FREE_NODE_SIZE);
    }

    #[test]
    fn link_round_trips() {
        let mut buffer = [0_u8; 64];
        let base = NonNull::from(&mut buffer).cast::<u8>();
        let first = Slot::new(base);
        let second = Slot::new(unsafe { base.add(32) });

        unsafe {
            first.set_next(Some(second));
            second.set_next(None);

            assert_eq!(first.next(), Some(second));
            assert_eq!(second.next(), None);
        }
    }

    #[test]
    fn unaligned_slot_is_supported() {
        let mut buffer = [0_u8; 64];
        let base = NonNull::from(&mut buffer).cast::<u8>();
        let odd = Slot::new(unsafe { base.add(3) });
        let other = Slot::new(unsafe { base.add(29) });

        unsafe {
            odd.set_next(Some(other));
            odd.set_tag(FREE_TAG);

            assert_eq!(odd.next(), Some(other));
            assert!(odd.is_tagged_free());

            odd.set_tag(IN_USE_TAG);
            assert!(!odd.is_tagged_free());
            assert_eq!(odd.tag(), IN_USE_TAG);
        }
    }

    #[test]
    fn tag_does_not_overwrite_link() {
        let mut buffer = [0_u8; 32];
        let base = NonNull::from(&mut buffer).cast::<u8>();
        let slot = Slot::new(base);
        let target = Slot::new(unsafe { base.add(16) });

        unsafe {
            slot.set_next(Some(target));
            slot.set_tag(FREE_TAG);
            assert_eq!(slot.next(), Some(target));
        }
    }
}
