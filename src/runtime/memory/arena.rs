//! Fixed-capacity bump arenas
//!
//! An [`Arena`] reserves one contiguous block from the global allocator and
//! hands out pieces of it by advancing a cursor. Pieces are never returned
//! individually; the whole block goes back when the arena is dropped.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use tracing::trace;

use super::allocator::AllocError;

/// Alignment of every arena block and of every default allocation.
pub const ARENA_ALIGN: usize = 16;

/// Round `size` up to the next multiple of `align` (a power of two).
///
/// `None` when the rounded size does not fit in `usize`.
#[inline]
pub const fn align_up(
    size: usize,
    align: usize,
) -> Option<usize> {
    match size.checked_add(align - 1) {
        Some(padded) => Some(padded & !(align - 1)),
        None => None,
    }
}

/// A contiguous region carved out by a monotonically advancing cursor.
#[derive(Debug)]
pub struct Arena {
    start: NonNull<u8>,
    capacity: usize,
    offset: usize,
}

// SAFETY: the arena exclusively owns its block; mutation requires `&mut self`.
unsafe impl Send for Arena {}
// SAFETY: shared access only reads the immutable bounds.
unsafe impl Sync for Arena {}

impl Arena {
    /// Reserve a zeroed block of `capacity` bytes (rounded up to [`ARENA_ALIGN`]).
    pub fn new(capacity: usize) -> Result<Self, AllocError> {
        let requested = capacity;
        let capacity = align_up(capacity.max(1), ARENA_ALIGN)
            .ok_or(AllocError::OutOfMemory { requested })?;
        let layout =
            Layout::from_size_align(capacity, ARENA_ALIGN).map_err(|_| AllocError::OutOfMemory { requested })?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let start = NonNull::new(raw).ok_or(AllocError::OutOfMemory {
            requested: capacity,
        })?;
        trace!(capacity, "arena reserved");
        Ok(Self {
            start,
            capacity,
            offset: 0,
        })
    }

    /// Bump-allocate `size` bytes at [`ARENA_ALIGN`].
    #[inline]
    pub fn alloc(
        &mut self,
        size: usize,
    ) -> Option<NonNull<u8>> {
        self.alloc_aligned(size, ARENA_ALIGN)
    }

    /// Bump-allocate `size` bytes at `align` (a power of two).
    ///
    /// Returns `None` when the remaining space cannot hold the request.
    pub fn alloc_aligned(
        &mut self,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let base = self.start.as_ptr() as usize;
        let aligned = align_up(base.checked_add(self.offset)?, align)? - base;
        let end = aligned.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        self.offset = end;
        // SAFETY: `aligned < capacity`, so the pointer stays inside the block.
        Some(unsafe { NonNull::new_unchecked(self.start.as_ptr().add(aligned)) })
    }

    /// Whether `ptr` points into this arena's block.
    #[inline]
    pub fn contains(
        &self,
        ptr: *const u8,
    ) -> bool {
        let base = self.start.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.capacity
    }

    /// Rewind the cursor to the start and zero the block.
    pub fn reset(&mut self) {
        // SAFETY: the block is `capacity` bytes long and exclusively owned.
        unsafe { std::ptr::write_bytes(self.start.as_ptr(), 0, self.offset) };
        self.offset = 0;
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.offset
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: the same layout was used for the allocation in `new`.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.capacity, ARENA_ALIGN);
            alloc::dealloc(self.start.as_ptr(), layout);
        }
    }
}
