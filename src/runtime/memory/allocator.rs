//! Block-based arena allocator for memory outside the collector
//!
//! # Design Principles
//! - No ownership logic, just raw memory
//! - Individual frees are not supported
//! - Size arithmetic is checked; overflow is reported as out of memory

use core::ptr::NonNull;

use thiserror::Error;
use tracing::debug;

use super::arena::{Arena, ARENA_ALIGN};

/// Memory allocation error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The system allocator could not satisfy the request
    #[error("out of memory: {requested} bytes requested")]
    OutOfMemory { requested: usize },
    /// Growing the heap would exceed its configured limit
    #[error("heap limit exceeded: {requested} bytes requested, limit is {limit}")]
    HeapLimit { requested: usize, limit: usize },
    /// Alignment requirements cannot be satisfied
    #[error("alignment error")]
    AlignmentError,
}

/// Default block size for [`ArenaAllocator`] (64KB).
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Block-based bump allocator for memory outside the collector.
///
/// Allocation bumps a cursor inside the current block and moves on to the
/// next block (adding one if needed) when the current one is full. Requests
/// larger than a block get a dedicated block of exactly their size.
/// Individual frees are not supported: [`reset`](Self::reset) rewinds every
/// block and [`free`](Self::free) releases them all.
#[derive(Debug)]
pub struct ArenaAllocator {
    blocks: Vec<Arena>,
    oversized: Vec<Arena>,
    block_size: usize,
    current: usize,
}

impl ArenaAllocator {
    /// Create an allocator with [`DEFAULT_BLOCK_SIZE`] blocks.
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    /// Create an allocator with a custom block size.
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            oversized: Vec::new(),
            block_size: block_size.max(ARENA_ALIGN),
            current: 0,
        }
    }

    /// Allocate `size` bytes at the default alignment.
    pub fn alloc(
        &mut self,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        self.alloc_aligned(size, ARENA_ALIGN)
    }

    /// Allocate `size` bytes at `align`.
    pub fn alloc_aligned(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(AllocError::AlignmentError);
        }
        let requested = size;
        let size = size.max(1);
        // Worst case padding for the alignment must still fit in one block.
        let padded = size
            .checked_add(align.saturating_sub(ARENA_ALIGN))
            .ok_or(AllocError::OutOfMemory { requested })?;
        if padded > self.block_size {
            return self.alloc_oversized(size, align);
        }

        while self.current < self.blocks.len() {
            if let Some(ptr) = self.blocks[self.current].alloc_aligned(size, align) {
                return Ok(ptr);
            }
            self.current += 1;
        }

        let mut block = Arena::new(self.block_size)?;
        let ptr = block
            .alloc_aligned(size, align)
            .ok_or(AllocError::OutOfMemory { requested: size })?;
        self.blocks.push(block);
        self.current = self.blocks.len() - 1;
        debug!(
            blocks = self.blocks.len(),
            block_size = self.block_size,
            "arena allocator grew"
        );
        Ok(ptr)
    }

    fn alloc_oversized(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // A rewound dedicated block is reused when it can hold the request.
        for block in self.oversized.iter_mut().filter(|b| b.used() == 0) {
            if let Some(ptr) = block.alloc_aligned(size, align) {
                return Ok(ptr);
            }
        }
        let capacity = size
            .checked_add(align.saturating_sub(ARENA_ALIGN))
            .ok_or(AllocError::OutOfMemory { requested: size })?;
        let mut block = Arena::new(capacity)?;
        let ptr = block
            .alloc_aligned(size, align)
            .ok_or(AllocError::OutOfMemory { requested: size })?;
        debug!(size, "dedicated block for oversized request");
        self.oversized.push(block);
        Ok(ptr)
    }

    /// Rewind every block without releasing memory.
    pub fn reset(&mut self) {
        for block in self.blocks.iter_mut().chain(self.oversized.iter_mut()) {
            block.reset();
        }
        self.current = 0;
    }

    /// Release all blocks.
    pub fn free(&mut self) {
        self.blocks.clear();
        self.oversized.clear();
        self.current = 0;
    }

    /// Total bytes reserved across all blocks.
    pub fn size(&self) -> usize {
        self.blocks
            .iter()
            .chain(self.oversized.iter())
            .map(Arena::capacity)
            .sum()
    }

    /// Bytes handed out since the last reset, including alignment padding.
    pub fn used(&self) -> usize {
        self.blocks
            .iter()
            .chain(self.oversized.iter())
            .map(Arena::used)
            .sum()
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len() + self.oversized.len()
    }
}

impl Default for ArenaAllocator {
    fn default() -> Self {
        Self::new()
    }
}
