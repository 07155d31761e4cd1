//! Raw memory for the runtime
//!
//! Two layers live here:
//! - [`Arena`]: one fixed-capacity block carved by a bump cursor. The garbage
//!   collector grows its heap one arena at a time.
//! - [`ArenaAllocator`]: a growable list of arenas for memory the collector
//!   does not manage, released wholesale by `reset` or `free`.

mod allocator;
mod arena;

pub use allocator::{AllocError, ArenaAllocator, DEFAULT_BLOCK_SIZE};
pub use arena::{align_up, Arena, ARENA_ALIGN};
