//! Runtime system
//!
//! Memory management (a tri-color garbage collector and a non-GC arena
//! allocator) and the concurrency primitives built on OS threads: channels,
//! actors, cancellation, tasks with an event loop, a deadline scheduler and
//! coroutines.

pub mod actor;
pub mod cancel;
pub mod channel;
pub mod coroutine;
pub mod errors;
pub mod event_loop;
pub mod gc;
pub mod memory;
pub mod scheduler;
