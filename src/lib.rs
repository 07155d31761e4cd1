//! skyrt runtime
//!
//! Concurrency and memory runtime for a managed language: a concurrent
//! tri-color garbage collector over arenas, bump allocation, channels with
//! `select`, actors, cancellation trees, tasks with an event loop, a
//! deadline scheduler and generator-style coroutines.
//!
//! # Example
//!
//! ```no_run
//! use skyrt::runtime::event_loop::spawn;
//!
//! let answer = spawn(|_token| Ok(6 * 7));
//! assert_eq!(answer.await_result(), Ok(42));
//! ```

#![doc(html_root_url = "https://docs.rs/skyrt")]
#![warn(rust_2018_idioms)]

// Public modules
pub mod runtime;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

pub use runtime::actor::Actor;
pub use runtime::cancel::{CancellationToken, TaskTree};
pub use runtime::channel::{Channel, Select};
pub use runtime::coroutine::{Coroutine, Yielder};
pub use runtime::errors::{ChannelError, TaskError, TaskResult};
pub use runtime::event_loop::{EventLoop, EventLoopConfig, Future, Promise, Timer};
pub use runtime::gc::{GCConfig, GCOptimizer, GarbageCollector, TypeInfo};
pub use runtime::memory::{Arena, ArenaAllocator};
pub use runtime::scheduler::{Scheduler, SchedulerConfig, Task, TaskId, TaskState};
pub use util::config::RuntimeConfig;

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runtime name
pub const NAME: &str = "skyrt";
