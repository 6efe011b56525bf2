//! fiberpool: a multi-threaded, work-stealing runtime for stackful,
//! completion-based tasks.
//!
//! Three tightly coupled pieces make up the core:
//!
//! 1. A stackful [`task`] abstraction — per-task heap stacks, CPU
//!    register context switching.
//! 2. A per-worker cooperative [`worker`] scheduler — run-to-yield,
//!    work stealing, I/O-completion draining.
//! 3. A lock-free Chase–Lev [`deque`] used as each worker's ready
//!    queue.
//!
//! The OS completion port and concrete socket transport are out of
//! scope: the crate ships the [`io_engine::IoEngine`] trait plus an
//! in-process [`io_engine::LoopbackIoEngine`] used by its own tests.
//!
//! ```no_run
//! use fiberpool::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::create(RuntimeConfig::new().worker_threads(4)).unwrap();
//! runtime.spawn(|| {
//!     fiberpool::spawn(|| {
//!         println!("child task");
//!     });
//!     fiberpool::yield_now();
//!     println!("parent task resumed");
//! });
//! runtime.run();
//! ```

mod config;
mod cpu_context;
mod current;
mod deque;
mod error;
mod io_engine;
mod runtime;
mod task;
mod worker;

pub use config::RuntimeConfig;
pub use current::{current_task, spawn, yield_now, TaskHandle};
pub use error::RuntimeError;
pub use io_engine::{send_all, CompletionEvent, IoEngine, IoHandle, LoopbackIoEngine, SendProgress};
pub use runtime::Runtime;
