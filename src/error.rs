//! Crate error type.

use thiserror::Error;

/// Errors surfaced across the public API.
///
/// Task allocation and deque growth failures are deliberately *not*
/// represented here: both are treated as fatal (a runtime cannot
/// meaningfully continue without a task record or a functioning ready
/// queue) and assert-and-crash rather than return a `Result`.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Failed to create an [`crate::io_engine::IoEngine`] (or a sibling
    /// via `share`).
    #[error("failed to create I/O engine: {0}")]
    IoEngineCreate(#[source] std::io::Error),

    /// Failed to register a handle with an [`crate::io_engine::IoEngine`].
    #[error("failed to register I/O handle: {0}")]
    IoEngineRegister(#[source] std::io::Error),

    /// Failed to spawn the OS thread backing a worker.
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// The remote endpoint closed the connection mid-transfer.
    #[error("connection reset while sending")]
    ConnectionReset,
}
