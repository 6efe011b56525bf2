//! The `IoEngine` abstraction and the in-process engine used by this
//! crate's own tests.
//!
//! The real target here is an OS completion port (IOCP, io_uring, an
//! epoll reactor...); that binding is explicitly out of scope. What's
//! specified is the seam a worker needs: register a handle, block
//! waiting for a batch of completions, get an opaque `context` pointer
//! back per event.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::RuntimeError;

/// An opaque OS handle. The crate never interprets this value; it
/// only ever threads it through to [`IoEngine::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoHandle(pub i64);

/// One completed (or failed) I/O operation.
#[derive(Debug, Clone, Copy)]
pub struct CompletionEvent {
    /// The context previously associated with the completed handle —
    /// always a task pointer, smuggled through as `usize`, in this
    /// runtime.
    pub context: usize,
    /// Operation-specific result code. Negative values are reserved
    /// for OS-style errors; callers interpret this themselves, the
    /// drain loop never inspects it.
    pub result: i64,
}

/// Maximum number of events a single [`IoEngine::wait`] call returns.
pub const MAX_EVENTS_PER_WAIT: usize = 64;

/// Per-worker completion port.
///
/// Implementations must be internally thread-safe for concurrent
/// `register` from different workers (in practice a real backend is
/// per-worker, so this rarely matters, but `share()` makes cross-use
/// possible).
pub trait IoEngine: Send + Sync {
    /// Bind `handle` so that its completion arrives with `context`
    /// echoed back. One-shot: this runtime never re-registers a
    /// handle that's already pending.
    fn register(&self, handle: IoHandle, context: usize) -> Result<(), RuntimeError>;

    /// Block up to `timeout` waiting for completions. Returns an empty
    /// vec on timeout. Never returns more than [`MAX_EVENTS_PER_WAIT`]
    /// events in one call.
    fn wait(&self, timeout: Duration) -> Vec<CompletionEvent>;

    /// Return a sibling engine. Under an OS with one completion port
    /// per machine this would share it; under a per-worker-port OS it
    /// creates an independent one. This crate's own engine always
    /// returns an independent one — it has no real port to multiplex.
    fn share(&self) -> Result<Box<dyn IoEngine>, RuntimeError>;
}

/// An in-process stand-in for a real completion port, driven entirely
/// by calls to [`LoopbackIoEngine::complete`] rather than actual OS
/// I/O. Backs this crate's own integration tests and demonstrates the
/// `IoEngine` contract for callers wiring up a real transport.
pub struct LoopbackIoEngine {
    state: Mutex<VecDeque<CompletionEvent>>,
    ready: Condvar,
}

impl LoopbackIoEngine {
    pub fn create() -> Result<LoopbackIoEngine, RuntimeError> {
        Ok(LoopbackIoEngine {
            state: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        })
    }

    /// Deliver a completion for `context` with the given result code.
    /// Simulates what a real backend would do when the OS reports an
    /// operation finished.
    pub fn complete(&self, context: usize, result: i64) {
        let mut queue = self.state.lock().unwrap();
        queue.push_back(CompletionEvent { context, result });
        self.ready.notify_all();
    }
}

impl IoEngine for LoopbackIoEngine {
    fn register(&self, _handle: IoHandle, _context: usize) -> Result<(), RuntimeError> {
        // Nothing to bind to an OS object; completions are injected
        // directly via `complete`.
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> Vec<CompletionEvent> {
        let mut queue = self.state.lock().unwrap();
        if queue.is_empty() {
            let (guard, _timed_out) = self.ready.wait_timeout(queue, timeout).unwrap();
            queue = guard;
        }
        let n = queue.len().min(MAX_EVENTS_PER_WAIT);
        queue.drain(..n).collect()
    }

    fn share(&self) -> Result<Box<dyn IoEngine>, RuntimeError> {
        Ok(Box::new(LoopbackIoEngine::create()?))
    }
}

/// Outcome of one attempt to push bytes into a transport.
pub enum SendProgress {
    /// `n` bytes were accepted synchronously.
    Sent(usize),
    /// The transport can't accept more right now; the caller has
    /// already submitted the async request and registered it.
    WouldBlock,
    /// The remote end closed the connection.
    Closed,
}

/// Drive a send-like operation to completion, parking the current
/// task on I/O between attempts that would block. The concrete
/// transport stays out of scope, so this operates over a
/// caller-supplied `attempt` closure rather than a real socket type.
///
/// # Panics
/// Panics if called outside any task.
pub fn send_all<F>(total_len: usize, mut attempt: F) -> Result<(), RuntimeError>
where
    F: FnMut() -> SendProgress,
{
    let mut sent = 0usize;
    while sent < total_len {
        match attempt() {
            SendProgress::Sent(n) => sent += n,
            SendProgress::WouldBlock => {
                let task = crate::current::current_task()
                    .expect("send_all called outside a task");
                unsafe { task.block_on_io() };
            }
            SendProgress::Closed => return Err(RuntimeError::ConnectionReset),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_times_out_with_no_completions() {
        let engine = LoopbackIoEngine::create().unwrap();
        let events = engine.wait(Duration::from_millis(10));
        assert!(events.is_empty());
    }

    #[test]
    fn completed_event_is_returned_by_wait() {
        let engine = LoopbackIoEngine::create().unwrap();
        engine.complete(0xdead_beef, 13);
        let events = engine.wait(Duration::from_millis(100));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].context, 0xdead_beef);
        assert_eq!(events[0].result, 13);
    }

    #[test]
    fn shared_engine_is_independent() {
        let engine = LoopbackIoEngine::create().unwrap();
        let sibling = engine.share().unwrap();
        engine.complete(1, 0);
        assert!(sibling.wait(Duration::from_millis(10)).is_empty());
    }
}
