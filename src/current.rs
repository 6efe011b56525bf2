//! Free-function surface for code running inside a task: `yield_now`,
//! `spawn`, and `current_task`. All three locate their caller through
//! the worker's thread-local current-task anchor rather than threading
//! a context argument everywhere.

use crate::error::RuntimeError;
use crate::io_engine::IoHandle;
use crate::task::Task;
use crate::worker::current_task_ptr;

/// A handle to the task currently executing on this OS thread,
/// returned by [`current_task`]. Used by I/O integration code to
/// register a handle and park until its completion arrives.
#[derive(Clone, Copy)]
pub struct TaskHandle(pub(crate) *mut Task);

unsafe impl Send for TaskHandle {}

impl TaskHandle {
    /// One-shot association of `handle` with the current worker's
    /// `IoEngine`, using this task as the completion context.
    ///
    /// # Safety
    /// Must only be called on the handle for the task that is
    /// currently running (i.e. the one returned by `current_task`). A
    /// `TaskHandle` retained past its task's `finalize()` points at a
    /// `Task` record the free-list may have already handed out again.
    pub unsafe fn register_io(&self, handle: IoHandle) -> Result<(), RuntimeError> {
        unsafe { (*self.0).register_io(handle) }
    }

    /// Park this task until its registered I/O completes. The caller
    /// must have already called `register_io` for the operation this
    /// block is waiting on — nothing else re-enqueues the task, the
    /// scheduler's completion drain does.
    ///
    /// # Safety
    /// Must only be called on the handle for the task that is
    /// currently running (i.e. the one returned by `current_task`).
    pub unsafe fn block_on_io(&self) {
        unsafe { (*self.0).block_on_io() }
    }

    /// Result code delivered by the most recently drained completion
    /// for this task.
    ///
    /// # Safety
    /// Must only be called on the handle for the task that is
    /// currently running (i.e. the one returned by `current_task`). A
    /// `TaskHandle` retained past its task's `finalize()` points at a
    /// `Task` record the free-list may have already handed out again.
    pub unsafe fn io_result(&self) -> i64 {
        unsafe { (*self.0).io_result }
    }

    /// The value this task registers itself under with the
    /// `IoEngine`. Needed by callers that hand off the actual
    /// completion delivery to something outside the task itself (a
    /// backend thread, a different task) and must tell it which
    /// context to report back.
    ///
    /// # Safety
    /// Must only be called on the handle for the task that is
    /// currently running (i.e. the one returned by `current_task`). A
    /// `TaskHandle` retained past its task's `finalize()` points at a
    /// `Task` record the free-list may have already handed out again.
    pub unsafe fn io_context(&self) -> usize {
        unsafe { (*self.0).io_context() }
    }
}

/// Returns a handle to the task currently executing on this OS
/// thread, or `None` if called outside any task.
pub fn current_task() -> Option<TaskHandle> {
    let p = current_task_ptr();
    if p.is_null() {
        None
    } else {
        Some(TaskHandle(p))
    }
}

/// Cooperatively yield back to the scheduler. The owning worker's
/// ready deque drains LIFO: this task resumes ahead of any work that
/// was already queued before this call, and behind any work queued
/// after it until that in turn yields.
///
/// # Panics
/// Panics if called outside any task.
pub fn yield_now() {
    let p = current_task_ptr();
    assert!(!p.is_null(), "yield_now() called outside a task");
    unsafe { (*p).yield_now() }
}

/// Schedule a new task. If called from inside a running task, the new
/// task is spawned on that task's own worker (locality dominates —
/// explicit balancing is the scheduler's job via stealing). If called
/// from outside any task, use [`crate::runtime::Runtime::spawn`]
/// instead.
///
/// # Panics
/// Panics if called outside any task.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let p = current_task_ptr();
    assert!(
        !p.is_null(),
        "spawn() called outside a task; use Runtime::spawn"
    );
    unsafe {
        let owner = (*p).owner;
        debug_assert!(!owner.is_null());
        (*owner).spawn_from_within(f);
    }
}
