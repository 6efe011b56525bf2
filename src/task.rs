//! The task: an owned stack, saved register context, and an embedded
//! user closure.
//!
//! Tasks are allocated once and then live in exactly one of {a
//! worker's ready deque, the I/O-parked set, a worker's free-list,
//! currently running} for as long as the runtime is up — the
//! underlying `Task` record and its stack are recycled through the
//! free-list rather than freed.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::thread;

use crate::cpu_context::{self, CpuContext};
use crate::error::RuntimeError;
use crate::io_engine::IoHandle;
use crate::worker::Worker;

/// Each task gets a dedicated 32 KiB stack. The top of it doubles as
/// storage for the embedded closure.
pub const STACK_SIZE: usize = 32 * 1024;

/// Upper bound on how much of the stack a spawned closure may occupy.
/// Leaves headroom below the closure for the task's actual call
/// stack plus the trampoline's two bootstrap slots.
const CLOSURE_BUDGET: usize = STACK_SIZE / 4;

struct ClosureVTable {
    call: unsafe fn(*mut ()),
    drop: unsafe fn(*mut ()),
}

fn vtable_for<F: FnOnce() + 'static>() -> &'static ClosureVTable {
    unsafe fn call_impl<F: FnOnce()>(ptr: *mut ()) {
        let f = unsafe { ptr::read(ptr as *mut F) };
        f();
    }
    unsafe fn drop_impl<F>(ptr: *mut ()) {
        unsafe { ptr::drop_in_place(ptr as *mut F) };
    }
    // Monomorphized once per `F`; equivalent to a per-type static
    // vtable instance without needing a `const fn` trait object.
    static VTABLE: ClosureVTable = ClosureVTable {
        call: call_impl::<F>,
        drop: drop_impl::<F>,
    };
    &VTABLE
}

/// A lightweight, stackful unit of execution.
pub struct Task {
    pub(crate) context: CpuContext,
    stack: Box<[u8]>,
    closure_addr: *mut (),
    vtable: Option<&'static ClosureVTable>,
    /// Back-reference to the worker currently responsible for this
    /// task. Non-owning; may change across steals.
    pub(crate) owner: *mut Worker,
    /// Intrusive singly-linked free-list pointer.
    pub(crate) next: *mut Task,
    /// Result of the most recently completed I/O operation this task
    /// registered, read by the task after waking from `block_on_io`.
    pub(crate) io_result: i64,
}

// A Task may be stolen onto another worker's thread; its closure is
// bounded `Send` at `set()` time, so moving the whole record is sound.
unsafe impl Send for Task {}

impl Task {
    pub(crate) fn new() -> Box<Task> {
        Box::new(Task {
            context: CpuContext::default(),
            stack: vec![0u8; STACK_SIZE].into_boxed_slice(),
            closure_addr: ptr::null_mut(),
            vtable: None,
            owner: ptr::null_mut(),
            next: ptr::null_mut(),
            io_result: 0,
        })
    }

    fn reset(&mut self) {
        if let Some(vt) = self.vtable.take() {
            unsafe { (vt.drop)(self.closure_addr) };
        }
        self.closure_addr = ptr::null_mut();
        self.io_result = 0;
    }

    /// Placement-construct `f` at the high end of the task's stack and
    /// point `context` at the trampoline.
    ///
    /// # Safety
    /// Must only be called on a task that is not currently running
    /// and not reachable from any other worker.
    ///
    /// Rejected at compile time, not just by a runtime check, when `F`
    /// doesn't fit the task's closure budget — see
    /// [`crate::runtime::Runtime::spawn`]'s doc example.
    pub(crate) unsafe fn set<F: FnOnce() + Send + 'static>(&mut self, f: F) {
        self.reset();

        const {
            assert!(
                mem::size_of::<F>() <= CLOSURE_BUDGET,
                "closure exceeds the task stack's closure budget"
            );
        }
        let size = mem::size_of::<F>();
        let align = mem::align_of::<F>().max(1);

        let high = self.stack.as_ptr() as usize + STACK_SIZE;
        let mut addr = high - size;
        addr &= !(align - 1);
        debug_assert!(addr >= self.stack.as_ptr() as usize);

        self.closure_addr = addr as *mut ();
        self.vtable = Some(vtable_for::<F>());
        unsafe { ptr::write(addr as *mut F, f) };

        let task_ptr = self as *mut Task;
        self.context = unsafe { cpu_context::init_context(task_ptr, addr) };
    }

    /// Run the embedded closure to completion, catching any panic
    /// instead of letting it unwind. Called exactly once, from
    /// [`task_main`].
    ///
    /// This catch is load-bearing, not just tidy error handling: an
    /// uncaught panic would unwind out of this `extern "C"` frame and
    /// through `context_swap`'s `#[unsafe(naked)]` frame on its way
    /// back to the worker, which has no unwind info to walk — that's
    /// undefined behavior, not a contained error.
    fn call(&mut self) -> thread::Result<()> {
        let vt = self.vtable.take().expect("task run with no closure set");
        let closure_addr = self.closure_addr;
        panic::catch_unwind(AssertUnwindSafe(|| unsafe { (vt.call)(closure_addr) }))
    }

    /// Cooperative yield: push `self` onto the current worker's ready
    /// deque and swap back to the scheduler.
    pub(crate) unsafe fn yield_now(&mut self) {
        let owner = self.owner;
        debug_assert!(!owner.is_null());
        unsafe { (*owner).requeue(self as *mut Task) };
        let main = unsafe { (*owner).main_context() };
        unsafe { cpu_context::context_swap(&mut self.context, main) };
    }

    /// Record this task as I/O-parked and swap back to the scheduler.
    /// The task's pointer must already be installed as the completion
    /// context for the pending operation — nothing else re-enqueues
    /// it, the completion drain does.
    pub(crate) unsafe fn block_on_io(&mut self) {
        let owner = self.owner;
        debug_assert!(!owner.is_null());
        unsafe { (*owner).mark_io_blocked() };
        let main = unsafe { (*owner).main_context() };
        unsafe { cpu_context::context_swap(&mut self.context, main) };
    }

    /// One-shot association of `handle` with the current worker's
    /// `IoEngine`, using this task's pointer as the completion
    /// context.
    pub(crate) fn register_io(&mut self, handle: IoHandle) -> Result<(), RuntimeError> {
        let owner = unsafe { &*self.owner };
        owner.io().register(handle, self.io_context())
    }

    /// The value this task registers itself under with the
    /// `IoEngine` — stable for the task's lifetime, usable by the
    /// caller to correlate a completion delivered from outside the
    /// task (e.g. from a backend thread) back to this task.
    pub(crate) fn io_context(&mut self) -> usize {
        self as *mut Task as usize
    }

    /// Destroy the closure, hand the task back to the worker's
    /// free-list (stack retained), then jump to the worker's main
    /// context. This task's own stack is never reached again.
    unsafe fn finalize(&mut self) -> ! {
        self.reset();
        let owner = self.owner;
        debug_assert!(!owner.is_null());
        self.owner = ptr::null_mut();
        unsafe { (*owner).reclaim(self as *mut Task) };
        let main = unsafe { (*owner).main_context() };
        unsafe { cpu_context::context_switch(main) }
    }
}

/// The first function a fresh task's stack ever runs, per the
/// trampoline contract in `cpu_context`. Never returns.
pub(crate) extern "C" fn task_main(task: *mut Task) -> ! {
    unsafe {
        if let Err(payload) = (*task).call() {
            log::error!("task panicked: {}", panic_message(&payload));
        }
        (*task).finalize()
    }
}

/// Best-effort extraction of a human-readable message from a caught
/// panic payload — covers the two payload shapes `panic!`/`assert!`
/// actually produce (`&str` literals, `String` from formatted panics).
fn panic_message(payload: &(dyn std::any::Any + Send + 'static)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Intrusive LIFO free-list of retired tasks, mutated only by the
/// owning worker.
pub(crate) struct FreeList {
    head: *mut Task,
}

impl FreeList {
    pub(crate) fn new() -> Self {
        FreeList {
            head: ptr::null_mut(),
        }
    }

    pub(crate) unsafe fn push(&mut self, task: *mut Task) {
        unsafe { (*task).next = self.head };
        self.head = task;
    }

    pub(crate) unsafe fn pop(&mut self) -> Option<*mut Task> {
        if self.head.is_null() {
            return None;
        }
        let head = self.head;
        self.head = unsafe { (*head).next };
        unsafe { (*head).next = ptr::null_mut() };
        Some(head)
    }

    /// Free every task still on the list. Called once, at worker
    /// shutdown.
    pub(crate) unsafe fn drain_and_drop(&mut self) {
        while let Some(t) = unsafe { self.pop() } {
            drop(unsafe { Box::from_raw(t) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_list_reuse_is_lifo() {
        let a = Box::into_raw(Task::new());
        let b = Box::into_raw(Task::new());
        let mut list = FreeList::new();
        unsafe {
            list.push(a);
            list.push(b);
            assert_eq!(list.pop(), Some(b));
            assert_eq!(list.pop(), Some(a));
            assert_eq!(list.pop(), None);
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }

    #[test]
    fn set_places_closure_within_budget() {
        let mut task = Task::new();
        let ran = std::rc::Rc::new(std::cell::Cell::new(false));
        let ran2 = ran.clone();
        // `set` normally requires `Send`; this test only checks
        // layout, so it calls the closure invocation path directly
        // rather than through a real context switch.
        struct NotSend(std::rc::Rc<std::cell::Cell<bool>>);
        unsafe impl Send for NotSend {}
        let payload = NotSend(ran2);
        unsafe {
            task.set(move || payload.0.set(true));
        }
        assert!(task.call().is_ok());
        assert!(ran.get());
    }

    #[test]
    fn call_catches_a_panicking_closure_instead_of_unwinding() {
        let mut task = Task::new();
        unsafe {
            task.set(|| panic!("deliberate test panic"));
        }
        let result = task.call();
        assert!(result.is_err());
        assert_eq!(
            panic_message(&result.unwrap_err()),
            "deliberate test panic"
        );
    }
}
