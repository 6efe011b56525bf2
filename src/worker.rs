//! The per-worker scheduler: a run-to-yield loop over one OS thread,
//! backed by a Chase–Lev ready deque, a free-list of retired tasks,
//! and a completion-based I/O engine.

use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cpu_context::{self, CpuContext};
use crate::deque::Deque;
use crate::io_engine::IoEngine;
use crate::task::{FreeList, Task};

thread_local! {
    static CURRENT_TASK: Cell<*mut Task> = const { Cell::new(ptr::null_mut()) };
}

pub(crate) fn current_task_ptr() -> *mut Task {
    CURRENT_TASK.with(|c| c.get())
}

/// Owner-exclusive worker state. Free-list, RNG, the scheduler's own
/// saved context, the `io_blocked` counter, and the peer directory are
/// all touched only by the thread running this worker's loop — no
/// synchronization is needed for any of it.
struct WorkerState {
    main: CpuContext,
    io_blocked: usize,
    free_list: FreeList,
    rng: XorShift32,
    peers: Vec<Arc<Worker>>,
}

/// One OS thread's worth of scheduler state: a ready deque any peer
/// may steal from, an owned I/O engine, and the rest of the
/// owner-exclusive bookkeeping above.
pub struct Worker {
    pub(crate) id: usize,
    ready: Deque,
    io: Box<dyn IoEngine>,
    state: UnsafeCell<WorkerState>,
    shutdown: Arc<AtomicBool>,
}

// SAFETY: `ready` and `io` are internally synchronized; everything
// else in `state` is accessed only from the thread that owns this
// worker (set up before the thread starts, then never touched again
// from outside it). `WorkerState` holds raw task pointers (via
// `FreeList`), which blocks the auto-derived `Send`; the worker as a
// whole is still safe to hand to the OS thread that will exclusively
// own it.
unsafe impl Send for Worker {}
unsafe impl Sync for Worker {}

impl Worker {
    pub(crate) fn new(
        id: usize,
        io: Box<dyn IoEngine>,
        ready_queue_capacity: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Worker {
        Worker {
            id,
            ready: Deque::new(ready_queue_capacity),
            io,
            state: UnsafeCell::new(WorkerState {
                main: CpuContext::default(),
                io_blocked: 0,
                free_list: FreeList::new(),
                rng: XorShift32::new(id as u32 + 1),
                peers: Vec::new(),
            }),
            shutdown,
        }
    }

    /// Install the peer directory. Called once by `Runtime::create`,
    /// before any worker thread starts — no race with the run loop.
    pub(crate) fn set_peers(&self, peers: Vec<Arc<Worker>>) {
        unsafe { (*self.state.get()).peers = peers };
    }

    pub(crate) fn io(&self) -> &dyn IoEngine {
        &*self.io
    }

    fn state_mut(&self) -> &mut WorkerState {
        unsafe { &mut *self.state.get() }
    }

    pub(crate) fn main_context(&self) -> *mut CpuContext {
        &mut self.state_mut().main
    }

    fn allocate_task(&self) -> *mut Task {
        unsafe { self.state_mut().free_list.pop() }.unwrap_or_else(|| Box::into_raw(Task::new()))
    }

    /// Spawn `f` as a new task on this worker's own ready deque.
    pub(crate) fn spawn_local<F: FnOnce() + Send + 'static>(&self, f: F) {
        let task = self.allocate_task();
        unsafe {
            (*task).owner = self as *const Worker as *mut Worker;
            (*task).set(f);
        }
        self.ready.push(task);
    }

    /// Called from [`crate::current::spawn`] — spawning from inside a
    /// task forwards to that task's own worker.
    pub(crate) fn spawn_from_within<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.spawn_local(f);
    }

    pub(crate) fn requeue(&self, task: *mut Task) {
        self.ready.push(task);
    }

    pub(crate) fn mark_io_blocked(&self) {
        self.state_mut().io_blocked += 1;
    }

    pub(crate) fn reclaim(&self, task: *mut Task) {
        unsafe { self.state_mut().free_list.push(task) };
    }

    /// Pick a random peer (falling back to any other worker on
    /// collision avoidance) and probe every peer's deque once, starting
    /// from that point.
    fn try_steal(&self) -> Option<*mut Task> {
        let state = self.state_mut();
        let n = state.peers.len();
        if n == 0 {
            return None;
        }
        let mid = (state.rng.next_u32() as usize) % n;
        for i in 0..n {
            let idx = (mid + i) % n;
            let peer = &state.peers[idx];
            if std::ptr::eq(peer.as_ref(), self) {
                continue;
            }
            if let Some(task) = peer.ready.steal() {
                log::trace!("worker {} stole a task from worker {}", self.id, peer.id);
                unsafe { (*task).owner = self as *const Worker as *mut Worker };
                return Some(task);
            }
        }
        None
    }

    fn drain_io(&self, wait: Duration) {
        let events = self.io.wait(wait);
        for event in events {
            let task = event.context as *mut Task;
            unsafe { (*task).io_result = event.result };
            self.state_mut().io_blocked -= 1;
            unsafe { (*task).owner = self as *const Worker as *mut Worker };
            self.ready.push(task);
        }
    }

    fn run_task(&self, task: *mut Task) {
        CURRENT_TASK.with(|c| c.set(task));
        let main = self.main_context();
        unsafe { cpu_context::context_swap(main, &(*task).context) };
        CURRENT_TASK.with(|c| c.set(ptr::null_mut()));
    }

    /// The scheduler loop. Runs until the shared shutdown flag is set
    /// and there is no more locally queued or stealable work.
    pub(crate) fn run(&self, poll_interval: Duration) {
        log::debug!("worker {} starting", self.id);
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let mut task = self.ready.pop();
            if task.is_none() {
                task = self.try_steal();
            }
            while task.is_none() {
                if self.shutdown.load(Ordering::Relaxed) {
                    self.shutdown_drain();
                    log::debug!("worker {} stopping", self.id);
                    return;
                }
                self.drain_io(poll_interval);
                task = self.ready.pop().or_else(|| self.try_steal());
            }
            self.run_task(task.unwrap());
        }
        self.shutdown_drain();
        log::debug!("worker {} stopping", self.id);
    }

    /// Free every task reachable from the ready deque and free-list.
    /// Tasks parked on I/O are leaked by construction — there is no
    /// way to cancel a pending completion out from under the backend.
    fn shutdown_drain(&self) {
        while let Some(t) = self.ready.pop() {
            drop(unsafe { Box::from_raw(t) });
        }
        unsafe { self.state_mut().free_list.drain_and_drop() };
    }
}

/// `xorshift128`-style generator seeded with four 32-bit words. Used
/// per-worker for steal-victim selection and once inside `Runtime`
/// for initial spawn placement.
pub(crate) struct XorShift32 {
    x: u32,
    y: u32,
    z: u32,
    w: u32,
}

impl XorShift32 {
    pub(crate) fn new(seed: u32) -> Self {
        let seed = if seed == 0 { 0x9e37_79b9 } else { seed };
        XorShift32 {
            x: seed,
            y: 0x9e37_79b9,
            z: 0x5851_f42d,
            w: 0x1405_7b7e,
        }
    }

    pub(crate) fn next_u32(&mut self) -> u32 {
        let t = self.x ^ (self.x << 11);
        self.x = self.y;
        self.y = self.z;
        self.z = self.w;
        self.w = self.w ^ (self.w >> 19) ^ (t ^ (t >> 8));
        self.w
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xorshift_does_not_stall_on_zero_seed() {
        let mut rng = XorShift32::new(0);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            seen.insert(rng.next_u32());
        }
        assert!(seen.len() > 90);
    }

    /// One worker holds 1000 ready tasks; three idle peers probe for
    /// work. Every task is accounted for exactly once, and stealing
    /// actually spreads the load rather than leaving it all on the
    /// original worker.
    #[test]
    fn idle_peers_steal_a_fair_share_of_a_busy_workers_queue() {
        use crate::io_engine::LoopbackIoEngine;

        const N: usize = 1000;
        let shutdown = Arc::new(AtomicBool::new(false));
        let workers: Vec<Arc<Worker>> = (0..4)
            .map(|id| {
                Arc::new(Worker::new(
                    id,
                    Box::new(LoopbackIoEngine::create().unwrap()),
                    32,
                    Arc::clone(&shutdown),
                ))
            })
            .collect();
        for w in &workers {
            w.set_peers(workers.clone());
        }

        let mut pushed = Vec::with_capacity(N);
        for _ in 0..N {
            let t = Box::into_raw(Task::new());
            unsafe { (*t).owner = Arc::as_ptr(&workers[0]) as *mut Worker };
            workers[0].ready.push(t);
            pushed.push(t);
        }

        let mut stolen_by = vec![0usize; 4];
        loop {
            let mut made_progress = false;
            for i in 1..4 {
                if workers[i].try_steal().is_some() {
                    stolen_by[i] += 1;
                    made_progress = true;
                }
            }
            if !made_progress {
                break;
            }
        }

        let mut remaining_on_owner = 0usize;
        while workers[0].ready.pop().is_some() {
            remaining_on_owner += 1;
        }

        let total_stolen: usize = stolen_by.iter().sum();
        assert_eq!(total_stolen + remaining_on_owner, N);
        for count in &stolen_by[1..] {
            assert!(*count > N / 10, "expected a fair share, got {count}");
        }

        for t in pushed {
            unsafe { drop(Box::from_raw(t)) };
        }
    }
}
