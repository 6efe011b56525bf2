//! The Chase–Lev work-stealing deque.
//!
//! Single owner calls [`Deque::push`]/[`Deque::pop`] from one end; any
//! number of thieves call [`Deque::steal`] from the other. Memory
//! orders below are load-bearing, not advisory — they follow the
//! published Chase–Lev algorithm exactly.

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicI64, AtomicPtr, Ordering};

use crate::task::Task;

struct Buffer {
    mask: i64,
    slots: Box<[AtomicPtr<Task>]>,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || AtomicPtr::new(std::ptr::null_mut()));
        Buffer {
            mask: capacity as i64 - 1,
            slots: slots.into_boxed_slice(),
        }
    }

    fn capacity(&self) -> i64 {
        self.mask + 1
    }

    unsafe fn get(&self, i: i64) -> *mut Task {
        self.slots[(i & self.mask) as usize].load(Ordering::Relaxed)
    }

    unsafe fn put(&self, i: i64, task: *mut Task) {
        self.slots[(i & self.mask) as usize].store(task, Ordering::Relaxed);
    }

    /// Copy the live range `[top, bottom)` into a freshly allocated
    /// buffer of double the capacity.
    unsafe fn grow(&self, top: i64, bottom: i64) -> Buffer {
        let grown = Buffer::new(self.capacity() as usize * 2);
        let mut i = top;
        while i < bottom {
            unsafe { grown.put(i, self.get(i)) };
            i += 1;
        }
        grown
    }
}

/// A bounded-then-growing, power-of-two-capacity circular buffer
/// addressed by monotonically increasing `top`/`bottom` indices.
pub struct Deque {
    top: AtomicI64,
    bottom: AtomicI64,
    buffer: AtomicPtr<Buffer>,
    /// Retired buffers, kept alive until the deque itself drops —
    /// concurrent thieves may still hold a pointer from a recent load
    /// of `buffer`. Mutated only from `push`, which is owner-only.
    garbage: UnsafeCell<Vec<Box<Buffer>>>,
}

unsafe impl Send for Deque {}
unsafe impl Sync for Deque {}

impl Deque {
    pub fn new(initial_capacity: usize) -> Self {
        let buf = Box::into_raw(Box::new(Buffer::new(initial_capacity)));
        Deque {
            top: AtomicI64::new(0),
            bottom: AtomicI64::new(0),
            buffer: AtomicPtr::new(buf),
            garbage: UnsafeCell::new(Vec::new()),
        }
    }

    /// Owner-only. Push a task onto the bottom of the deque, growing
    /// the backing array if it's full.
    pub fn push(&self, task: *mut Task) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let mut buf_ptr = self.buffer.load(Ordering::Relaxed);
        let mut buf = unsafe { &*buf_ptr };

        if buf.capacity() - 1 < b - t {
            let grown = Box::into_raw(Box::new(unsafe { buf.grow(t, b) }));
            // SAFETY: `buf_ptr` was produced by a prior `Box::into_raw`
            // and is only reclaimed here, on the owner thread, after
            // installing its replacement.
            unsafe { (*self.garbage.get()).push(Box::from_raw(buf_ptr)) };
            self.buffer.store(grown, Ordering::Release);
            buf_ptr = grown;
            buf = unsafe { &*buf_ptr };
        }

        unsafe { buf.put(b, task) };
        fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Relaxed);
    }

    /// Owner-only. Pop the most recently pushed task (LIFO).
    pub fn pop(&self) -> Option<*mut Task> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            // Was already empty; undo the speculative decrement.
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        let buf = unsafe { &*self.buffer.load(Ordering::Relaxed) };
        let task = unsafe { buf.get(b) };

        if t == b {
            // Last element: race the thieves for it.
            let won = self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(b + 1, Ordering::Relaxed);
            if !won {
                return None;
            }
        }

        Some(task)
    }

    /// Any worker may call this. Steal the least recently pushed task
    /// (FIFO). Never retries internally; the caller decides.
    pub fn steal(&self) -> Option<*mut Task> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t >= b {
            return None;
        }

        // Rust's atomics have no `consume` ordering; `Acquire` is the
        // strictly-stronger substitute the published algorithm's
        // `consume` load is implemented as on every mainstream
        // compiler anyway.
        let buf = unsafe { &*self.buffer.load(Ordering::Acquire) };
        let task = unsafe { buf.get(t) };

        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Some(task)
        } else {
            None
        }
    }
}

impl Drop for Deque {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(*self.buffer.get_mut()));
        }
    }
}
