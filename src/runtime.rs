//! `Runtime`: owns a fixed pool of workers, spawns their OS threads,
//! and load-balances externally submitted work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::io_engine::IoEngine;
use crate::worker::{Worker, XorShift32};

/// Owns N workers and the OS threads that run them.
pub struct Runtime {
    config: RuntimeConfig,
    workers: Vec<Arc<Worker>>,
    spawn_rng: std::sync::Mutex<XorShift32>,
    shutdown: Arc<AtomicBool>,
    threads: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Build a runtime whose `IoEngine` is the crate's own
    /// [`crate::io_engine::LoopbackIoEngine`]. Does not start any
    /// threads yet.
    pub fn create(config: RuntimeConfig) -> Result<Runtime, RuntimeError> {
        Runtime::create_with_engine(config, crate::io_engine::LoopbackIoEngine::create)
    }

    /// Build a runtime using a caller-supplied `IoEngine` for the
    /// first worker; every other worker gets a sibling obtained via
    /// [`IoEngine::share`].
    pub fn create_with_engine<E, F>(
        config: RuntimeConfig,
        make_engine: F,
    ) -> Result<Runtime, RuntimeError>
    where
        E: IoEngine + 'static,
        F: FnOnce() -> Result<E, RuntimeError>,
    {
        let n = if config.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            config.worker_threads
        };
        let n = n.max(1);

        let shutdown = Arc::new(AtomicBool::new(false));
        let first: Box<dyn IoEngine> = Box::new(make_engine()?);
        let mut engines: Vec<Box<dyn IoEngine>> = Vec::with_capacity(n);
        engines.push(first);
        for _ in 1..n {
            let sibling = engines[0].share()?;
            engines.push(sibling);
        }

        let workers: Vec<Arc<Worker>> = engines
            .into_iter()
            .enumerate()
            .map(|(id, io)| {
                Arc::new(Worker::new(
                    id,
                    io,
                    config.ready_queue_capacity,
                    Arc::clone(&shutdown),
                ))
            })
            .collect();

        for w in &workers {
            w.set_peers(workers.clone());
        }

        Ok(Runtime {
            config,
            workers,
            spawn_rng: std::sync::Mutex::new(XorShift32::new(0x1234_5678)),
            shutdown,
            threads: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Schedule `fn` on a randomly chosen worker. Known limitation: if
    /// that worker is currently blocked in `IoEngine::wait`, the task
    /// doesn't run until the wait returns — there is no wakeup
    /// mechanism for a sleeping worker in this implementation.
    ///
    /// `F` must fit within the task's stack-embedded closure budget
    /// (a quarter of [`crate::task::STACK_SIZE`]); an oversized closure
    /// is rejected at compile time, not by a runtime check:
    ///
    /// ```compile_fail
    /// # use fiberpool::{Runtime, RuntimeConfig};
    /// let runtime = Runtime::create(RuntimeConfig::new()).unwrap();
    /// let oversized = [0u8; 64 * 1024];
    /// runtime.spawn(move || {
    ///     let _ = &oversized;
    /// });
    /// ```
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let idx = {
            let mut rng = self.spawn_rng.lock().unwrap();
            (rng.next_u32() as usize) % self.workers.len()
        };
        self.workers[idx].spawn_local(f);
    }

    /// Start an OS thread per worker after index 0, running
    /// `Worker::run` on each; run worker 0's loop on the calling
    /// thread. Blocks until every worker loop returns, which — absent
    /// a call to [`Runtime::shutdown`] from another thread — is never,
    /// by design, for a long-running server.
    pub fn run(&self) {
        let mut threads = self.threads.lock().unwrap();
        for worker in &self.workers[1..] {
            let worker = Arc::clone(worker);
            let poll_interval = self.config.io_poll_interval;
            threads.push(thread::spawn(move || worker.run(poll_interval)));
        }
        drop(threads);

        self.workers[0].run(self.config.io_poll_interval);

        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Signal every worker to stop once its local work and stealable
    /// peer work are exhausted. Gives test tooling (and any embedder)
    /// a deterministic way to tear a runtime down.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Owner-side `pop` is LIFO: the task that most recently yielded
    /// always preempts older ready work on the same worker.
    /// Two tasks that do nothing but yield in a loop therefore don't
    /// interleave on a single worker — whichever one starts yielding
    /// first keeps winning until it finishes, then the other runs to
    /// completion uninterrupted. That's the invariant this test
    /// checks: both tasks run to completion and contribute one
    /// contiguous run each, not a perfectly alternating sequence.
    #[test]
    fn two_yielding_tasks_each_run_to_completion_on_one_worker() {
        let config = RuntimeConfig::new()
            .worker_threads(1)
            .io_poll_interval(Duration::from_millis(5));
        let runtime = Arc::new(Runtime::create(config).unwrap());
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let remaining = Arc::new(AtomicUsize::new(2));

        let log_b = Arc::clone(&log);
        let remaining_b = Arc::clone(&remaining);
        let runtime_b = Arc::clone(&runtime);
        let log_a = Arc::clone(&log);
        let remaining_a = Arc::clone(&remaining);
        let runtime_a = Arc::clone(&runtime);

        runtime.spawn(move || {
            crate::current::spawn(move || {
                for _ in 0..1000 {
                    log_b.lock().unwrap().push('B');
                    crate::current::yield_now();
                }
                if remaining_b.fetch_sub(1, Ordering::AcqRel) == 1 {
                    runtime_b.shutdown();
                }
            });
            for _ in 0..1000 {
                log_a.lock().unwrap().push('A');
                crate::current::yield_now();
            }
            if remaining_a.fetch_sub(1, Ordering::AcqRel) == 1 {
                runtime_a.shutdown();
            }
        });

        runtime.run();

        let recorded = log.lock().unwrap();
        assert_eq!(recorded.len(), 2000);
        assert_eq!(recorded.iter().filter(|&&c| c == 'A').count(), 1000);
        assert_eq!(recorded.iter().filter(|&&c| c == 'B').count(), 1000);
        let transitions = recorded.windows(2).filter(|w| w[0] != w[1]).count();
        assert!(
            transitions <= 1,
            "expected at most one run boundary under LIFO owner-pop, got {transitions}"
        );
    }

    #[test]
    fn fan_out_spawn_hits_every_slot_exactly_once() {
        const N: usize = 2000;
        let config = RuntimeConfig::new()
            .worker_threads(4)
            .io_poll_interval(Duration::from_millis(5));
        let runtime = Arc::new(Runtime::create(config).unwrap());
        let slots: Arc<Vec<AtomicUsize>> =
            Arc::new((0..N).map(|_| AtomicUsize::new(0)).collect());
        let remaining = Arc::new(AtomicUsize::new(N));

        let slots_for_root = Arc::clone(&slots);
        let remaining_for_root = Arc::clone(&remaining);
        let runtime_for_root = Arc::clone(&runtime);

        runtime.spawn(move || {
            for i in 0..N {
                let slots = Arc::clone(&slots_for_root);
                let remaining = Arc::clone(&remaining_for_root);
                let runtime = Arc::clone(&runtime_for_root);
                crate::current::spawn(move || {
                    slots[i].fetch_add(1, Ordering::Relaxed);
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        runtime.shutdown();
                    }
                });
            }
        });

        runtime.run();

        for slot in slots.iter() {
            assert_eq!(slot.load(Ordering::Relaxed), 1);
        }
    }
}
