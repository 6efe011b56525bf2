//! Runtime configuration.

use std::time::Duration;

/// Tunables for [`crate::runtime::Runtime::create`].
///
/// Plain data, documented defaults, no config-file format — this is a
/// library embedded by a host process, not a standalone service.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) ready_queue_capacity: usize,
    pub(crate) io_poll_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: 0,
            ready_queue_capacity: 256,
            io_poll_interval: Duration::from_millis(20),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worker OS threads. `0` (the default) means "use the
    /// OS-reported hardware concurrency".
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    /// Initial capacity of each worker's ready deque. Rounded up to
    /// the next power of two.
    pub fn ready_queue_capacity(mut self, cap: usize) -> Self {
        self.ready_queue_capacity = cap;
        self
    }

    /// How long a worker blocks in `IoEngine::wait` before re-checking
    /// for stealable work. See the scheduler loop's design note on why
    /// this can't simply be infinite.
    pub fn io_poll_interval(mut self, interval: Duration) -> Self {
        self.io_poll_interval = interval;
        self
    }
}
