//! A task registers, parks on, and resumes from an I/O completion
//! delivered by another thread while a real `Runtime` is running — no
//! shortcuts into worker internals.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use fiberpool::{
    CompletionEvent, IoEngine, IoHandle, LoopbackIoEngine, Runtime, RuntimeConfig, RuntimeError,
};

/// Shares one `LoopbackIoEngine` across every worker, so a completion
/// delivered from a thread outside the runtime reaches whichever
/// worker is actually waiting on it.
struct SharedLoopback(Arc<LoopbackIoEngine>);

impl IoEngine for SharedLoopback {
    fn register(&self, handle: IoHandle, context: usize) -> Result<(), RuntimeError> {
        self.0.register(handle, context)
    }
    fn wait(&self, timeout: Duration) -> Vec<CompletionEvent> {
        self.0.wait(timeout)
    }
    fn share(&self) -> Result<Box<dyn IoEngine>, RuntimeError> {
        Ok(Box::new(SharedLoopback(Arc::clone(&self.0))))
    }
}

#[test]
fn task_blocks_on_io_and_resumes_with_the_delivered_result() {
    let _ = env_logger::builder().is_test(true).try_init();
    let engine = Arc::new(LoopbackIoEngine::create().unwrap());
    let config = RuntimeConfig::new()
        .worker_threads(2)
        .io_poll_interval(Duration::from_millis(10));
    let runtime = Arc::new(
        Runtime::create_with_engine(config, || Ok(SharedLoopback(Arc::clone(&engine)))).unwrap(),
    );

    let (context_tx, context_rx) = mpsc::channel();
    let observed = Arc::new(AtomicI64::new(-1));
    let observed_in_task = Arc::clone(&observed);
    let runtime_in_task = Arc::clone(&runtime);

    runtime.spawn(move || {
        let task = fiberpool::current_task().unwrap();
        unsafe {
            task.register_io(IoHandle(42)).unwrap();
            context_tx.send(task.io_context()).unwrap();
            task.block_on_io();
            observed_in_task.store(task.io_result(), Ordering::Release);
        }
        runtime_in_task.shutdown();
    });

    // Deliver the completion from a thread with no relationship to
    // any worker, the way a real backend thread would.
    let engine_for_delivery = Arc::clone(&engine);
    let delivery = std::thread::spawn(move || {
        let context = context_rx.recv().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        engine_for_delivery.complete(context, 99);
    });

    runtime.run();
    delivery.join().unwrap();

    assert_eq!(observed.load(Ordering::Acquire), 99);
}

#[test]
fn send_all_parks_on_would_block_then_drains_through_the_runtime() {
    use fiberpool::SendProgress;
    use std::sync::atomic::AtomicUsize;

    let engine = Arc::new(LoopbackIoEngine::create().unwrap());
    let config = RuntimeConfig::new()
        .worker_threads(1)
        .io_poll_interval(Duration::from_millis(10));
    let runtime = Arc::new(
        Runtime::create_with_engine(config, || Ok(SharedLoopback(Arc::clone(&engine)))).unwrap(),
    );

    let attempts = Arc::new(AtomicUsize::new(0));
    let total_sent = Arc::new(AtomicUsize::new(0));
    let attempts_in_task = Arc::clone(&attempts);
    let total_sent_in_task = Arc::clone(&total_sent);
    let runtime_in_task = Arc::clone(&runtime);
    let engine_in_task = Arc::clone(&engine);

    runtime.spawn(move || {
        let task = fiberpool::current_task().unwrap();
        let context = unsafe {
            task.register_io(IoHandle(7)).unwrap();
            task.io_context()
        };

        let result = fiberpool::send_all(100, || {
            let n = attempts_in_task.fetch_add(1, Ordering::AcqRel);
            match n {
                0 => SendProgress::Sent(40),
                1 => {
                    // Wake ourselves back up once this task is
                    // actually parked: another thread can't safely
                    // observe that moment, so deliver the completion
                    // synchronously right here instead of blocking —
                    // `complete` only enqueues, it never runs the task.
                    engine_in_task.complete(context, 0);
                    SendProgress::WouldBlock
                }
                _ => SendProgress::Sent(60),
            }
        });

        assert!(result.is_ok());
        total_sent_in_task.store(attempts_in_task.load(Ordering::Acquire), Ordering::Release);
        runtime_in_task.shutdown();
    });

    runtime.run();

    assert!(total_sent.load(Ordering::Acquire) >= 3);
}
