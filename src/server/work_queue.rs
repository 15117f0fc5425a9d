// src/server/work_queue.rs

//! Dynamically sized thread pool for request processing.
//!
//! The queue starts with a single worker and doubles when backlog builds
//! up, capped by `min(max_threads, hardware_concurrency)`. Workers park
//! on a condition variable; an idle worker retires itself after the
//! protection period, so shrinking is best-effort rather than exact.
//! Finished work lands on a completion list drained by one async task
//! behind a single wake notification, keeping the reactor's syscall
//! count flat under load.

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info};

/// How long an idle worker lingers before retiring.
const PROTECTION_PERIOD: Duration = Duration::from_secs(5);

static HARDWARE_CONCURRENCY: Lazy<usize> = Lazy::new(|| {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
});

/// A unit of work: runs on a pool thread, completes on the drainer.
pub trait Work: Send + 'static {
    fn run(&mut self);
    fn complete(self: Box<Self>);
}

struct FnWork<T: Send + 'static> {
    job: Option<Box<dyn FnOnce() -> T + Send>>,
    result: Option<T>,
    done: Option<oneshot::Sender<T>>,
}

impl<T: Send + 'static> Work for FnWork<T> {
    fn run(&mut self) {
        if let Some(job) = self.job.take() {
            self.result = Some(job());
        }
    }

    fn complete(mut self: Box<Self>) {
        if let (Some(result), Some(done)) = (self.result.take(), self.done.take()) {
            let _ = done.send(result);
        }
    }
}

struct Inner {
    name: String,
    queue: Mutex<VecDeque<Box<dyn Work>>>,
    cond: Condvar,
    nr_threads: AtomicUsize,
    nr_queued: AtomicUsize,
    max_threads: usize,
    stopping: AtomicBool,
    finished: Mutex<Vec<Box<dyn Work>>>,
    finished_notify: Arc<Notify>,
}

pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    /// Creates the queue with one worker and spawns the completion
    /// drainer on the current runtime.
    pub fn new(name: &str, max_threads: usize) -> Self {
        let inner = Arc::new(Inner {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            nr_threads: AtomicUsize::new(0),
            nr_queued: AtomicUsize::new(0),
            max_threads: max_threads.max(1).min(*HARDWARE_CONCURRENCY).max(1),
            stopping: AtomicBool::new(false),
            finished: Mutex::new(Vec::new()),
            finished_notify: Arc::new(Notify::new()),
        });
        spawn_workers(&inner, 1);

        // The drainer: one task, one notification, any number of
        // completions per wake.
        let drain_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                drain_inner.finished_notify.notified().await;
                loop {
                    let batch: Vec<Box<dyn Work>> =
                        std::mem::take(&mut *drain_inner.finished.lock());
                    if batch.is_empty() {
                        break;
                    }
                    for work in batch {
                        work.complete();
                    }
                }
                if drain_inner.stopping.load(Ordering::SeqCst) {
                    return;
                }
            }
        });

        Self { inner }
    }

    pub fn threads(&self) -> usize {
        self.inner.nr_threads.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.inner.nr_queued.load(Ordering::Relaxed)
    }

    /// Schedules raw work, growing the pool when backlog exceeds the
    /// worker count.
    pub fn schedule(&self, work: Box<dyn Work>) {
        let inner = &self.inner;
        inner.nr_queued.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = inner.queue.lock();
            let threads = inner.nr_threads.load(Ordering::Relaxed);
            if inner.nr_queued.load(Ordering::Relaxed) > threads
                && threads * 2 <= inner.max_threads
            {
                debug!("work queue '{}': growing to {} workers", inner.name, threads * 2);
                spawn_workers(inner, threads);
            }
            queue.push_back(work);
        }
        inner.cond.notify_one();
    }

    /// Convenience: runs a closure on the pool, completing through a
    /// oneshot on the drainer.
    pub fn submit<T, F>(&self, job: F) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.schedule(Box::new(FnWork {
            job: Some(Box::new(job)),
            result: None,
            done: Some(tx),
        }));
        rx
    }

    /// Stops the pool; queued work still executes.
    pub fn shutdown(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.cond.notify_all();
        self.inner.finished_notify.notify_one();
        info!("work queue '{}' shut down", self.inner.name);
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_workers(inner: &Arc<Inner>, count: usize) {
    for _ in 0..count.max(1) {
        let inner = inner.clone();
        inner.nr_threads.fetch_add(1, Ordering::Relaxed);
        std::thread::Builder::new()
            .name(format!("wq-{}", inner.name))
            .spawn(move || worker_loop(inner))
            .expect("spawning a worker thread");
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        let work = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(work) = queue.pop_front() {
                    break Some(work);
                }
                if inner.stopping.load(Ordering::SeqCst) {
                    break None;
                }
                let timed_out = inner
                    .cond
                    .wait_for(&mut queue, PROTECTION_PERIOD)
                    .timed_out();
                // Idle past the protection period: retire, unless we are
                // the last worker.
                if timed_out
                    && queue.is_empty()
                    && inner.nr_threads.load(Ordering::Relaxed) > 1
                {
                    break None;
                }
            }
        };
        let Some(mut work) = work else {
            inner.nr_threads.fetch_sub(1, Ordering::Relaxed);
            return;
        };
        work.run();
        inner.nr_queued.fetch_sub(1, Ordering::Relaxed);
        inner.finished.lock().push(work);
        inner.finished_notify.notify_one();
    }
}
