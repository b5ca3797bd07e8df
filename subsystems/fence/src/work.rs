//! # Callback Work Queue
//!
//! Kernel callbacks registered against a fence must not run on the
//! signaling thread, which may hold hardware-facing locks. They are queued
//! here and drained by one dedicated worker, preserving registration
//! order. Jobs still queued at shutdown are drained before the worker
//! exits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use event_listener::{Event, Listener};
use spin::Mutex;

type Job = Box<dyn FnOnce() + Send>;

struct WorkInner {
    jobs: Mutex<VecDeque<Job>>,
    ready: Event,
    shutdown: AtomicBool,
}

/// Single-worker FIFO job queue
pub struct CallbackQueue {
    inner: Arc<WorkInner>,
    worker: Option<JoinHandle<()>>,
}

impl CallbackQueue {
    /// Spawn the worker thread
    pub fn new() -> Self {
        let inner = Arc::new(WorkInner {
            jobs: Mutex::new(VecDeque::new()),
            ready: Event::new(),
            shutdown: AtomicBool::new(false),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name(String::from("fence-cb"))
            .spawn(move || worker_loop(&worker_inner))
            .ok();

        if worker.is_none() {
            log::error!("failed to spawn fence callback worker");
        }

        CallbackQueue { inner, worker }
    }

    /// Append one job; runs asynchronously in queue order
    pub fn queue(&self, job: Job) {
        self.inner.jobs.lock().push_back(job);
        self.inner.ready.notify(1);
    }

    /// Number of jobs not yet started
    pub fn backlog(&self) -> usize {
        self.inner.jobs.lock().len()
    }
}

fn worker_loop(inner: &WorkInner) {
    loop {
        let job = inner.jobs.lock().pop_front();
        if let Some(job) = job {
            job();
            continue;
        }

        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }

        let listener = inner.ready.listen();
        if inner.shutdown.load(Ordering::Acquire) || !inner.jobs.lock().is_empty() {
            continue;
        }
        listener.wait();
    }
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallbackQueue {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.ready.notify(usize::MAX);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
