//! Bounded worker pool.
//!
//! Entity executions and action dispatches are posted here so the agent
//! never gobbles up unbounded threads or memory: a fixed number of workers
//! drain a lock-free, bounded ready queue (`crossbeam_queue::ArrayQueue`).
//! When the queue is full the post is rejected instead of blocking, so a
//! stalled agent surfaces backpressure to its caller rather than
//! accumulating work.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_queue::ArrayQueue;
use tracing::debug;

/// One entry in the ready queue.
enum Job {
    Run(Box<dyn FnOnce() + Send>),

    /// Sentinel telling a worker to exit.
    Shutdown,
}

struct Shared {
    queue: ArrayQueue<Job>,

    /// Jobs posted but not yet finished (excludes shutdown sentinels).
    pending: AtomicUsize,

    closed: AtomicBool,
}

/// A fixed-size worker pool over a bounded ready queue.
pub struct JobQueue {
    shared: Arc<Shared>,
    workers: Vec<Option<JoinHandle<()>>>,
}

impl JobQueue {
    /// Creates the pool with `worker_count` threads and a ready queue of
    /// `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(name: &str, worker_count: usize, capacity: usize) -> Self {
        assert!(capacity > 0, "ready queue capacity must be positive");

        let shared = Arc::new(Shared {
            queue: ArrayQueue::new(capacity),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });

        let workers = (0..worker_count.max(1))
            .map(|i| {
                let shared = shared.clone();
                let handle = thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || Self::worker_loop(&shared))
                    .expect("spawning job queue worker");
                Some(handle)
            })
            .collect();

        Self { shared, workers }
    }

    /// The main loop for a worker thread.
    ///
    /// Pops jobs until a shutdown sentinel arrives (or the queue is closed
    /// and drained). An empty queue yields rather than busy-spinning.
    fn worker_loop(shared: &Shared) {
        loop {
            match shared.queue.pop() {
                Some(Job::Run(job)) => {
                    job();
                    shared.pending.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Job::Shutdown) => break,
                None => {
                    if shared.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    thread::yield_now();
                }
            }
        }
    }

    /// Posts a job to the ready queue.
    ///
    /// Returns false when the queue is closed or full (backpressure); the
    /// caller retries or sheds the work.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        if self.shared.closed.load(Ordering::SeqCst) {
            return false;
        }

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        match self.shared.queue.push(Job::Run(Box::new(job))) {
            Ok(()) => true,
            Err(_) => {
                self.shared.pending.fetch_sub(1, Ordering::SeqCst);
                false
            }
        }
    }

    /// Blocks until every posted job has finished.
    pub fn drain(&self) {
        while self.shared.pending.load(Ordering::SeqCst) > 0 {
            thread::yield_now();
        }
    }

    pub fn queued(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Closes the pool: new posts are rejected, jobs already queued still
    /// run, and the workers exit. Threads are joined on drop.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);

        // Best-effort wake-up: a sentinel per worker. Workers also watch
        // the closed flag, so a full queue cannot strand them.
        for _ in 0..self.workers.len() {
            let _ = self.shared.queue.push(Job::Shutdown);
        }
        debug!("job queue closed");
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.close();
        for worker in &mut self.workers {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_all_posted_jobs() {
        let queue = JobQueue::new("test", 4, 256);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = counter.clone();
            assert!(queue.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        queue.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn closed_queue_rejects_jobs() {
        let queue = JobQueue::new("test", 1, 8);
        assert!(queue.post(|| {}));
        queue.drain();
        queue.close();
        assert!(!queue.post(|| {}));
    }

    #[test]
    fn full_queue_signals_backpressure() {
        // One worker blocked on a gate keeps the queue from draining.
        let gate = Arc::new(AtomicBool::new(false));
        let queue = JobQueue::new("test", 1, 2);

        let hold = gate.clone();
        queue.post(move || {
            while !hold.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        });

        // Fill the ready queue behind the blocked worker, then overflow it.
        let mut rejected = 0;
        for _ in 0..8 {
            if !queue.post(|| {}) {
                rejected += 1;
            }
        }
        assert!(rejected > 0, "overflow must surface backpressure");

        gate.store(true, Ordering::SeqCst);
        queue.drain();
        assert_eq!(queue.queued(), 0);
    }

    #[test]
    #[should_panic(expected = "ready queue capacity must be positive")]
    fn zero_capacity_panics() {
        let _queue = JobQueue::new("test", 1, 0);
    }
}
