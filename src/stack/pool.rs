//! Lookup Thread Pool
//!
//! A small fixed pool with a bounded queue for fanning file lookups out across
//! an array's members. A full or closed queue never fails the request: the
//! caller gets its job back and runs it inline, degrading the cross-file scan
//! to sequential.

use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Sender, TrySendError};
use tracing::debug;

/// Work queued onto the pool
pub type Job = Box<dyn FnOnce() + Send>;

/// Queue slots per worker
const QUEUE_PER_WORKER: usize = 4;

/// Bounded worker pool for cross-file lookups
pub struct LookupPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl LookupPool {
    /// Spawn `cpu_count + 1` workers named after `name`
    pub fn new(name: &str) -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            + 1;
        let (tx, rx) = bounded::<Job>(threads * QUEUE_PER_WORKER);
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-lookup-{}", name, i))
                .spawn(move || {
                    for job in rx.iter() {
                        job();
                    }
                })
                .expect("spawning lookup worker");
            workers.push(handle);
        }
        debug!(name, threads, "lookup pool started");
        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// Try to queue `job`. On a full or shut-down queue the job is handed
    /// back so the caller can execute it inline.
    pub fn submit(&self, job: Job) -> std::result::Result<(), Job> {
        match &self.tx {
            Some(tx) => match tx.try_send(job) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => Err(job),
            },
            None => Err(job),
        }
    }
}

impl Drop for LookupPool {
    fn drop(&mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn executes_submitted_jobs() {
        let pool = LookupPool::new("test");
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = crossbeam::channel::unbounded();
        for _ in 0..8 {
            let counter = counter.clone();
            let tx = tx.clone();
            let job: Job = Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            });
            if let Err(job) = pool.submit(job) {
                job(); // inline fallback
            }
        }
        for _ in 0..8 {
            rx.recv().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn rejected_jobs_are_returned_intact() {
        let pool = LookupPool::new("satur");
        // saturate the queue with sleepers, then overfill it
        let mut inline = 0;
        for _ in 0..1000 {
            let job: Job = Box::new(|| std::thread::sleep(std::time::Duration::from_millis(1)));
            if let Err(job) = pool.submit(job) {
                job();
                inline += 1;
            }
        }
        // with a bounded queue, at least some jobs must have come back
        assert!(inline > 0);
    }
}
