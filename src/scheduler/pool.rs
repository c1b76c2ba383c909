//! Cached worker pool
//!
//! Threads are created on demand whenever no worker is idle, and idle
//! workers exit after a keep-alive timeout. There is no upper bound and no
//! minimum size.

use crate::error::{panic_message, Result, TermCoreError};
use crate::sync::lock;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Unbounded, eagerly-growing worker pool
pub(crate) struct WorkerPool {
    name: String,
    keep_alive: Duration,
    /// `None` once shut down
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    idle: Arc<AtomicUsize>,
    /// Jobs sent but not yet picked up by a worker
    queued: Arc<AtomicUsize>,
    alive: Arc<AtomicUsize>,
    spawned: AtomicUsize,
}

impl WorkerPool {
    pub(crate) fn new(name: impl Into<String>, keep_alive: Duration) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            name: name.into(),
            keep_alive,
            sender: Mutex::new(Some(sender)),
            receiver,
            idle: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
            alive: Arc::new(AtomicUsize::new(0)),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Queue a job, spawning a worker if none is idle
    pub(crate) fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let sender = lock(&self.sender);
            let sender = sender.as_ref().ok_or(TermCoreError::SchedulerShutdown)?;
            self.queued.fetch_add(1, Ordering::SeqCst);
            if sender.send(Box::new(job)).is_err() {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                return Err(TermCoreError::SchedulerShutdown);
            }
        }

        if self.queued.load(Ordering::SeqCst) > self.idle.load(Ordering::SeqCst) {
            self.spawn_worker()?;
        }
        Ok(())
    }

    fn spawn_worker(&self) -> Result<()> {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let receiver = self.receiver.clone();
        let idle = Arc::clone(&self.idle);
        let queued = Arc::clone(&self.queued);
        let alive = Arc::clone(&self.alive);
        let keep_alive = self.keep_alive;

        alive.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.name, n))
            .spawn(move || {
                worker_loop(&receiver, &idle, &queued, keep_alive);
                alive.fetch_sub(1, Ordering::SeqCst);
            });

        if let Err(e) = spawned {
            self.alive.fetch_sub(1, Ordering::SeqCst);
            return Err(TermCoreError::io("spawning worker thread", e));
        }
        Ok(())
    }

    /// Number of live worker threads
    pub(crate) fn worker_count(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    /// Reject new jobs. Queued jobs still drain, then workers exit.
    pub(crate) fn shutdown(&self) {
        lock(&self.sender).take();
    }

    /// Check if the job sender was dropped
    pub(crate) fn is_shutdown(&self) -> bool {
        lock(&self.sender).is_none()
    }
}

fn worker_loop(
    receiver: &Receiver<Job>,
    idle: &AtomicUsize,
    queued: &AtomicUsize,
    keep_alive: Duration,
) {
    loop {
        idle.fetch_add(1, Ordering::SeqCst);
        let next = receiver.recv_timeout(keep_alive);
        // Leave the idle set before the queued count drops, so a submitter
        // never sees a busy worker as available for its job
        idle.fetch_sub(1, Ordering::SeqCst);

        let job = match next {
            Ok(job) => job,
            // A job may have been queued right as we timed out
            Err(RecvTimeoutError::Timeout) => match receiver.try_recv() {
                Ok(job) => job,
                Err(_) => break,
            },
            Err(RecvTimeoutError::Disconnected) => break,
        };
        queued.fetch_sub(1, Ordering::SeqCst);

        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            tracing::error!("Worker job panicked: {}", panic_message(payload.as_ref()));
        }
    }
}
