//! Admission-controlled transfer queue
//!
//! Re-evaluation runs after every state-changing call and after every task
//! execution ends, so the queue drains itself without a polling loop. Each
//! pass counts the running tasks and promotes admissible ones (waiting, or
//! paused with a pending resume) in submission order until the cap is
//! reached. A task is never admitted again while a previous execution of it
//! is still on a worker thread.

use super::events::TransferEvent;
use super::task::{TaskSnapshot, TransferContext, TransferStatus, TransferTask};
use crate::config::TransferConfig;
use crate::error::{panic_message, Result, TermCoreError, TransferError};
use crate::events::{EventBus, Listener, ListenerId};
use crate::sync::lock;
use crossbeam::channel::Receiver;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Bounded pool paired with the cap it was built for
struct PoolSlot {
    size: usize,
    pool: Arc<rayon::ThreadPool>,
}

struct QueueInner {
    tasks: Mutex<Vec<Arc<TransferTask>>>,
    max_concurrent: AtomicUsize,
    pool: Mutex<Option<PoolSlot>>,
    events: EventBus<TransferEvent>,
}

/// Queue running at most `max_concurrent` transfers at a time
#[derive(Clone)]
pub struct TransferQueue {
    inner: Arc<QueueInner>,
}

impl TransferQueue {
    /// Create a queue with the given admission cap
    pub fn new(max_concurrent: usize) -> Result<Self> {
        if max_concurrent == 0 {
            return Err(TermCoreError::InvalidConcurrency(max_concurrent));
        }
        Ok(Self {
            inner: Arc::new(QueueInner {
                tasks: Mutex::new(Vec::new()),
                max_concurrent: AtomicUsize::new(max_concurrent),
                pool: Mutex::new(None),
                events: EventBus::new(),
            }),
        })
    }

    /// Create a queue from configuration
    pub fn from_config(config: &TransferConfig) -> Result<Self> {
        Self::new(config.max_concurrent)
    }

    /// Append a task and try to admit it
    pub fn add_task(&self, task: Arc<TransferTask>) -> u64 {
        let id = task.id();
        let snapshot = task.snapshot();
        lock(&self.inner.tasks).push(task);
        tracing::debug!(task = id, local = %snapshot.local_path.display(), remote = %snapshot.remote_path, "Transfer queued");
        self.inner.events.emit(&TransferEvent::Added(snapshot));
        reevaluate(&self.inner);
        id
    }

    /// Cancel a task that has not finished yet
    pub fn cancel_task(&self, id: u64) -> Result<bool> {
        let task = self.find(id).ok_or(TermCoreError::TaskNotFound(id))?;
        let changed = cancel(&self.inner, &task);
        if changed {
            reevaluate(&self.inner);
        }
        Ok(changed)
    }

    /// Pause a waiting or running task.
    ///
    /// A running transfer stops at its next checkpoint and gives up its
    /// slot; its progress is kept.
    pub fn pause_task(&self, id: u64) -> Result<bool> {
        let task = self.find(id).ok_or(TermCoreError::TaskNotFound(id))?;
        match task.transition(TransferStatus::Paused, None) {
            Some(snapshot) => {
                tracing::debug!(task = id, "Transfer paused");
                self.inner.events.emit(&TransferEvent::Paused(snapshot));
                reevaluate(&self.inner);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Make a paused task eligible to run again
    pub fn resume_task(&self, id: u64) -> Result<bool> {
        let task = self.find(id).ok_or(TermCoreError::TaskNotFound(id))?;
        let resumed = task.request_resume();
        if resumed {
            tracing::debug!(task = id, "Transfer resume requested");
            reevaluate(&self.inner);
        }
        Ok(resumed)
    }

    /// Cancel (if unfinished) and stop tracking a task
    pub fn remove_task(&self, id: u64) -> Result<Arc<TransferTask>> {
        let task = self.find(id).ok_or(TermCoreError::TaskNotFound(id))?;
        let freed_slot = cancel(&self.inner, &task);
        lock(&self.inner.tasks).retain(|t| t.id() != id);
        self.inner.events.emit(&TransferEvent::Removed(task.snapshot()));
        if freed_slot {
            reevaluate(&self.inner);
        }
        Ok(task)
    }

    /// Change the admission cap.
    ///
    /// Raising it admits waiting tasks right away; lowering it never stops
    /// tasks already running above the new cap.
    pub fn set_max_concurrent(&self, max_concurrent: usize) -> Result<()> {
        if max_concurrent == 0 {
            return Err(TermCoreError::InvalidConcurrency(max_concurrent));
        }
        let previous = self.inner.max_concurrent.swap(max_concurrent, Ordering::SeqCst);
        if previous != max_concurrent {
            tracing::debug!(previous, max_concurrent, "Transfer concurrency cap changed");
            reevaluate(&self.inner);
        }
        Ok(())
    }

    /// Current admission cap
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent.load(Ordering::SeqCst)
    }

    /// Tasks currently running
    pub fn count_running(&self) -> usize {
        self.count(TransferStatus::Running)
    }

    /// Tasks waiting for admission
    pub fn count_waiting(&self) -> usize {
        self.count(TransferStatus::Waiting)
    }

    /// Tasks currently paused
    pub fn count_paused(&self) -> usize {
        self.count(TransferStatus::Paused)
    }

    fn count(&self, status: TransferStatus) -> usize {
        lock(&self.inner.tasks)
            .iter()
            .filter(|t| t.status() == status)
            .count()
    }

    /// Number of tracked tasks
    pub fn len(&self) -> usize {
        lock(&self.inner.tasks).len()
    }

    /// Check if no tasks are tracked
    pub fn is_empty(&self) -> bool {
        lock(&self.inner.tasks).is_empty()
    }

    /// Look up a tracked task
    pub fn find(&self, id: u64) -> Option<Arc<TransferTask>> {
        lock(&self.inner.tasks).iter().find(|t| t.id() == id).cloned()
    }

    /// Snapshots of every tracked task, in submission order
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        lock(&self.inner.tasks).iter().map(|t| t.snapshot()).collect()
    }

    /// Check if every tracked task reached a terminal state
    pub fn is_idle(&self) -> bool {
        lock(&self.inner.tasks)
            .iter()
            .all(|t| t.status().is_terminal())
    }

    /// Drop finished, failed and cancelled tasks; returns how many
    pub fn clear_completed(&self) -> usize {
        let removed: Vec<Arc<TransferTask>> = {
            let mut tasks = lock(&self.inner.tasks);
            let (done, keep): (Vec<_>, Vec<_>) =
                tasks.drain(..).partition(|t| t.status().is_terminal());
            *tasks = keep;
            done
        };
        for task in &removed {
            self.inner.events.emit(&TransferEvent::Removed(task.snapshot()));
        }
        removed.len()
    }

    /// Register a listener for transfer events
    pub fn subscribe(&self, listener: impl Listener<TransferEvent> + 'static) -> ListenerId {
        self.inner.events.subscribe(listener)
    }

    /// Remove a listener
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Receive transfer events over a channel
    pub fn event_channel(&self) -> Receiver<TransferEvent> {
        self.inner.events.channel()
    }
}

/// Move a task to cancelled; true if it held or awaited a slot
fn cancel(inner: &QueueInner, task: &TransferTask) -> bool {
    match task.transition(TransferStatus::Cancelled, None) {
        Some(snapshot) => {
            tracing::debug!(task = task.id(), "Transfer cancelled");
            inner.events.emit(&TransferEvent::Cancelled(snapshot));
            true
        }
        None => false,
    }
}

/// Promote admissible tasks while running < cap
fn reevaluate(inner: &Arc<QueueInner>) {
    let max = inner.max_concurrent.load(Ordering::SeqCst);
    let started: Vec<(Arc<TransferTask>, TaskSnapshot)> = {
        let tasks = lock(&inner.tasks);
        let mut running = tasks
            .iter()
            .filter(|t| t.status() == TransferStatus::Running)
            .count();
        let mut started = Vec::new();
        for task in tasks.iter() {
            if running >= max {
                break;
            }
            if let Some(snapshot) = task.try_admit() {
                running += 1;
                started.push((Arc::clone(task), snapshot));
            }
        }
        started
    };

    for (task, snapshot) in started {
        tracing::debug!(task = task.id(), "Transfer started");
        inner.events.emit(&TransferEvent::Started(snapshot));

        let pool = match worker_pool(inner, max) {
            Ok(pool) => pool,
            Err(e) => {
                fail(inner, &task, e.to_string());
                task.end_execution();
                continue;
            }
        };
        let job_inner = Arc::clone(inner);
        pool.spawn(move || execute(&job_inner, &task));
    }
}

/// Pool sized to the current cap, rebuilt when the cap changed
fn worker_pool(inner: &QueueInner, size: usize) -> Result<Arc<rayon::ThreadPool>> {
    let mut slot = lock(&inner.pool);
    if let Some(existing) = slot.as_ref() {
        if existing.size == size {
            return Ok(Arc::clone(&existing.pool));
        }
    }

    // Any previous pool finishes its in-flight transfers before its
    // threads exit
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(size)
        .thread_name(|i| format!("termcore-transfer-{}", i))
        .build()
        .map_err(|e| TermCoreError::ThreadPool(e.to_string()))?;
    let pool = Arc::new(pool);
    *slot = Some(PoolSlot {
        size,
        pool: Arc::clone(&pool),
    });
    Ok(pool)
}

/// Run one admitted task on a pool thread, then admit the next ones
fn execute(inner: &Arc<QueueInner>, task: &Arc<TransferTask>) {
    let transfer = task.transfer();
    let ctx = TransferContext::new(task, &inner.events);
    let outcome = catch_unwind(AssertUnwindSafe(|| transfer.run(&ctx)));

    match outcome {
        Ok(Ok(())) => {
            if let Some(snapshot) = task.transition(TransferStatus::Complete, None) {
                tracing::info!(task = task.id(), bytes = snapshot.transferred, "Transfer complete");
                inner.events.emit(&TransferEvent::Complete(snapshot));
            }
        }
        Ok(Err(TransferError::Paused)) => {
            // Already paused by pause_task, unless the transfer paused itself
            if let Some(snapshot) = task.transition(TransferStatus::Paused, None) {
                inner.events.emit(&TransferEvent::Paused(snapshot));
            }
        }
        Ok(Err(TransferError::Cancelled)) => {
            cancel(inner, task);
        }
        Ok(Err(e)) => fail(inner, task, e.to_string()),
        Err(payload) => fail(
            inner,
            task,
            format!("transfer panicked: {}", panic_message(payload.as_ref())),
        ),
    }

    task.end_execution();
    reevaluate(inner);
}

fn fail(inner: &QueueInner, task: &TransferTask, message: String) {
    // A cancel that raced with the failure wins
    if let Some(snapshot) = task.transition(TransferStatus::Error, Some(message.clone())) {
        tracing::warn!(task = task.id(), "Transfer failed: {}", message);
        inner.events.emit(&TransferEvent::Error(snapshot));
    }
}
