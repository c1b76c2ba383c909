//! Scheduled task handles
//!
//! A [`TaskHandle`] is the cancellable descriptor of one unit of deferred
//! work. Handles are cheap to clone; every clone refers to the same task.

use crate::error::panic_message;
use crate::sync::lock;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// Work that runs at most once
pub(crate) type OnceWork = Box<dyn FnOnce(&TaskContext<'_>) -> anyhow::Result<()> + Send>;

/// Work that runs on every tick of a loop task
pub(crate) type LoopWork = Box<dyn Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// How a task repeats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Runs a single time after its delay
    Once,
    /// Runs repeatedly, rearmed one period after each run completes
    Loop,
}

enum Work {
    Once(Mutex<Option<OnceWork>>),
    Loop(LoopWork),
}

struct HandleInner {
    id: u64,
    kind: TaskKind,
    delay: Duration,
    work: Work,
    /// `None` when the delay is too large to represent; never due
    next_fire: Mutex<Option<Instant>>,
    running: AtomicBool,
    cancelled: AtomicBool,
    /// Worker thread currently executing the work, unparked on cancel
    owner: Mutex<Option<Thread>>,
    runs: AtomicU64,
}

/// Cancellable descriptor for one scheduled unit of work
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<HandleInner>,
}

impl TaskHandle {
    pub(crate) fn once(id: u64, delay: Duration, work: OnceWork) -> Self {
        Self::build(id, TaskKind::Once, delay, Work::Once(Mutex::new(Some(work))))
    }

    pub(crate) fn looping(id: u64, period: Duration, work: LoopWork) -> Self {
        Self::build(id, TaskKind::Loop, period, Work::Loop(work))
    }

    fn build(id: u64, kind: TaskKind, delay: Duration, work: Work) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                kind,
                delay,
                work,
                next_fire: Mutex::new(Instant::now().checked_add(delay)),
                running: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                owner: Mutex::new(None),
                runs: AtomicU64::new(0),
            }),
        }
    }

    /// Unique handle id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether this is a one-shot or repeating task
    pub fn kind(&self) -> TaskKind {
        self.inner.kind
    }

    /// Initial delay (once) or period (loop)
    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    /// Check if the work is executing right now
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Check if the handle was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Number of completed executions
    pub fn run_count(&self) -> u64 {
        self.inner.runs.load(Ordering::SeqCst)
    }

    /// Time left until the handle becomes due (zero if already due,
    /// `Duration::MAX` if it never will be)
    pub fn next_fire_in(&self) -> Duration {
        match *lock(&self.inner.next_fire) {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// Cancel the task.
    ///
    /// No further executions are dispatched. An execution already in flight
    /// is only asked to stop: its owning thread is unparked so that
    /// [`TaskContext::sleep`] returns early, and [`TaskContext::is_cancelled`]
    /// turns true.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(handle = self.inner.id, "Task cancelled");
        if let Some(owner) = lock(&self.inner.owner).as_ref() {
            owner.unpark();
        }
    }

    /// Due for dispatch: not running, not cancelled, fire time reached
    pub(crate) fn is_due(&self, now: Instant) -> bool {
        !self.is_running()
            && !self.is_cancelled()
            && lock(&self.inner.next_fire).is_some_and(|at| now >= at)
    }

    /// Mark running; false if another dispatch already claimed it
    pub(crate) fn try_claim(&self) -> bool {
        self.inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Undo a claim whose dispatch was rejected
    pub(crate) fn release(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Execute the work on the current thread.
    ///
    /// Errors and panics are caught and logged. Loop tasks are rearmed
    /// relative to the completion time before the running flag clears.
    pub(crate) fn run(&self) {
        let inner = &self.inner;
        if self.is_cancelled() {
            self.release();
            return;
        }

        *lock(&inner.owner) = Some(thread::current());
        let ctx = TaskContext { handle: inner };

        let outcome = match &inner.work {
            Work::Once(slot) => {
                let work = lock(slot).take();
                match work {
                    Some(work) => catch_unwind(AssertUnwindSafe(|| work(&ctx))),
                    None => Ok(Ok(())),
                }
            }
            Work::Loop(work) => catch_unwind(AssertUnwindSafe(|| work(&ctx))),
        };

        *lock(&inner.owner) = None;
        inner.runs.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(handle = inner.id, kind = ?inner.kind, "Scheduled task failed: {:#}", e);
            }
            Err(payload) => {
                tracing::error!(
                    handle = inner.id,
                    kind = ?inner.kind,
                    "Scheduled task panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }

        if inner.kind == TaskKind::Loop && !self.is_cancelled() {
            *lock(&inner.next_fire) = Instant::now().checked_add(inner.delay);
        }
        self.release();
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("delay", &self.inner.delay)
            .field("running", &self.is_running())
            .field("cancelled", &self.is_cancelled())
            .field("runs", &self.run_count())
            .finish()
    }
}

/// View of the executing task handed to scheduled work
pub struct TaskContext<'a> {
    handle: &'a HandleInner,
}

impl TaskContext<'_> {
    /// Id of the handle being executed
    pub fn handle_id(&self) -> u64 {
        self.handle.id
    }

    /// Check whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.handle.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` if the full duration elapsed, `false` if the sleep
    /// was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        loop {
            if self.is_cancelled() {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return true;
                    }
                    thread::park_timeout(deadline - now);
                }
                // Past the end of the clock: only cancellation ends it
                None => thread::park(),
            }
        }
    }
}
