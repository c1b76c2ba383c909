//! Deferred and looping task scheduler
//!
//! A single poll thread wakes on a short fixed interval, scans the live
//! handles and dispatches every due, idle, uncancelled one onto a cached
//! worker pool.
//!
//! ```text
//!   schedule_once / schedule_loop
//!               │
//!               ▼
//!     ┌───────────────────┐   every poll_interval   ┌──────────────────┐
//!     │ live: Vec<Handle> │ ──── due & idle ──────▶ │ WorkerPool       │
//!     └───────────────────┘                         │ (grows on demand)│
//!               ▲                                   └────────┬─────────┘
//!               └──── loop tasks rearmed after completion ───┘
//! ```
//!
//! One-shot handles leave the live set when dispatched. Loop handles stay
//! until cancelled and are rearmed one period after each run *completes*,
//! so delays accumulate under load. A failing loop task keeps running on
//! its schedule; callers that want fail-fast behavior cancel it themselves.

mod future;
mod handle;
mod pool;

pub use future::TaskFuture;
pub use handle::{TaskContext, TaskHandle, TaskKind};

use crate::config::SchedulerConfig;
use crate::error::{panic_message, Result, TermCoreError};
use crate::sync::lock;
use crossbeam::channel::bounded;
use pool::WorkerPool;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct Shared {
    config: SchedulerConfig,
    live: Mutex<Vec<TaskHandle>>,
    pool: WorkerPool,
    shutdown: AtomicBool,
    next_id: AtomicU64,
}

/// Scheduler for one-shot, repeating and immediate background work
pub struct TaskScheduler {
    shared: Arc<Shared>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Create a scheduler and start its poll thread
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        if config.poll_interval().is_zero() {
            return Err(TermCoreError::config("scheduler poll interval must be non-zero"));
        }

        let shared = Arc::new(Shared {
            pool: WorkerPool::new("termcore-worker", config.worker_keep_alive()),
            config,
            live: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        });

        let poll_shared = Arc::clone(&shared);
        let poller = thread::Builder::new()
            .name("termcore-scheduler".to_string())
            .spawn(move || poll_loop(&poll_shared))
            .map_err(|e| TermCoreError::io("spawning scheduler poll thread", e))?;

        tracing::debug!(
            poll_interval_ms = shared.config.poll_interval_ms,
            "Task scheduler started"
        );

        Ok(Self {
            shared,
            poller: Mutex::new(Some(poller)),
        })
    }

    /// Run `work` once, no earlier than `delay` from now
    pub fn schedule_once<F>(&self, work: F, delay: Duration) -> Result<TaskHandle>
    where
        F: FnOnce(&TaskContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.ensure_running()?;
        let handle = TaskHandle::once(self.next_id(), delay, Box::new(work));
        self.track(&handle);
        Ok(handle)
    }

    /// Run `work` repeatedly, `period` after each run completes.
    ///
    /// The first run happens one period from now.
    pub fn schedule_loop<F>(&self, work: F, period: Duration) -> Result<TaskHandle>
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let handle = TaskHandle::looping(self.next_id(), period, Box::new(work));
        self.track(&handle);
        Ok(handle)
    }

    /// Cancel a handle and drop it from the live set
    pub fn cancel(&self, handle: &TaskHandle) {
        handle.cancel();
        lock(&self.shared.live).retain(|h| h.id() != handle.id());
    }

    /// Dispatch `work` immediately, bypassing the poll loop
    pub fn run_now<F>(&self, work: F) -> Result<TaskHandle>
    where
        F: FnOnce(&TaskContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.ensure_running()?;
        let handle = TaskHandle::once(self.next_id(), Duration::ZERO, Box::new(work));
        dispatch(&self.shared, handle.clone())?;
        Ok(handle)
    }

    /// Dispatch result-bearing work immediately.
    ///
    /// An error or panic in `work` is delivered through the future only.
    pub fn submit<T, F>(&self, work: F) -> Result<TaskFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext<'_>) -> anyhow::Result<T> + Send + 'static,
    {
        let (sender, receiver) = bounded(1);
        self.run_now(move |ctx| {
            let outcome = match catch_unwind(AssertUnwindSafe(|| work(ctx))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(payload) => Err(panic_message(payload.as_ref())),
            };
            if let Err(message) = &outcome {
                tracing::debug!(handle = ctx.handle_id(), "Submitted task failed: {}", message);
            }
            // The caller may have dropped the future
            let _ = sender.send(outcome);
            Ok(())
        })?;
        Ok(TaskFuture::new(receiver))
    }

    /// Number of handles still waiting for dispatch or rearm
    pub fn live_count(&self) -> usize {
        lock(&self.shared.live).len()
    }

    /// Number of worker threads currently alive
    pub fn worker_count(&self) -> usize {
        self.shared.pool.worker_count()
    }

    /// Check if shutdown was signaled
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Stop the poll loop and reject new work.
    ///
    /// Work already running is left to finish on its own.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.pool.shutdown();
        lock(&self.shared.live).clear();

        if let Some(poller) = lock(&self.poller).take() {
            if poller.thread().id() != thread::current().id() && poller.join().is_err() {
                tracing::error!("Scheduler poll thread panicked");
            }
        }
        tracing::debug!("Task scheduler shut down");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() || self.shared.pool.is_shutdown() {
            Err(TermCoreError::SchedulerShutdown)
        } else {
            Ok(())
        }
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn track(&self, handle: &TaskHandle) {
        tracing::trace!(handle = handle.id(), kind = ?handle.kind(), delay = ?handle.delay(), "Task scheduled");
        lock(&self.shared.live).push(handle.clone());
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn poll_loop(shared: &Shared) {
    let interval = shared.config.poll_interval();
    while !shared.shutdown.load(Ordering::SeqCst) {
        let due = collect_due(shared, Instant::now());
        for handle in due {
            if let Err(e) = dispatch(shared, handle) {
                tracing::warn!("Failed to dispatch scheduled task: {}", e);
            }
        }
        thread::sleep(interval);
    }
}

/// Claim every due handle. One-shot handles leave the live set here.
fn collect_due(shared: &Shared, now: Instant) -> Vec<TaskHandle> {
    let mut live = lock(&shared.live);
    let mut due = Vec::new();
    live.retain(|handle| {
        if handle.is_cancelled() {
            return false;
        }
        if handle.is_due(now) && handle.try_claim() {
            due.push(handle.clone());
            return handle.kind() == TaskKind::Loop;
        }
        true
    });
    due
}

/// Send a claimed (or claimable) handle to the worker pool
fn dispatch(shared: &Shared, handle: TaskHandle) -> Result<()> {
    // Claims made by the poll loop stay; direct dispatch claims here
    let _ = handle.try_claim();
    let runner = handle.clone();
    shared.pool.execute(move || runner.run()).map_err(|e| {
        handle.release();
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn scheduler() -> TaskScheduler {
        TaskScheduler::new(SchedulerConfig::default()).unwrap()
    }

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_once_respects_delay() {
        let sched = scheduler();
        let (tx, rx) = bounded(1);
        let scheduled_at = Instant::now();
        sched
            .schedule_once(
                move |_| {
                    tx.send(Instant::now()).unwrap();
                    Ok(())
                },
                Duration::from_millis(100),
            )
            .unwrap();

        let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired_at.duration_since(scheduled_at) >= Duration::from_millis(100));
        assert!(wait_until(Duration::from_secs(1), || sched.live_count() == 0));
    }

    #[test]
    fn test_once_runs_at_most_once() {
        let sched = scheduler();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = sched
            .schedule_once(
                move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Duration::ZERO,
            )
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || handle.run_count() == 1));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_loop_spacing_follows_completion() {
        let sched = scheduler();
        let stamps = Arc::new(Mutex::new(Vec::<(Instant, Instant)>::new()));
        let s = stamps.clone();
        let handle = sched
            .schedule_loop(
                move |_| {
                    let start = Instant::now();
                    thread::sleep(Duration::from_millis(20));
                    lock(&s).push((start, Instant::now()));
                    Ok(())
                },
                Duration::from_millis(30),
            )
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || lock(&stamps).len() >= 4));
        sched.cancel(&handle);

        let stamps = lock(&stamps);
        for pair in stamps.windows(2) {
            let (_, prev_end) = pair[0];
            let (next_start, _) = pair[1];
            assert!(next_start.duration_since(prev_end) >= Duration::from_millis(30));
        }
    }

    #[test]
    fn test_cancel_before_fire_prevents_execution() {
        let sched = scheduler();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = sched
            .schedule_once(
                move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Duration::from_millis(50),
            )
            .unwrap();
        sched.cancel(&handle);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(sched.live_count(), 0);
    }

    #[test]
    fn test_cancelled_loop_stops() {
        let sched = scheduler();
        let handle = sched
            .schedule_loop(|_| Ok(()), Duration::from_millis(10))
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || handle.run_count() >= 2));

        handle.cancel();
        // Let any in-flight run drain
        assert!(wait_until(Duration::from_secs(1), || !handle.is_running()));
        let runs = handle.run_count();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(handle.run_count(), runs);
        assert!(wait_until(Duration::from_secs(1), || sched.live_count() == 0));
    }

    #[test]
    fn test_failing_loop_keeps_retrying() {
        let sched = scheduler();
        let handle = sched
            .schedule_loop(|_| anyhow::bail!("keep-alive check failed"), Duration::from_millis(10))
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || handle.run_count() >= 3));
        assert!(!handle.is_cancelled());
        sched.cancel(&handle);
    }

    #[test]
    fn test_panicking_task_does_not_stop_poll_loop() {
        let sched = scheduler();
        sched
            .schedule_once(|_| panic!("bad task"), Duration::ZERO)
            .unwrap();

        let (tx, rx) = bounded(1);
        sched
            .schedule_once(
                move |_| {
                    tx.send(()).unwrap();
                    Ok(())
                },
                Duration::from_millis(20),
            )
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_submit_returns_value_and_errors() {
        let sched = scheduler();
        let ok = sched.submit(|_| Ok(6 * 7)).unwrap();
        assert_eq!(ok.wait().unwrap(), 42);

        let failed = sched
            .submit(|_| -> anyhow::Result<()> { anyhow::bail!("no route to host") })
            .unwrap();
        match failed.wait() {
            Err(TermCoreError::TaskFailed(msg)) => assert!(msg.contains("no route to host")),
            other => panic!("unexpected: {:?}", other),
        }

        let panicked = sched.submit(|_| -> anyhow::Result<u8> { panic!("exploded") }).unwrap();
        assert!(matches!(panicked.wait(), Err(TermCoreError::TaskFailed(_))));
    }

    #[test]
    fn test_run_now_skips_poll_loop() {
        let sched = scheduler();
        let (tx, rx) = bounded(1);
        sched
            .run_now(move |_| {
                tx.send(()).unwrap();
                Ok(())
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(sched.live_count(), 0);
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let sched = scheduler();
        sched.shutdown();
        assert!(sched.is_shutdown());
        assert!(matches!(
            sched.schedule_once(|_| Ok(()), Duration::ZERO),
            Err(TermCoreError::SchedulerShutdown)
        ));
        assert!(matches!(
            sched.run_now(|_| Ok(())),
            Err(TermCoreError::SchedulerShutdown)
        ));
        // Idempotent
        sched.shutdown();
    }

    #[test]
    fn test_unrepresentable_delay_never_fires() {
        let sched = scheduler();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let once = sched
            .schedule_once(
                move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Duration::MAX,
            )
            .unwrap();
        let looping = sched
            .schedule_loop(|_| Ok(()), Duration::from_secs(u64::MAX))
            .unwrap();

        assert_eq!(once.next_fire_in(), Duration::MAX);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(looping.run_count(), 0);
        assert_eq!(sched.live_count(), 2);

        sched.cancel(&once);
        sched.cancel(&looping);
        assert_eq!(sched.live_count(), 0);
    }

    #[test]
    fn test_sleep_without_deadline_ends_on_cancel() {
        let sched = scheduler();
        let (tx, rx) = bounded(1);
        let handle = sched
            .run_now(move |ctx| {
                tx.send(ctx.sleep(Duration::MAX)).unwrap();
                Ok(())
            })
            .unwrap();

        thread::sleep(Duration::from_millis(30));
        handle.cancel();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(false));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = SchedulerConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            TaskScheduler::new(config),
            Err(TermCoreError::Config(_))
        ));
    }
}
