//! Transfer task state machine
//!
//! A [`TransferTask`] describes one upload or download. Its mutable state
//! lives behind a single mutex so that snapshots read by UI threads are
//! always consistent, while only the worker executing the task advances its
//! progress.

use super::events::TransferEvent;
use crate::error::TransferError;
use crate::events::EventBus;
use crate::sync::lock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Which way the bytes flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// Local to remote
    Upload,
    /// Remote to local
    Download,
}

/// Lifecycle state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Queued, not yet admitted
    Waiting,
    /// Admitted and moving bytes
    Running,
    /// Halted by the user; keeps its progress
    Paused,
    /// Finished successfully
    Complete,
    /// Failed with an error message
    Error,
    /// Cancelled by the user
    Cancelled,
}

impl TransferStatus {
    /// Complete, error or cancelled
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    /// Statuses only move forward, except for Running and Paused which
    /// may alternate.
    pub fn can_transition_to(self, next: Self) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Waiting, Running | Paused | Cancelled) => true,
            (Running, Paused | Complete | Error | Cancelled) => true,
            (Paused, Running | Complete | Error | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The byte-moving logic behind a task, supplied by the protocol layer.
///
/// Implementations report progress through the context and call
/// [`TransferContext::checkpoint`] between chunks so that pause and cancel
/// take effect. A resumed run starts from [`TransferContext::transferred`].
pub trait Transfer: Send + Sync {
    /// Move the bytes
    fn run(&self, ctx: &TransferContext<'_>) -> Result<(), TransferError>;
}

impl<F> Transfer for F
where
    F: Fn(&TransferContext<'_>) -> Result<(), TransferError> + Send + Sync,
{
    fn run(&self, ctx: &TransferContext<'_>) -> Result<(), TransferError> {
        self(ctx)
    }
}

#[derive(Debug)]
struct TaskState {
    status: TransferStatus,
    total: Option<u64>,
    transferred: u64,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    /// Paused task asked to run again on the next admission pass
    resume_requested: bool,
    /// An execution is still on a worker thread
    in_flight: bool,
}

/// One queued file transfer
pub struct TransferTask {
    id: u64,
    local_path: PathBuf,
    remote_path: String,
    direction: TransferDirection,
    transfer: Arc<dyn Transfer>,
    state: Mutex<TaskState>,
}

impl TransferTask {
    /// Create a waiting task around the given byte-moving logic
    pub fn new(
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        direction: TransferDirection,
        transfer: impl Transfer + 'static,
    ) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            direction,
            transfer: Arc::new(transfer),
            state: Mutex::new(TaskState {
                status: TransferStatus::Waiting,
                total: None,
                transferred: 0,
                error: None,
                started_at: None,
                finished_at: None,
                resume_requested: false,
                in_flight: false,
            }),
        }
    }

    /// Create a waiting task around a closure
    pub fn from_fn<F>(
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        direction: TransferDirection,
        run: F,
    ) -> Self
    where
        F: Fn(&TransferContext<'_>) -> Result<(), TransferError> + Send + Sync + 'static,
    {
        Self::new(local_path, remote_path, direction, run)
    }

    /// Set the total size up front, when the submitter already knows it
    pub fn with_total(self, total: u64) -> Self {
        lock(&self.state).total = Some(total);
        self
    }

    /// Unique task id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Local side of the transfer
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Remote side of the transfer
    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    /// Upload or download
    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// Current status
    pub fn status(&self) -> TransferStatus {
        lock(&self.state).status
    }

    /// Bytes moved so far
    pub fn transferred(&self) -> u64 {
        lock(&self.state).transferred
    }

    /// Total size, if known
    pub fn total(&self) -> Option<u64> {
        lock(&self.state).total
    }

    /// Error message of a failed task
    pub fn error(&self) -> Option<String> {
        lock(&self.state).error.clone()
    }

    /// Consistent copy of the task's current state
    pub fn snapshot(&self) -> TaskSnapshot {
        let state = lock(&self.state);
        self.snapshot_of(&state)
    }

    fn snapshot_of(&self, state: &TaskState) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            local_path: self.local_path.clone(),
            remote_path: self.remote_path.clone(),
            direction: self.direction,
            status: state.status,
            transferred: state.transferred,
            total: state.total,
            error: state.error.clone(),
            started_at: state.started_at,
            finished_at: state.finished_at,
        }
    }

    pub(crate) fn transfer(&self) -> Arc<dyn Transfer> {
        Arc::clone(&self.transfer)
    }

    /// Apply a status change if allowed, returning the new snapshot.
    ///
    /// The finish time is stamped on the first terminal transition only.
    pub(crate) fn transition(&self, next: TransferStatus, error: Option<String>) -> Option<TaskSnapshot> {
        let mut state = lock(&self.state);
        if !state.status.can_transition_to(next) {
            return None;
        }
        state.status = next;
        state.resume_requested = false;
        if next == TransferStatus::Error {
            state.error = error;
        }
        if next == TransferStatus::Running && state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
        if next.is_terminal() && state.finished_at.is_none() {
            state.finished_at = Some(Utc::now());
        }
        Some(self.snapshot_of(&state))
    }

    /// Admit the task if it is waiting, or paused with a pending resume,
    /// and no earlier execution is still winding down.
    pub(crate) fn try_admit(&self) -> Option<TaskSnapshot> {
        let mut state = lock(&self.state);
        let admissible = state.status == TransferStatus::Waiting
            || (state.status == TransferStatus::Paused && state.resume_requested);
        if state.in_flight || !admissible {
            return None;
        }
        state.status = TransferStatus::Running;
        state.resume_requested = false;
        state.in_flight = true;
        if state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
        Some(self.snapshot_of(&state))
    }

    /// The worker finished with this task
    pub(crate) fn end_execution(&self) {
        lock(&self.state).in_flight = false;
    }

    /// Flag a paused task for re-admission; false if it is not paused
    pub(crate) fn request_resume(&self) -> bool {
        let mut state = lock(&self.state);
        if state.status == TransferStatus::Paused {
            state.resume_requested = true;
            true
        } else {
            false
        }
    }

    fn set_total(&self, total: u64) -> TaskSnapshot {
        let mut state = lock(&self.state);
        // Never shrinks, and never drops below what already moved
        let floor = state.total.unwrap_or(0).max(state.transferred);
        state.total = Some(total.max(floor));
        self.snapshot_of(&state)
    }

    fn advance(&self, bytes: u64) -> TaskSnapshot {
        let mut state = lock(&self.state);
        let moved = state.transferred.saturating_add(bytes);
        state.transferred = match state.total {
            Some(total) => moved.min(total),
            None => moved,
        };
        self.snapshot_of(&state)
    }
}

impl fmt::Debug for TransferTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("TransferTask")
            .field("id", &self.id)
            .field("local_path", &self.local_path)
            .field("remote_path", &self.remote_path)
            .field("direction", &self.direction)
            .field("state", &*state)
            .finish()
    }
}

/// Point-in-time view of a task, carried by every event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    /// Task id
    pub id: u64,
    /// Local path
    pub local_path: PathBuf,
    /// Remote path
    pub remote_path: String,
    /// Upload or download
    pub direction: TransferDirection,
    /// Status at snapshot time
    pub status: TransferStatus,
    /// Bytes moved
    pub transferred: u64,
    /// Total size, if known
    pub total: Option<u64>,
    /// Error message, if failed
    pub error: Option<String>,
    /// First time the task started running
    pub started_at: Option<DateTime<Utc>>,
    /// Time of the terminal transition
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    /// Completion percentage, if the total is known
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some(self.transferred as f64 / total as f64 * 100.0),
            None => None,
        }
    }

    /// Time spent since the first start (up to the finish, if finished)
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }

    /// Average throughput in bytes/second
    pub fn throughput(&self) -> Option<f64> {
        let secs = self.elapsed()?.num_milliseconds() as f64 / 1000.0;
        if secs > 0.0 {
            Some(self.transferred as f64 / secs)
        } else {
            None
        }
    }
}

/// Handle given to a running [`Transfer`]
pub struct TransferContext<'a> {
    task: &'a TransferTask,
    events: &'a EventBus<TransferEvent>,
}

impl<'a> TransferContext<'a> {
    pub(crate) fn new(task: &'a TransferTask, events: &'a EventBus<TransferEvent>) -> Self {
        Self { task, events }
    }

    /// Id of the task being executed
    pub fn task_id(&self) -> u64 {
        self.task.id
    }

    /// Local side of the transfer
    pub fn local_path(&self) -> &Path {
        &self.task.local_path
    }

    /// Remote side of the transfer
    pub fn remote_path(&self) -> &str {
        &self.task.remote_path
    }

    /// Record the total size once known
    pub fn set_total(&self, total: u64) {
        let snapshot = self.task.set_total(total);
        self.events.emit(&TransferEvent::Progress(snapshot));
    }

    /// Record `bytes` more moved and notify listeners
    pub fn advance(&self, bytes: u64) {
        let snapshot = self.task.advance(bytes);
        self.events.emit(&TransferEvent::Progress(snapshot));
    }

    /// Bytes moved so far; a resumed run continues from here
    pub fn transferred(&self) -> u64 {
        self.task.transferred()
    }

    /// Total size, if known
    pub fn total(&self) -> Option<u64> {
        self.task.total()
    }

    /// Check if the task was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.task.status() == TransferStatus::Cancelled
    }

    /// Stop here if the task was paused or cancelled
    pub fn checkpoint(&self) -> Result<(), TransferError> {
        match self.task.status() {
            TransferStatus::Cancelled => Err(TransferError::Cancelled),
            TransferStatus::Paused => Err(TransferError::Paused),
            _ => Ok(()),
        }
    }
}
