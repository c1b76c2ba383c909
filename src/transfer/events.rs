//! Transfer lifecycle events

use super::task::TaskSnapshot;

/// Notification sent to transfer listeners.
///
/// Every variant carries the task's snapshot taken right after the change.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Task entered the queue
    Added(TaskSnapshot),
    /// Task was admitted and started (or resumed) running
    Started(TaskSnapshot),
    /// Bytes moved or total size learned
    Progress(TaskSnapshot),
    /// Task was paused
    Paused(TaskSnapshot),
    /// Task finished successfully
    Complete(TaskSnapshot),
    /// Task failed; the snapshot carries the error message
    Error(TaskSnapshot),
    /// Task was cancelled
    Cancelled(TaskSnapshot),
    /// Task left the queue
    Removed(TaskSnapshot),
}

impl TransferEvent {
    /// Snapshot of the affected task
    pub fn snapshot(&self) -> &TaskSnapshot {
        match self {
            Self::Added(s)
            | Self::Started(s)
            | Self::Progress(s)
            | Self::Paused(s)
            | Self::Complete(s)
            | Self::Error(s)
            | Self::Cancelled(s)
            | Self::Removed(s) => s,
        }
    }

    /// Id of the affected task
    pub fn task_id(&self) -> u64 {
        self.snapshot().id
    }

    /// Short event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Started(_) => "started",
            Self::Progress(_) => "progress",
            Self::Paused(_) => "paused",
            Self::Complete(_) => "complete",
            Self::Error(_) => "error",
            Self::Cancelled(_) => "cancelled",
            Self::Removed(_) => "removed",
        }
    }
}
