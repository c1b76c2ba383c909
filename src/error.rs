//! Error types for TermCore
//!
//! This module defines the errors surfaced across the public submission
//! boundary of the scheduler, the transfer queue and the relay. Failures
//! inside individual units of work never travel through these types to the
//! caller; they are logged or reported through listener events instead.

use thiserror::Error;

/// Main error type for TermCore operations
#[derive(Error, Debug)]
pub enum TermCoreError {
    /// I/O error with context
    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Concurrency cap must be at least one
    #[error("Invalid concurrency cap: {0} (must be at least 1)")]
    InvalidConcurrency(usize),

    /// Work submitted after shutdown
    #[error("Scheduler has been shut down")]
    SchedulerShutdown,

    /// A result-bearing task failed or panicked
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// No task with this id is tracked
    #[error("Task not found: {0}")]
    TaskNotFound(u64),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection could not be established or accepted
    #[error("Connection error to '{addr}': {message}")]
    Connection { addr: String, message: String },

    /// Thread pool could not be built
    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

impl TermCoreError {
    /// Create an I/O error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a connection error
    pub fn connection(addr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            addr: addr.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Check if this error is a contract violation by the caller
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidConcurrency(_) | Self::SchedulerShutdown | Self::TaskNotFound(_)
        )
    }
}

/// Result type alias for TermCore operations
pub type Result<T> = std::result::Result<T, TermCoreError>;

impl From<std::io::Error> for TermCoreError {
    fn from(err: std::io::Error) -> Self {
        TermCoreError::io("unspecified", err)
    }
}

impl From<serde_json::Error> for TermCoreError {
    fn from(err: serde_json::Error) -> Self {
        TermCoreError::Config(err.to_string())
    }
}

/// Outcome of the byte-moving logic behind one transfer.
///
/// `Cancelled` and `Paused` are interrupts raised at a checkpoint, not
/// failures; only the remaining variants put a task into the error state.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Underlying stream or file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Task was cancelled while running
    #[error("Transfer cancelled")]
    Cancelled,

    /// Task was paused while running
    #[error("Transfer paused")]
    Paused,

    /// Protocol layer reported a failure
    #[error("{0}")]
    Failed(String),
}

impl TransferError {
    /// Create a protocol-level failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Check if this is a checkpoint interrupt rather than a failure
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Paused)
    }
}

/// Extension trait for adding context to std::io::Result
pub trait IoResultExt<T> {
    /// Add context to an I/O error
    fn with_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| TermCoreError::io(context, e))
    }
}

/// Render a caught panic payload as a message
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
