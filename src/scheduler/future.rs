//! Result-bearing submissions

use crate::error::{Result, TermCoreError};
use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

pub(crate) type Outcome<T> = std::result::Result<T, String>;

/// Pending result of [`TaskScheduler::submit`](super::TaskScheduler::submit)
#[derive(Debug)]
pub struct TaskFuture<T> {
    receiver: Receiver<Outcome<T>>,
}

impl<T> TaskFuture<T> {
    pub(crate) fn new(receiver: Receiver<Outcome<T>>) -> Self {
        Self { receiver }
    }

    /// Block until the work finishes
    pub fn wait(self) -> Result<T> {
        match self.receiver.recv() {
            Ok(outcome) => outcome.map_err(TermCoreError::TaskFailed),
            Err(_) => Err(dropped()),
        }
    }

    /// Block for at most `timeout`; `None` if the work is still running
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome.map_err(TermCoreError::TaskFailed)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(dropped())),
        }
    }

    /// Take the result if it is ready
    pub fn try_take(&self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome.map_err(TermCoreError::TaskFailed)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(dropped())),
        }
    }
}

fn dropped() -> TermCoreError {
    TermCoreError::TaskFailed("task was dropped before completing".to_string())
}
