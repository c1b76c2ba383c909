//! File transfer queue
//!
//! Uploads and downloads are queued as [`TransferTask`]s and admitted in
//! FIFO order up to a concurrency cap. Listeners follow each task through
//! [`TransferEvent`]s.

mod events;
mod local;
mod queue;
mod task;
mod throttle;

pub use crate::error::TransferError;
pub use events::TransferEvent;
pub use local::LocalCopy;
pub use queue::TransferQueue;
pub use task::{
    TaskSnapshot, Transfer, TransferContext, TransferDirection, TransferStatus, TransferTask,
};
pub use throttle::BandwidthLimiter;
