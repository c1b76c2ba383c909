//! # TermCore - background machinery for terminal sessions
//!
//! TermCore is the concurrency core of a terminal/SSH client. The protocol
//! and UI layers hand it work; it decides when and where that work runs and
//! reports back through events.
//!
//! ## Components
//!
//! - **Task scheduler**: one-shot delayed work, fixed-delay loops and
//!   result-bearing submissions on a cached worker pool
//! - **Transfer queue**: uploads and downloads admitted FIFO up to a
//!   concurrency cap, with pause, resume and cancel
//! - **Relay**: two byte pumps joining the ends of a forwarded port
//! - **Event bus**: thread-safe listener lists feeding the UI
//!
//! ## Quick Start
//!
//! ```no_run
//! use termcore::config::SchedulerConfig;
//! use termcore::scheduler::TaskScheduler;
//! use std::time::Duration;
//!
//! let scheduler = TaskScheduler::new(SchedulerConfig::default()).unwrap();
//!
//! // Keep-alive check every 30 seconds
//! let keep_alive = scheduler
//!     .schedule_loop(|_ctx| {
//!         println!("ping");
//!         Ok(())
//!     }, Duration::from_secs(30))
//!     .unwrap();
//!
//! keep_alive.cancel();
//! scheduler.shutdown();
//! ```
//!
//! ## Transfers
//!
//! ```no_run
//! use termcore::transfer::{LocalCopy, TransferDirection, TransferEvent, TransferQueue, TransferTask};
//! use std::sync::Arc;
//!
//! let queue = TransferQueue::new(3).unwrap();
//! queue.subscribe(|event: &TransferEvent| println!("{} #{}", event.name(), event.task_id()));
//!
//! let task = TransferTask::new(
//!     "/tmp/report.pdf",
//!     "/home/user/report.pdf",
//!     TransferDirection::Download,
//!     LocalCopy::new("/home/user/report.pdf", "/tmp/report.pdf"),
//! );
//! queue.add_task(Arc::new(task));
//! ```
//!
//! ## Port Forwarding
//!
//! ```no_run
//! use termcore::relay::Relay;
//! use std::net::TcpStream;
//!
//! let local = TcpStream::connect("127.0.0.1:9000").unwrap();
//! let remote = TcpStream::connect("10.0.0.5:80").unwrap();
//!
//! let handle = Relay::default().forward(local, remote).unwrap();
//! let stats = handle.join();
//! println!("{} bytes relayed", stats.total_bytes());
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod progress;
pub mod relay;
pub mod scheduler;
pub mod transfer;

mod sync;

// Re-export commonly used types
pub use config::CoreConfig;
pub use error::{Result, TermCoreError, TransferError};
pub use relay::{Relay, RelayHandle};
pub use scheduler::{TaskHandle, TaskScheduler};
pub use transfer::{TransferQueue, TransferTask};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use termcore::prelude::*;
    //! ```

    pub use crate::config::{CoreConfig, RelayConfig, SchedulerConfig, TransferConfig};
    pub use crate::error::{Result, TermCoreError, TransferError};
    pub use crate::events::{EventBus, Listener, ListenerId};
    pub use crate::progress::ProgressReporter;
    pub use crate::relay::{Connector, PortForwarder, Relay, RelayHandle, RelayStats, RelayStream, TcpConnector};
    pub use crate::scheduler::{TaskContext, TaskFuture, TaskHandle, TaskKind, TaskScheduler};
    pub use crate::transfer::{
        BandwidthLimiter, LocalCopy, TaskSnapshot, Transfer, TransferContext, TransferDirection,
        TransferEvent, TransferQueue, TransferStatus, TransferTask,
    };
}
