//! Progress reporter implementation
//!
//! Renders transfer queue events with indicatif:
//! - One bar per transfer with bytes, throughput and ETA
//! - An overall line counting finished transfers
//! - Hidden draw target for quiet mode

use crate::events::Listener;
use crate::sync::lock;
use crate::transfer::{TaskSnapshot, TransferEvent, TransferStatus};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const BAR_TEMPLATE: &str =
    "{prefix:.bold.dim} [{bar:40.green/white}] {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta}) {msg}";

/// Transfer queue listener drawing progress bars
pub struct ProgressReporter {
    /// Multi-progress container
    multi: MultiProgress,
    /// Overall status line
    status: ProgressBar,
    /// Per-task bars, keyed by task id
    bars: Mutex<HashMap<u64, ProgressBar>>,
    /// Start time
    start_time: Instant,
    /// Transfers seen
    added: AtomicU64,
    /// Transfers finished successfully
    completed: AtomicU64,
    /// Transfers failed
    failed: AtomicU64,
    /// Transfers cancelled
    cancelled: AtomicU64,
    /// Bytes moved by finished transfers
    bytes_done: AtomicU64,
    /// Is progress enabled
    enabled: AtomicBool,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let multi = MultiProgress::new();

        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(spinner_style());
        status.enable_steady_tick(Duration::from_millis(120));

        Self {
            multi,
            status,
            bars: Mutex::new(HashMap::new()),
            start_time: Instant::now(),
            added: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            bytes_done: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Create a disabled progress reporter (for quiet mode)
    pub fn disabled() -> Self {
        let reporter = Self::new();
        reporter.enabled.store(false, Ordering::SeqCst);
        reporter.multi.set_draw_target(ProgressDrawTarget::hidden());
        reporter.status.disable_steady_tick();
        reporter
    }

    /// Check if progress is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finish the status line with a final message
    pub fn finish(&self) {
        let summary = self.summary();
        let mark = if summary.failed == 0 { "✓" } else { "✗" };
        self.status.finish_with_message(format!(
            "{} {}/{} transfers complete, {} in {:.1?}",
            mark,
            summary.completed,
            summary.added,
            humansize::format_size(summary.bytes_done, humansize::BINARY),
            summary.elapsed
        ));
    }

    /// Get progress summary
    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            added: self.added.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
        }
    }

    fn bar(&self, snapshot: &TaskSnapshot) -> ProgressBar {
        let mut bars = lock(&self.bars);
        bars.entry(snapshot.id)
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(snapshot.total.unwrap_or(0)));
                bar.set_style(bar_style());
                bar.set_prefix(short_name(&snapshot.remote_path));
                bar
            })
            .clone()
    }

    fn update(&self, snapshot: &TaskSnapshot) {
        let bar = self.bar(snapshot);
        if let Some(total) = snapshot.total {
            bar.set_length(total);
        }
        bar.set_position(snapshot.transferred);
    }

    fn finish_bar(&self, snapshot: &TaskSnapshot) {
        let Some(bar) = lock(&self.bars).remove(&snapshot.id) else {
            return;
        };
        bar.set_position(snapshot.transferred);
        match snapshot.status {
            TransferStatus::Complete => bar.finish_with_message("✓"),
            TransferStatus::Error => {
                let error = snapshot.error.as_deref().unwrap_or("failed");
                bar.abandon_with_message(format!("✗ {error}"));
            }
            _ => bar.abandon_with_message("cancelled"),
        }
    }

    fn refresh_status(&self) {
        let summary = self.summary();
        self.status.set_message(format!(
            "{}/{} transfers done, {} failed",
            summary.completed + summary.cancelled,
            summary.added,
            summary.failed
        ));
    }
}

impl Listener<TransferEvent> for ProgressReporter {
    fn on_event(&self, event: &TransferEvent) {
        match event {
            TransferEvent::Added(snapshot) => {
                self.added.fetch_add(1, Ordering::Relaxed);
                self.bar(snapshot).set_message("waiting");
            }
            TransferEvent::Started(snapshot) => {
                let bar = self.bar(snapshot);
                bar.set_message("");
                bar.reset_eta();
            }
            // A worker may still report bytes after a cancel finished the bar
            TransferEvent::Progress(snapshot) if snapshot.status.is_terminal() => {}
            TransferEvent::Progress(snapshot) => self.update(snapshot),
            TransferEvent::Paused(snapshot) => self.bar(snapshot).set_message("paused"),
            TransferEvent::Complete(snapshot) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.bytes_done.fetch_add(snapshot.transferred, Ordering::Relaxed);
                self.finish_bar(snapshot);
            }
            TransferEvent::Error(snapshot) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.finish_bar(snapshot);
            }
            TransferEvent::Cancelled(snapshot) => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                self.finish_bar(snapshot);
            }
            TransferEvent::Removed(snapshot) => self.finish_bar(snapshot),
        }
        self.refresh_status();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Last path component, truncated for the bar prefix
fn short_name(path: &str) -> String {
    let name = path.rsplit(['/', '\\']).find(|s| !s.is_empty()).unwrap_or(path);
    if name.chars().count() > 24 {
        let tail: String = name.chars().rev().take(21).collect::<Vec<_>>().into_iter().rev().collect();
        format!("...{tail}")
    } else {
        name.to_string()
    }
}

/// Progress summary
#[derive(Debug, Clone)]
pub struct ProgressSummary {
    /// Transfers seen
    pub added: u64,
    /// Transfers finished successfully
    pub completed: u64,
    /// Transfers failed
    pub failed: u64,
    /// Transfers cancelled
    pub cancelled: u64,
    /// Bytes moved by completed transfers
    pub bytes_done: u64,
    /// Elapsed time
    pub elapsed: Duration,
}

impl ProgressSummary {
    /// Throughput in bytes/second over the whole run
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_done as f64 / secs
        } else {
            0.0
        }
    }

    /// Print summary to console
    pub fn print(&self) {
        println!("Transfers: {}/{} complete", self.completed, self.added);
        if self.failed > 0 {
            println!("Failed:    {}", self.failed);
        }
        if self.cancelled > 0 {
            println!("Cancelled: {}", self.cancelled);
        }
        println!("Bytes:     {}", humansize::format_size(self.bytes_done, humansize::BINARY));
        println!("Elapsed:   {:.1?}", self.elapsed);
        println!("Speed:     {}/s", humansize::format_size(self.throughput() as u64, humansize::BINARY));
    }
}
