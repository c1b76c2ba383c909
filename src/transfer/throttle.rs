//! Shared bandwidth cap for transfers
//!
//! A governor token bucket where one cell stands for [`CELL_BYTES`] of
//! payload. Waiting is done cell by cell, so a caller can stop between
//! cells instead of sleeping through a whole chunk.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::convert::Infallible;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Payload bytes per bucket cell
pub const CELL_BYTES: u64 = 1024;

/// Sleep between bucket checks while starved
const STARVED_NAP: Duration = Duration::from_millis(2);

type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limit that can be cloned and shared between transfers
///
/// Clones draw from the same bucket, so the limit applies to the sum of
/// their traffic.
#[derive(Clone)]
pub struct BandwidthLimiter {
    bucket: Arc<Bucket>,
    rate: u64,
}

impl BandwidthLimiter {
    /// Limit to `bytes_per_second`; anything under one cell rounds up to one
    pub fn new(bytes_per_second: u64) -> Self {
        let cells = u32::try_from(bytes_per_second / CELL_BYTES).unwrap_or(u32::MAX);
        let cells = NonZeroU32::new(cells).unwrap_or(NonZeroU32::MIN);

        // One second worth of cells may go out at once
        let quota = Quota::per_second(cells).allow_burst(cells);
        Self {
            bucket: Arc::new(RateLimiter::direct(quota)),
            rate: bytes_per_second,
        }
    }

    /// Configured rate
    pub fn bytes_per_second(&self) -> u64 {
        self.rate
    }

    /// Wait for room to send `bytes`, asking `interrupt` before every nap
    ///
    /// Returns the first error `interrupt` yields. Cells already taken by
    /// then stay spent.
    pub fn pace<E>(&self, bytes: usize, mut interrupt: impl FnMut() -> Result<(), E>) -> Result<(), E> {
        for _ in 0..cells_for(bytes) {
            while self.bucket.check().is_err() {
                interrupt()?;
                thread::sleep(STARVED_NAP);
            }
        }
        Ok(())
    }

    /// Wait for room to send `bytes` with no way out
    pub fn pace_uninterrupted(&self, bytes: usize) {
        let _ = self.pace(bytes, || Ok::<(), Infallible>(()));
    }

    /// Take room for `bytes` only if it is there now
    pub fn try_pace(&self, bytes: usize) -> bool {
        (0..cells_for(bytes)).all(|_| self.bucket.check().is_ok())
    }
}

fn cells_for(bytes: usize) -> u64 {
    (bytes as u64).div_ceil(CELL_BYTES).max(1)
}

impl fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("bytes_per_second", &self.rate)
            .finish()
    }
}
