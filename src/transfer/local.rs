//! Chunked file copy between two local paths
//!
//! The built-in [`Transfer`] used by the CLI and the tests. Remote
//! protocols plug in their own implementations; this one reads the source
//! in fixed chunks, reports progress after each write and resumes from the
//! task's recorded offset after a pause.

use super::task::{Transfer, TransferContext};
use super::throttle::BandwidthLimiter;
use crate::config::DEFAULT_CHUNK_SIZE;
use crate::error::TransferError;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Copies `source` to `dest` in chunks
#[derive(Debug, Clone)]
pub struct LocalCopy {
    source: PathBuf,
    dest: PathBuf,
    chunk_size: usize,
    limiter: Option<BandwidthLimiter>,
}

impl LocalCopy {
    pub fn new(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            limiter: None,
        }
    }

    /// Bytes read per step; clamped to at least one
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Share a rate limit with other copies
    pub fn with_limiter(mut self, limiter: BandwidthLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    fn open_dest(&self, offset: u64) -> std::io::Result<File> {
        if offset == 0 {
            return File::create(&self.dest);
        }
        let mut file = OpenOptions::new().write(true).open(&self.dest)?;
        // Drop anything written past the recorded offset
        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(file)
    }
}

impl Transfer for LocalCopy {
    fn run(&self, ctx: &TransferContext<'_>) -> Result<(), TransferError> {
        let mut reader = File::open(&self.source)?;
        let size = reader.metadata()?.len();
        ctx.set_total(size);

        let offset = ctx.transferred();
        if offset > 0 {
            tracing::debug!(task = ctx.task_id(), offset, "resuming copy");
            reader.seek(SeekFrom::Start(offset))?;
        }

        let mut writer = BufWriter::with_capacity(self.chunk_size, self.open_dest(offset)?);
        let mut buffer = vec![0u8; self.chunk_size];

        loop {
            if let Err(interrupt) = ctx.checkpoint() {
                writer.flush()?;
                return Err(interrupt);
            }

            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }

            // Unwritten bytes are read again from the offset on resume
            if let Some(limiter) = &self.limiter {
                if let Err(interrupt) = limiter.pace(bytes_read, || ctx.checkpoint()) {
                    writer.flush()?;
                    return Err(interrupt);
                }
            }

            writer.write_all(&buffer[..bytes_read])?;
            ctx.advance(bytes_read as u64);
        }

        writer.flush()?;
        Ok(())
    }
}
