//! Configuration settings for TermCore
//!
//! Defines the runtime configuration of the scheduler, transfer queue and
//! relay, the JSON config file loader, and the CLI arguments.

use crate::error::{IoResultExt, Result, TermCoreError};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default scheduler poll interval (10 ms)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Default idle time before a scheduler worker exits (60 s)
pub const DEFAULT_WORKER_KEEP_ALIVE_MS: u64 = 60_000;

/// Default number of concurrently running transfers
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default transfer chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default relay pump buffer (16 KiB)
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// TermCore - background scheduling, transfers and port forwarding
#[derive(Parser, Debug, Clone)]
#[command(name = "termcore")]
#[command(author = "TermCore Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Task scheduling, transfer queueing and port forwarding for terminal sessions")]
#[command(long_about = r#"
TermCore drives the background machinery of a terminal/SSH client:
a deferred/looping task scheduler, a bounded transfer queue and a
bidirectional relay for port forwarding.

Examples:
  termcore copy a.bin b.bin --dest /backup --max-concurrent 2
  termcore copy big.iso --dest /mnt --bandwidth-limit 10M
  termcore forward --listen 127.0.0.1:8080 --target 10.0.0.5:80
"#)]
pub struct CliArgs {
    /// Path to a JSON config file
    #[arg(short = 'c', long, global = true, value_name = "PATH", env = "TERMCORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress progress output)
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Copy files through the transfer queue
    #[command(name = "copy")]
    Copy {
        /// Files to copy
        #[arg(required = true, value_name = "SOURCE")]
        sources: Vec<PathBuf>,

        /// Destination directory
        #[arg(short, long, value_name = "DIR")]
        dest: PathBuf,

        /// Maximum concurrent transfers (overrides config)
        #[arg(short = 'j', long, value_name = "NUM")]
        max_concurrent: Option<usize>,

        /// Combined bandwidth limit (e.g., 10M for 10 MB/s)
        #[arg(long, value_name = "RATE")]
        bandwidth_limit: Option<String>,
    },

    /// Forward a local TCP port to a target address
    #[command(name = "forward")]
    Forward {
        /// Local address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8022", value_name = "ADDR")]
        listen: String,

        /// Target address to connect each client to
        #[arg(short, long, value_name = "ADDR")]
        target: String,
    },
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Poll loop interval in milliseconds
    pub poll_interval_ms: u64,
    /// Idle time before a worker thread exits, in milliseconds
    pub worker_keep_alive_ms: u64,
}

impl SchedulerConfig {
    /// Poll loop interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Worker keep-alive
    pub fn worker_keep_alive(&self) -> Duration {
        Duration::from_millis(self.worker_keep_alive_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            worker_keep_alive_ms: DEFAULT_WORKER_KEEP_ALIVE_MS,
        }
    }
}

/// Transfer queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Admission cap on concurrently running transfers
    pub max_concurrent: usize,
    /// Chunk size for built-in transfers
    pub chunk_size: usize,
    /// Bandwidth limit for built-in transfers in bytes/sec
    pub bandwidth_limit: Option<u64>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            bandwidth_limit: None,
        }
    }
}

/// Relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Size of each pump's transfer chunk
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Scheduler settings
    pub scheduler: SchedulerConfig,
    /// Transfer queue settings
    pub transfers: TransferConfig,
    /// Relay settings
    pub relay: RelayConfig,
}

impl CoreConfig {
    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Reject values the components cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.poll_interval_ms == 0 {
            return Err(TermCoreError::config("scheduler.poll_interval_ms must be non-zero"));
        }
        if self.transfers.max_concurrent == 0 {
            return Err(TermCoreError::InvalidConcurrency(0));
        }
        if self.transfers.chunk_size == 0 {
            return Err(TermCoreError::config("transfers.chunk_size must be non-zero"));
        }
        if self.relay.buffer_size == 0 {
            return Err(TermCoreError::config("relay.buffer_size must be non-zero"));
        }
        Ok(())
    }

    /// Build from CLI arguments: config file first, then flag overrides
    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Commands::Copy {
            max_concurrent,
            bandwidth_limit,
            ..
        } = &args.command
        {
            if let Some(n) = max_concurrent {
                config.transfers.max_concurrent = *n;
            }
            if let Some(rate) = bandwidth_limit {
                let limit = parse_size(rate)
                    .map_err(|e| TermCoreError::config(format!("Invalid bandwidth limit: {}", e)))?;
                config.transfers.bandwidth_limit = Some(limit);
            }
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parse a human-readable size (e.g., "64K", "10M", "1.5G")
pub fn parse_size(size: &str) -> std::result::Result<u64, String> {
    let size = size.trim().to_uppercase();

    if size.is_empty() {
        return Err("Empty size string".to_string());
    }

    let (num_str, multiplier) = if size.ends_with("GB") || size.ends_with('G') {
        (size.trim_end_matches(|c| c == 'G' || c == 'B'), 1024u64 * 1024 * 1024)
    } else if size.ends_with("MB") || size.ends_with('M') {
        (size.trim_end_matches(|c| c == 'M' || c == 'B'), 1024u64 * 1024)
    } else if size.ends_with("KB") || size.ends_with('K') {
        (size.trim_end_matches(|c| c == 'K' || c == 'B'), 1024u64)
    } else {
        (size.trim_end_matches('B'), 1u64)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number: {}", num_str))?;

    if num < 0.0 {
        return Err(format!("Negative size: {}", size));
    }

    Ok((num * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("1KB").unwrap(), 1024);
        assert_eq!(parse_size("10M").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size("1.5G").unwrap(), (1.5 * 1024.0 * 1024.0 * 1024.0) as u64);
        assert!(parse_size("").is_err());
        assert!(parse_size("fast").is_err());
        assert!(parse_size("-1K").is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.transfers.max_concurrent, DEFAULT_MAX_CONCURRENT);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = CoreConfig::default();
        config.transfers.max_concurrent = 0;
        assert!(matches!(
            config.validate(),
            Err(TermCoreError::InvalidConcurrency(0))
        ));
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "transfers": {{ "max_concurrent": 5 }} }}"#).unwrap();

        let config = CoreConfig::load(file.path()).unwrap();
        assert_eq!(config.transfers.max_concurrent, 5);
        assert_eq!(config.transfers.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.relay.buffer_size, DEFAULT_RELAY_BUFFER_SIZE);
    }

    #[test]
    fn test_load_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            CoreConfig::load(file.path()),
            Err(TermCoreError::Config(_))
        ));
    }

    #[test]
    fn test_cli_overrides() {
        let args = CliArgs::parse_from([
            "termcore",
            "copy",
            "a.bin",
            "--dest",
            "/tmp/out",
            "-j",
            "4",
            "--bandwidth-limit",
            "2M",
        ]);
        let config = CoreConfig::from_cli(&args).unwrap();
        assert_eq!(config.transfers.max_concurrent, 4);
        assert_eq!(config.transfers.bandwidth_limit, Some(2 * 1024 * 1024));
    }
}
