//! TermCore CLI
//!
//! Drives the transfer queue and the port forwarder from the command line.

use anyhow::{bail, Context};
use clap::Parser;
use crossbeam::channel::RecvTimeoutError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use termcore::config::{CliArgs, Commands, CoreConfig};
use termcore::events::Listener;
use termcore::progress::ProgressReporter;
use termcore::relay::{PortForwarder, Relay, TcpConnector};
use termcore::scheduler::TaskScheduler;
use termcore::transfer::{
    BandwidthLimiter, LocalCopy, TransferDirection, TransferEvent, TransferQueue, TransferTask,
};
use tracing_subscriber::EnvFilter;

/// Connect timeout for forwarded targets
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn main() {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Initialize logging; RUST_LOG wins over -v
    let default_level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Handle result
    if let Err(e) = run(args) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: CliArgs) -> anyhow::Result<()> {
    let config = CoreConfig::from_cli(&args)?;

    match &args.command {
        Commands::Copy { sources, dest, .. } => copy_files(&config, sources, dest, args.quiet),
        Commands::Forward { listen, target } => forward_port(&config, listen, target),
    }
}

fn copy_files(config: &CoreConfig, sources: &[PathBuf], dest: &Path, quiet: bool) -> anyhow::Result<()> {
    if !dest.is_dir() {
        bail!("destination {} is not a directory", dest.display());
    }

    let queue = TransferQueue::from_config(&config.transfers)?;
    let reporter = Arc::new(if quiet {
        ProgressReporter::disabled()
    } else {
        ProgressReporter::new()
    });
    {
        let reporter = Arc::clone(&reporter);
        queue.subscribe(move |event: &TransferEvent| reporter.on_event(event));
    }
    let events = queue.event_channel();

    // Periodic queue status in the log
    let scheduler = TaskScheduler::new(config.scheduler.clone())?;
    {
        let queue = queue.clone();
        scheduler.schedule_loop(
            move |_ctx| {
                tracing::info!(
                    running = queue.count_running(),
                    waiting = queue.count_waiting(),
                    "Transfer queue status"
                );
                Ok(())
            },
            Duration::from_secs(1),
        )?;
    }

    // One limiter shared by every transfer caps the combined rate
    let limiter = config.transfers.bandwidth_limit.map(BandwidthLimiter::new);

    for source in sources {
        let name = source
            .file_name()
            .with_context(|| format!("{} has no file name", source.display()))?;
        let target = dest.join(name);

        let mut copy = LocalCopy::new(source, &target).with_chunk_size(config.transfers.chunk_size);
        if let Some(limiter) = &limiter {
            copy = copy.with_limiter(limiter.clone());
        }

        let task = TransferTask::new(
            source,
            target.display().to_string(),
            TransferDirection::Upload,
            copy,
        );
        queue.add_task(Arc::new(task));
    }

    // Wait for every transfer to reach a terminal state
    let mut finished = 0;
    let mut failed = 0;
    while finished < sources.len() {
        match events.recv_timeout(Duration::from_millis(500)) {
            Ok(TransferEvent::Complete(_)) | Ok(TransferEvent::Cancelled(_)) => finished += 1,
            Ok(TransferEvent::Error(snapshot)) => {
                finished += 1;
                failed += 1;
                tracing::error!(
                    task = snapshot.id,
                    path = %snapshot.local_path.display(),
                    error = snapshot.error.as_deref().unwrap_or("unknown"),
                    "Transfer failed"
                );
            }
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    scheduler.shutdown();
    reporter.finish();
    if !quiet {
        reporter.summary().print();
    }

    if failed > 0 {
        bail!("{} of {} transfers failed", failed, sources.len());
    }
    Ok(())
}

fn forward_port(config: &CoreConfig, listen: &str, target: &str) -> anyhow::Result<()> {
    let connector = TcpConnector::new(target).with_timeout(CONNECT_TIMEOUT);
    let forwarder = PortForwarder::bind(listen, connector, Relay::from_config(&config.relay))?;

    println!("Forwarding {} -> {}", forwarder.local_addr()?, target);
    forwarder.run()?;
    Ok(())
}
