//! Distributed Job Execution Worker
//!
//! The worker is a long-running agent that claims tasks from a central
//! queue and supervises their execution: it polls for work, admits claims
//! subject to slot, device, and disk capacity, runs each claim as a child
//! process, and drains or aborts cleanly when the host is reclaimed.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

// The worker is organized into several modules, each with a distinct
// responsibility.
mod cache;
mod config;
mod devices;
mod diskspace;
mod gc;
mod handler;
mod host;
mod monitor;
mod queue;
mod registry;
mod reporter;
mod runner;
mod worker;

use cache::DirVolumeCache;
use config::ConfigManager;
use devices::PooledDeviceManager;
use diskspace::SysinfoDiskProbe;
use gc::WorkDirGc;
use handler::ProcessHandlerFactory;
use host::{SignalShutdownManager, UnixHost};
use monitor::TracingMonitor;
use queue::HttpQueue;
use worker::{Worker, WorkerDeps};

/// Command-line arguments for the worker
#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Job execution worker that claims tasks from the central queue", long_about = None)]
struct CliArgs {
    /// Path to the configuration directory containing worker.toml
    #[arg(value_name = "CONFIG_DIR")]
    config_dir: PathBuf,

    /// Override the worker ID from config file
    #[arg(long = "worker-id", value_name = "ID")]
    worker_id: Option<String>,

    /// Override the central queue URL from config file
    #[arg(long = "queue-url", value_name = "URL")]
    queue_url: Option<String>,

    /// Override the API key from config file
    #[arg(long = "api-key", value_name = "KEY")]
    api_key: Option<String>,

    /// Override the task capacity from config file
    #[arg(long = "capacity", value_name = "SLOTS")]
    capacity: Option<u32>,
}

// The `#[tokio::main]` attribute transforms the `async fn main` into a
// synchronous `fn main` that initializes a tokio runtime and runs the async
// code.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize the logging framework (`tracing`).
    let file_appender = tracing_appender::rolling::daily("./logs", "worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Configure logging with proper RUST_LOG environment variable handling
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default directives are only used if RUST_LOG is not set
        tracing_subscriber::EnvFilter::new("worker=info,shared=info,metrics=info,events=info")
    });

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    // Parse command-line arguments
    let cli_args = CliArgs::parse();

    info!("Distributed job worker starting up");
    info!("Configuration directory: {}", cli_args.config_dir.display());

    // Load and validate configuration before anything else touches the
    // filesystem or the network.
    let config = match load_configuration(&cli_args).await {
        Ok(config) => config,
        Err(e) => {
            error!("FATAL ERROR: Failed to load worker configuration");
            error!("Error: {}", e);

            // Print the full error chain to show all context
            let mut current_error = e.source();
            while let Some(err) = current_error {
                error!("  Caused by: {}", err);
                current_error = err.source();
            }

            error!("Please review worker.toml in the configuration directory:");
            error!("  * worker_id, queue_url, api_key must be non-empty");
            error!("  * task_capacity must be greater than 0");
            error!("  * restrict_cpu requires a cpu pool under [devices]");
            error!("Worker startup ABORTED. Please fix the errors above and try again.");
            std::process::exit(1);
        }
    };

    // The work volume and cache directory must exist before the disk probe
    // and the garbage collector look at them.
    tokio::fs::create_dir_all(&config.work_volume).await?;
    tokio::fs::create_dir_all(&config.cache_dir).await?;

    // Assemble the collaborators the worker core drives.
    let root_monitor = TracingMonitor::root();
    let worker_monitor = root_monitor.child(&config.worker_id);

    let shutdown_manager = SignalShutdownManager::new(config.idle_shutdown_timeout_seconds);
    shutdown_manager.clone().spawn_signal_listener();

    let http_queue = Arc::new(HttpQueue::new(&config)?);

    let deps = WorkerDeps {
        queue: http_queue.clone(),
        device_manager: Arc::new(PooledDeviceManager::new(&config.devices)),
        disk_probe: Arc::new(SysinfoDiskProbe::new()),
        gc: Arc::new(WorkDirGc::new(
            config.work_volume.clone(),
            Duration::from_secs(config.gc_min_age_seconds),
        )),
        volume_cache: Arc::new(DirVolumeCache::new(
            config.cache_dir.clone(),
            config.cache_max_bytes,
        )),
        host: Arc::new(UnixHost::new()),
        shutdown_manager,
        handler_factory: Arc::new(ProcessHandlerFactory::new(config.work_volume.clone())),
        monitor: worker_monitor,
    };

    let mut worker = Worker::new(&config, deps);

    // Feed cancellation messages from the queue into the worker.
    spawn_cancellation_poller(
        http_queue,
        worker.cancel_sender(),
        Duration::from_secs(config.cancellation_poll_interval_seconds),
    );

    // The worker loop runs until a shutdown completes; the only error that
    // escapes is an unrecoverable host-shutdown failure.
    if let Err(e) = worker.run().await {
        error!("Worker error: {:#}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
    Ok(())
}

/// Loads worker.toml and applies command-line overrides.
async fn load_configuration(cli_args: &CliArgs) -> Result<shared::WorkerConfig> {
    let mut config_manager = ConfigManager::new(cli_args.config_dir.clone())?;
    config_manager.load_config().await?;
    config_manager.apply_overrides(
        cli_args.worker_id.clone(),
        cli_args.queue_url.clone(),
        cli_args.api_key.clone(),
        cli_args.capacity,
    )?;
    Ok(config_manager.config().clone())
}

/// Spawns the background task that polls the queue for cancellation
/// messages and forwards them to the worker loop.
fn spawn_cancellation_poller(
    queue: Arc<HttpQueue>,
    cancel_tx: tokio::sync::mpsc::Sender<shared::api::CancelMessage>,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match queue.fetch_cancellations().await {
                Ok(messages) => {
                    for msg in messages {
                        if cancel_tx.send(msg).await.is_err() {
                            debug!("Worker loop gone, stopping cancellation poller");
                            return;
                        }
                    }
                }
                Err(e) => debug!("Cancellation poll failed: {:#}", e),
            }
        }
    });
}

// Unit tests for the worker live in the tests module; see src/tests/.
#[cfg(test)]
mod tests;
