//! Host control and shutdown intent
//!
//! Two seams live here: the host controller (uptime probes and the final
//! power-off) and the shutdown manager (the external authority the worker
//! asks every poll cycle whether it should keep running). The shipped
//! shutdown manager is signal-driven: the first TERM or INT requests a
//! graceful drain, a second one demands immediate teardown. It can also
//! raise a graceful shutdown after a configured stretch of idleness, which
//! is how spot fleets retire workers that ran out of work.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How the worker should terminate. Monotonic: intent only ever moves
/// toward higher severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownIntent {
    /// Keep running.
    None,
    /// Stop admitting work, drain running tasks, then exit.
    Graceful,
    /// Abort running tasks and exit now.
    Immediate,
}

/// Control surface of the host instance the worker runs on.
#[async_trait]
pub trait HostController: Send + Sync {
    /// Seconds since the host booted.
    fn uptime(&self) -> Result<u64>;

    /// Seconds since the current billing window began.
    fn billing_cycle_uptime(&self) -> Result<u64>;

    /// Powers the host off. Failure here is the only fatal error in the
    /// worker.
    async fn shutdown(&self) -> Result<()>;
}

/// External authority over worker termination.
pub trait ShutdownManager: Send + Sync {
    /// The worker has no running tasks this cycle.
    fn on_idle(&self);

    /// The worker has at least one running task this cycle.
    fn on_working(&self);

    /// The currently requested shutdown intent.
    fn should_exit(&self) -> ShutdownIntent;
}

/// Host controller for Unix hosts: uptime from /proc/uptime, power-off via
/// the system shutdown command.
pub struct UnixHost;

impl UnixHost {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UnixHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostController for UnixHost {
    fn uptime(&self) -> Result<u64> {
        let content =
            std::fs::read_to_string("/proc/uptime").context("failed to read /proc/uptime")?;
        let seconds: f64 = content
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty /proc/uptime"))?
            .parse()
            .context("failed to parse /proc/uptime")?;
        Ok(seconds as u64)
    }

    fn billing_cycle_uptime(&self) -> Result<u64> {
        // Per-second billing: the window opened at boot.
        self.uptime()
    }

    async fn shutdown(&self) -> Result<()> {
        warn!("Powering off the host");
        let status = tokio::process::Command::new("shutdown")
            .args(["-h", "now"])
            .status()
            .await
            .context("failed to invoke shutdown command")?;

        if !status.success() {
            return Err(anyhow::anyhow!("shutdown command exited with {}", status));
        }
        Ok(())
    }
}

/// Signal- and idleness-driven shutdown manager.
pub struct SignalShutdownManager {
    /// Number of termination signals received so far.
    signals: AtomicU32,
    /// When the worker first reported idle, if it is still idle.
    idle_since: Mutex<Option<Instant>>,
    /// Continuous idleness that triggers a graceful shutdown; None disables.
    idle_timeout: Option<Duration>,
}

impl SignalShutdownManager {
    /// Creates a manager with an idle timeout in seconds; 0 disables idle
    /// shutdown.
    pub fn new(idle_shutdown_timeout_seconds: u64) -> Arc<Self> {
        let idle_timeout = if idle_shutdown_timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(idle_shutdown_timeout_seconds))
        };
        Arc::new(Self {
            signals: AtomicU32::new(0),
            idle_since: Mutex::new(None),
            idle_timeout,
        })
    }

    /// Creates a manager with an explicit idle timeout duration.
    pub fn with_idle_timeout(idle_timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            signals: AtomicU32::new(0),
            idle_since: Mutex::new(None),
            idle_timeout,
        })
    }

    /// Registers one received termination signal.
    pub fn record_signal(&self) {
        let seen = self.signals.fetch_add(1, Ordering::SeqCst) + 1;
        if seen == 1 {
            info!("Termination signal received, will drain and exit");
        } else {
            warn!("Repeated termination signal, will abort running tasks");
        }
    }

    /// Spawns a background task that feeds Unix termination signals into
    /// this manager.
    pub fn spawn_signal_listener(self: Arc<Self>) {
        let manager = self;
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("Failed to install SIGTERM handler: {}", e);
                        return;
                    }
                };
                let mut sigint = match signal(SignalKind::interrupt()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("Failed to install SIGINT handler: {}", e);
                        return;
                    }
                };

                loop {
                    tokio::select! {
                        _ = sigterm.recv() => manager.record_signal(),
                        _ = sigint.recv() => manager.record_signal(),
                    }
                }
            }

            #[cfg(not(unix))]
            {
                loop {
                    if tokio::signal::ctrl_c().await.is_err() {
                        return;
                    }
                    manager.record_signal();
                }
            }
        });
    }
}

impl ShutdownManager for SignalShutdownManager {
    fn on_idle(&self) {
        if let Ok(mut idle_since) = self.idle_since.lock() {
            if idle_since.is_none() {
                debug!("Worker reported idle");
                *idle_since = Some(Instant::now());
            }
        }
    }

    fn on_working(&self) {
        if let Ok(mut idle_since) = self.idle_since.lock() {
            if idle_since.take().is_some() {
                debug!("Worker reported working");
            }
        }
    }

    fn should_exit(&self) -> ShutdownIntent {
        match self.signals.load(Ordering::SeqCst) {
            0 => {}
            1 => return ShutdownIntent::Graceful,
            _ => return ShutdownIntent::Immediate,
        }

        if let (Some(timeout), Ok(idle_since)) = (self.idle_timeout, self.idle_since.lock()) {
            if let Some(since) = *idle_since {
                if since.elapsed() >= timeout {
                    info!(
                        idle_seconds = since.elapsed().as_secs(),
                        "Idle timeout reached, requesting graceful shutdown"
                    );
                    return ShutdownIntent::Graceful;
                }
            }
        }

        ShutdownIntent::None
    }
}
