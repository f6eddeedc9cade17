//! Task handler contract and the process-based implementation
//!
//! The worker core never executes a payload itself; it constructs a handler
//! through the injected factory and drives it through `start`, `cancel`,
//! and `abort`. The shipped handler runs the payload command as a child
//! process in a per-run work directory, with leased device ids exported
//! through the environment.

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::api::Claim;
use shared::WorkerError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Observable execution state of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Aborted,
}

/// Controller for one claimed run.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs the task to completion. Returns once the task reached a
    /// terminal state, successfully or not. `cancel` and `abort` must cause
    /// this to return within bounded time.
    async fn start(&self) -> Result<()>;

    /// Requests cooperative cancellation.
    fn cancel(&self, reason: &str);

    /// Demands teardown. Stronger than cancel; failures are reported but the
    /// caller is expected to proceed regardless.
    fn abort(&self, reason: &str) -> Result<()>;

    /// Current execution state.
    fn status(&self) -> HandlerStatus;
}

/// Per-run execution options assembled by the worker at admission.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Leased device ids keyed by device kind.
    pub devices: HashMap<String, String>,
}

/// Builds a handler for a claimed run.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, claim: &Claim, options: ExecutionOptions) -> Result<Arc<dyn TaskHandler>>;
}

enum StopRequest {
    Cancel(String),
    Abort(String),
}

/// Handler that runs the payload command as a supervised child process.
pub struct ProcessTaskHandler {
    task_id: String,
    run_id: u32,
    command: Vec<String>,
    env: HashMap<String, String>,
    work_dir: PathBuf,
    max_run_time: Option<Duration>,
    status: Mutex<HandlerStatus>,
    stop: Mutex<Option<StopRequest>>,
    stop_notify: Notify,
}

impl ProcessTaskHandler {
    fn request_stop(&self, request: StopRequest) {
        if let Ok(mut stop) = self.stop.lock() {
            if stop.is_none() {
                *stop = Some(request);
            }
        }
        self.stop_notify.notify_one();
    }

    fn set_status(&self, status: HandlerStatus) {
        if let Ok(mut current) = self.status.lock() {
            *current = status;
        }
    }

    /// Consumes a pending stop request, if any.
    fn take_stop(&self) -> Option<StopRequest> {
        self.stop.lock().ok().and_then(|mut stop| stop.take())
    }
}

#[async_trait]
impl TaskHandler for ProcessTaskHandler {
    async fn start(&self) -> Result<()> {
        if self.command.is_empty() {
            self.set_status(HandlerStatus::Failed);
            return Err(WorkerError::TaskExecution(format!(
                "task {} run {} has no command to execute",
                self.task_id, self.run_id
            ))
            .into());
        }

        self.set_status(HandlerStatus::Running);

        if let Err(e) = tokio::fs::create_dir_all(&self.work_dir).await {
            self.set_status(HandlerStatus::Failed);
            return Err(e).with_context(|| {
                format!("failed to create work dir {}", self.work_dir.display())
            });
        }

        let mut command = tokio::process::Command::new(&self.command[0]);
        command
            .args(&self.command[1..])
            .envs(&self.env)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.set_status(HandlerStatus::Failed);
                return Err(e).with_context(|| {
                    format!(
                        "failed to spawn '{}' for task {} run {}",
                        self.command[0], self.task_id, self.run_id
                    )
                });
            }
        };

        debug!(
            task_id = %self.task_id,
            run_id = self.run_id,
            command = %self.command[0],
            "Task process started"
        );

        let max_run_time = async {
            match self.max_run_time {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            status = child.wait() => {
                let status = match status {
                    Ok(status) => status,
                    Err(e) => {
                        self.set_status(HandlerStatus::Failed);
                        return Err(e).context("failed to wait for task process");
                    }
                };
                if status.success() {
                    self.set_status(HandlerStatus::Succeeded);
                    Ok(())
                } else {
                    self.set_status(HandlerStatus::Failed);
                    Err(WorkerError::TaskExecution(format!(
                        "task {} run {} exited with {}",
                        self.task_id, self.run_id, status
                    ))
                    .into())
                }
            }
            _ = self.stop_notify.notified() => {
                if let Err(e) = child.start_kill() {
                    warn!(task_id = %self.task_id, run_id = self.run_id, "Failed to kill task process: {}", e);
                }
                let _ = child.wait().await;

                match self.take_stop() {
                    Some(StopRequest::Abort(reason)) => {
                        self.set_status(HandlerStatus::Aborted);
                        Err(WorkerError::TaskExecution(format!(
                            "task {} run {} aborted: {}",
                            self.task_id, self.run_id, reason
                        ))
                        .into())
                    }
                    Some(StopRequest::Cancel(reason)) => {
                        self.set_status(HandlerStatus::Canceled);
                        info!(task_id = %self.task_id, run_id = self.run_id, reason = %reason, "Task canceled");
                        Ok(())
                    }
                    // A stray notification without a request: the process is
                    // already gone, treat it as a cancellation.
                    None => {
                        self.set_status(HandlerStatus::Canceled);
                        info!(task_id = %self.task_id, run_id = self.run_id, "Task canceled");
                        Ok(())
                    }
                }
            }
            _ = max_run_time => {
                if let Err(e) = child.start_kill() {
                    warn!(task_id = %self.task_id, run_id = self.run_id, "Failed to kill timed-out task: {}", e);
                }
                let _ = child.wait().await;
                self.set_status(HandlerStatus::Failed);
                Err(WorkerError::TaskExecution(format!(
                    "task {} run {} exceeded its max run time",
                    self.task_id, self.run_id
                ))
                .into())
            }
        }
    }

    fn cancel(&self, reason: &str) {
        debug!(task_id = %self.task_id, run_id = self.run_id, reason, "Cancel requested");
        self.request_stop(StopRequest::Cancel(reason.to_string()));
    }

    fn abort(&self, reason: &str) -> Result<()> {
        debug!(task_id = %self.task_id, run_id = self.run_id, reason, "Abort requested");
        self.request_stop(StopRequest::Abort(reason.to_string()));
        Ok(())
    }

    fn status(&self) -> HandlerStatus {
        self.status
            .lock()
            .map(|status| *status)
            .unwrap_or(HandlerStatus::Failed)
    }
}

/// Factory producing [`ProcessTaskHandler`]s under the configured work
/// volume.
pub struct ProcessHandlerFactory {
    work_volume: PathBuf,
}

impl ProcessHandlerFactory {
    pub fn new(work_volume: PathBuf) -> Self {
        Self { work_volume }
    }
}

impl HandlerFactory for ProcessHandlerFactory {
    fn create(&self, claim: &Claim, options: ExecutionOptions) -> Result<Arc<dyn TaskHandler>> {
        let task_id = claim.status.task_id.clone();
        let run_id = claim.run_id;
        let payload = &claim.task.payload;

        let mut env = payload.env.clone();
        env.insert("TASK_ID".to_string(), task_id.clone());
        env.insert("RUN_ID".to_string(), run_id.to_string());
        // Leased devices are handed to the process by kind, e.g.
        // DEVICE_CPU=cpu-3.
        for (kind, id) in &options.devices {
            env.insert(format!("DEVICE_{}", kind.to_uppercase()), id.clone());
        }

        Ok(Arc::new(ProcessTaskHandler {
            work_dir: self.work_volume.join(format!("{}-{}", task_id, run_id)),
            task_id,
            run_id,
            command: payload.command.clone(),
            env,
            max_run_time: payload.max_run_time.map(Duration::from_secs),
            status: Mutex::new(HandlerStatus::Pending),
            stop: Mutex::new(None),
            stop_notify: Notify::new(),
        }))
    }
}
