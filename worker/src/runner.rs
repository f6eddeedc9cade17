//! Per-claim execution: device leasing and the spawned handler drive
//!
//! Admission happens on the worker loop (it owns the registry); the long
//! part, driving `handler.start()` to completion, runs as an independent
//! tokio task that reports back over the completion channel. The lifecycle
//! events around `start()` are emitted from the spawned task so that
//! `taskStart` always precedes the await and `taskFinish` follows it on
//! every exit path, panics included.

use crate::devices::{Device, DeviceManager};
use crate::handler::TaskHandler;
use crate::monitor::Monitor;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use shared::api::TaskPayload;
use shared::{EventType, LifecycleEvent};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Completion report from a spawned runner back to the worker loop.
#[derive(Debug)]
pub struct TaskComplete {
    pub task_id: String,
    pub run_id: u32,
    pub result: Result<()>,
}

/// Leases every device the run needs: a cpu device when the worker
/// restricts CPU, plus one device per kind declared in the payload
/// capabilities. On any acquisition failure the devices leased so far are
/// released before the error is returned.
pub fn lease_devices(
    device_manager: &dyn DeviceManager,
    restrict_cpu: bool,
    payload: &TaskPayload,
) -> Result<HashMap<String, Box<dyn Device>>> {
    let mut kinds: Vec<&str> = Vec::new();
    if restrict_cpu {
        kinds.push("cpu");
    }
    if let Some(capabilities) = &payload.capabilities {
        kinds.extend(capabilities.devices.keys().map(String::as_str));
    }

    let mut leased: HashMap<String, Box<dyn Device>> = HashMap::new();
    for kind in kinds {
        if leased.contains_key(kind) {
            continue;
        }
        match device_manager.acquire(kind) {
            Ok(device) => {
                leased.insert(kind.to_string(), device);
            }
            Err(e) => {
                for device in leased.values() {
                    device.release();
                }
                return Err(e).with_context(|| format!("failed to lease '{}' device", kind));
            }
        }
    }

    Ok(leased)
}

/// Spawns the execution of an admitted run. Fire-and-forget: the worker
/// loop learns the outcome through `complete_tx`.
pub fn spawn_execution(
    handler: Arc<dyn TaskHandler>,
    worker_id: String,
    task_id: String,
    run_id: u32,
    task_created: DateTime<Utc>,
    monitor: Arc<dyn Monitor>,
    complete_tx: mpsc::Sender<TaskComplete>,
) {
    tokio::spawn(async move {
        monitor.log_event(
            LifecycleEvent::for_task(EventType::TaskQueue, &worker_id, &task_id, run_id)
                .at(task_created),
        );
        monitor.log_event(LifecycleEvent::for_task(
            EventType::TaskStart,
            &worker_id,
            &task_id,
            run_id,
        ));

        // A panicking handler must still produce a taskFinish and a
        // completion report, or its registry entry would leak forever.
        let result = match AssertUnwindSafe(handler.start()).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "task handler panicked for task {} run {}",
                task_id,
                run_id
            )),
        };

        monitor.log_event(LifecycleEvent::for_task(
            EventType::TaskFinish,
            &worker_id,
            &task_id,
            run_id,
        ));

        let report = TaskComplete {
            task_id: task_id.clone(),
            run_id,
            result,
        };
        if complete_tx.send(report).await.is_err() {
            debug!(
                task_id = %task_id,
                run_id,
                "Worker loop gone before task completion could be reported"
            );
        }
    });
}
