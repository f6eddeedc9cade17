//! The worker loop: polling, admission, retirement, and shutdown
//!
//! This module owns all shared state of the worker. A single
//! `tokio::select!` loop drives four inputs: the poll timer (one pending
//! timer, re-armed after each cycle), completion reports from spawned task
//! runners, cancellation messages, and the capacity report timer. Because
//! registry and counter mutation only ever happens on this loop, admission
//! and retirement are naturally serialized against each other and against
//! shutdown handling.

use crate::cache::VolumeCache;
use crate::devices::DeviceManager;
use crate::diskspace::DiskProbe;
use crate::gc::GarbageCollector;
use crate::handler::{ExecutionOptions, HandlerFactory};
use crate::host::{HostController, ShutdownIntent, ShutdownManager};
use crate::monitor::Monitor;
use crate::queue::Queue;
use crate::registry::{RunningRegistry, RunningState};
use crate::reporter::CapacityReporter;
use crate::runner::{lease_devices, spawn_execution, TaskComplete};
use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use shared::api::{CancelMessage, Claim, REASON_CANCELED};
use shared::{EventType, LifecycleEvent, WorkerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How often the immediate-shutdown drain re-checks the registry.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// External collaborators the worker core drives.
pub struct WorkerDeps {
    pub queue: Arc<dyn Queue>,
    pub device_manager: Arc<dyn DeviceManager>,
    pub disk_probe: Arc<dyn DiskProbe>,
    pub gc: Arc<dyn GarbageCollector>,
    pub volume_cache: Arc<dyn VolumeCache>,
    pub host: Arc<dyn HostController>,
    pub shutdown_manager: Arc<dyn ShutdownManager>,
    pub handler_factory: Arc<dyn HandlerFactory>,
    pub monitor: Arc<dyn Monitor>,
}

/// Lifecycle state of the worker loop.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerState {
    Running,
    Stopped,
}

/// The worker: claims work from the queue and supervises it to completion.
pub struct Worker {
    worker_id: String,
    /// Slots this worker offers. Zeroed by a graceful shutdown so nothing
    /// further is admitted.
    capacity: u32,
    restrict_cpu: bool,
    poll_interval: Duration,
    report_interval: Duration,
    work_volume: PathBuf,
    min_diskspace_bytes: u64,

    deps: WorkerDeps,
    registry: RunningRegistry,
    reporter: CapacityReporter,

    pub state: WorkerState,
    intent: ShutdownIntent,
    paused: bool,
    rearm_poll: bool,

    /// Admissible slots computed by the last capacity gate pass.
    last_known_capacity: u32,
    /// Accumulated run time of completed tasks.
    total_run_time_ms: u64,
    /// When the registry last changed.
    last_task_event: Option<Instant>,
    /// Whether the device-supply adjustment notice has been emitted for the
    /// current shortage.
    device_capacity_limited: bool,

    complete_tx: mpsc::Sender<TaskComplete>,
    complete_rx: mpsc::Receiver<TaskComplete>,
    cancel_tx: mpsc::Sender<CancelMessage>,
    cancel_rx: mpsc::Receiver<CancelMessage>,
}

impl Worker {
    pub fn new(config: &WorkerConfig, deps: WorkerDeps) -> Self {
        let (complete_tx, complete_rx) = mpsc::channel(config.channel_buffer_size);
        let (cancel_tx, cancel_rx) = mpsc::channel(config.channel_buffer_size);
        let reporter = CapacityReporter::new(deps.monitor.clone(), config.task_capacity, 0);

        Self {
            worker_id: config.worker_id.clone(),
            capacity: config.task_capacity,
            restrict_cpu: config.restrict_cpu,
            poll_interval: config.poll_interval(),
            report_interval: Duration::from_secs(config.capacity_report_interval_seconds),
            work_volume: config.work_volume.clone(),
            min_diskspace_bytes: config.min_diskspace_bytes,
            deps,
            registry: RunningRegistry::new(),
            reporter,
            state: WorkerState::Running,
            intent: ShutdownIntent::None,
            paused: false,
            rearm_poll: false,
            last_known_capacity: config.task_capacity,
            total_run_time_ms: 0,
            last_task_event: None,
            device_capacity_limited: false,
            complete_tx,
            complete_rx,
            cancel_tx,
            cancel_rx,
        }
    }

    /// Sender half of the cancellation channel, for whoever receives
    /// cancellation messages on the worker's behalf.
    pub fn cancel_sender(&self) -> mpsc::Sender<CancelMessage> {
        self.cancel_tx.clone()
    }

    /// Stops scheduling poll cycles. The pending poll timer is discarded by
    /// the run loop's guard; completion and cancellation handling continue.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resumes polling with a freshly armed timer.
    #[allow(dead_code)]
    pub fn resume(&mut self) {
        self.paused = false;
        self.rearm_poll = true;
    }

    /// Stops the run loop without touching the host. Running tasks keep
    /// going until their handlers return; nothing new is scheduled.
    #[allow(dead_code)]
    pub fn close(&mut self) {
        self.pause();
        self.state = WorkerState::Stopped;
    }

    /// Emits the startup lifecycle events.
    fn announce_boot(&self) {
        match self.deps.host.uptime() {
            Ok(uptime) => self.deps.monitor.log_event(
                LifecycleEvent::new(EventType::InstanceBoot, &self.worker_id).seconds_ago(uptime),
            ),
            Err(e) => warn!("Host uptime probe failed: {:#}", e),
        }
        self.deps
            .monitor
            .log_event(LifecycleEvent::new(EventType::WorkerReady, &self.worker_id));
        info!(
            worker_id = %self.worker_id,
            capacity = self.capacity,
            "Worker ready"
        );
    }

    /// Runs the worker until a shutdown completes. The only error that
    /// escapes is an unrecoverable host-shutdown failure.
    pub async fn run(&mut self) -> Result<()> {
        self.announce_boot();

        // The first tick fires almost immediately so that configuration or
        // queue problems surface right after startup.
        let mut poll_timer = Box::pin(tokio::time::sleep(Duration::from_millis(1)));
        let mut report_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.report_interval,
            self.report_interval,
        );
        report_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.state == WorkerState::Stopped {
                break;
            }

            tokio::select! {
                _ = &mut poll_timer, if !self.paused => {
                    self.poll_cycle().await?;
                    poll_timer = Box::pin(tokio::time::sleep(self.jittered_poll_interval()));
                }
                Some(done) = self.complete_rx.recv() => {
                    self.retire_task(done);
                }
                Some(msg) = self.cancel_rx.recv() => {
                    self.handle_cancellation(msg);
                }
                _ = report_timer.tick() => {
                    self.report_capacity();
                }
            }

            if self.rearm_poll {
                self.rearm_poll = false;
                poll_timer = Box::pin(tokio::time::sleep(self.jittered_poll_interval()));
            }
        }

        Ok(())
    }

    /// The configured poll interval with ±10% jitter, so a fleet of workers
    /// does not hammer the queue in lockstep.
    fn jittered_poll_interval(&self) -> Duration {
        let factor = rand::rng().random_range(0.9..=1.1);
        Duration::from_secs_f64(self.poll_interval.as_secs_f64() * factor)
    }

    /// One full poll cycle: shutdown observation, garbage collection,
    /// capacity and disk gates, claim, admission. Recoverable failures are
    /// absorbed here; the returned error is fatal (host shutdown failed).
    pub(crate) async fn poll_cycle(&mut self) -> Result<()> {
        // Report idleness and act on the shutdown intent before anything
        // else; an immediate shutdown must not be delayed by a claim.
        if self.registry.is_empty() {
            self.deps.shutdown_manager.on_idle();
        } else {
            self.deps.shutdown_manager.on_working();
        }
        self.observe_shutdown_intent();

        match self.intent {
            ShutdownIntent::Immediate => {
                return self.shutdown_immediate().await;
            }
            ShutdownIntent::Graceful => {
                if self.capacity != 0 {
                    info!("Graceful shutdown requested, halting task admissions");
                    self.capacity = 0;
                }
                if self.registry.is_empty() {
                    return self.final_shutdown().await;
                }
            }
            ShutdownIntent::None => {}
        }

        self.deps.gc.sweep(self.registry.is_empty()).await;

        let admissible = self.admissible_capacity();
        if admissible == 0 {
            return Ok(());
        }

        match self.deps.disk_probe.exceeds_threshold(
            &self.work_volume,
            self.min_diskspace_bytes,
            admissible,
        ) {
            Ok(false) => {}
            Ok(true) => {
                warn!(admissible, "Disk pressure, not claiming work this cycle");
                return Ok(());
            }
            Err(e) => {
                // One cycle of unavailable capacity; the next poll retries.
                warn!("Disk probe failed, not claiming work: {:#}", e);
                return Ok(());
            }
        }

        let claims = match self.deps.queue.claim_work(admissible).await {
            Ok(claims) => claims,
            Err(e) => {
                error!("[alert-operator] claim-work request failed: {:#}", e);
                return Ok(());
            }
        };
        if claims.is_empty() {
            debug!("No work available");
            return Ok(());
        }

        // Make room for incoming task volumes once per claiming cycle.
        self.deps.volume_cache.purge_caches().await;

        info!(count = claims.len(), "Claimed tasks");
        for claim in claims {
            let task_id = claim.status.task_id.clone();
            let run_id = claim.run_id;
            if let Err(e) = self.launch_task(claim) {
                error!(
                    task_id = %task_id,
                    run_id,
                    "Task setup failed: {:#}", e
                );
                self.deps.monitor.count("task.error", 1);
            }
        }

        Ok(())
    }

    /// Admissible slots: remaining configured capacity bounded by device
    /// supply. A failed device probe means no admissions this cycle.
    fn admissible_capacity(&mut self) -> u32 {
        let running = self.registry.size() as u32;
        let open_slots = self.capacity.saturating_sub(running);

        let device_capacity = match self.deps.device_manager.available_capacity() {
            Ok(capacity) => capacity,
            Err(e) => {
                error!("[alert-operator] device capacity probe failed: {:#}", e);
                0
            }
        };

        if device_capacity < self.capacity {
            if !self.device_capacity_limited {
                info!(
                    device_capacity,
                    capacity = self.capacity,
                    "Device supply below configured capacity, admissions adjusted"
                );
                self.device_capacity_limited = true;
            }
        } else {
            self.device_capacity_limited = false;
        }

        let admissible = open_slots.min(device_capacity);
        self.last_known_capacity = admissible;
        admissible
    }

    /// Admits one claim: leases devices, constructs the handler, registers
    /// the run, and spawns its execution.
    fn launch_task(&mut self, claim: Claim) -> Result<()> {
        let task_id = claim.status.task_id.clone();
        let run_id = claim.run_id;

        debug!(task_id = %task_id, run_id, "Admitting claimed task");

        if self.registry.find(&task_id, run_id).is_some() {
            warn!(task_id = %task_id, run_id, "Claim duplicates a running task, ignoring");
            return Ok(());
        }

        // A task claimed for the first time reveals its queue latency.
        if claim.status.runs.is_empty() {
            let waited_ms = (Utc::now() - claim.task.created).num_milliseconds().max(0);
            self.deps
                .monitor
                .measure("timeToFirstClaim", waited_ms as f64);
        }

        let devices = lease_devices(
            self.deps.device_manager.as_ref(),
            self.restrict_cpu,
            &claim.task.payload,
        )?;
        let options = ExecutionOptions {
            devices: devices
                .iter()
                .map(|(kind, device)| (kind.clone(), device.id().to_string()))
                .collect(),
        };

        let handler = match self.deps.handler_factory.create(&claim, options) {
            Ok(handler) => handler,
            Err(e) => {
                for device in devices.values() {
                    device.release();
                }
                return Err(e).context("failed to construct task handler");
            }
        };

        // Counters must describe the registry as it was before this insert.
        self.record_capacity();
        let state = RunningState {
            task_id: task_id.clone(),
            run_id,
            start_time: Instant::now(),
            devices,
            handler: handler.clone(),
        };
        if let Some(rejected) = self.registry.add(state) {
            rejected.release_devices();
            return Ok(());
        }
        self.last_task_event = Some(Instant::now());

        spawn_execution(
            handler,
            self.worker_id.clone(),
            task_id,
            run_id,
            claim.task.created,
            self.deps.monitor.clone(),
            self.complete_tx.clone(),
        );

        Ok(())
    }

    /// Retires a completed run: releases its leases, accounts its run time,
    /// and removes it from the registry.
    pub(crate) fn retire_task(&mut self, done: TaskComplete) {
        // Counters must describe the registry as it was before this removal.
        self.record_capacity();

        match self.registry.remove(&done.task_id, done.run_id) {
            Some(state) => {
                state.release_devices();
                let elapsed_ms = state.start_time.elapsed().as_millis() as u64;
                self.total_run_time_ms += elapsed_ms;
                self.last_known_capacity += 1;
                self.last_task_event = Some(Instant::now());
                debug!(
                    task_id = %done.task_id,
                    run_id = done.run_id,
                    elapsed_ms,
                    "Task retired"
                );
            }
            None => {
                warn!(
                    task_id = %done.task_id,
                    run_id = done.run_id,
                    "Completed task not found in registry"
                );
            }
        }

        if let Err(e) = done.result {
            error!(
                task_id = %done.task_id,
                run_id = done.run_id,
                "Task execution failed: {:#}", e
            );
            self.deps.monitor.count("task.error", 1);
        }
    }

    /// Acts on one cancellation message: only runs resolved as canceled are
    /// acted upon, everything else is ignored.
    pub(crate) fn handle_cancellation(&mut self, msg: CancelMessage) {
        if msg.reason_resolved() != Some(REASON_CANCELED) {
            return;
        }

        let task_id = &msg.payload.status.task_id;
        let run_id = msg.payload.run_id;

        match self.registry.find(task_id, run_id) {
            Some(state) => {
                info!(task_id = %task_id, run_id, "Canceling task");
                state.handler.cancel(REASON_CANCELED);
                // The handler unwinds through the normal retirement path,
                // which tolerates these already-released leases.
                state.release_devices();
            }
            None => {
                debug!(task_id = %task_id, run_id, "Cancellation for task not in registry");
            }
        }
    }

    /// Merges the shutdown manager's current request into the monotonic
    /// intent.
    fn observe_shutdown_intent(&mut self) {
        let requested = self.deps.shutdown_manager.should_exit();
        if requested > self.intent {
            info!(intent = ?requested, "Shutdown intent raised");
            self.intent = requested;
        }
    }

    /// Aborts everything in flight, waits for the registry to drain, then
    /// shuts the host down.
    async fn shutdown_immediate(&mut self) -> Result<()> {
        self.deps.monitor.count("spotTermination", 1);
        warn!(
            running = self.registry.size(),
            "Immediate shutdown, aborting running tasks"
        );

        for state in self.registry.snapshot() {
            if let Err(e) = state.handler.abort("worker-shutdown") {
                // The queue reconciles the claim via expiry.
                debug!(
                    task_id = %state.task_id,
                    run_id = state.run_id,
                    "Handler abort failed: {:#}", e
                );
            }
            state.release_devices();
        }

        // Aborted handlers unwind through the normal retirement path; wait
        // for the registry to empty out.
        loop {
            self.drain_completions();
            if self.registry.is_empty() {
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        self.final_shutdown().await
    }

    /// Processes every completion report that has already arrived.
    pub(crate) fn drain_completions(&mut self) {
        while let Ok(done) = self.complete_rx.try_recv() {
            self.retire_task(done);
        }
    }

    /// Emits the shutdown events and powers the host off. Sets the worker
    /// state to Stopped first so the run loop exits even if the host call
    /// fails.
    async fn final_shutdown(&mut self) -> Result<()> {
        info!("Shutting down instance");
        self.pause();
        self.capacity = 0;
        self.deps.monitor.log_event(LifecycleEvent::new(
            EventType::InstanceShutdown,
            &self.worker_id,
        ));
        self.deps
            .monitor
            .log_event(LifecycleEvent::new(EventType::Exit, &self.worker_id));
        self.state = WorkerState::Stopped;

        self.deps.host.shutdown().await.context("host shutdown failed")
    }

    /// Accrues the capacity counters for the window since the last snapshot
    /// and samples the current occupancy.
    fn record_capacity(&mut self) {
        let busy = self.registry.size() as u32;
        let idle = self.capacity.saturating_sub(busy);
        self.reporter.record(idle, busy);
    }

    /// Periodic capacity report: snapshot accrual plus the efficiency
    /// measure.
    pub(crate) fn report_capacity(&mut self) {
        self.record_capacity();

        let running_elapsed_ms: u64 = self
            .registry
            .snapshot()
            .iter()
            .map(|s| s.start_time.elapsed().as_millis() as u64)
            .sum();

        match self.deps.host.billing_cycle_uptime() {
            Ok(uptime) => self.reporter.measure_efficiency(
                self.total_run_time_ms,
                running_elapsed_ms,
                self.capacity,
                uptime,
            ),
            Err(e) => debug!("Billing uptime probe failed: {:#}", e),
        }
    }

    // Accessors, mostly exercised by the tests.

    #[allow(dead_code)]
    pub fn running_count(&self) -> usize {
        self.registry.size()
    }

    #[allow(dead_code)]
    pub fn configured_capacity(&self) -> u32 {
        self.capacity
    }

    #[allow(dead_code)]
    pub fn last_known_capacity(&self) -> u32 {
        self.last_known_capacity
    }

    #[allow(dead_code)]
    pub fn total_run_time_ms(&self) -> u64 {
        self.total_run_time_ms
    }

    #[allow(dead_code)]
    pub(crate) fn last_task_event(&self) -> Option<Instant> {
        self.last_task_event
    }

    #[allow(dead_code)]
    pub(crate) fn registry(&self) -> &RunningRegistry {
        &self.registry
    }

    #[allow(dead_code)]
    pub(crate) fn is_paused(&self) -> bool {
        self.paused
    }
}
