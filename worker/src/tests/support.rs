//! Test doubles and builders shared by the worker test modules

use crate::cache::VolumeCache;
use crate::devices::{Device, DeviceManager, PooledDeviceManager};
use crate::diskspace::DiskProbe;
use crate::gc::GarbageCollector;
use crate::handler::{ExecutionOptions, HandlerFactory, HandlerStatus, TaskHandler};
use crate::host::{HostController, ShutdownIntent, ShutdownManager};
use crate::monitor::Monitor;
use crate::queue::Queue;
use crate::worker::{Worker, WorkerDeps};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use shared::api::{
    CancelMessage, CancelPayload, Capabilities, Claim, RunInfo, Task, TaskPayload, TaskStatus,
};
use shared::{EventType, LifecycleEvent, WorkerConfig};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Monitor

#[derive(Default)]
pub struct MonitorState {
    pub counts: Mutex<HashMap<String, u64>>,
    pub measures: Mutex<Vec<(String, f64)>>,
    pub events: Mutex<Vec<LifecycleEvent>>,
}

/// Monitor capturing every emission for assertions.
#[derive(Clone, Default)]
pub struct TestMonitor {
    pub state: Arc<MonitorState>,
}

impl TestMonitor {
    pub fn count_of(&self, name: &str) -> u64 {
        self.state
            .counts
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn measures_of(&self, name: &str) -> Vec<f64> {
        self.state
            .measures
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn events_of(&self, event_type: EventType) -> Vec<LifecycleEvent> {
        self.state
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl Monitor for TestMonitor {
    fn count(&self, name: &str, n: u64) {
        *self
            .state
            .counts
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0) += n;
    }

    fn measure(&self, name: &str, value: f64) {
        self.state
            .measures
            .lock()
            .unwrap()
            .push((name.to_string(), value));
    }

    fn log_event(&self, event: LifecycleEvent) {
        self.state.events.lock().unwrap().push(event);
    }

    fn child(&self, _name: &str) -> Arc<dyn Monitor> {
        Arc::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// Queue

/// Queue double that hands out pre-loaded claim batches and records every
/// claim-work call.
#[derive(Default)]
pub struct FakeQueue {
    batches: Mutex<VecDeque<Vec<Claim>>>,
    calls: Mutex<Vec<u32>>,
    pub fail: AtomicBool,
}

impl FakeQueue {
    pub fn push_batch(&self, claims: Vec<Claim>) {
        self.batches.lock().unwrap().push_back(claims);
    }

    pub fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Queue for FakeQueue {
    async fn claim_work(&self, n_tasks: u32) -> Result<Vec<Claim>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("queue unreachable"));
        }
        self.calls.lock().unwrap().push(n_tasks);
        Ok(self
            .batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Devices

/// Device manager double: real pools plus a switchable probe failure.
pub struct FakeDeviceManager {
    inner: PooledDeviceManager,
    pub fail_probe: AtomicBool,
}

impl FakeDeviceManager {
    pub fn new(pools: &[(&str, u32)]) -> Self {
        let sizes = pools
            .iter()
            .map(|(kind, count)| (kind.to_string(), *count))
            .collect();
        Self {
            inner: PooledDeviceManager::new(&sizes),
            fail_probe: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.inner.available_capacity().unwrap()
    }
}

impl DeviceManager for FakeDeviceManager {
    fn available_capacity(&self) -> Result<u32> {
        if self.fail_probe.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("device probe exploded"));
        }
        self.inner.available_capacity()
    }

    fn acquire(&self, kind: &str) -> Result<Box<dyn Device>> {
        self.inner.acquire(kind)
    }
}

// ---------------------------------------------------------------------------
// Disk, GC, cache

#[derive(Default)]
pub struct FakeDiskProbe {
    pub pressure: AtomicBool,
    pub fail: AtomicBool,
    pub calls: Mutex<Vec<(u64, u32)>>,
}

impl DiskProbe for FakeDiskProbe {
    fn exceeds_threshold(
        &self,
        _volume: &Path,
        threshold_bytes: u64,
        admissible: u32,
    ) -> Result<bool> {
        self.calls.lock().unwrap().push((threshold_bytes, admissible));
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("disk probe exploded"));
        }
        Ok(self.pressure.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct RecordingGc {
    sweeps: Mutex<Vec<bool>>,
}

impl RecordingGc {
    pub fn sweeps(&self) -> Vec<bool> {
        self.sweeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl GarbageCollector for RecordingGc {
    async fn sweep(&self, full: bool) {
        self.sweeps.lock().unwrap().push(full);
    }
}

#[derive(Default)]
pub struct RecordingCache {
    purges: AtomicU32,
}

impl RecordingCache {
    pub fn purges(&self) -> u32 {
        self.purges.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VolumeCache for RecordingCache {
    async fn purge_caches(&self) {
        self.purges.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Host and shutdown manager

pub struct FakeHost {
    shutdowns: AtomicU32,
    pub uptime_seconds: u64,
    pub billing_seconds: u64,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            shutdowns: AtomicU32::new(0),
            uptime_seconds: 3600,
            billing_seconds: 3600,
        }
    }
}

impl FakeHost {
    pub fn shutdowns(&self) -> u32 {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostController for FakeHost {
    fn uptime(&self) -> Result<u64> {
        Ok(self.uptime_seconds)
    }

    fn billing_cycle_uptime(&self) -> Result<u64> {
        Ok(self.billing_seconds)
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct ScriptedShutdownManager {
    intent: Mutex<Option<ShutdownIntent>>,
    pub idle_reports: AtomicU32,
    pub working_reports: AtomicU32,
}

impl ScriptedShutdownManager {
    pub fn set_intent(&self, intent: ShutdownIntent) {
        *self.intent.lock().unwrap() = Some(intent);
    }
}

impl ShutdownManager for ScriptedShutdownManager {
    fn on_idle(&self) {
        self.idle_reports.fetch_add(1, Ordering::SeqCst);
    }

    fn on_working(&self) {
        self.working_reports.fetch_add(1, Ordering::SeqCst);
    }

    fn should_exit(&self) -> ShutdownIntent {
        self.intent.lock().unwrap().unwrap_or(ShutdownIntent::None)
    }
}

// ---------------------------------------------------------------------------
// Handlers

/// Handler double. Immediate variants finish on their own after a short
/// delay; holding variants wait for their gate, a cancel, or an abort.
pub struct FakeHandler {
    fail: bool,
    gate: Option<Arc<Notify>>,
    stop: Notify,
    cancels: Mutex<Vec<String>>,
    aborts: Mutex<Vec<String>>,
    status: Mutex<HandlerStatus>,
}

impl FakeHandler {
    fn build(fail: bool, gate: Option<Arc<Notify>>) -> Arc<Self> {
        Arc::new(Self {
            fail,
            gate,
            stop: Notify::new(),
            cancels: Mutex::new(Vec::new()),
            aborts: Mutex::new(Vec::new()),
            status: Mutex::new(HandlerStatus::Pending),
        })
    }

    /// Completes successfully after a short delay.
    pub fn immediate() -> Arc<Self> {
        Self::build(false, None)
    }

    /// Fails after a short delay.
    pub fn failing() -> Arc<Self> {
        Self::build(true, None)
    }

    /// Runs until the returned gate is notified (or the handler is canceled
    /// or aborted).
    pub fn holding() -> (Arc<Self>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (Self::build(false, Some(gate.clone())), gate)
    }

    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().unwrap().clone()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.aborts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskHandler for FakeHandler {
    async fn start(&self) -> Result<()> {
        *self.status.lock().unwrap() = HandlerStatus::Running;

        if let Some(gate) = &self.gate {
            tokio::select! {
                _ = gate.notified() => {}
                _ = self.stop.notified() => {
                    *self.status.lock().unwrap() = HandlerStatus::Canceled;
                    return Ok(());
                }
            }
        } else {
            // Long enough that retirement observes a non-zero run time.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        if self.fail {
            *self.status.lock().unwrap() = HandlerStatus::Failed;
            Err(anyhow::anyhow!("task blew up"))
        } else {
            *self.status.lock().unwrap() = HandlerStatus::Succeeded;
            Ok(())
        }
    }

    fn cancel(&self, reason: &str) {
        self.cancels.lock().unwrap().push(reason.to_string());
        self.stop.notify_one();
    }

    fn abort(&self, reason: &str) -> Result<()> {
        self.aborts.lock().unwrap().push(reason.to_string());
        self.stop.notify_one();
        Ok(())
    }

    fn status(&self) -> HandlerStatus {
        *self.status.lock().unwrap()
    }
}

/// Factory double handing out pre-registered handlers by (task, run).
#[derive(Default)]
pub struct FakeHandlerFactory {
    handlers: Mutex<HashMap<(String, u32), Arc<FakeHandler>>>,
    pub created: Mutex<Vec<(String, u32, ExecutionOptions)>>,
    pub fail_create: AtomicBool,
}

impl FakeHandlerFactory {
    pub fn register(&self, task_id: &str, run_id: u32, handler: Arc<FakeHandler>) {
        self.handlers
            .lock()
            .unwrap()
            .insert((task_id.to_string(), run_id), handler);
    }

    pub fn created_options(&self, task_id: &str, run_id: u32) -> Option<ExecutionOptions> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .find(|(t, r, _)| t == task_id && *r == run_id)
            .map(|(_, _, options)| options.clone())
    }
}

impl HandlerFactory for FakeHandlerFactory {
    fn create(&self, claim: &Claim, options: ExecutionOptions) -> Result<Arc<dyn TaskHandler>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("handler construction failed"));
        }
        let key = (claim.status.task_id.clone(), claim.run_id);
        self.created
            .lock()
            .unwrap()
            .push((key.0.clone(), key.1, options));
        let handler = self
            .handlers
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(FakeHandler::immediate);
        Ok(handler)
    }
}

// ---------------------------------------------------------------------------
// Claim and message builders

pub fn make_claim(task_id: &str, run_id: u32) -> Claim {
    Claim {
        status: TaskStatus {
            task_id: task_id.to_string(),
            runs: vec![],
        },
        run_id,
        task: Task {
            created: Utc::now(),
            payload: TaskPayload::default(),
        },
    }
}

pub fn claim_with_devices(task_id: &str, run_id: u32, kinds: &[&str]) -> Claim {
    let mut claim = make_claim(task_id, run_id);
    claim.task.payload.capabilities = Some(Capabilities {
        devices: kinds
            .iter()
            .map(|kind| (kind.to_string(), serde_json::json!({})))
            .collect(),
    });
    claim
}

pub fn cancel_message(task_id: &str, run_id: u32, reason: &str) -> CancelMessage {
    CancelMessage {
        payload: CancelPayload {
            run_id,
            status: TaskStatus {
                task_id: task_id.to_string(),
                runs: vec![RunInfo {
                    run_id,
                    state: Some("exception".to_string()),
                    reason_resolved: Some(reason.to_string()),
                }],
            },
        },
    }
}

// ---------------------------------------------------------------------------
// Worker harness

pub fn test_config(capacity: u32) -> WorkerConfig {
    WorkerConfig {
        worker_id: "test-worker".to_string(),
        queue_url: "http://localhost:1".to_string(),
        api_key: "secret".to_string(),
        task_capacity: capacity,
        poll_interval_ms: 1000,
        restrict_cpu: false,
        devices: HashMap::new(),
        work_volume: PathBuf::from("./work"),
        min_diskspace_bytes: 1024,
        cache_dir: PathBuf::from("./cache"),
        cache_max_bytes: 1024 * 1024,
        gc_min_age_seconds: 3600,
        capacity_report_interval_seconds: 60,
        idle_shutdown_timeout_seconds: 0,
        cancellation_poll_interval_seconds: 10,
        channel_buffer_size: 100,
        http_client_timeout_seconds: 5,
    }
}

/// All the collaborator doubles plus a way to build workers around them.
pub struct TestHarness {
    pub queue: Arc<FakeQueue>,
    pub device_manager: Arc<FakeDeviceManager>,
    pub disk: Arc<FakeDiskProbe>,
    pub gc: Arc<RecordingGc>,
    pub cache: Arc<RecordingCache>,
    pub host: Arc<FakeHost>,
    pub shutdown: Arc<ScriptedShutdownManager>,
    pub factory: Arc<FakeHandlerFactory>,
    pub monitor: TestMonitor,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_devices(&[])
    }

    pub fn with_devices(pools: &[(&str, u32)]) -> Self {
        Self {
            queue: Arc::new(FakeQueue::default()),
            device_manager: Arc::new(FakeDeviceManager::new(pools)),
            disk: Arc::new(FakeDiskProbe::default()),
            gc: Arc::new(RecordingGc::default()),
            cache: Arc::new(RecordingCache::default()),
            host: Arc::new(FakeHost::default()),
            shutdown: Arc::new(ScriptedShutdownManager::default()),
            factory: Arc::new(FakeHandlerFactory::default()),
            monitor: TestMonitor::default(),
        }
    }

    pub fn worker(&self, capacity: u32) -> Worker {
        self.worker_with(test_config(capacity))
    }

    pub fn worker_with(&self, config: WorkerConfig) -> Worker {
        Worker::new(
            &config,
            WorkerDeps {
                queue: self.queue.clone(),
                device_manager: self.device_manager.clone(),
                disk_probe: self.disk.clone(),
                gc: self.gc.clone(),
                volume_cache: self.cache.clone(),
                host: self.host.clone(),
                shutdown_manager: self.shutdown.clone(),
                handler_factory: self.factory.clone(),
                monitor: Arc::new(self.monitor.clone()),
            },
        )
    }
}
