//! Device leasing for exclusive-use host resources
//!
//! Tasks can require exclusive host resources while they run: a CPU pin, a
//! loopback video device, a KVM slot. Each resource kind is modeled as a
//! pool of numbered slots; a task leases one slot per required kind at
//! admission and the lease is returned when the task retires. Release is
//! idempotent because cancellation and retirement may both try to return
//! the same lease.

use anyhow::Result;
use shared::WorkerError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A leased exclusive-use host resource.
pub trait Device: Send + Sync + std::fmt::Debug {
    /// Stable identifier of the leased slot (e.g. "cpu-3").
    fn id(&self) -> &str;

    /// The device kind this lease belongs to.
    fn kind(&self) -> &str;

    /// Returns the lease to its pool. Safe to call more than once; only the
    /// first call has an effect.
    fn release(&self);
}

/// Supplier of leasable devices.
pub trait DeviceManager: Send + Sync {
    /// How many more tasks the device supply can support right now.
    fn available_capacity(&self) -> Result<u32>;

    /// Leases one device of the given kind.
    fn acquire(&self, kind: &str) -> Result<Box<dyn Device>>;
}

#[derive(Debug)]
struct Pool {
    free: Vec<u32>,
    total: u32,
}

/// Device manager backed by fixed per-kind slot pools from configuration.
pub struct PooledDeviceManager {
    pools: Arc<Mutex<HashMap<String, Pool>>>,
}

impl PooledDeviceManager {
    /// Builds pools from a kind-to-slot-count mapping.
    pub fn new(pool_sizes: &HashMap<String, u32>) -> Self {
        let pools = pool_sizes
            .iter()
            .map(|(kind, &count)| {
                (
                    kind.clone(),
                    Pool {
                        // Slots are handed out lowest-first.
                        free: (0..count).rev().collect(),
                        total: count,
                    },
                )
            })
            .collect();
        Self {
            pools: Arc::new(Mutex::new(pools)),
        }
    }
}

impl DeviceManager for PooledDeviceManager {
    fn available_capacity(&self) -> Result<u32> {
        let pools = self
            .pools
            .lock()
            .map_err(|_| WorkerError::Device("device pool lock poisoned".to_string()))?;

        // With no pools configured the device supply never constrains
        // admissions.
        if pools.is_empty() {
            return Ok(u32::MAX);
        }

        Ok(pools
            .values()
            .map(|p| p.free.len() as u32)
            .min()
            .unwrap_or(0))
    }

    fn acquire(&self, kind: &str) -> Result<Box<dyn Device>> {
        let mut pools = self
            .pools
            .lock()
            .map_err(|_| WorkerError::Device("device pool lock poisoned".to_string()))?;

        let pool = pools.get_mut(kind).ok_or_else(|| {
            WorkerError::Device(format!("no device pool configured for kind '{}'", kind))
        })?;

        let slot = pool.free.pop().ok_or_else(|| {
            WorkerError::Device(format!(
                "device pool '{}' exhausted ({} slots)",
                kind, pool.total
            ))
        })?;

        debug!(kind, slot, "Leased device");

        Ok(Box::new(PooledDevice {
            id: format!("{}-{}", kind, slot),
            kind: kind.to_string(),
            slot,
            pools: self.pools.clone(),
            released: AtomicBool::new(false),
        }))
    }
}

/// A lease on one slot of a [`PooledDeviceManager`] pool.
#[derive(Debug)]
pub struct PooledDevice {
    id: String,
    kind: String,
    slot: u32,
    pools: Arc<Mutex<HashMap<String, Pool>>>,
    released: AtomicBool,
}

impl Device for PooledDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.pools.lock() {
            Ok(mut pools) => {
                if let Some(pool) = pools.get_mut(&self.kind) {
                    pool.free.push(self.slot);
                    debug!(kind = %self.kind, slot = self.slot, "Released device");
                }
            }
            Err(_) => warn!(id = %self.id, "Device pool lock poisoned, lease dropped"),
        }
    }
}

impl Drop for PooledDevice {
    fn drop(&mut self) {
        // A lease that falls out of scope without an explicit release still
        // returns to the pool.
        self.release();
    }
}
