//! Host resource bookkeeping for the local runtime.
//!
//! The pool owns the free and used sets of external ports and GPU device ids
//! plus the container slot counter. It performs no I/O; callers reserve here,
//! talk to the runtime, then either keep or release what they reserved.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;

use anyhow::{bail, Context};
use thiserror::Error;

/// Maximum external ports a single container may publish.
pub const MAX_PORTS_PER_CONTAINER: usize = 3;

/// Allocation failures. All of them map to a quota error upstream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("exceed Container Port: {requested} requested, at most {cap} allowed")]
    PortCapExceeded { requested: usize, cap: usize },

    #[error("exceed Container Port: {requested} requested, {available} free")]
    PortsExhausted { requested: usize, available: usize },

    #[error("exceed GPU Device: {requested} requested, {available} free")]
    GpusExhausted { requested: usize, available: usize },

    #[error("exceed Container Limit: {max}")]
    SlotsExhausted { max: usize },
}

/// CPU cores pinned to a container, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuRange {
    pub first: u32,
    pub last: u32,
}

impl CpuRange {
    /// Range for the container started while `running` others are live.
    ///
    /// The range depends only on the running count, so a container created
    /// after a kill can overlap one that is still running.
    pub fn for_slot(running: usize, vcpu: u32) -> Self {
        let first = running as u32 * vcpu;
        Self {
            first,
            last: first + vcpu.max(1) - 1,
        }
    }
}

impl fmt::Display for CpuRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

/// Comparable view of the pool, for status and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolUsage {
    pub free_ports: BTreeSet<u16>,
    pub used_ports: BTreeSet<u16>,
    pub free_gpus: Vec<String>,
    pub used_gpus: BTreeSet<String>,
    pub slots: usize,
    pub max_slots: usize,
}

#[derive(Debug)]
struct PoolState {
    free_ports: BTreeSet<u16>,
    used_ports: BTreeSet<u16>,
    /// Configured device ids in allocation order.
    gpu_order: Vec<String>,
    used_gpus: BTreeSet<String>,
    slots: usize,
}

/// Free/used sets for ports, GPUs and container slots.
#[derive(Debug)]
pub struct ResourcePool {
    state: Mutex<PoolState>,
    max_slots: usize,
}

impl ResourcePool {
    /// Create a pool from the configured ports, device ids and slot cap.
    pub fn new(ports: impl IntoIterator<Item = u16>, gpus: Vec<String>, max_slots: usize) -> Self {
        let mut gpu_order = Vec::with_capacity(gpus.len());
        for id in gpus {
            if !gpu_order.contains(&id) {
                gpu_order.push(id);
            }
        }

        Self {
            state: Mutex::new(PoolState {
                free_ports: ports.into_iter().collect(),
                used_ports: BTreeSet::new(),
                gpu_order,
                used_gpus: BTreeSet::new(),
                slots: 0,
            }),
            max_slots,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve `n` external ports, lowest first.
    pub fn allocate_ports(&self, n: usize) -> Result<Vec<u16>, PoolError> {
        if n > MAX_PORTS_PER_CONTAINER {
            return Err(PoolError::PortCapExceeded {
                requested: n,
                cap: MAX_PORTS_PER_CONTAINER,
            });
        }

        let mut state = self.state();
        if state.free_ports.len() < n {
            return Err(PoolError::PortsExhausted {
                requested: n,
                available: state.free_ports.len(),
            });
        }

        let picked: Vec<u16> = state.free_ports.iter().take(n).copied().collect();
        for port in &picked {
            state.free_ports.remove(port);
            state.used_ports.insert(*port);
        }
        Ok(picked)
    }

    /// Return ports to the free set. Ports not in use are ignored.
    pub fn release_ports(&self, ports: &[u16]) {
        let mut state = self.state();
        for port in ports {
            if state.used_ports.remove(port) {
                state.free_ports.insert(*port);
            }
        }
    }

    /// Reserve `n` GPU devices in configured order.
    pub fn allocate_gpus(&self, n: usize) -> Result<Vec<String>, PoolError> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.state();
        let free: Vec<String> = state
            .gpu_order
            .iter()
            .filter(|id| !state.used_gpus.contains(*id))
            .cloned()
            .collect();

        if free.len() < n {
            return Err(PoolError::GpusExhausted {
                requested: n,
                available: free.len(),
            });
        }

        let picked: Vec<String> = free.into_iter().take(n).collect();
        for id in &picked {
            state.used_gpus.insert(id.clone());
        }
        Ok(picked)
    }

    /// Return GPU devices to the free set. Ids not in use are ignored.
    pub fn release_gpus(&self, ids: &[String]) {
        let mut state = self.state();
        for id in ids {
            state.used_gpus.remove(id);
        }
    }

    /// Take a container slot. Returns the number of slots held before this one.
    pub fn reserve_slot(&self) -> Result<usize, PoolError> {
        let mut state = self.state();
        if state.slots >= self.max_slots {
            return Err(PoolError::SlotsExhausted {
                max: self.max_slots,
            });
        }
        let before = state.slots;
        state.slots += 1;
        Ok(before)
    }

    /// Give back a container slot.
    pub fn release_slot(&self) {
        let mut state = self.state();
        state.slots = state.slots.saturating_sub(1);
    }

    /// Mark resources of a recovered container as used.
    ///
    /// Ports outside the configured range are ignored. The slot is always
    /// taken, even past the cap, so the count matches the runtime.
    pub fn claim(&self, ports: &[u16], gpus: &[String]) {
        let mut state = self.state();
        for port in ports {
            if state.free_ports.remove(port) {
                state.used_ports.insert(*port);
            }
        }
        for id in gpus {
            if state.gpu_order.contains(id) {
                state.used_gpus.insert(id.clone());
            }
        }
        state.slots += 1;
    }

    /// Number of containers holding a slot.
    pub fn slots(&self) -> usize {
        self.state().slots
    }

    /// Configured slot cap.
    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Number of configured GPU devices.
    pub fn gpu_count(&self) -> usize {
        self.state().gpu_order.len()
    }

    /// Snapshot of the current sets.
    pub fn usage(&self) -> PoolUsage {
        let state = self.state();
        PoolUsage {
            free_ports: state.free_ports.clone(),
            used_ports: state.used_ports.clone(),
            free_gpus: state
                .gpu_order
                .iter()
                .filter(|id| !state.used_gpus.contains(*id))
                .cloned()
                .collect(),
            used_gpus: state.used_gpus.clone(),
            slots: state.slots,
            max_slots: self.max_slots,
        }
    }
}

/// Parse a port list such as `8000-8002,9000`.
pub fn parse_port_list(raw: &str) -> anyhow::Result<Vec<u16>> {
    let mut ports = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (start, end) = match part.split_once('-') {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (part, part),
        };
        let start: u16 = start
            .parse()
            .with_context(|| format!("invalid port '{}'", start))?;
        let end: u16 = end
            .parse()
            .with_context(|| format!("invalid port '{}'", end))?;
        if end < start {
            bail!("invalid port range '{}'", part);
        }
        ports.extend(start..=end);
    }
    Ok(ports)
}
