//! Port allocation for tunnel listeners
//!
//! The allocator owns the in-memory set of assigned ports. It is not persisted:
//! [`PortAllocator::import`] must be fed the ports of every active tunnel row
//! before the first allocation after a restart.

use crate::error::ControlError;
use rand::Rng;
use relaymesh_engines::RESERVED_PORTS;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Random draws before giving up on finding a free port
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Dynamic range for random allocation (inclusive)
    pub range_start: u16,
    pub range_end: u16,
    pub max_attempts: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            range_start: 10000,
            range_end: 65000,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl AllocatorConfig {
    pub fn new(range_start: u16, range_end: u16) -> Self {
        Self {
            range_start: range_start.min(range_end),
            range_end: range_start.max(range_end),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Outcome of [`PortAllocator::allocate_random`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub port: u16,
    /// `false` when the range was exhausted and an already assigned port was
    /// handed out; the caller does not own that assignment
    pub fresh: bool,
}

/// Tracks ports currently bound to a tunnel
#[derive(Debug)]
pub struct PortAllocator {
    config: AllocatorConfig,
    assigned: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        info!(
            range_start = config.range_start,
            range_end = config.range_end,
            "Port allocator initialized"
        );
        Self {
            config,
            assigned: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    fn assigned(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.assigned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn draw(&self) -> u16 {
        rand::thread_rng().gen_range(self.config.range_start..=self.config.range_end)
    }

    /// Draw a free port from the dynamic range and mark it assigned
    ///
    /// Never fails: once `max_attempts` draws all collide, the last draw is
    /// handed out anyway with a warning.
    pub fn allocate_random(&self) -> Allocation {
        let mut assigned = self.assigned();

        let mut candidate = self.draw();
        for _ in 0..self.config.max_attempts {
            if !assigned.contains(&candidate) && !RESERVED_PORTS.contains(&candidate) {
                assigned.insert(candidate);
                debug!(port = candidate, "Allocated random port");
                return Allocation {
                    port: candidate,
                    fresh: true,
                };
            }
            candidate = self.draw();
        }

        warn!(
            port = candidate,
            attempts = self.config.max_attempts,
            assigned = assigned.len(),
            "No free port found, handing out a possibly duplicate port"
        );
        let fresh = assigned.insert(candidate);
        Allocation {
            port: candidate,
            fresh,
        }
    }

    /// Mark an explicit port as assigned
    pub fn reserve(&self, port: u16) -> Result<(), ControlError> {
        if port == 0 {
            return Err(ControlError::InvalidPort(0));
        }

        let mut assigned = self.assigned();
        if !assigned.insert(port) {
            return Err(ControlError::PortInUse(port));
        }

        debug!(port, "Reserved port");
        Ok(())
    }

    /// Forget a port; returns whether it was assigned
    pub fn release(&self, port: u16) -> bool {
        let removed = self.assigned().remove(&port);
        if removed {
            debug!(port, "Released port");
        }
        removed
    }

    /// Rebuild from persisted assignments, replacing the current set
    pub fn import<I>(&self, ports: I) -> usize
    where
        I: IntoIterator<Item = u16>,
    {
        let mut assigned = self.assigned();
        assigned.clear();
        assigned.extend(ports);
        info!(count = assigned.len(), "Port assignments rebuilt");
        assigned.len()
    }

    pub fn is_assigned(&self, port: u16) -> bool {
        self.assigned().contains(&port)
    }

    pub fn len(&self) -> usize {
        self.assigned().len()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned().is_empty()
    }

    /// Sorted snapshot of the assigned set
    pub fn snapshot(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.assigned().iter().copied().collect();
        ports.sort_unstable();
        ports
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(AllocatorConfig::default())
    }
}
