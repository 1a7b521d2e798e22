//! Port allocation for running instances

use parking_lot::Mutex;
use std::collections::HashSet;

/// First port handed out to agent instances
pub const INITIAL_PORT: u16 = 5000;

/// Hands out locally-unique TCP ports, lowest-available-first from 5000.
///
/// Ports are reclaimed synchronously when an instance stops, so the set
/// always mirrors the currently running instances.
pub struct PortAllocator {
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve the lowest free port at or above [`INITIAL_PORT`]
    pub fn acquire(&self) -> u16 {
        let mut allocated = self.allocated.lock();
        let mut port = INITIAL_PORT;
        while allocated.contains(&port) {
            port += 1;
        }
        allocated.insert(port);
        port
    }

    /// Return a port to the pool
    pub fn release(&self, port: u16) {
        self.allocated.lock().remove(&port);
    }

    /// Number of currently allocated ports
    pub fn allocated_count(&self) -> usize {
        self.allocated.lock().len()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}
