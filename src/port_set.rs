//! Authoritative mutable set of port numbers eligible for scanning.

use std::collections::HashSet;
use std::sync::RwLock;

/// Bounded set of ports the scanner is allowed to probe.
///
/// Bounded by a configured `[min, max]` range and a maximum cardinality.
/// Safe under concurrent mutation and iteration: `snapshot()` returns a
/// point-in-time copy rather than a live iterator over the guarded set.
pub struct PortSet {
    min: u16,
    max: u16,
    max_ports: usize,
    ports: RwLock<HashSet<u16>>,
}

impl PortSet {
    /// Construct a `PortSet` pre-populated with every port in `[min, max]`,
    /// capped at `max_ports` entries.
    pub fn new(min: u16, max: u16, max_ports: usize) -> Self {
        let ports: HashSet<u16> = (min..=max).take(max_ports).collect();
        Self {
            min,
            max,
            max_ports,
            ports: RwLock::new(ports),
        }
    }

    /// Add `port` if it lies within `[min, max]` and the set has room.
    /// Returns `true` if the port was (or already is) present.
    pub fn add(&self, port: u16) -> bool {
        if port < self.min || port > self.max {
            return false;
        }
        let mut ports = self.ports.write().expect("PortSet lock poisoned");
        if ports.contains(&port) {
            return true;
        }
        if ports.len() >= self.max_ports {
            return false;
        }
        ports.insert(port);
        true
    }

    pub fn remove(&self, port: u16) {
        self.ports.write().expect("PortSet lock poisoned").remove(&port);
    }

    /// Point-in-time copy of the currently eligible ports.
    pub fn snapshot(&self) -> HashSet<u16> {
        self.ports.read().expect("PortSet lock poisoned").clone()
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }
}
