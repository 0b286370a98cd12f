//! Host port allocation with random probing and a linear-scan fallback.

use std::collections::{BTreeMap, HashMap};

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use labvisor_protocol::PortRole;

use crate::config::{PortRange, PortsConfig};
use crate::error::{LabError, LabResult};

/// Tracks which host ports are held and by which session.
#[derive(Debug)]
pub struct PortAllocator {
    config: PortsConfig,
    /// port -> owning session ID
    held: HashMap<u16, String>,
    rng: StdRng,
}

impl PortAllocator {
    pub fn new(config: PortsConfig) -> Self {
        Self {
            config,
            held: HashMap::new(),
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic allocator for tests.
    pub fn with_seed(config: PortsConfig, seed: u64) -> Self {
        Self {
            config,
            held: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Allocate a free port from `pool` on behalf of `owner`.
    ///
    /// Tries `random_attempts` random candidates, then scans the range
    /// linearly. Exhaustion is reported, never retried here.
    pub fn allocate_port(&mut self, pool: PortRole, owner: &str) -> LabResult<u16> {
        let range = self.config.range_for(pool);
        if range.is_empty() {
            return Err(LabError::AllocationExhausted { pool });
        }

        for _ in 0..self.config.random_attempts {
            let candidate = self.rng.random_range(range.start..=range.end);
            if !self.held.contains_key(&candidate) {
                self.held.insert(candidate, owner.to_string());
                return Ok(candidate);
            }
        }

        debug!(
            "random probing for {} port exhausted after {} attempts, scanning",
            pool, self.config.random_attempts
        );

        match self.linear_scan(range) {
            Some(port) => {
                self.held.insert(port, owner.to_string());
                Ok(port)
            }
            None => Err(LabError::AllocationExhausted { pool }),
        }
    }

    /// Allocate one port per role, all or nothing.
    pub fn allocate_ports(
        &mut self,
        roles: &[PortRole],
        owner: &str,
    ) -> LabResult<BTreeMap<PortRole, u16>> {
        let mut allocated = BTreeMap::new();
        for role in roles {
            if allocated.contains_key(role) {
                continue;
            }
            match self.allocate_port(*role, owner) {
                Ok(port) => {
                    allocated.insert(*role, port);
                }
                Err(err) => {
                    for port in allocated.values() {
                        self.release_port(*port);
                    }
                    return Err(err);
                }
            }
        }
        Ok(allocated)
    }

    /// Release a port. Returns false if it was not held.
    pub fn release_port(&mut self, port: u16) -> bool {
        self.held.remove(&port).is_some()
    }

    /// Release every port held by `owner`.
    pub fn release_owner(&mut self, owner: &str) -> Vec<u16> {
        let ports: Vec<u16> = self
            .held
            .iter()
            .filter(|(_, o)| o.as_str() == owner)
            .map(|(p, _)| *p)
            .collect();
        for port in &ports {
            self.held.remove(port);
        }
        ports
    }

    pub fn is_held(&self, port: u16) -> bool {
        self.held.contains_key(&port)
    }

    pub fn owner_of(&self, port: u16) -> Option<&str> {
        self.held.get(&port).map(String::as_str)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    fn linear_scan(&self, range: PortRange) -> Option<u16> {
        (range.start..=range.end).find(|p| !self.held.contains_key(p))
    }
}
