//! FIFO pool of sandbox addresses within a managed subnet.
//!
//! The pool hands out one address per sandbox and reclaims it on release.
//! Allocation order is first-in-first-out rather than random so that the
//! address assignment sequence is reproducible across runs.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::OrchestratorError;

/// Tracks the unassigned addresses of a subnet.
///
/// The pool trusts its callers: `release` does not check that the address
/// was ever issued. Duplicate-release guarding is the registry's job
/// (an address is only released when its registry entry is removed).
#[derive(Debug)]
pub struct AddressPool {
    available: VecDeque<Ipv4Addr>,
}

impl AddressPool {
    /// Builds the pool from the full host enumeration of `subnet`,
    /// excluding the gateway (the subnet's first host).
    pub fn new(subnet: Ipv4Net) -> Self {
        let available: VecDeque<Ipv4Addr> = subnet.hosts().skip(1).collect();
        Self { available }
    }

    /// Pops the next free address, oldest first.
    pub fn allocate(&mut self) -> Result<Ipv4Addr, OrchestratorError> {
        self.available
            .pop_front()
            .ok_or(OrchestratorError::PoolExhausted)
    }

    /// Returns an address to the back of the queue.
    pub fn release(&mut self, address: Ipv4Addr) {
        self.available.push_back(address);
    }

    /// Number of addresses currently free.
    pub fn available(&self) -> usize {
        self.available.len()
    }
}
