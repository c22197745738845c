//! Process-wide directory of active sandboxes, keyed by address.
//!
//! The registry backs coordinated shutdown and guards against
//! double-releasing an address: teardown only returns an address to the
//! pool when it actually removed the corresponding entry here.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};

/// What the orchestrator remembers about one live sandbox.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Opaque sandbox id.
    pub id: String,
    /// Container name the sandbox runs under.
    pub container: String,
    /// Unique project name isolating this instance.
    pub project: String,
    /// Whether the address came from the pool (static addresses bypass it).
    pub pool_issued: bool,
    /// When the sandbox finished provisioning.
    pub provisioned_at: DateTime<Utc>,
}

/// Address → sandbox mapping for every live sandbox in this process.
#[derive(Debug, Default)]
pub struct SandboxRegistry {
    entries: HashMap<Ipv4Addr, RegistryEntry>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sandbox under its address. Returns the displaced entry
    /// if the address was somehow already registered.
    pub fn insert(&mut self, address: Ipv4Addr, entry: RegistryEntry) -> Option<RegistryEntry> {
        self.entries.insert(address, entry)
    }

    /// Removes and returns the entry for `address`, if registered.
    pub fn remove(&mut self, address: Ipv4Addr) -> Option<RegistryEntry> {
        self.entries.remove(&address)
    }

    #[allow(dead_code)] // Exercised by tests; useful for callers
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.entries.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)] // Exercised by tests; useful for callers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all entries, for coordinated shutdown.
    pub fn drain(&mut self) -> Vec<(Ipv4Addr, RegistryEntry)> {
        self.entries.drain().collect()
    }
}
