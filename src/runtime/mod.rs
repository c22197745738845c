//! Container runtime abstraction for sandbox instances.
//!
//! Sandboxes run as Docker containers in production; the trait seam
//! exists so lifecycle logic (provision rollback, reset, teardown) can be
//! exercised against scripted runtimes without a Docker daemon.

mod docker;
mod null;

pub use docker::DockerRuntime;
pub use null::NullRuntime;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Everything needed to start one sandbox container: the in-memory form
/// of the per-instance descriptor file.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSpec {
    /// Unique project name isolating this instance.
    pub project: String,
    /// Container name, derived from the project.
    pub container: String,
    /// Image to run.
    pub image: String,
    /// Bridge network to attach to.
    pub network: String,
    /// Static IPv4 address on that network.
    pub address: String,
    /// Volume bindings, `host:container:mode`.
    pub binds: Vec<String>,
    /// Environment, `KEY=VALUE`.
    pub env: Vec<String>,
    /// Labels identifying containers created by this orchestrator.
    pub labels: HashMap<String, String>,
    /// Ports exposed on the sandbox network, e.g. `5900/tcp`.
    pub exposed_ports: Vec<String>,
}

impl RuntimeSpec {
    /// Serializes the spec to a transient descriptor file and returns
    /// its path. The caller owns the file and removes it on teardown.
    pub fn write_descriptor(&self) -> Result<PathBuf> {
        let body = serde_json::to_string_pretty(self)?;
        let file = tempfile::Builder::new()
            .prefix("deskbox-spec-")
            .suffix(".json")
            .tempfile()?;
        std::fs::write(file.path(), body)?;
        let (_, path) = file.keep()?;
        Ok(path)
    }
}

/// Operations the orchestrator needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Makes sure the managed bridge network exists with the given subnet.
    async fn ensure_network(&self, name: &str, subnet: &str) -> Result<()>;

    /// Creates and starts the container described by `spec`.
    async fn start(&self, spec: &RuntimeSpec) -> Result<()>;

    /// Whether the container is currently running.
    async fn is_running(&self, container: &str) -> Result<bool>;

    /// Runs a command inside the container. With `detach` the call
    /// returns once the command has been dispatched.
    async fn exec(
        &self,
        container: &str,
        cmd: &[String],
        user: Option<&str>,
        detach: bool,
    ) -> Result<()>;

    /// Stops and removes the container.
    async fn remove(&self, container: &str) -> Result<()>;

    /// Force-removes every container carrying the given label, returning
    /// how many were removed. Used to reap instances left behind by a
    /// previous process.
    async fn remove_labeled(&self, key: &str, value: &str) -> Result<u32>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RuntimeSpec {
        RuntimeSpec {
            project: "deskbox-abc123".to_string(),
            container: "deskbox-abc123-desktop".to_string(),
            image: "deskbox-desktop:latest".to_string(),
            network: "deskbox-net".to_string(),
            address: "172.20.0.2".to_string(),
            binds: vec!["/tmp/home:/home/user:rw".to_string()],
            env: vec!["DISPLAY_WIDTH=500".to_string()],
            labels: HashMap::from([("created_by".to_string(), "deskbox-net".to_string())]),
            exposed_ports: vec!["5900/tcp".to_string()],
        }
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let path = spec().write_descriptor().unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();

        assert_eq!(parsed["container"], "deskbox-abc123-desktop");
        assert_eq!(parsed["address"], "172.20.0.2");
        assert_eq!(parsed["binds"][0], "/tmp/home:/home/user:rw");

        std::fs::remove_file(path).unwrap();
    }
}
