//! Docker-backed container runtime.
//!
//! Each sandbox runs as one container on a managed bridge network with a
//! static address. Containers are labeled so instances left behind by a
//! crashed process can be reaped on the next startup.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogOutput,
    NetworkingConfig, RemoveContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{ContainerRuntime, RuntimeSpec};

/// Runs sandbox containers against the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the local daemon and verifies it is reachable.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker. Is Docker running?")?;

        docker
            .ping()
            .await
            .context("Cannot ping Docker daemon. Is Docker running?")?;

        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_network(&self, name: &str, subnet: &str) -> Result<()> {
        let mut filters = HashMap::new();
        filters.insert("name", vec![name]);

        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
            .context("Failed to list networks")?;

        // The name filter matches substrings; check for the exact name.
        if networks
            .iter()
            .any(|n| n.name.as_deref() == Some(name))
        {
            debug!("Network {} already exists", name);
            return Ok(());
        }

        info!("Creating network {} ({})", name, subnet);
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                ipam: Ipam {
                    config: Some(vec![IpamConfig {
                        subnet: Some(subnet.to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .with_context(|| format!("Failed to create network {name}"))?;

        Ok(())
    }

    async fn start(&self, spec: &RuntimeSpec) -> Result<()> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .exposed_ports
            .iter()
            .map(|p| (p.clone(), HashMap::new()))
            .collect();

        let mut endpoints = HashMap::new();
        endpoints.insert(
            spec.network.clone(),
            EndpointSettings {
                ipam_config: Some(EndpointIpamConfig {
                    ipv4_address: Some(spec.address.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };

        debug!("Creating container: {}", spec.container);
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.container.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .context("Failed to create container")?;

        debug!("Starting container: {}", spec.container);
        self.docker
            .start_container::<String>(&spec.container, None)
            .await
            .context("Failed to start container")?;

        Ok(())
    }

    async fn is_running(&self, container: &str) -> Result<bool> {
        let inspect = self
            .docker
            .inspect_container(container, None)
            .await
            .with_context(|| format!("Failed to inspect container {container}"))?;

        Ok(inspect
            .state
            .and_then(|s| s.running)
            .unwrap_or(false))
    }

    async fn exec(
        &self,
        container: &str,
        cmd: &[String],
        user: Option<&str>,
        detach: bool,
    ) -> Result<()> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    user: user.map(ToString::to_string),
                    attach_stdout: Some(!detach),
                    attach_stderr: Some(!detach),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create exec")?;

        if detach {
            self.docker
                .start_exec(
                    &exec.id,
                    Some(StartExecOptions {
                        detach: true,
                        ..Default::default()
                    }),
                )
                .await
                .context("Failed to start detached exec")?;
            return Ok(());
        }

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .context("Failed to start exec")?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        debug!("exec stdout: {}", String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        debug!("exec stderr: {}", String::from_utf8_lossy(&message));
                    }
                    Err(e) => {
                        warn!("Error reading exec output: {}", e);
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    async fn remove(&self, container: &str) -> Result<()> {
        debug!("Removing container: {}", container);
        self.docker
            .remove_container(
                container,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("Failed to remove container {container}"))?;

        Ok(())
    }

    async fn remove_labeled(&self, key: &str, value: &str) -> Result<u32> {
        let label = format!("{key}={value}");
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("Failed to list containers")?;

        let mut removed = 0;
        for container in containers {
            let Some(id) = container.id else { continue };
            match self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => {
                    info!("Removed orphaned container {}", id);
                    removed += 1;
                }
                Err(e) => {
                    warn!("Failed to remove container {}: {}", id, e);
                }
            }
        }

        Ok(removed)
    }
}
