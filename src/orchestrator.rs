//! Process-wide sandbox orchestration.
//!
//! The [`Orchestrator`] is the single owner of the address pool and the
//! sandbox registry. It is constructed once by the process entry point
//! with an injected [`ContainerRuntime`] and passed by reference to
//! everything that provisions or reaps sandboxes — there is no hidden
//! global state, and all pool/registry mutation happens under the locks
//! held here.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::events::NavCallback;
use crate::pool::AddressPool;
use crate::registry::SandboxRegistry;
use crate::runtime::ContainerRuntime;
use crate::sandbox::Sandbox;

/// The two process-wide mutable structures, shared between the
/// orchestrator and every live sandbox (teardown reclaims through it).
pub(crate) struct Shared {
    pool: Mutex<AddressPool>,
    registry: Mutex<SandboxRegistry>,
}

impl Shared {
    pub(crate) fn lock_pool(&self) -> MutexGuard<'_, AddressPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_registry(&self) -> MutexGuard<'_, SandboxRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Options for one provisioning call.
#[derive(Default)]
pub struct ProvisionOptions {
    /// Bypass the pool and bind this exact address. Used for child and
    /// clone scenarios where the address is managed elsewhere; such an
    /// address is never returned to the pool.
    pub static_address: Option<Ipv4Addr>,

    /// Invoked with `(home-relative path, view mode)` on every
    /// navigation change, starting with a synthetic baseline event.
    pub on_navigate: Option<NavCallback>,

    /// Seed for this sandbox's random choices (template, preferences,
    /// task). Unseeded sandboxes draw from OS entropy.
    pub seed: Option<u64>,
}

/// Owns the pool and registry; hands out [`Sandbox`] instances.
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    runtime: Arc<dyn ContainerRuntime>,
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Builds the orchestrator, enumerating the configured subnet into
    /// the address pool.
    pub fn new(config: OrchestratorConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let subnet: Ipv4Net = config
            .network
            .subnet
            .parse()
            .with_context(|| format!("Invalid subnet {:?}", config.network.subnet))?;

        let shared = Shared {
            pool: Mutex::new(AddressPool::new(subnet)),
            registry: Mutex::new(SandboxRegistry::new()),
        };

        Ok(Self {
            config: Arc::new(config),
            runtime,
            shared: Arc::new(shared),
        })
    }

    /// Provisions one sandbox: address, scratch home, container, event
    /// listener, initial task.
    ///
    /// On failure everything is rolled back — address, registry entry,
    /// scratch state — and the call is safe to retry.
    pub async fn provision(
        &self,
        options: ProvisionOptions,
    ) -> Result<Sandbox, OrchestratorError> {
        let (address, pool_issued) = match options.static_address {
            Some(address) => (address, false),
            None => (self.shared.lock_pool().allocate()?, true),
        };
        info!("Provisioning sandbox at {}", address);

        let rng: Box<dyn RngCore + Send> = match options.seed {
            Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
            None => Box::new(StdRng::from_os_rng()),
        };

        let result = Sandbox::provision(
            self.config.clone(),
            self.runtime.clone(),
            self.shared.clone(),
            address,
            pool_issued,
            options.on_navigate.map(Arc::new),
            rng,
        )
        .await;

        match result {
            Ok(sandbox) => Ok(sandbox),
            Err(e) => {
                // The sandbox removed its own traces (container,
                // scratch, registry entry); the address is ours.
                self.shared.lock_registry().remove(address);
                if pool_issued {
                    self.shared.lock_pool().release(address);
                }
                warn!("Provisioning at {} failed: {:#}", address, e);
                Err(OrchestratorError::provision_failed(format!("{e:#}")))
            }
        }
    }

    /// Removes containers left behind by earlier runs of this
    /// deployment. Call once at startup, before provisioning.
    pub async fn cleanup_orphaned(&self) -> Result<u32> {
        self.runtime
            .remove_labeled("created_by", &self.config.created_by_label())
            .await
    }

    /// Coordinated shutdown: removes every registered container and
    /// reclaims every pool-issued address. Sandbox handles that are
    /// still alive afterwards tear down into no-ops.
    pub async fn shutdown_all(&self) -> u32 {
        let entries = {
            let mut registry = self.shared.lock_registry();
            registry.drain()
        };

        let mut removed = 0;
        for (address, entry) in entries {
            match self.runtime.remove(&entry.container).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove container {}: {e:#}", entry.container),
            }
            if entry.pool_issued {
                self.shared.lock_pool().release(address);
            }
        }
        info!("Shut down {} sandboxes", removed);
        removed
    }

    /// Number of addresses currently free.
    pub fn available_addresses(&self) -> usize {
        self.shared.lock_pool().available()
    }

    /// Number of live sandboxes.
    pub fn active_sandboxes(&self) -> usize {
        self.shared.lock_registry().len()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeSpec;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted runtime: records calls, optionally refuses to start.
    #[derive(Default)]
    struct MockRuntime {
        fail_start: bool,
        started: Mutex<Vec<RuntimeSpec>>,
        removed: Mutex<Vec<String>>,
        execs: Mutex<Vec<(String, Vec<String>, bool)>>,
    }

    impl MockRuntime {
        fn failing() -> Self {
            Self {
                fail_start: true,
                ..Default::default()
            }
        }

        fn started(&self) -> Vec<RuntimeSpec> {
            self.started.lock().unwrap().clone()
        }

        fn removed(&self) -> Vec<String> {
            self.removed.lock().unwrap().clone()
        }

        fn execs(&self) -> Vec<(String, Vec<String>, bool)> {
            self.execs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn ensure_network(&self, _name: &str, _subnet: &str) -> Result<()> {
            Ok(())
        }

        async fn start(&self, spec: &RuntimeSpec) -> Result<()> {
            if self.fail_start {
                anyhow::bail!("start refused by mock");
            }
            self.started.lock().unwrap().push(spec.clone());
            Ok(())
        }

        async fn is_running(&self, _container: &str) -> Result<bool> {
            Ok(!self.fail_start)
        }

        async fn exec(
            &self,
            container: &str,
            cmd: &[String],
            _user: Option<&str>,
            detach: bool,
        ) -> Result<()> {
            self.execs
                .lock()
                .unwrap()
                .push((container.to_string(), cmd.to_vec(), detach));
            Ok(())
        }

        async fn remove(&self, container: &str) -> Result<()> {
            self.removed.lock().unwrap().push(container.to_string());
            Ok(())
        }

        async fn remove_labeled(&self, _key: &str, _value: &str) -> Result<u32> {
            Ok(0)
        }
    }

    fn orchestrator(runtime: Arc<MockRuntime>) -> Orchestrator {
        Orchestrator::new(OrchestratorConfig::default(), runtime).unwrap()
    }

    fn seeded(seed: u64) -> ProvisionOptions {
        ProvisionOptions {
            seed: Some(seed),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_provision_populates_and_registers() {
        let runtime = Arc::new(MockRuntime::default());
        let orch = orchestrator(runtime.clone());
        let total = orch.available_addresses();

        let sandbox = orch.provision(seeded(1)).await.unwrap();

        assert_eq!(orch.available_addresses(), total - 1);
        assert_eq!(orch.active_sandboxes(), 1);
        // Default template landed in the scratch home.
        assert!(sandbox.scratch_root().join("Documents").is_dir());
        assert!(sandbox.channel_path().exists());
        assert!(sandbox.instruction().is_some());
        assert_eq!(
            sandbox.current_navigation_state().0,
            "/".to_string()
        );

        let started = runtime.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].address, sandbox.address().to_string());
    }

    #[tokio::test]
    async fn test_provision_then_teardown_restores_everything() {
        let runtime = Arc::new(MockRuntime::default());
        let orch = orchestrator(runtime.clone());
        let total = orch.available_addresses();

        let mut sandbox = orch.provision(seeded(2)).await.unwrap();
        let descriptor = sandbox.descriptor_path().unwrap().to_path_buf();
        let channel = sandbox.channel_path().to_path_buf();
        assert!(descriptor.exists());

        sandbox.teardown().await;

        assert_eq!(orch.available_addresses(), total);
        assert_eq!(orch.active_sandboxes(), 0);
        assert!(!descriptor.exists());
        assert!(!channel.exists());
        assert_eq!(runtime.removed().len(), 1);

        // Idempotent: a second teardown neither fails nor double-releases.
        sandbox.teardown().await;
        assert_eq!(orch.available_addresses(), total);
        assert_eq!(runtime.removed().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back_fully() {
        let runtime = Arc::new(MockRuntime::failing());
        let orch = orchestrator(runtime);
        let total = orch.available_addresses();

        let err = orch.provision(seeded(3)).await.unwrap_err();

        assert!(err.is_provision_failed());
        assert_eq!(orch.available_addresses(), total);
        assert_eq!(orch.active_sandboxes(), 0);
    }

    #[tokio::test]
    async fn test_static_address_bypasses_pool() {
        let runtime = Arc::new(MockRuntime::default());
        let orch = orchestrator(runtime);
        let total = orch.available_addresses();

        let address = Ipv4Addr::new(172, 20, 0, 200);
        let mut sandbox = orch
            .provision(ProvisionOptions {
                static_address: Some(address),
                seed: Some(4),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(sandbox.address(), address);
        assert_eq!(orch.available_addresses(), total);
        assert_eq!(orch.active_sandboxes(), 1);

        sandbox.teardown().await;
        // A static address never enters the pool.
        assert_eq!(orch.available_addresses(), total);
        assert_eq!(orch.active_sandboxes(), 0);
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let runtime = Arc::new(MockRuntime::default());
        let mut config = OrchestratorConfig::default();
        // /30 leaves a single allocatable host after the gateway.
        config.network.subnet = "10.9.0.0/30".to_string();
        let orch = Orchestrator::new(config, runtime).unwrap();

        let _first = orch.provision(seeded(5)).await.unwrap();
        let err = orch.provision(seeded(6)).await.unwrap_err();
        assert!(err.is_pool_exhausted());
    }

    #[tokio::test]
    async fn test_initial_synthetic_navigation_callback() {
        let runtime = Arc::new(MockRuntime::default());
        let orch = orchestrator(runtime);

        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let seen_in_cb = seen.clone();
        let sandbox = orch
            .provision(ProvisionOptions {
                on_navigate: Some(Box::new(move |path, view| {
                    seen_in_cb.lock().unwrap().push((path.into(), view.into()));
                })),
                seed: Some(7),
                ..Default::default()
            })
            .await
            .unwrap();

        let events = seen.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "/");
        assert_eq!(events[0].1, sandbox.prefs().view.as_str());
    }

    #[tokio::test]
    async fn test_shutdown_all_reclaims_registry_and_pool() {
        let runtime = Arc::new(MockRuntime::default());
        let orch = orchestrator(runtime.clone());
        let total = orch.available_addresses();

        let _a = orch.provision(seeded(8)).await.unwrap();
        let _b = orch.provision(seeded(9)).await.unwrap();
        assert_eq!(orch.active_sandboxes(), 2);

        let removed = orch.shutdown_all().await;
        assert_eq!(removed, 2);
        assert_eq!(orch.active_sandboxes(), 0);
        assert_eq!(orch.available_addresses(), total);
        assert_eq!(runtime.removed().len(), 2);
    }

    // -------------------------------------------------------------------------
    // Reset (with a scripted remote session)
    // -------------------------------------------------------------------------

    mod reset {
        use super::*;
        use crate::remote::{
            Connector, Frame, FramebufferTransport, Geometry, RemoteDesktopSession,
            TransportError,
        };

        struct ReadyTransport;

        #[async_trait]
        impl FramebufferTransport for ReadyTransport {
            async fn pointer_event(
                &mut self,
                _mask: u8,
                _x: u16,
                _y: u16,
            ) -> Result<(), TransportError> {
                Ok(())
            }

            async fn key_event(&mut self, _down: bool, _keysym: u32) -> Result<(), TransportError> {
                Ok(())
            }

            async fn capture(
                &mut self,
                _x: u16,
                _y: u16,
                width: u16,
                height: u16,
            ) -> Result<Frame, TransportError> {
                Ok(Frame {
                    width: u32::from(width),
                    height: u32::from(height),
                    data: vec![200; width as usize * height as usize * 3],
                })
            }
        }

        struct ReadyConnector(Arc<AtomicUsize>);

        #[async_trait]
        impl Connector for ReadyConnector {
            async fn connect(&self) -> Result<Box<dyn FramebufferTransport>, TransportError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(ReadyTransport))
            }
        }

        #[tokio::test]
        async fn test_reset_repopulates_and_regenerates() {
            let runtime = Arc::new(MockRuntime::default());
            let orch = orchestrator(runtime.clone());
            let mut sandbox = orch.provision(seeded(10)).await.unwrap();

            // Mark the pre-reset tree so we can tell it was wiped.
            std::fs::write(sandbox.scratch_root().join("marker.bin"), "x").unwrap();

            let connects = Arc::new(AtomicUsize::new(0));
            sandbox.inject_session(RemoteDesktopSession::new(
                Box::new(ReadyConnector(connects.clone())),
                Geometry {
                    width: 100,
                    height: 100,
                    toolbar_margin: 0,
                },
            ));

            sandbox.reset().await.unwrap();

            // Wiped and repopulated: the marker is gone, the channel and
            // a fresh tree remain.
            assert!(!sandbox.scratch_root().join("marker.bin").exists());
            assert!(sandbox.channel_path().exists());
            assert!(sandbox.scratch_root().join("Documents").is_dir());
            assert!(sandbox.instruction().is_some());

            // The readiness probe went through the injected session.
            assert!(connects.load(Ordering::SeqCst) >= 1);

            // Container-side reseed, kill, and detached relaunch.
            let execs = runtime.execs();
            assert!(execs.iter().any(|(_, cmd, _)| cmd
                .iter()
                .any(|part| part.contains("gtk-3.0"))));
            assert!(execs.iter().any(|(_, cmd, _)| cmd
                .iter()
                .any(|part| part.contains("pkill"))));
            assert!(execs
                .iter()
                .any(|(_, cmd, detach)| *detach && cmd.iter().any(|p| p.contains("nautilus"))));

            // Navigation baseline reseeded to the new view at home root.
            let (path, view) = sandbox.current_navigation_state();
            assert_eq!(path, "/");
            assert_eq!(view, sandbox.prefs().view.as_str());
        }

        #[tokio::test]
        async fn test_reset_requires_running_state() {
            let runtime = Arc::new(MockRuntime::default());
            let orch = orchestrator(runtime);
            let mut sandbox = orch.provision(seeded(11)).await.unwrap();

            sandbox.teardown().await;
            let err = sandbox.reset().await.unwrap_err();
            assert!(matches!(err, OrchestratorError::InvalidState { .. }));
        }
    }
}
