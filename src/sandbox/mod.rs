//! One disposable desktop sandbox per training episode.
//!
//! A [`Sandbox`] owns an exclusive scratch home directory bind-mounted
//! into its container, the navigation event channel, a lazily created
//! remote-desktop session, and the current task. Lifecycle is a
//! monotonic state machine: `Provisioning → Running → TearingDown →
//! Closed`, with teardown safe to call any number of times.

mod prefs;
mod template;

pub use prefs::{UiPrefs, ViewMode};

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::RngCore;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::{expand_path, OrchestratorConfig};
use crate::error::OrchestratorError;
use crate::events::{EventChannel, NavCallback, NavState, CHANNEL_FILE};
use crate::orchestrator::Shared;
use crate::registry::RegistryEntry;
use crate::remote::{Frame, Geometry, RemoteDesktopSession, RfbConnector, TransportError};
use crate::runtime::{ContainerRuntime, RuntimeSpec};
use crate::task::{self, Task};

/// Entries the sandbox runtime creates inside the home tree; hidden from
/// directory listings and never eligible as task targets.
pub(crate) const RUNTIME_ENTRIES: &[&str] = &[CHANNEL_FILE, ".dbus"];

/// How long to wait for the container to report running after start.
const HEALTH_DEADLINE: Duration = Duration::from_secs(30);
const HEALTH_POLL: Duration = Duration::from_millis(250);

/// Pause between relaunching the file manager on reset and probing for
/// a rendered frame.
const RESET_SETTLE: Duration = Duration::from_millis(500);
const RESET_PROBE_POLL: Duration = Duration::from_millis(250);

/// Lifecycle phase of a sandbox. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Provisioning,
    Running,
    TearingDown,
    Closed,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Running => write!(f, "running"),
            Self::TearingDown => write!(f, "tearing-down"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// A live sandbox instance and its host-side resources.
pub struct Sandbox {
    id: String,
    address: Ipv4Addr,
    pool_issued: bool,
    state: LifecycleState,
    config: Arc<OrchestratorConfig>,
    runtime: Arc<dyn ContainerRuntime>,
    shared: Arc<Shared>,

    scratch: Option<TempDir>,
    scratch_path: PathBuf,
    /// Absolute home path inside the sandbox (the scratch mount point).
    home: String,

    channel: EventChannel,
    nav: Arc<NavState>,
    listener: Option<std::thread::JoinHandle<()>>,
    callback: Option<Arc<NavCallback>>,

    session: Option<RemoteDesktopSession>,
    task: Option<Task>,
    prefs: UiPrefs,

    container: String,
    descriptor: Option<PathBuf>,

    rng: Box<dyn RngCore + Send>,
}

impl Sandbox {
    /// Provisions a new sandbox bound to `address`.
    ///
    /// On failure every trace of this sandbox is cleaned up before the
    /// error propagates; the address itself is the caller's to release.
    pub(crate) async fn provision(
        config: Arc<OrchestratorConfig>,
        runtime: Arc<dyn ContainerRuntime>,
        shared: Arc<Shared>,
        address: Ipv4Addr,
        pool_issued: bool,
        callback: Option<Arc<NavCallback>>,
        mut rng: Box<dyn RngCore + Send>,
    ) -> Result<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let project = format!("deskbox-{id}");
        let container = format!("{project}-desktop");
        let home = config.sandbox_home();

        // Host-side scratch home, populated before the container starts.
        let scratch = tempfile::Builder::new()
            .prefix("deskbox-home-")
            .tempdir()
            .context("Failed to create scratch root")?;
        let scratch_path = scratch.path().to_path_buf();

        let tree = template::choose(config.templates.dir.as_deref(), rng.as_mut())?;
        template::populate(&scratch_path, &tree, rng.as_mut())?;

        let channel = EventChannel::create(&scratch_path)?;
        let prefs = UiPrefs::randomize(&scratch_path, rng.as_mut());

        let spec = build_spec(&config, &project, &container, address, &scratch_path, &prefs)?;
        let descriptor = spec.write_descriptor()?;

        runtime
            .ensure_network(&config.network.name, &config.network.subnet)
            .await?;

        if let Err(e) = runtime.start(&spec).await {
            let _ = std::fs::remove_file(&descriptor);
            return Err(e).context("Failed to start sandbox runtime");
        }

        if let Err(e) = wait_healthy(runtime.as_ref(), &container).await {
            let _ = runtime.remove(&container).await;
            let _ = std::fs::remove_file(&descriptor);
            return Err(e);
        }

        let nav = Arc::new(NavState::new(home.clone(), prefs.view.as_str()));
        let mut sandbox = Self {
            id: id.clone(),
            address,
            pool_issued,
            state: LifecycleState::Provisioning,
            config,
            runtime,
            shared: shared.clone(),
            scratch: Some(scratch),
            scratch_path,
            home,
            channel,
            nav,
            listener: None,
            callback,
            session: None,
            task: None,
            prefs,
            container: container.clone(),
            descriptor: Some(descriptor),
            rng,
        };

        shared.lock_registry().insert(
            address,
            RegistryEntry {
                id,
                container,
                project,
                pool_issued,
                provisioned_at: Utc::now(),
            },
        );
        sandbox.state = LifecycleState::Running;

        if let Err(e) = sandbox.finish_provision() {
            // The address stays allocated here; the orchestrator
            // releases it when this error reaches it.
            sandbox.pool_issued = false;
            sandbox.teardown().await;
            return Err(e);
        }

        info!(
            "Sandbox {} running at {} (home {})",
            sandbox.id, sandbox.address, sandbox.scratch_path.display()
        );
        Ok(sandbox)
    }

    /// Post-start wiring: listener thread, baseline navigation state,
    /// initial task.
    fn finish_provision(&mut self) -> Result<()> {
        let listener = self.channel.spawn_listener(
            self.nav.clone(),
            self.home.clone(),
            self.callback.clone(),
        )?;
        self.listener = Some(listener);

        // Synthetic baseline callback: no event has arrived yet, but
        // callers treat the home root and default view as reconciled.
        if let Some(cb) = &self.callback {
            cb("/", self.prefs.view.as_str());
        }

        self.task = Some(task::generate(&self.scratch_path, self.rng.as_mut())?);
        Ok(())
    }

    /// Opaque unique identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The address this sandbox exclusively owns until teardown.
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Host-side path of the sandbox home.
    pub fn scratch_root(&self) -> &Path {
        &self.scratch_path
    }

    /// Current UI preferences (view mode, sidebar, bookmarks).
    pub fn prefs(&self) -> &UiPrefs {
        &self.prefs
    }

    /// Instruction text of the current task.
    pub fn instruction(&self) -> Option<&str> {
        self.task.as_ref().map(Task::instruction)
    }

    /// The current task, if one has been generated.
    pub fn task(&self) -> Option<&Task> {
        self.task.as_ref()
    }

    /// Reconciled navigation state: home-relative path and view mode.
    pub fn current_navigation_state(&self) -> (String, String) {
        let (abs, view) = self.nav.snapshot();
        let rel = crate::events::relative_to_home(&abs, &self.home)
            .unwrap_or_else(|| "/".to_string());
        (rel, view)
    }

    /// Whether a mouse hold is in progress.
    pub fn mouse_held(&self) -> bool {
        self.session.as_ref().is_some_and(RemoteDesktopSession::mouse_held)
    }

    /// Textual tree of the current home contents.
    pub fn directory_tree(&self) -> String {
        template::directory_tree(&self.scratch_path, RUNTIME_ENTRIES)
    }

    /// Blocks until the current task's goal state holds or `timeout`
    /// elapses. `false` if there is no task or the deadline passed.
    pub async fn wait_for_task(
        &self,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> bool {
        match &self.task {
            Some(task) => task.wait_for_completion(poll_interval, timeout).await,
            None => false,
        }
    }

    /// Re-rolls the episode without restarting the container: fresh home
    /// tree, fresh preferences, fresh task. Returns once the relaunched
    /// file manager renders (readiness probe), so the next `get_screen`
    /// observes the new state rather than a stale frame.
    pub async fn reset(&mut self) -> Result<(), OrchestratorError> {
        if self.state != LifecycleState::Running {
            return Err(OrchestratorError::invalid_state("running", self.state));
        }
        self.reset_inner()
            .await
            .map_err(|e| OrchestratorError::provision_failed(format!("{e:#}")))
    }

    async fn reset_inner(&mut self) -> Result<()> {
        debug!("Resetting sandbox {}", self.id);

        template::clear(&self.scratch_path, CHANNEL_FILE)?;
        let tree = template::choose(self.config.templates.dir.as_deref(), self.rng.as_mut())?;
        template::populate(&self.scratch_path, &tree, self.rng.as_mut())?;

        self.prefs = UiPrefs::randomize(&self.scratch_path, self.rng.as_mut());
        prefs::write_bookmark_files(&self.scratch_path, &self.home, &self.prefs)?;

        let user = container_user();
        let seed = prefs::bookmark_seed_script(&self.prefs);
        if let Err(e) = self
            .runtime
            .exec(&self.container, &shell(&seed), Some(&user), false)
            .await
        {
            warn!("Failed to reseed container bookmarks: {e}");
        }

        // pkill reports failure when nothing matched; either way the
        // relaunch below brings a fresh instance up.
        let kill = format!("pkill -f {}", self.config.runtime.file_manager);
        let _ = self
            .runtime
            .exec(&self.container, &shell(&kill), Some(&user), false)
            .await;

        let relaunch =
            prefs::relaunch_script(&self.prefs, &self.home, &self.config.runtime.file_manager);
        self.runtime
            .exec(&self.container, &shell(&relaunch), Some(&user), true)
            .await
            .context("Failed to relaunch file manager")?;

        self.nav.reseed(self.home.clone(), self.prefs.view.as_str());
        self.task = Some(task::generate(&self.scratch_path, self.rng.as_mut())?);

        tokio::time::sleep(RESET_SETTLE).await;
        let frame = self.get_screen(None, RESET_PROBE_POLL).await;
        debug!(
            "Reset probe for {} done ({}x{})",
            self.id, frame.width, frame.height
        );
        Ok(())
    }

    /// Tears the sandbox down and reclaims every resource it owns.
    ///
    /// Idempotent and infallible by contract: failures along the way are
    /// logged, never propagated — reclaiming the address and registry
    /// slot takes priority over reporting.
    pub async fn teardown(&mut self) {
        if self.state == LifecycleState::Closed {
            return;
        }
        self.state = LifecycleState::TearingDown;
        debug!("Tearing down sandbox {}", self.id);

        if let Err(e) = self.runtime.remove(&self.container).await {
            warn!("Failed to remove container {}: {e:#}", self.container);
        }

        if let Some(mut session) = self.session.take() {
            session.disconnect();
        }

        // Stop signal first, channel removal second: a straggling
        // listener iteration hits a missing file and exits instead of
        // hanging. The thread is never joined.
        self.nav.request_stop();
        self.channel.remove();
        self.listener.take();

        self.reclaim_slot();

        if let Some(path) = self.descriptor.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove descriptor {}: {e}", path.display());
                }
            }
        }

        if let Some(scratch) = self.scratch.take() {
            if let Err(e) = scratch.close() {
                warn!("Failed to remove scratch root: {e}");
            }
        }

        self.state = LifecycleState::Closed;
        info!("Sandbox {} closed, {} released", self.id, self.address);
    }

    /// Removes the registry entry and, only if one was actually present,
    /// returns a pool-issued address. Calling twice releases once.
    fn reclaim_slot(&mut self) {
        let entry = self.shared.lock_registry().remove(self.address);
        if entry.is_some() && self.pool_issued {
            self.shared.lock_pool().release(self.address);
        }
    }

    /// Captures the screen region below the toolbar margin, waiting for
    /// a rendered (non-dark) frame. See
    /// [`RemoteDesktopSession::get_screen`] for the timeout contract.
    pub async fn get_screen(
        &mut self,
        timeout: Option<Duration>,
        poll_interval: Duration,
    ) -> Frame {
        self.session_mut().get_screen(timeout, poll_interval).await
    }

    /// Moves the cursor by a delta from its last known position.
    pub async fn move_cursor_by(&mut self, dx: i32, dy: i32) -> Result<(), TransportError> {
        self.session_mut().move_cursor_by(dx, dy).await
    }

    /// Moves the cursor to an absolute position.
    pub async fn move_cursor_to(&mut self, x: i32, y: i32) -> Result<(), TransportError> {
        self.session_mut().move_cursor_to(x, y).await
    }

    /// Clicks a mouse button (1 = left, 2 = middle, 3 = right).
    pub async fn click(&mut self, button: u8) -> Result<(), TransportError> {
        self.session_mut().click(button).await
    }

    /// Presses and holds a mouse button.
    pub async fn hold_start(&mut self, button: u8) -> Result<(), TransportError> {
        self.session_mut().hold_start(button).await
    }

    /// Releases a held mouse button.
    pub async fn hold_end(&mut self, button: u8) -> Result<(), TransportError> {
        self.session_mut().hold_end(button).await
    }

    /// Presses a key by X keysym.
    pub async fn key_down(&mut self, keysym: u32) -> Result<(), TransportError> {
        self.session_mut().key_down(keysym).await
    }

    /// Releases a key by X keysym.
    pub async fn key_up(&mut self, keysym: u32) -> Result<(), TransportError> {
        self.session_mut().key_up(keysym).await
    }

    /// Presses and releases a key by X keysym.
    pub async fn key_press(&mut self, keysym: u32) -> Result<(), TransportError> {
        self.session_mut().key_press(keysym).await
    }

    /// The remote session, created on first use. A session object always
    /// exists from here on; its connection self-heals per call.
    fn session_mut(&mut self) -> &mut RemoteDesktopSession {
        let config = &self.config;
        let address = self.address;
        self.session.get_or_insert_with(|| {
            let connector = RfbConnector::new(
                address,
                config.remote.port,
                config.remote.password.clone(),
                Duration::from_secs(config.remote.connect_timeout_secs),
            );
            RemoteDesktopSession::new(
                Box::new(connector),
                Geometry {
                    width: config.display.width,
                    height: config.display.height,
                    toolbar_margin: config.display.toolbar_margin,
                },
            )
        })
    }

    #[cfg(test)]
    pub(crate) fn inject_session(&mut self, session: RemoteDesktopSession) {
        self.session = Some(session);
    }

    #[cfg(test)]
    pub(crate) fn descriptor_path(&self) -> Option<&Path> {
        self.descriptor.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn channel_path(&self) -> &Path {
        self.channel.path()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.state != LifecycleState::Closed {
            warn!(
                "Sandbox {} dropped without teardown; reclaiming host-side state",
                self.id
            );
            self.nav.request_stop();
            self.channel.remove();
            self.reclaim_slot();
            if let Some(path) = self.descriptor.take() {
                let _ = std::fs::remove_file(path);
            }
            // The container itself is reaped by cleanup_orphaned on the
            // next startup; removal needs an async runtime we may not
            // have during drop.
        }
    }
}

/// Populates `template` into a throwaway directory and renders the
/// resulting tree, for validating template files without a runtime.
pub fn preview_template(template: &str, seed: u64) -> Result<String> {
    use rand::SeedableRng;

    let dir = tempfile::tempdir().context("Failed to create preview directory")?;
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    template::populate(dir.path(), template, &mut rng)?;
    Ok(template::directory_tree(dir.path(), RUNTIME_ENTRIES))
}

/// `uid:gid` string aligning in-container execs with the host user that
/// owns the scratch mount.
fn container_user() -> String {
    format!(
        "{}:{}",
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw()
    )
}

fn shell(script: &str) -> Vec<String> {
    vec!["bash".to_string(), "-lc".to_string(), script.to_string()]
}

/// Assembles the runtime descriptor for one sandbox instance.
fn build_spec(
    config: &OrchestratorConfig,
    project: &str,
    container: &str,
    address: Ipv4Addr,
    scratch: &Path,
    prefs: &UiPrefs,
) -> Result<RuntimeSpec> {
    let mut binds = vec![format!("{}:{}:rw", scratch.display(), config.sandbox_home())];
    for mount in &config.runtime.shared_mounts {
        let host = expand_path(&mount.host)?;
        let mode = if mount.readonly { "ro" } else { "rw" };
        binds.push(format!("{}:{}:{}", host, mount.container, mode));
    }

    let mut env = vec![
        format!("VNC_PASSWORD={}", config.remote.password),
        format!("USER_ID={}", nix::unistd::getuid().as_raw()),
        format!("GROUP_ID={}", nix::unistd::getgid().as_raw()),
        format!("USER_NAME={}", config.runtime.username),
        "KEEP_APP_RUNNING=1".to_string(),
        format!("DISPLAY_WIDTH={}", config.display.width),
        format!(
            "DISPLAY_HEIGHT={}",
            config.display.toolbar_margin + config.display.height
        ),
    ];
    env.extend(prefs.env());

    Ok(RuntimeSpec {
        project: project.to_string(),
        container: container.to_string(),
        image: config.runtime.image.clone(),
        network: config.network.name.clone(),
        address: address.to_string(),
        binds,
        env,
        labels: std::collections::HashMap::from([(
            "created_by".to_string(),
            config.created_by_label(),
        )]),
        exposed_ports: vec![format!("{}/tcp", config.remote.port)],
    })
}

async fn wait_healthy(runtime: &dyn ContainerRuntime, container: &str) -> Result<()> {
    let deadline = std::time::Instant::now() + HEALTH_DEADLINE;
    loop {
        match runtime.is_running(container).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => debug!("Health check failed: {e}"),
        }
        if std::time::Instant::now() >= deadline {
            anyhow::bail!("Container {container} did not become healthy");
        }
        tokio::time::sleep(HEALTH_POLL).await;
    }
}
