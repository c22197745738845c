use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "deskbox.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub templates: TemplateConfig,
}

/// Managed bridge network the sandboxes attach to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// CIDR range addresses are drawn from. The first host is reserved
    /// as the gateway and never issued.
    #[serde(default = "default_subnet")]
    pub subnet: String,

    /// Name of the bridge network (created on first provision if absent).
    #[serde(default = "default_network_name")]
    pub name: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnet: default_subnet(),
            name: default_network_name(),
        }
    }
}

/// Sandbox screen geometry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_display_dim")]
    pub width: u32,

    #[serde(default = "default_display_dim")]
    pub height: u32,

    /// Vertical offset reserved for a fixed top bar inside the sandbox.
    /// Cursor coordinates and frame captures are expressed below it.
    #[serde(default)]
    pub toolbar_margin: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: default_display_dim(),
            height: default_display_dim(),
            toolbar_margin: 0,
        }
    }
}

/// Remote-framebuffer (VNC) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Shared secret for VNC authentication. Every sandbox uses the
    /// same one; the network is private to the orchestrator.
    #[serde(default = "default_password")]
    pub password: String,

    #[serde(default = "default_vnc_port")]
    pub port: u16,

    /// TCP connect timeout for one connection attempt. The session
    /// retries the full connect-and-probe cycle without bound.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            password: default_password(),
            port: default_vnc_port(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Container runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Desktop image to run. Expected to start a VNC server and the
    /// file manager, honoring the DISPLAY_*/SIDEBAR_HIDDEN/BOOKMARKS
    /// environment variables.
    #[serde(default = "default_image")]
    pub image: String,

    /// Account name inside the sandbox; drives the home directory path.
    /// The uid/gid stay aligned with the host user.
    #[serde(default = "default_username")]
    pub username: String,

    /// Process name of the in-sandbox file manager, used to restart it
    /// on reset.
    #[serde(default = "default_file_manager")]
    pub file_manager: String,

    /// Additional read-only asset mounts (pre-fetched themes, icons).
    #[serde(default)]
    pub shared_mounts: Vec<Mount>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            username: default_username(),
            file_manager: default_file_manager(),
            shared_mounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub host: String,
    pub container: String,
    #[serde(default = "default_true")]
    pub readonly: bool,
}

/// Where home-directory templates come from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Directory of template files; one is chosen at random per
    /// provision/reset. Absent: a built-in default tree is used.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

// Default value functions

fn default_subnet() -> String {
    "172.20.0.0/24".to_string()
}

fn default_network_name() -> String {
    "deskbox-net".to_string()
}

fn default_display_dim() -> u32 {
    500
}

fn default_password() -> String {
    "12345".to_string()
}

fn default_vnc_port() -> u16 {
    5900
}

fn default_connect_timeout() -> u64 {
    1
}

fn default_image() -> String {
    "deskbox-desktop:latest".to_string()
}

fn default_username() -> String {
    "user".to_string()
}

fn default_file_manager() -> String {
    "nautilus".to_string()
}

fn default_true() -> bool {
    true
}

impl OrchestratorConfig {
    /// Load configuration from `deskbox.toml` in `dir`, using defaults
    /// if the file is not present.
    pub fn load(dir: &Path) -> Result<Self> {
        Self::load_file(&dir.join(CONFIG_FILE))
    }

    /// Load configuration from an explicit path, using defaults if the
    /// file is not present.
    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Home directory path inside the sandbox.
    pub fn sandbox_home(&self) -> String {
        format!("/home/{}", self.runtime.username)
    }

    /// Label value marking containers as belonging to this deployment,
    /// used to reap orphans from earlier runs.
    pub(crate) fn created_by_label(&self) -> String {
        self.network.name.clone()
    }
}

/// Expand ~ to home directory
pub(crate) fn expand_path(path: &str) -> Result<String> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(rest).display().to_string())
    } else {
        Ok(path.to_string())
    }
}
