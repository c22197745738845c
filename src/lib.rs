//! Disposable desktop sandboxes for UI-agent training.
//!
//! Each episode gets its own containerized desktop running a file
//! manager: an exclusive scratch home populated from a template, a
//! static address from a managed subnet, a VNC control session that
//! self-heals across transport failures, and an out-of-band event
//! channel reporting every navigation the agent causes. The
//! [`Orchestrator`] owns the address pool and sandbox registry;
//! [`Sandbox`] handles expose the per-instance control surface
//! (screen capture, input injection, reset, task polling).

pub mod config;
pub mod error;
mod events;
pub mod orchestrator;
mod pool;
mod registry;
pub mod remote;
pub mod runtime;
pub mod sandbox;
pub mod task;
mod templates;

pub use config::OrchestratorConfig;
pub use error::OrchestratorError;
pub use events::NavCallback;
pub use orchestrator::{Orchestrator, ProvisionOptions};
pub use remote::{Frame, TransportError};
pub use sandbox::{LifecycleState, Sandbox, UiPrefs, ViewMode};
pub use task::Task;
