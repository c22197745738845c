//! Domain-specific error types for orchestrator operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings. Transport-level failures
//! never appear here: they are absorbed inside the remote-desktop
//! session and only surface as per-call results (see [`crate::remote`]).

/// Errors that can occur while provisioning or driving sandboxes.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Every address in the managed subnet is assigned to a live sandbox.
    ///
    /// Recoverable by tearing another sandbox down first.
    #[error("address pool exhausted: no free addresses in the managed subnet")]
    PoolExhausted,

    /// The sandbox runtime failed to come up. All partially allocated
    /// state (address, registry entry, scratch files) has been rolled
    /// back; the call is safe to retry.
    #[error("sandbox provisioning failed: {message}")]
    ProvisionFailed { message: String },

    /// An operation was invoked in a lifecycle state that does not
    /// permit it (e.g. `reset` on a sandbox that is tearing down).
    #[error("invalid lifecycle state: expected {expected}, sandbox is {actual}")]
    InvalidState { expected: String, actual: String },
}

impl OrchestratorError {
    /// Creates a `ProvisionFailed` error from any displayable cause.
    pub fn provision_failed(cause: impl std::fmt::Display) -> Self {
        Self::ProvisionFailed {
            message: cause.to_string(),
        }
    }

    /// Creates an `InvalidState` error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }

    /// Returns true if this is a pool exhaustion error.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted)
    }

    /// Returns true if this is a provisioning failure.
    pub fn is_provision_failed(&self) -> bool {
        matches!(self, Self::ProvisionFailed { .. })
    }
}
