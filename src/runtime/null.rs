//! No-op runtime implementation for tests and dry runs.

use anyhow::Result;
use async_trait::async_trait;

use super::{ContainerRuntime, RuntimeSpec};

/// A runtime that accepts every operation and runs nothing.
///
/// Useful for:
/// - Exercising lifecycle logic without a Docker daemon
/// - Dry-running template population and task generation
#[derive(Debug, Default, Clone)]
pub struct NullRuntime;

impl NullRuntime {
    /// Creates a new `NullRuntime`.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ContainerRuntime for NullRuntime {
    async fn ensure_network(&self, _name: &str, _subnet: &str) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _spec: &RuntimeSpec) -> Result<()> {
        Ok(())
    }

    async fn is_running(&self, _container: &str) -> Result<bool> {
        Ok(true)
    }

    async fn exec(
        &self,
        _container: &str,
        _cmd: &[String],
        _user: Option<&str>,
        _detach: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _container: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_labeled(&self, _key: &str, _value: &str) -> Result<u32> {
        Ok(0)
    }
}
