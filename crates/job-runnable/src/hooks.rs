//! Failure hooks

use async_trait::async_trait;

/// Best-effort callbacks on the failure path.
///
/// Whatever a hook returns, or even a panic inside it, is discarded by the
/// runner and never changes how the job is disposed of. Hooks are awaited
/// inline, so they should return promptly.
#[async_trait]
pub trait FailureHooks: Send + Sync {
    /// Called on every failed attempt, before the disposition is decided
    async fn on_failure(&self, _error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once the attempt ceiling has been reached
    async fn on_final_failure(&self, _error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl FailureHooks for NoopHooks {}
