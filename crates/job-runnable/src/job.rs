//! Job definitions

use serde::{Deserialize, Serialize};

use crate::handle::QueueJobHandle;
use crate::policy::RetryPolicy;
use crate::runner::{guarded, log_start, settle, ExecuteError, ExecutionOutcome, RetryBehavior};

/// Job Identifier
pub type JobId = uuid::Uuid;

/// Job Status, as tracked by the in-memory host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting in queue, possibly delayed
    Pending,
    /// Handed to a worker
    Reserved,
    /// Removed for good
    Deleted,
    /// Marked failed by the host
    Failed,
}

/// A unit of work that retries itself through its queue handle.
///
/// Implementors supply `run`, a name, and access to their [`RetryPolicy`].
/// The failure hooks and `retry_delay` come from [`RetryBehavior`] and
/// [`FailureHooks`](crate::FailureHooks) and can be overridden.
#[async_trait::async_trait]
pub trait Runnable: RetryBehavior + Send + Sync {
    /// Job name/type
    fn name(&self) -> &str;

    /// The work itself
    async fn run(&mut self) -> anyhow::Result<()>;

    fn policy_mut(&mut self) -> &mut RetryPolicy;

    /// Attempt ceiling, 0 for unlimited
    fn tries(mut self, max_tries: u32) -> Self
    where
        Self: Sized,
    {
        self.policy_mut().max_tries = max_tries;
        self
    }

    /// Advisory timeout in seconds, 0 for unlimited
    fn timeout(mut self, secs: u64) -> Self
    where
        Self: Sized,
    {
        self.policy_mut().timeout_secs = secs;
        self
    }

    fn ignore_max_attempts_exceeded(mut self, ignore: bool) -> Self
    where
        Self: Sized,
    {
        self.policy_mut().ignore_max_attempts_exceeded = ignore;
        self
    }

    /// Entry point for the host worker: run once, then release, delete, or
    /// hand the error back.
    async fn execute(
        &mut self,
        handle: Option<&mut dyn QueueJobHandle>,
    ) -> Result<ExecutionOutcome, ExecuteError> {
        log_start(handle.as_deref());

        match guarded(self.run()).await {
            Ok(()) => Ok(ExecutionOutcome::Succeeded),
            Err(e) => settle(&*self, handle, e).await,
        }
    }
}
