//! Job runner: executes a unit of work and settles its queue handle

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, error, info};

use crate::handle::{QueueError, QueueJobHandle};
use crate::hooks::{FailureHooks, NoopHooks};
use crate::policy::RetryPolicy;

/// Where a single execution ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The unit of work completed, handle untouched
    Succeeded,
    /// The handle was released for another attempt
    RetryScheduled { delay_secs: u64 },
    /// The handle was deleted after exhausting its attempts
    Deleted,
}

/// Failures that escape `execute`
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Job failed without a queue handle: {0}")]
    NoJobContext(#[source] anyhow::Error),
    #[error("Job {job} failed after its handle was closed: {source}")]
    Terminal {
        job: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl ExecuteError {
    /// The error raised by the unit of work, if that is what escaped
    pub fn job_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::NoJobContext(e) | Self::Terminal { source: e, .. } => Some(e),
            Self::Queue(_) => None,
        }
    }

    pub fn into_job_error(self) -> Option<anyhow::Error> {
        match self {
            Self::NoJobContext(e) | Self::Terminal { source: e, .. } => Some(e),
            Self::Queue(_) => None,
        }
    }
}

/// Policy plus hooks: everything the failure path needs to know about a job.
pub trait RetryBehavior: FailureHooks {
    fn policy(&self) -> &RetryPolicy;

    /// Seconds before the next attempt. Override to implement backoff.
    fn retry_delay(&self) -> u64 {
        self.policy().retry_delay()
    }
}

/// Runs closures against a fixed policy and set of hooks.
///
/// ```no_run
/// # async fn demo(handle: &mut dyn job_runnable::QueueJobHandle) {
/// use job_runnable::{JobRunner, RetryPolicy};
///
/// let runner = JobRunner::new(RetryPolicy::new().with_max_tries(3));
/// let outcome = runner
///     .execute(Some(handle), || async { Ok(()) })
///     .await;
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct JobRunner<H = NoopHooks> {
    policy: RetryPolicy,
    hooks: H,
}

impl JobRunner {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            hooks: NoopHooks,
        }
    }
}

impl<H: FailureHooks> JobRunner<H> {
    pub fn with_hooks<T: FailureHooks>(self, hooks: T) -> JobRunner<T> {
        JobRunner {
            policy: self.policy,
            hooks,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Run `work` once and settle `handle` according to the outcome
    pub async fn execute<F, Fut>(
        &self,
        handle: Option<&mut dyn QueueJobHandle>,
        work: F,
    ) -> Result<ExecutionOutcome, ExecuteError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        log_start(handle.as_deref());

        match guarded(work()).await {
            Ok(()) => Ok(ExecutionOutcome::Succeeded),
            Err(e) => settle(self, handle, e).await,
        }
    }
}

#[async_trait::async_trait]
impl<H: FailureHooks> FailureHooks for JobRunner<H> {
    async fn on_failure(&self, error: &anyhow::Error) -> anyhow::Result<()> {
        self.hooks.on_failure(error).await
    }

    async fn on_final_failure(&self, error: &anyhow::Error) -> anyhow::Result<()> {
        self.hooks.on_final_failure(error).await
    }
}

impl<H: FailureHooks> RetryBehavior for JobRunner<H> {
    fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

pub(crate) fn log_start(handle: Option<&dyn QueueJobHandle>) {
    if let Some(handle) = handle {
        info!(
            job = handle.name(),
            attempts = handle.attempts(),
            body = handle.raw_body(),
            "Handling queued job"
        );
    }
}

/// Await the unit of work, turning a panic into an ordinary error
pub(crate) async fn guarded<F>(work: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(
            "job panicked: {}",
            panic_message(panic.as_ref())
        )),
    }
}

/// Decide what happens to a handle after the unit of work failed with `error`
pub(crate) async fn settle<B>(
    behavior: &B,
    handle: Option<&mut dyn QueueJobHandle>,
    error: anyhow::Error,
) -> Result<ExecutionOutcome, ExecuteError>
where
    B: RetryBehavior + ?Sized,
{
    let Some(handle) = handle else {
        error!(error = %error, "Job failed with no queue handle");
        return Err(ExecuteError::NoJobContext(error));
    };

    let job = handle.name().to_owned();
    let attempts = handle.attempts();
    let limit = handle.max_tries();

    swallow(&job, "on_failure", behavior.on_failure(&error)).await;

    if RetryPolicy::ceiling_reached(attempts, limit) {
        error!(
            job = %job,
            attempts,
            error = ?error,
            "Queued job has been attempted too many times"
        );

        swallow(&job, "on_final_failure", behavior.on_final_failure(&error)).await;

        if behavior.policy().ignore_max_attempts_exceeded {
            handle.delete().await?;
            info!(job = %job, attempts, "Deleted job after exhausting its attempts");
            return Ok(ExecutionOutcome::Deleted);
        }
    }

    if handle.is_closed() {
        return Err(ExecuteError::Terminal { job, source: error });
    }

    let delay_secs = behavior.retry_delay();
    handle.release(delay_secs).await?;

    info!(
        job = %job,
        attempt = attempts,
        delay_secs,
        error = %error,
        "Job failed, released for retry"
    );

    Ok(ExecutionOutcome::RetryScheduled { delay_secs })
}

async fn swallow<F>(job: &str, hook: &'static str, fut: F)
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(job, hook, error = %e, "Ignoring failure hook error"),
        Err(panic) => debug!(
            job,
            hook,
            panic = %panic_message(panic.as_ref()),
            "Ignoring failure hook panic"
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct FakeHandle {
        attempts: u32,
        max_tries: u32,
        deleted: bool,
        released: bool,
        failed: bool,
        releases: Vec<u64>,
        deletes: u32,
    }

    impl FakeHandle {
        fn new(attempts: u32, max_tries: u32) -> Self {
            Self {
                attempts,
                max_tries,
                ..Default::default()
            }
        }

        fn untouched(&self) -> bool {
            self.releases.is_empty() && self.deletes == 0
        }
    }

    #[async_trait]
    impl QueueJobHandle for FakeHandle {
        fn attempts(&self) -> u32 {
            self.attempts
        }

        fn max_tries(&self) -> u32 {
            self.max_tries
        }

        fn name(&self) -> &str {
            "fake_job"
        }

        fn raw_body(&self) -> &str {
            "{}"
        }

        async fn delete(&mut self) -> Result<(), QueueError> {
            if !self.deleted {
                self.deleted = true;
                self.deletes += 1;
            }
            Ok(())
        }

        async fn release(&mut self, delay_secs: u64) -> Result<(), QueueError> {
            if !self.released {
                self.released = true;
                self.releases.push(delay_secs);
            }
            Ok(())
        }

        fn is_deleted(&self) -> bool {
            self.deleted
        }

        fn is_released(&self) -> bool {
            self.released
        }

        fn has_failed(&self) -> bool {
            self.failed
        }
    }

    /// Handle whose transport rejects every mutation
    #[derive(Debug)]
    struct BrokenHandle;

    #[async_trait]
    impl QueueJobHandle for BrokenHandle {
        fn attempts(&self) -> u32 {
            1
        }

        fn max_tries(&self) -> u32 {
            0
        }

        fn name(&self) -> &str {
            "broken_job"
        }

        fn raw_body(&self) -> &str {
            ""
        }

        async fn delete(&mut self) -> Result<(), QueueError> {
            Err(QueueError::Backend("connection reset".into()))
        }

        async fn release(&mut self, _delay_secs: u64) -> Result<(), QueueError> {
            Err(QueueError::Backend("connection reset".into()))
        }

        fn is_deleted(&self) -> bool {
            false
        }

        fn is_released(&self) -> bool {
            false
        }

        fn has_failed(&self) -> bool {
            false
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum HookMode {
        Quiet,
        Error,
        Panic,
    }

    #[derive(Debug, Clone)]
    struct CountingHooks {
        failures: Arc<AtomicU32>,
        final_failures: Arc<AtomicU32>,
        mode: HookMode,
    }

    impl CountingHooks {
        fn new(mode: HookMode) -> Self {
            Self {
                failures: Arc::new(AtomicU32::new(0)),
                final_failures: Arc::new(AtomicU32::new(0)),
                mode,
            }
        }

        fn counts(&self) -> (u32, u32) {
            (
                self.failures.load(Ordering::SeqCst),
                self.final_failures.load(Ordering::SeqCst),
            )
        }

        fn react(&self) -> anyhow::Result<()> {
            match self.mode {
                HookMode::Quiet => Ok(()),
                HookMode::Error => Err(anyhow::anyhow!("hook exploded")),
                HookMode::Panic => panic!("hook panicked"),
            }
        }
    }

    #[async_trait]
    impl FailureHooks for CountingHooks {
        async fn on_failure(&self, _error: &anyhow::Error) -> anyhow::Result<()> {
            self.failures.fetch_add(1, Ordering::SeqCst);
            self.react()
        }

        async fn on_final_failure(&self, _error: &anyhow::Error) -> anyhow::Result<()> {
            self.final_failures.fetch_add(1, Ordering::SeqCst);
            self.react()
        }
    }

    fn build(policy: RetryPolicy, mode: HookMode) -> (JobRunner<CountingHooks>, CountingHooks) {
        let hooks = CountingHooks::new(mode);
        (JobRunner::new(policy).with_hooks(hooks.clone()), hooks)
    }

    async fn failing() -> anyhow::Result<()> {
        Err(anyhow::anyhow!("boom"))
    }

    async fn panicking() -> anyhow::Result<()> {
        panic!("worker bug")
    }

    #[tokio::test]
    async fn test_success_leaves_handle_untouched() {
        let (runner, hooks) = build(RetryPolicy::new().with_max_tries(1), HookMode::Quiet);
        let mut handle = FakeHandle::new(1, 1);

        let outcome = runner
            .execute(Some(&mut handle), || async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(outcome, ExecutionOutcome::Succeeded);
        assert!(handle.untouched());
        assert_eq!(hooks.counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_unlimited_tries_always_retry() {
        let (runner, hooks) = build(RetryPolicy::new(), HookMode::Quiet);

        for attempts in [1, 10, 500] {
            let mut handle = FakeHandle::new(attempts, 0);
            let outcome = runner.execute(Some(&mut handle), failing).await.unwrap();

            assert_eq!(outcome, ExecutionOutcome::RetryScheduled { delay_secs: 1 });
            assert_eq!(handle.releases, vec![1]);
        }

        assert_eq!(hooks.counts(), (3, 0));
    }

    #[tokio::test]
    async fn test_exhausted_and_ignored_deletes() {
        let policy = RetryPolicy::new()
            .with_max_tries(3)
            .with_ignore_max_attempts_exceeded(true);
        let (runner, hooks) = build(policy, HookMode::Quiet);
        let mut handle = FakeHandle::new(3, 3);

        let outcome = runner.execute(Some(&mut handle), failing).await.unwrap();

        assert_eq!(outcome, ExecutionOutcome::Deleted);
        assert_eq!(handle.deletes, 1);
        assert!(handle.releases.is_empty());
        assert_eq!(hooks.counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_exhausted_on_closed_handle_rethrows() {
        let (runner, hooks) = build(RetryPolicy::new().with_max_tries(3), HookMode::Quiet);

        let closers: [fn(&mut FakeHandle); 3] = [
            |h| h.deleted = true,
            |h| h.released = true,
            |h| h.failed = true,
        ];

        for close in closers {
            let mut handle = FakeHandle::new(3, 3);
            close(&mut handle);

            let err = runner
                .execute(Some(&mut handle), failing)
                .await
                .unwrap_err();

            assert!(matches!(err, ExecuteError::Terminal { ref job, .. } if job == "fake_job"));
            assert_eq!(err.job_error().unwrap().to_string(), "boom");
            assert!(handle.untouched());
        }

        assert_eq!(hooks.counts(), (3, 3));
    }

    #[tokio::test]
    async fn test_exhausted_without_ignore_falls_through_to_retry() {
        let (runner, hooks) = build(RetryPolicy::new().with_max_tries(3), HookMode::Quiet);
        let mut handle = FakeHandle::new(4, 3);

        let outcome = runner.execute(Some(&mut handle), failing).await.unwrap();

        assert_eq!(outcome, ExecutionOutcome::RetryScheduled { delay_secs: 1 });
        assert_eq!(hooks.counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_three_try_sequence() {
        let (runner, hooks) = build(RetryPolicy::new().with_max_tries(3), HookMode::Quiet);
        let mut outcomes = Vec::new();

        for attempts in 1..=3 {
            let mut handle = FakeHandle::new(attempts, 3);
            outcomes.push(runner.execute(Some(&mut handle), failing).await.unwrap());
            assert_eq!(hooks.counts().1, u32::from(attempts == 3));
        }

        assert_eq!(
            outcomes,
            vec![ExecutionOutcome::RetryScheduled { delay_secs: 1 }; 3]
        );
    }

    #[tokio::test]
    async fn test_third_attempt_already_released_rethrows() {
        let (runner, hooks) = build(RetryPolicy::new().with_max_tries(3), HookMode::Quiet);

        for attempts in 1..=2 {
            let mut handle = FakeHandle::new(attempts, 3);
            runner.execute(Some(&mut handle), failing).await.unwrap();
        }

        let mut handle = FakeHandle::new(3, 3);
        handle.released = true;
        let err = runner
            .execute(Some(&mut handle), failing)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecuteError::Terminal { .. }));
        assert!(handle.untouched());
        assert_eq!(hooks.counts(), (3, 1));
    }

    #[tokio::test]
    async fn test_no_handle_rethrows_without_hooks() {
        let (runner, hooks) = build(RetryPolicy::new().with_max_tries(3), HookMode::Quiet);

        let err = runner.execute(None, failing).await.unwrap_err();

        assert!(matches!(err, ExecuteError::NoJobContext(_)));
        assert_eq!(err.into_job_error().unwrap().to_string(), "boom");
        assert_eq!(hooks.counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_hook_errors_do_not_change_outcome() {
        for mode in [HookMode::Error, HookMode::Panic] {
            let policy = RetryPolicy::new()
                .with_max_tries(2)
                .with_ignore_max_attempts_exceeded(true);
            let (runner, hooks) = build(policy, mode);

            let mut fresh = FakeHandle::new(1, 2);
            let outcome = runner.execute(Some(&mut fresh), failing).await.unwrap();
            assert_eq!(outcome, ExecutionOutcome::RetryScheduled { delay_secs: 1 });

            let mut last = FakeHandle::new(2, 2);
            let outcome = runner.execute(Some(&mut last), failing).await.unwrap();
            assert_eq!(outcome, ExecutionOutcome::Deleted);

            assert_eq!(hooks.counts(), (2, 1), "mode {mode:?}");
        }
    }

    #[tokio::test]
    async fn test_panicking_work_is_a_failure() {
        let (runner, hooks) = build(RetryPolicy::new(), HookMode::Quiet);
        let mut handle = FakeHandle::new(1, 0);

        let outcome = runner
            .execute(Some(&mut handle), panicking)
            .await
            .unwrap();

        assert_eq!(outcome, ExecutionOutcome::RetryScheduled { delay_secs: 1 });
        assert_eq!(hooks.counts(), (1, 0));
    }

    #[tokio::test]
    async fn test_custom_retry_delay() {
        let (runner, _) = build(RetryPolicy::new().with_retry_delay(30), HookMode::Quiet);
        let mut handle = FakeHandle::new(1, 5);

        let outcome = runner.execute(Some(&mut handle), failing).await.unwrap();

        assert_eq!(outcome, ExecutionOutcome::RetryScheduled { delay_secs: 30 });
        assert_eq!(handle.releases, vec![30]);
    }

    #[tokio::test]
    async fn test_independent_handles() {
        let (runner, hooks) = build(
            RetryPolicy::new()
                .with_max_tries(2)
                .with_ignore_max_attempts_exceeded(true),
            HookMode::Quiet,
        );
        let mut first = FakeHandle::new(1, 2);
        let mut second = FakeHandle::new(2, 2);

        let a = runner.execute(Some(&mut first), failing).await.unwrap();
        let b = runner.execute(Some(&mut second), failing).await.unwrap();

        assert_eq!(a, ExecutionOutcome::RetryScheduled { delay_secs: 1 });
        assert_eq!(b, ExecutionOutcome::Deleted);
        assert_eq!(first.releases, vec![1]);
        assert_eq!(first.deletes, 0);
        assert_eq!(second.deletes, 1);
        assert!(second.releases.is_empty());
        assert_eq!(hooks.counts(), (2, 1));
    }

    #[tokio::test]
    async fn test_transport_error_surfaces() {
        let runner = JobRunner::new(RetryPolicy::new());
        let mut handle = BrokenHandle;

        let err = runner
            .execute(Some(&mut handle), failing)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecuteError::Queue(QueueError::Backend(_))));
        assert!(err.job_error().is_none());
    }
}
