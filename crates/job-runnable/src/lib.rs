//! # Job Runnable
//!
//! Retry and failure handling for queue-processed jobs.
//!
//! Features:
//! - `Runnable` trait for jobs that settle their own queue handle
//! - `JobRunner` for running plain closures under a `RetryPolicy`
//! - Best-effort failure hooks that can never change the outcome
//! - `QueueJobHandle` contract with an in-memory host

pub mod config;
pub mod handle;
pub mod hooks;
pub mod job;
pub mod memory;
pub mod policy;
pub mod runner;

pub use config::ConfigError;
pub use handle::{QueueError, QueueJobHandle};
pub use hooks::{FailureHooks, NoopHooks};
pub use job::{JobId, JobStatus, Runnable};
pub use memory::{JobEntry, MemoryJobHandle, MemoryQueue};
pub use policy::{RetryPolicy, DEFAULT_RETRY_DELAY_SECS};
pub use runner::{ExecuteError, ExecutionOutcome, JobRunner, RetryBehavior};
