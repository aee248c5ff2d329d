//! Queue Handle Trait

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Job not found")]
    NotFound,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A reserved, in-flight queue message.
///
/// Owned by the host queue system. Implementations must keep `attempts`
/// monotonic across releases, keep `max_tries` fixed for one execution, make
/// `delete`/`release` idempotent, and report accurate state afterwards.
#[async_trait]
pub trait QueueJobHandle: Send + Sync {
    /// Number of times this message has been reserved, including this one
    fn attempts(&self) -> u32;

    /// Attempt ceiling the message was enqueued with, 0 means unlimited
    fn max_tries(&self) -> u32;

    /// Job type name
    fn name(&self) -> &str;

    /// Serialized payload as it sits on the queue
    fn raw_body(&self) -> &str;

    /// Remove the message permanently
    async fn delete(&mut self) -> Result<(), QueueError>;

    /// Put the message back, available again after `delay_secs`
    async fn release(&mut self, delay_secs: u64) -> Result<(), QueueError>;

    fn is_deleted(&self) -> bool;

    fn is_released(&self) -> bool;

    /// Whether the host has already marked this message failed
    fn has_failed(&self) -> bool;

    /// Any of delete, release, or failure closes the handle for the runner
    fn is_closed(&self) -> bool {
        self.is_deleted() || self.is_released() || self.has_failed()
    }
}
