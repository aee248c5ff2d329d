//! In-memory queue host with delayed release

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::handle::{QueueError, QueueJobHandle};
use crate::job::{JobId, JobStatus, Runnable};
use crate::runner::RetryBehavior;

/// A job as stored by the queue
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub raw_body: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_tries: u32,
}

/// Heap entry - orders by run_at (earliest first), then insertion order
#[derive(Debug, Clone, Eq, PartialEq)]
struct PriorityEntry {
    run_at: DateTime<Utc>,
    seq: u64,
    id: Uuid,
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Shared {
    jobs: RwLock<HashMap<Uuid, JobEntry>>,
    queue: RwLock<BinaryHeap<PriorityEntry>>,
    seq: AtomicU64,
}

impl Shared {
    async fn schedule(&self, id: Uuid, run_at: DateTime<Utc>) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.queue
            .write()
            .await
            .push(PriorityEntry { run_at, seq, id });
    }
}

/// `from + delay_secs`, or a backend error when that is not representable
fn delayed_from(from: DateTime<Utc>, delay_secs: u64) -> Result<DateTime<Utc>, QueueError> {
    i64::try_from(delay_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delay| from.checked_add_signed(delay))
        .ok_or_else(|| QueueError::Backend(format!("delay of {delay_secs}s is out of range")))
}

/// Queue living in process memory. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a payload that becomes available after `delay_secs`
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        max_tries: u32,
        delay_secs: Option<u64>,
    ) -> Result<JobId, QueueError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let run_at = delayed_from(now, delay_secs.unwrap_or(0))?;

        let entry = JobEntry {
            id,
            job_type: job_type.to_string(),
            raw_body: serde_json::to_string(&payload)?,
            payload,
            status: JobStatus::Pending,
            created_at: now,
            run_at,
            attempts: 0,
            max_tries,
        };

        self.shared.jobs.write().await.insert(id, entry);
        self.shared.schedule(id, run_at).await;

        Ok(id)
    }

    /// Serialize a job and enqueue it under its own name and attempt ceiling
    pub async fn dispatch<J>(&self, job: &J) -> Result<JobId, QueueError>
    where
        J: Runnable + Serialize,
    {
        let payload = serde_json::to_value(job)?;
        self.enqueue(job.name(), payload, job.policy().max_tries, None)
            .await
    }

    /// Take the next ready job, counting this as one more attempt
    pub async fn reserve(&self) -> Result<Option<MemoryJobHandle>, QueueError> {
        let mut queue = self.shared.queue.write().await;
        let now = Utc::now();

        while let Some(next) = queue.peek() {
            if next.run_at > now {
                break;
            }
            let Some(next) = queue.pop() else { break };

            let mut jobs = self.shared.jobs.write().await;
            let Some(job) = jobs.get_mut(&next.id) else {
                continue;
            };
            // Stale heap entries for deleted or failed jobs are skipped
            if job.status != JobStatus::Pending {
                continue;
            }

            job.status = JobStatus::Reserved;
            job.attempts += 1;

            tracing::debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempts = job.attempts,
                "Reserved job"
            );

            return Ok(Some(MemoryJobHandle {
                entry: job.clone(),
                shared: self.shared.clone(),
                deleted: false,
                released: false,
                failed: false,
            }));
        }

        Ok(None)
    }

    pub async fn get_status(&self, id: JobId) -> Result<JobStatus, QueueError> {
        let jobs = self.shared.jobs.read().await;
        jobs.get(&id).map(|job| job.status).ok_or(QueueError::NotFound)
    }

    pub async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError> {
        let jobs = self.shared.jobs.read().await;
        jobs.get(&id).cloned().ok_or(QueueError::NotFound)
    }

    /// Number of jobs still waiting, delayed ones included
    pub async fn pending(&self) -> usize {
        let jobs = self.shared.jobs.read().await;
        jobs.values()
            .filter(|job| job.status == JobStatus::Pending)
            .count()
    }
}

/// Reservation of a single job from a [`MemoryQueue`]
#[derive(Debug)]
pub struct MemoryJobHandle {
    entry: JobEntry,
    shared: Arc<Shared>,
    deleted: bool,
    released: bool,
    failed: bool,
}

impl MemoryJobHandle {
    pub fn id(&self) -> JobId {
        self.entry.id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.entry.payload
    }

    /// Close the job out as failed on behalf of the host
    pub async fn mark_as_failed(&mut self) -> Result<(), QueueError> {
        if self.failed {
            return Ok(());
        }
        self.set_status(JobStatus::Failed).await?;
        self.failed = true;
        Ok(())
    }

    async fn set_status(&self, status: JobStatus) -> Result<(), QueueError> {
        let mut jobs = self.shared.jobs.write().await;
        let job = jobs.get_mut(&self.entry.id).ok_or(QueueError::NotFound)?;
        job.status = status;
        Ok(())
    }
}

#[async_trait]
impl QueueJobHandle for MemoryJobHandle {
    fn attempts(&self) -> u32 {
        self.entry.attempts
    }

    fn max_tries(&self) -> u32 {
        self.entry.max_tries
    }

    fn name(&self) -> &str {
        &self.entry.job_type
    }

    fn raw_body(&self) -> &str {
        &self.entry.raw_body
    }

    async fn delete(&mut self) -> Result<(), QueueError> {
        if self.deleted {
            return Ok(());
        }
        // A failed job keeps its status
        if !self.failed {
            self.set_status(JobStatus::Deleted).await?;
        }
        self.deleted = true;
        Ok(())
    }

    async fn release(&mut self, delay_secs: u64) -> Result<(), QueueError> {
        if self.is_closed() {
            return Ok(());
        }

        let run_at = delayed_from(Utc::now(), delay_secs)?;
        {
            let mut jobs = self.shared.jobs.write().await;
            let job = jobs.get_mut(&self.entry.id).ok_or(QueueError::NotFound)?;
            job.status = JobStatus::Pending;
            job.run_at = run_at;
        }
        self.shared.schedule(self.entry.id, run_at).await;
        self.released = true;

        tracing::debug!(
            job_id = %self.entry.id,
            attempts = self.entry.attempts,
            delay_secs,
            "Re-queued job"
        );

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
