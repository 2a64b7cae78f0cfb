//! The job store contract and its two backends.
//!
//! Every state transition a job goes through is performed by a [`JobStore`]
//! inside one database transaction, together with the matching
//! [`JobStateEntry`] history row. The claim in [`JobStore::fetch_next_job`] is
//! the only mutual-exclusion mechanism between servers.

mod postgres;
mod sqlite;

pub use self::postgres::{NEW_JOB_CHANNEL, PgJobStore};
pub use self::sqlite::SqliteJobStore;

use crate::config::Config;
use crate::errors::StorageError;
use crate::schema::{Cron, Job, JobServerEntry, JobState, JobStateEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Receives a hint whenever a job that is ready to run is inserted.
///
/// The payload is the id of the inserted job but carries no guarantee: the
/// job may already have been claimed by another server when it arrives.
pub type NewJobReceiver = mpsc::Receiver<Uuid>;

/// Number of notifications buffered before further ones are dropped.
pub(crate) const NOTIFICATION_BUFFER: usize = 64;

/// Storage operations the scheduler runs on.
#[async_trait]
pub trait JobStore: Debug + Send + Sync + 'static {
    /// Apply the schema and (re-)register this server.
    ///
    /// Safe to call any number of times.
    async fn start_storage(&self) -> Result<(), StorageError>;

    /// Insert a new job in the `Created` state.
    async fn insert_job(&self, job: &Job) -> Result<(), StorageError>;

    /// Claim the next eligible job, or the job `hint` if it is eligible.
    ///
    /// A job is eligible when its state is below `Active`, its `start_after`
    /// lies in the past and its queue is one of this server's queues. The
    /// lowest priority value wins, ties go to the oldest job. The claimed job
    /// is returned in the `Active` state.
    async fn fetch_next_job(&self, hint: Option<Uuid>) -> Result<Option<Job>, StorageError>;

    /// `Active → Completed`.
    async fn complete_job_by_id(&self, id: Uuid) -> Result<(), StorageError>;

    /// `Active → Failed`, keeping `message` as the failure reason.
    async fn fail_job_by_id(&self, id: Uuid, message: &str) -> Result<(), StorageError>;

    /// `Active → Retry`, counting the retry and pushing `start_after` back by
    /// `delay_ms`. Returns the updated job.
    async fn retry_job(&self, id: Uuid, delay_ms: i32) -> Result<Job, StorageError>;

    /// Cancel a job that has not completed yet.
    async fn cancel_job_by_id(&self, id: Uuid) -> Result<(), StorageError>;

    /// `Cancelled → Created`, keeping the original `start_after`.
    async fn resume_job(&self, id: Uuid) -> Result<(), StorageError>;

    /// Look up a job.
    async fn get_job_by_id(&self, id: Uuid) -> Result<Option<Job>, StorageError>;

    /// The state history of a job, oldest entry first.
    async fn get_job_states(&self, job_id: Uuid) -> Result<Vec<JobStateEntry>, StorageError>;

    /// One page of jobs, newest first. Pages start at 1.
    async fn get_latest_jobs(
        &self,
        page: u32,
        limit: u32,
        state: Option<JobState>,
    ) -> Result<Vec<Job>, StorageError>;

    /// The most recently created job carrying `throttle_key`.
    async fn get_job_by_throttle(&self, throttle_key: &str) -> Result<Option<Job>, StorageError>;

    /// Insert a cron schedule or replace the one with the same name.
    async fn add_or_update_cron(&self, cron: &Cron) -> Result<(), StorageError>;

    /// All cron schedules.
    async fn get_crons(&self) -> Result<Vec<Cron>, StorageError>;

    /// Remove a cron schedule. Returns whether it existed.
    async fn delete_cron(&self, name: &str) -> Result<bool, StorageError>;

    /// Record that this server is alive.
    async fn update_heartbeat(&self) -> Result<(), StorageError>;

    /// All registered servers.
    async fn get_job_servers(&self) -> Result<Vec<JobServerEntry>, StorageError>;

    /// Remove servers whose last heartbeat is older than `older_than`.
    /// Returns how many were removed.
    async fn remove_inactive_servers(&self, older_than: Duration) -> Result<u64, StorageError>;

    /// Subscribe to new-job notifications, if the backend supports them.
    async fn subscribe_new_jobs(&self) -> Result<Option<NewJobReceiver>, StorageError>;
}

/// The parts of [`Config`] a store needs to claim jobs and register itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerIdentity {
    pub(crate) name: String,
    pub(crate) worker_count: usize,
    pub(crate) claim_queues: Vec<String>,
}

impl ServerIdentity {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            name: config.server_name.clone(),
            worker_count: config.worker_count,
            claim_queues: config.claim_queues(),
        }
    }

    /// The `data` column of this server's registry row.
    pub(crate) fn registration(&self, started_at: DateTime<Utc>) -> Value {
        json!({
            "worker_count": self.worker_count,
            "queues": self.claim_queues,
            "started_at": started_at,
        })
    }
}

/// Row offset of a 1-based page.
pub(crate) fn page_offset(page: u32, limit: u32) -> i64 {
    i64::from(page.max(1) - 1) * i64::from(limit)
}

/// Convert a std duration into a chrono one, saturating on overflow.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Pick the error for a transition whose `UPDATE` matched no row.
pub(crate) fn missing_or_precondition(
    id: Uuid,
    exists: bool,
    expected: &'static str,
) -> StorageError {
    if exists {
        StorageError::PreconditionFailed { id, expected }
    } else {
        StorageError::JobNotFound(id)
    }
}

/// The states a job can be cancelled from.
pub(crate) const CANCELLABLE: &str = "created, retry or active";
