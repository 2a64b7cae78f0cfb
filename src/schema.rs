//! Database row types.
//!
//! These structs mirror the `jobs`, `job_states`, `crons` and `job_servers`
//! tables and decode from both the PostgreSQL and the SQLite backend.

use crate::job_data::JobData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Queue used when a job does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Lifecycle state of a job.
///
/// The numeric values are stored in the database and their order is part of
/// the contract: a job is claimable while `state < Active` and cancellable
/// while `state < Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum JobState {
    /// Waiting for its first run.
    Created = 0,
    /// Failed at least once and waiting for another attempt.
    Retry = 1,
    /// Claimed by a worker and running.
    Active = 2,
    /// Finished successfully.
    Completed = 3,
    /// Cancelled before completion.
    Cancelled = 4,
    /// Ran out of retries.
    Failed = 5,
}

impl JobState {
    /// The stored representation.
    pub const fn as_i16(self) -> i16 {
        self as i16
    }

    /// Human readable name, as used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Retry => "retry",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a job record in the database
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for the job
    pub id: Uuid,
    /// Name used to look up the handler
    pub job_name: String,
    /// Payload passed to the handler
    #[sqlx(json)]
    pub data: JobData,
    /// Current lifecycle state
    pub state: JobState,
    /// Earliest time the job may be claimed
    pub start_after: DateTime<Utc>,
    /// Timestamp when the job was created
    pub created_on: DateTime<Utc>,
    /// Priority of the job (lower = runs first)
    pub priority: i16,
    /// Queue the job belongs to
    pub queue: String,
    /// How many retries are allowed after the first failure
    pub retry_max_count: i32,
    /// Number of retries performed so far
    pub retry_count: i32,
    /// Delay applied to `start_after` on each retry
    pub retry_delay_ms: i32,
    /// Server that last claimed the job
    pub server_name: Option<String>,
    /// Deduplication key
    pub throttle_key: Option<String>,
    /// Deduplication window in seconds
    pub throttle_seconds: Option<i32>,
    /// When the job was last claimed
    pub started_on: Option<DateTime<Utc>>,
    /// When the job completed
    pub completed_on: Option<DateTime<Utc>>,
    /// When the job was cancelled
    pub cancelled_on: Option<DateTime<Utc>>,
    /// When the job failed for good
    pub failed_on: Option<DateTime<Utc>>,
    /// Error text of the final failure
    pub failed_message: Option<String>,
}

impl Job {
    /// A fresh job in the `Created` state, eligible from `start_after`.
    pub fn new(
        job_name: impl Into<String>,
        data: JobData,
        start_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.into(),
            data,
            state: JobState::Created,
            start_after,
            created_on: now,
            priority: 0,
            queue: DEFAULT_QUEUE.to_string(),
            retry_max_count: 0,
            retry_count: 0,
            retry_delay_ms: 0,
            server_name: None,
            throttle_key: None,
            throttle_seconds: None,
            started_on: None,
            completed_on: None,
            cancelled_on: None,
            failed_on: None,
            failed_message: None,
        }
    }

    /// Whether another attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.retry_max_count
    }
}

/// One entry of a job's state history
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct JobStateEntry {
    /// Unique identifier of the entry
    pub id: Uuid,
    /// The job this entry belongs to
    pub job_id: Uuid,
    /// State the job moved into
    pub state: JobState,
    /// Failure text for `Failed` transitions
    pub message: Option<String>,
    /// When the transition happened
    pub created_at: DateTime<Utc>,
}

/// A recurring schedule
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Cron {
    /// Unique name, also used as the throttle key of the jobs it enqueues
    pub name: String,
    /// Five-field cron expression
    pub cron_expression: String,
    /// Encoded deferred call to run on each firing
    pub data: String,
    /// IANA time zone the expression is evaluated in (UTC when unset)
    pub time_zone: Option<String>,
    /// When the schedule was first registered
    pub created_at: DateTime<Utc>,
    /// When the schedule was last registered or changed
    pub updated_at: DateTime<Utc>,
}

/// A live server instance
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct JobServerEntry {
    /// Server identity, usually the host name
    pub id: String,
    /// Descriptive data: worker count, queues, start time
    #[sqlx(json)]
    pub data: Value,
    /// Last time the server reported in
    pub last_heartbeat: DateTime<Utc>,
}
