#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
/// Time sources.
pub mod clock;
/// Deferred method calls stored as job payloads.
pub mod codec;
mod config;
/// Cron expression parsing and due checks.
pub mod cron;
mod errors;
mod job_data;
mod job_registry;
mod liveness;
mod queue;
mod runner;
/// Database schema definitions.
pub mod schema;
/// Storage backends.
pub mod storage;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::BackgroundJob;
/// Time sources used for scheduling.
pub use self::clock::{Clock, MockClock, SystemClock};
/// Deferred method calls.
pub use self::codec::{CallArg, CallArgs, DeferredCall};
/// Server configuration.
pub use self::config::Config;
/// Error types.
pub use self::errors::{CodecError, CronError, EnqueueError, StorageError};
/// Job payloads.
pub use self::job_data::JobData;
/// What a handler knows about the job it runs.
pub use self::job_registry::JobContext;
/// Enqueueing and schedule management.
pub use self::queue::{CronOptions, JobOptions, JobQueue};
/// The main runner that orchestrates job processing.
pub use self::runner::{Configured, RunHandle, Runner, Unconfigured};
/// Job state and the job record.
pub use self::schema::{Job, JobState};
/// Storage backends.
pub use self::storage::{JobStore, PgJobStore, SqliteJobStore};
