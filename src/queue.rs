use crate::clock::{Clock, SystemClock};
use crate::codec::{self, DEFERRED_CALL_JOB, DESCRIPTOR_KEY, DeferredCall};
use crate::cron::{parse_cron_expression, parse_time_zone};
use crate::errors::{EnqueueError, StorageError};
use crate::job_data::JobData;
use crate::schema::{Cron, DEFAULT_QUEUE, Job};
use crate::storage::JobStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Per-job settings given at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// How many times a failed run is retried.
    pub retry_max_count: i32,
    /// Delay added to `start_after` on each retry, in milliseconds.
    pub retry_delay_ms: i32,
    /// Lower values run first.
    pub priority: i16,
    /// Target queue; blank or unset means `"default"`.
    pub queue: Option<String>,
    /// Key identifying jobs that should not run too close to each other.
    pub throttle_key: Option<String>,
    /// How close jobs with the same throttle key may run.
    pub throttle_window: Option<Duration>,
}

impl JobOptions {
    /// Allow `max_count` retries, each delayed by `delay_ms`.
    pub fn retry(mut self, max_count: i32, delay_ms: i32) -> Self {
        self.retry_max_count = max_count;
        self.retry_delay_ms = delay_ms;
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    /// Set the target queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Tag the job with a throttle key and window.
    pub fn throttle(mut self, key: impl Into<String>, window: Duration) -> Self {
        self.throttle_key = Some(key.into());
        self.throttle_window = Some(window);
        self
    }

    fn queue_name(&self) -> String {
        match self.queue.as_deref().map(str::trim) {
            Some(queue) if !queue.is_empty() => queue.to_string(),
            _ => DEFAULT_QUEUE.to_string(),
        }
    }
}

/// Settings of a cron schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CronOptions {
    /// IANA time zone the expression is evaluated in. UTC when unset.
    pub time_zone: Option<String>,
}

impl CronOptions {
    /// Evaluate the expression in `time_zone`.
    pub fn time_zone(mut self, time_zone: impl Into<String>) -> Self {
        self.time_zone = Some(time_zone.into());
        self
    }
}

/// Entry point for scheduling work: enqueue, cancel and resume jobs, and
/// manage cron schedules.
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    /// A queue writing to `store`.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying store, for the read operations.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// The current time according to this queue's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Enqueue a job named `job_name` to run once `start_after` has passed.
    #[instrument(skip(self, data, options), fields(job.name = %job_name, job.id = tracing::field::Empty))]
    pub async fn enqueue(
        &self,
        job_name: &str,
        start_after: DateTime<Utc>,
        data: Option<JobData>,
        options: JobOptions,
    ) -> Result<Uuid, EnqueueError> {
        let mut job = Job::new(
            job_name,
            data.unwrap_or_default(),
            start_after,
            self.clock.now(),
        );
        job.priority = options.priority;
        job.queue = options.queue_name();
        job.retry_max_count = options.retry_max_count;
        job.retry_delay_ms = options.retry_delay_ms;
        job.throttle_key = options.throttle_key;
        job.throttle_seconds = options
            .throttle_window
            .map(|window| i32::try_from(window.as_secs()).unwrap_or(i32::MAX));

        tracing::Span::current().record("job.id", tracing::field::display(job.id));

        self.store.insert_job(&job).await?;
        debug!(job.queue = %job.queue, "Enqueued job");

        Ok(job.id)
    }

    /// Enqueue a job to run as soon as a worker is free.
    pub async fn enqueue_now(
        &self,
        job_name: &str,
        data: Option<JobData>,
        options: JobOptions,
    ) -> Result<Uuid, EnqueueError> {
        self.enqueue(job_name, self.clock.now(), data, options).await
    }

    /// Enqueue a deferred method call.
    pub async fn enqueue_call(
        &self,
        call: &DeferredCall,
        start_after: DateTime<Utc>,
        options: JobOptions,
    ) -> Result<Uuid, EnqueueError> {
        let data = JobData::new().with(DESCRIPTOR_KEY, codec::encode(call)?)?;
        self.enqueue(DEFERRED_CALL_JOB, start_after, Some(data), options)
            .await
    }

    /// Cancel a job that has not completed yet.
    pub async fn cancel(&self, id: Uuid) -> Result<(), StorageError> {
        self.store.cancel_job_by_id(id).await
    }

    /// Put a cancelled job back into the `Created` state.
    pub async fn resume(&self, id: Uuid) -> Result<(), StorageError> {
        self.store.resume_job(id).await
    }

    /// Register the cron schedule `name`, or replace the existing one.
    ///
    /// The expression and time zone are validated before anything is stored.
    #[instrument(skip(self, call, options))]
    pub async fn add_or_update_cron(
        &self,
        name: &str,
        expression: &str,
        call: &DeferredCall,
        options: CronOptions,
    ) -> Result<(), EnqueueError> {
        let cron = self.build_cron(name, expression, call, options)?;
        self.store.add_or_update_cron(&cron).await?;
        debug!("Registered cron schedule");
        Ok(())
    }

    /// Remove the cron schedule `name`. Returns whether it existed.
    pub async fn remove_cron(&self, name: &str) -> Result<bool, StorageError> {
        self.store.delete_cron(name).await
    }

    pub(crate) fn build_cron(
        &self,
        name: &str,
        expression: &str,
        call: &DeferredCall,
        options: CronOptions,
    ) -> Result<Cron, EnqueueError> {
        parse_cron_expression(expression)?;
        parse_time_zone(options.time_zone.as_deref())?;

        let now = self.clock.now();
        Ok(Cron {
            name: name.to_string(),
            cron_expression: expression.trim().to_string(),
            data: codec::encode(call)?,
            time_zone: options.time_zone.filter(|tz| !tz.trim().is_empty()),
            created_at: now,
            updated_at: now,
        })
    }
}
