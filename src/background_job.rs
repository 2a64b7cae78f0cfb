use crate::errors::EnqueueError;
use crate::job_data::JobData;
use crate::queue::{JobOptions, JobQueue};
use crate::schema::DEFAULT_QUEUE;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tracing::instrument;
use uuid::Uuid;

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
///
/// The job value itself is the payload: it is serialized into the job's
/// [`JobData`] on enqueue and deserialized again before [`Self::run`].
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application.
    const JOB_NAME: &'static str;

    /// Default priority of the task. Lower values run first.
    const PRIORITY: i16 = 0;

    /// Job queue where this job will be executed.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// How many times a failed run is retried.
    const RETRY_MAX_COUNT: i32 = 0;

    /// Delay between a failure and the next attempt, in milliseconds.
    const RETRY_DELAY_MS: i32 = 0;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the task. This method should define its logic.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// The options derived from the constants above.
    fn options() -> JobOptions {
        JobOptions::default()
            .priority(Self::PRIORITY)
            .queue(Self::QUEUE)
            .retry(Self::RETRY_MAX_COUNT, Self::RETRY_DELAY_MS)
    }

    /// Enqueue this job for immediate background execution.
    #[instrument(name = "jobyard.enqueue", skip(self, queue), fields(message = Self::JOB_NAME))]
    fn enqueue<'a>(&'a self, queue: &'a JobQueue) -> BoxFuture<'a, Result<Uuid, EnqueueError>> {
        let start_after = queue.now();
        self.enqueue_at(queue, start_after)
    }

    /// Enqueue this job to run once `start_after` has passed.
    fn enqueue_at<'a>(
        &'a self,
        queue: &'a JobQueue,
        start_after: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Uuid, EnqueueError>> {
        let data = match JobData::from_serializable(self) {
            Ok(Some(data)) => data,
            Ok(None) => {
                let error = EnqueueError::InvalidData(Self::JOB_NAME.to_string());
                return async move { Err(error) }.boxed();
            }
            Err(error) => return async move { Err(EnqueueError::SerializationError(error)) }.boxed(),
        };

        queue
            .enqueue(Self::JOB_NAME, start_after, Some(data), Self::options())
            .boxed()
    }
}
