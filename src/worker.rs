use crate::job_registry::{JobContext, JobRegistry};
use crate::schema::Job;
use crate::storage::JobStore;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use anyhow::anyhow;
use futures_util::FutureExt;
use sentry_core::{Hub, SentryFutureExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, warn};

/// Executes claimed jobs and records their outcome.
pub(crate) struct Worker<Context> {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) job_timeout: Option<Duration>,
    pub(crate) shutdown: CancellationToken,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Run a claimed job until it reaches an outcome.
    ///
    /// A failed job with retries left and no retry delay is claimed again and
    /// re-run right away, in the same worker slot.
    pub(crate) async fn run(&self, mut job: Job) {
        loop {
            let span = info_span!("job", job.id = %job.id, job.name = %job.job_name);

            debug!(parent: &span, retry_count = job.retry_count, "Running job…");
            let result = self
                .execute(&job)
                .instrument(span.clone())
                .bind_hub(Hub::current())
                .await;

            match self.record_outcome(&job, result).instrument(span).await {
                Some(next) => job = next,
                None => break,
            }
        }
    }

    async fn execute(&self, job: &Job) -> anyhow::Result<()> {
        let context = self.context.clone();
        let job_context = JobContext {
            job_id: job.id,
            job_name: job.job_name.clone(),
            data: job.data.clone(),
            retry_count: job.retry_count,
            cancellation: self.shutdown.child_token(),
        };
        let timeout = self.job_timeout;

        with_sentry_transaction(&job.job_name, || async move {
            let run_task_fn = self
                .job_registry
                .get(&job.job_name)
                .ok_or_else(|| anyhow!("no handler registered for job `{}`", job.job_name))?;

            let future = AssertUnwindSafe(run_task_fn(context, job_context))
                .catch_unwind()
                .map(|result| {
                    result
                        .map_err(|e| try_to_extract_panic_info(&*e))
                        .and_then(std::convert::identity)
                });

            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, future).await.map_err(|_| {
                    anyhow!(
                        "job exceeded its execution timeout of {} ms",
                        timeout.as_millis()
                    )
                })?,
                None => future.await,
            }
        })
        .await
    }

    /// Write the transition that follows `result`. Returns the job again if it
    /// was re-claimed for an immediate retry.
    async fn record_outcome(&self, job: &Job, result: anyhow::Result<()>) -> Option<Job> {
        let error = match result {
            Ok(()) => {
                debug!("Job completed");
                if let Err(error) = self.store.complete_job_by_id(job.id).await {
                    error!(%error, "Failed to mark job as completed");
                }
                return None;
            }
            Err(error) => error,
        };

        if !job.can_retry() {
            warn!("Job failed: {error:#}");
            if let Err(error) = self.store.fail_job_by_id(job.id, &format!("{error:#}")).await {
                error!(%error, "Failed to mark job as failed");
            }
            return None;
        }

        warn!(
            retry_count = job.retry_count,
            retry_max_count = job.retry_max_count,
            "Job failed, scheduling a retry: {error:#}"
        );

        let retried = match self.store.retry_job(job.id, job.retry_delay_ms).await {
            Ok(retried) => retried,
            Err(error) => {
                error!(%error, "Failed to schedule job retry");
                return None;
            }
        };

        if retried.retry_delay_ms > 0 || self.shutdown.is_cancelled() {
            return None;
        }

        match self.store.fetch_next_job(Some(job.id)).await {
            Ok(next) => next,
            Err(error) => {
                error!(%error, "Failed to re-claim job for retry");
                None
            }
        }
    }
}
