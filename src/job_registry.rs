use crate::background_job::BackgroundJob;
use crate::codec::{CallArgs, CallRegistry, DEFERRED_CALL_JOB, DESCRIPTOR_KEY};
use crate::job_data::JobData;
use anyhow::anyhow;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What a handler knows about the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The job's id.
    pub job_id: Uuid,
    /// The job's name.
    pub job_name: String,
    /// The job's payload.
    pub data: JobData,
    /// How many times the job has been retried before this attempt.
    pub retry_count: i32,
    /// Cancelled when the server shuts down.
    pub cancellation: CancellationToken,
}

pub(crate) type RunJobFn<Context> =
    dyn Fn(Context, JobContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Maps job names to handlers.
pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, Arc<RunJobFn<Context>>>,
    calls: CallRegistry<Context>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            calls: CallRegistry::default(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut job_names = self.entries.keys().collect::<Vec<_>>();
        job_names.sort();

        f.debug_struct("JobRegistry")
            .field("job_names", &job_names)
            .field("calls", &self.calls)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRegistry<Context> {
    /// Register a typed job under its [`BackgroundJob::JOB_NAME`].
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        self.entries
            .insert(J::JOB_NAME.to_string(), Arc::new(runnable::<J>));
    }

    /// Register a handler for `job_name`, replacing any previous one.
    pub(crate) fn register_fn<F, Fut>(&mut self, job_name: &str, handler: F)
    where
        F: Fn(Context, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Arc<RunJobFn<Context>> = Arc::new(move |ctx, job| handler(ctx, job).boxed());
        self.entries.insert(job_name.to_string(), handler);
    }

    /// Register the handler of deferred calls to `target.method`.
    pub(crate) fn register_call<F, Fut>(&mut self, target: &str, method: &str, handler: F)
    where
        F: Fn(Context, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.calls.register(target, method, handler);
    }

    /// Look up the handler of `job_name`.
    pub(crate) fn get(&self, job_name: &str) -> Option<Arc<RunJobFn<Context>>> {
        self.entries.get(job_name).cloned()
    }

    /// Freeze the registry, routing deferred-call jobs to the registered calls.
    pub(crate) fn seal(mut self) -> Arc<Self> {
        let calls = Arc::new(std::mem::take(&mut self.calls));
        self.register_fn(DEFERRED_CALL_JOB, move |ctx, job| {
            let calls = calls.clone();
            async move {
                let descriptor = job
                    .data
                    .get::<String>(DESCRIPTOR_KEY)?
                    .ok_or_else(|| anyhow!("deferred call has no `{DESCRIPTOR_KEY}` entry"))?;
                calls.invoke(&descriptor, ctx).await
            }
        });
        Arc::new(self)
    }
}

fn runnable<J: BackgroundJob>(
    ctx: J::Context,
    job: JobContext,
) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        let job: J = job.data.deserialize_into()?;
        job.run(ctx).await
    }
    .boxed()
}
