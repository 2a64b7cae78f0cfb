use crate::clock::{Clock, SystemClock};
use crate::codec::{CallArgs, DeferredCall};
use crate::config::Config;
use crate::cron::CronEngine;
use crate::errors::{EnqueueError, StorageError};
use crate::job_registry::{JobContext, JobRegistry};
use crate::liveness::{run_heartbeat, run_maintenance};
use crate::queue::{CronOptions, JobQueue};
use crate::schema::Cron;
use crate::storage::{JobStore, NewJobReceiver};
use crate::worker::Worker;
use crate::BackgroundJob;
use futures_util::future::join_all;
use rand::Rng;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The core runner responsible for claiming and running jobs
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    store: Arc<dyn JobStore>,
    context: Context,
    config: Config,
    clock: Arc<dyn Clock>,
    job_registry: JobRegistry<Context>,
    crons: Vec<Cron>,
    shutdown_when_queue_empty: bool,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Send + Sync + 'static, State> std::fmt::Debug
    for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("store", &self.store)
            .field("context", &self.context)
            .field("config", &self.config)
            .field("job_registry", &self.job_registry)
            .field("crons", &self.crons.iter().map(|c| &c.name).collect::<Vec<_>>())
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner on `store` with the given context and configuration.
    ///
    /// The store should be built from the same `config`, so that the queues it
    /// claims from and the server name it registers match.
    pub fn new(store: Arc<dyn JobStore>, context: Context, config: Config) -> Self {
        Self {
            store,
            context,
            config,
            clock: Arc::new(SystemClock),
            job_registry: JobRegistry::default(),
            crons: Vec::new(),
            shutdown_when_queue_empty: false,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    fn configured(self) -> Runner<Context, Configured> {
        Runner {
            store: self.store,
            context: self.context,
            config: self.config,
            clock: self.clock,
            job_registry: self.job_registry,
            crons: self.crons,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            _state: PhantomData,
        }
    }

    /// Register a typed job.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Runner<Context, Configured> {
        self.job_registry.register::<J>();
        self.configured()
    }

    /// Register a handler for jobs named `job_name`.
    pub fn register_fn<F, Fut>(mut self, job_name: &str, handler: F) -> Runner<Context, Configured>
    where
        F: Fn(Context, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.job_registry.register_fn(job_name, handler);
        self.configured()
    }

    /// Register the handler of deferred calls to `target.method`.
    pub fn register_call<F, Fut>(
        mut self,
        target: &str,
        method: &str,
        handler: F,
    ) -> Runner<Context, Configured>
    where
        F: Fn(Context, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.job_registry.register_call(target, method, handler);
        self.configured()
    }

    /// Add or replace the cron schedule `name` when the runner starts.
    ///
    /// The expression and time zone are validated right away.
    pub fn cron(
        mut self,
        name: &str,
        expression: &str,
        call: DeferredCall,
        options: CronOptions,
    ) -> Result<Self, EnqueueError> {
        let cron = self.queue().build_cron(name, expression, &call, options)?;
        self.crons.push(cron);
        Ok(self)
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the runner to shut down when the background job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// A queue handle on this runner's store.
    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.store.clone()).with_clock(self.clock.clone())
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Prepare the store and start the background tasks.
    ///
    /// This runs the migrations, registers the server and its cron schedules,
    /// then spawns the dispatch loop, the cron engine, the heartbeat and the
    /// server maintenance task. The returned [`RunHandle`] is used to stop them.
    pub async fn start(self) -> Result<RunHandle, StorageError> {
        self.store.start_storage().await?;

        let now = self.clock.now();
        for mut cron in self.crons {
            cron.created_at = now;
            cron.updated_at = now;
            self.store.add_or_update_cron(&cron).await?;
        }

        let notifications = if self.config.listen_notify {
            self.store.subscribe_new_jobs().await?
        } else {
            None
        };

        let shutdown = CancellationToken::new();
        let server_name = self.config.server_name.clone();
        info!(
            server.name = %server_name,
            worker_count = self.config.worker_count,
            queues = ?self.config.claim_queues(),
            "Starting job server…"
        );

        let worker = Arc::new(Worker {
            store: self.store.clone(),
            context: self.context,
            job_registry: self.job_registry.seal(),
            job_timeout: self.config.job_timeout,
            shutdown: shutdown.clone(),
        });

        let dispatcher = Dispatcher {
            store: self.store.clone(),
            worker,
            permits: Arc::new(Semaphore::new(self.config.worker_count.max(1))),
            notifications,
            poll_interval: self.config.poll_interval,
            jitter: self.config.poll_jitter,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            shutdown: shutdown.clone(),
            in_flight: JoinSet::new(),
        };

        let cron_engine = CronEngine {
            queue: JobQueue::new(self.store.clone()).with_clock(self.clock.clone()),
            interval: self.config.cron_poll_interval,
            parallelism: self.config.worker_count.max(1),
            shutdown: shutdown.clone(),
        };

        let span = info_span!("server", server.name = %server_name);
        let handles = vec![
            tokio::spawn(dispatcher.run().instrument(span.clone())),
            tokio::spawn(cron_engine.run().instrument(span.clone())),
            tokio::spawn(
                run_heartbeat(
                    self.store.clone(),
                    self.config.heartbeat_interval,
                    shutdown.clone(),
                )
                .instrument(span.clone()),
            ),
            tokio::spawn(
                run_maintenance(
                    self.store,
                    self.config.server_maintenance_interval,
                    self.config.server_purge_after,
                    shutdown.clone(),
                )
                .instrument(span),
            ),
        ];

        Ok(RunHandle { handles, shutdown })
    }
}

/// Handle to a running background job processing system
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl RunHandle {
    /// Stop claiming jobs and stop the background tasks.
    ///
    /// Jobs already running are allowed to finish. Calling this more than once
    /// has no further effect.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether shutdown has been requested, or the runner stopped on its own.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait for all background tasks, including running jobs, to finish.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background task panicked");
            }
        });
    }
}

/// The fetch loop: claims jobs while worker slots are free and hands them to
/// the worker.
struct Dispatcher<Context> {
    store: Arc<dyn JobStore>,
    worker: Arc<Worker<Context>>,
    permits: Arc<Semaphore>,
    notifications: Option<NewJobReceiver>,
    poll_interval: Duration,
    jitter: Duration,
    shutdown_when_queue_empty: bool,
    shutdown: CancellationToken,
    in_flight: JoinSet<()>,
}

impl<Context: Clone + Send + Sync + 'static> Dispatcher<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Claim and run jobs until shutdown, or until the queue is empty if
    /// `shutdown_when_queue_empty` is set.
    #[allow(clippy::cognitive_complexity)]
    async fn run(mut self) {
        loop {
            self.reap_finished();

            // A slot is taken before claiming, so no job is claimed while all workers are busy.
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => permit,
                () = self.shutdown.cancelled() => break,
            };
            let Ok(permit) = permit else {
                break;
            };

            if self.shutdown.is_cancelled() {
                break;
            }

            trace!("Looking for next background job…");
            match self.store.fetch_next_job(None).await {
                Ok(Some(job)) => {
                    let worker = self.worker.clone();
                    self.in_flight.spawn(async move {
                        worker.run(job).await;
                        drop(permit);
                    });
                }
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No pending background jobs found. Shutting down the dispatcher…");
                    break;
                }
                Ok(None) => {
                    drop(permit);
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No pending background jobs found. Polling again in {sleep_duration:?}…");
                    self.wait_for_work(sleep_duration).await;
                }
                Err(error) => {
                    drop(permit);
                    error!("Failed to fetch job: {error}");
                    tokio::select! {
                        () = sleep(self.sleep_duration_with_jitter()) => {}
                        () = self.shutdown.cancelled() => {}
                    }
                }
            }
        }

        while let Some(result) = self.in_flight.join_next().await {
            if let Err(error) = result {
                warn!(%error, "Job task panicked");
            }
        }

        // Stops the cron, heartbeat and maintenance tasks when the loop ended on its own.
        self.shutdown.cancel();
        debug!("Dispatcher stopped");
    }

    fn reap_finished(&mut self) {
        while let Some(result) = self.in_flight.try_join_next() {
            if let Err(error) = result {
                warn!(%error, "Job task panicked");
            }
        }
    }

    /// Sleep for `duration`, waking early on a new-job notification or shutdown.
    async fn wait_for_work(&mut self, duration: Duration) {
        let shutdown = self.shutdown.clone();
        let Some(notifications) = self.notifications.as_mut() else {
            tokio::select! {
                () = sleep(duration) => {}
                () = shutdown.cancelled() => {}
            }
            return;
        };

        let open = tokio::select! {
            () = sleep(duration) => true,
            received = notifications.recv() => {
                trace!("Woken up by a new job notification");
                received.is_some()
            }
            () = shutdown.cancelled() => true,
        };

        if !open {
            warn!("New-job notifications stopped, falling back to polling");
            self.notifications = None;
            return;
        }

        // One claim attempt covers every notification received so far.
        while notifications.try_recv().is_ok() {}
    }
}
