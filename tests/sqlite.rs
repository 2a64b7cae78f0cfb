#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use claims::{assert_matches, assert_none, assert_ok, assert_some};
use insta::assert_compact_json_snapshot;
use jobyard::{
    BackgroundJob, Config, CronError, CronOptions, DeferredCall, EnqueueError, Job, JobContext,
    JobData, JobOptions, JobQueue, JobState, JobStore, MockClock, SqliteJobStore, StorageError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Barrier;
use tokio::time::Instant;
use uuid::Uuid;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use jobyard::Runner;

    /// A fixed point in time the mock clocks start at
    pub(super) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 12, 14, 0, 0).unwrap()
    }

    /// Configuration with short intervals and a stable server name
    pub(super) fn test_config() -> Config {
        Config::default()
            .server_name("test-server")
            .worker_count(2)
            .poll_interval(Duration::from_millis(50))
            .cron_poll_interval(Duration::from_millis(50))
            .listen_notify(false)
    }

    /// Create a migrated store on a fresh database file
    pub(super) async fn setup_store(
        config: &Config,
    ) -> anyhow::Result<(Arc<SqliteJobStore>, TempDir)> {
        let dir = tempfile::tempdir()?;
        let store = SqliteJobStore::open(dir.path().join("jobs.db"), config).await?;
        store.start_storage().await?;
        Ok((Arc::new(store), dir))
    }

    /// Create a migrated store and a queue that both read time from `clock`
    pub(super) async fn setup_store_with_clock(
        config: &Config,
        clock: &MockClock,
    ) -> anyhow::Result<(Arc<SqliteJobStore>, JobQueue, TempDir)> {
        let dir = tempfile::tempdir()?;
        let store = SqliteJobStore::open(dir.path().join("jobs.db"), config)
            .await?
            .with_clock(Arc::new(clock.clone()));
        store.start_storage().await?;

        let store = Arc::new(store);
        let queue = JobQueue::new(store.clone()).with_clock(Arc::new(clock.clone()));
        Ok((store, queue, dir))
    }

    /// Create a test runner that stops once the queue is empty
    pub(super) fn create_test_runner<Context: Clone + Send + Sync + 'static>(
        store: Arc<SqliteJobStore>,
        context: Context,
        config: Config,
    ) -> Runner<Context> {
        Runner::new(store, context, config).shutdown_when_queue_empty()
    }
}

async fn history(store: &SqliteJobStore, id: Uuid) -> anyhow::Result<Vec<JobState>> {
    let states = store.get_job_states(id).await?;
    Ok(states.into_iter().map(|entry| entry.state).collect())
}

async fn job(store: &SqliteJobStore, id: Uuid) -> anyhow::Result<Job> {
    Ok(assert_some!(store.get_job_by_id(id).await?))
}

#[tokio::test]
async fn start_storage_is_idempotent() -> anyhow::Result<()> {
    let config = test_utils::test_config();
    let (store, _dir) = test_utils::setup_store(&config).await?;

    assert_ok!(store.start_storage().await);
    assert_ok!(store.start_storage().await);

    let servers = store.get_job_servers().await?;
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].id, "test-server");
    assert_compact_json_snapshot!(servers[0].data["queues"], @r#"["cron", "default"]"#);
    assert_eq!(servers[0].data["worker_count"], 2);

    Ok(())
}

#[tokio::test]
async fn jobs_are_claimed_by_priority_then_age() -> anyhow::Result<()> {
    let clock = MockClock::fixed(test_utils::t0());
    let config = test_utils::test_config();
    let (store, queue, _dir) = test_utils::setup_store_with_clock(&config, &clock).await?;

    let low = queue
        .enqueue_now("report", None, JobOptions::default().priority(5))
        .await?;
    clock.advance(ChronoDuration::seconds(1));
    let first = queue.enqueue_now("report", None, JobOptions::default()).await?;
    clock.advance(ChronoDuration::seconds(1));
    let second = queue.enqueue_now("report", None, JobOptions::default()).await?;
    clock.advance(ChronoDuration::seconds(1));

    let claimed = assert_some!(store.fetch_next_job(None).await?);
    assert_eq!(claimed.id, first);
    let claimed = assert_some!(store.fetch_next_job(None).await?);
    assert_eq!(claimed.id, second);
    let claimed = assert_some!(store.fetch_next_job(None).await?);
    assert_eq!(claimed.id, low);
    assert_none!(store.fetch_next_job(None).await?);

    Ok(())
}

#[tokio::test]
async fn claimed_jobs_are_active_and_recorded() -> anyhow::Result<()> {
    let clock = MockClock::fixed(test_utils::t0());
    let config = test_utils::test_config();
    let (store, queue, _dir) = test_utils::setup_store_with_clock(&config, &clock).await?;

    let data = JobData::new().with("user_id", 42)?;
    let id = queue
        .enqueue_now("welcome_mail", Some(data), JobOptions::default())
        .await?;

    // Claims require `start_after` to be strictly in the past.
    assert_none!(store.fetch_next_job(None).await?);
    clock.advance(ChronoDuration::seconds(1));

    let claimed = assert_some!(store.fetch_next_job(None).await?);
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.state, JobState::Active);
    assert_eq!(claimed.server_name.as_deref(), Some("test-server"));
    assert_eq!(claimed.started_on, Some(test_utils::t0() + ChronoDuration::seconds(1)));
    assert_eq!(claimed.data.get::<i64>("user_id")?, Some(42));
    assert_eq!(claimed.queue, "default");

    assert_compact_json_snapshot!(history(&store, id).await?, @r#"["created", "active"]"#);

    Ok(())
}

#[tokio::test]
async fn future_jobs_wait_for_start_after() -> anyhow::Result<()> {
    let clock = MockClock::fixed(test_utils::t0());
    let config = test_utils::test_config();
    let (store, queue, _dir) = test_utils::setup_store_with_clock(&config, &clock).await?;

    let start_after = test_utils::t0() + ChronoDuration::hours(1);
    let id = queue
        .enqueue("report", start_after, None, JobOptions::default())
        .await?;

    clock.advance(ChronoDuration::minutes(59));
    assert_none!(store.fetch_next_job(None).await?);

    clock.advance(ChronoDuration::minutes(2));
    let claimed = assert_some!(store.fetch_next_job(None).await?);
    assert_eq!(claimed.id, id);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_fetchers_claim_each_job_once() -> anyhow::Result<()> {
    let config = test_utils::test_config();
    let (store, _dir) = test_utils::setup_store(&config).await?;
    let queue = JobQueue::new(store.clone());

    let past = Utc::now() - ChronoDuration::seconds(10);
    let mut enqueued = HashSet::new();
    for _ in 0..20 {
        enqueued.insert(
            queue
                .enqueue("report", past, None, JobOptions::default())
                .await?,
        );
    }

    let fetchers = (0..8).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = store.fetch_next_job(None).await? {
                claimed.push(job.id);
            }
            Ok::<_, StorageError>(claimed)
        })
    });

    let mut claimed = Vec::new();
    for fetcher in futures_util::future::join_all(fetchers).await {
        claimed.extend(fetcher??);
    }

    assert_eq!(claimed.len(), 20);
    assert_eq!(claimed.into_iter().collect::<HashSet<_>>(), enqueued);

    Ok(())
}

#[tokio::test]
async fn queues_are_isolated() -> anyhow::Result<()> {
    let clock = MockClock::fixed(test_utils::t0());
    let config = test_utils::test_config().queues(["mail"]);
    let (store, queue, _dir) = test_utils::setup_store_with_clock(&config, &clock).await?;

    queue.enqueue_now("report", None, JobOptions::default()).await?;
    let mail = queue
        .enqueue_now("welcome_mail", None, JobOptions::default().queue("mail"))
        .await?;
    clock.advance(ChronoDuration::seconds(1));
    let cron = queue
        .enqueue_now("deferred_call", None, JobOptions::default().queue("cron"))
        .await?;
    clock.advance(ChronoDuration::seconds(1));

    let claimed = assert_some!(store.fetch_next_job(None).await?);
    assert_eq!(claimed.id, mail);
    let claimed = assert_some!(store.fetch_next_job(None).await?);
    assert_eq!(claimed.id, cron);
    assert_none!(store.fetch_next_job(None).await?);

    Ok(())
}

#[tokio::test]
async fn fetch_can_be_pinned_to_one_job() -> anyhow::Result<()> {
    let clock = MockClock::fixed(test_utils::t0());
    let config = test_utils::test_config();
    let (store, queue, _dir) = test_utils::setup_store_with_clock(&config, &clock).await?;

    queue.enqueue_now("first", None, JobOptions::default()).await?;
    let pinned = queue.enqueue_now("second", None, JobOptions::default()).await?;
    clock.advance(ChronoDuration::seconds(1));

    let claimed = assert_some!(store.fetch_next_job(Some(pinned)).await?);
    assert_eq!(claimed.id, pinned);
    assert_none!(store.fetch_next_job(Some(pinned)).await?);
    assert_none!(store.fetch_next_job(Some(Uuid::new_v4())).await?);

    Ok(())
}

#[tokio::test]
async fn retries_push_start_after_forward() -> anyhow::Result<()> {
    let clock = MockClock::fixed(test_utils::t0());
    let config = test_utils::test_config();
    let (store, queue, _dir) = test_utils::setup_store_with_clock(&config, &clock).await?;

    let id = queue
        .enqueue_now("report", None, JobOptions::default().retry(2, 5_000))
        .await?;
    clock.advance(ChronoDuration::seconds(1));
    assert_some!(store.fetch_next_job(None).await?);

    let retried = store.retry_job(id, 5_000).await?;
    assert_eq!(retried.state, JobState::Retry);
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.start_after, test_utils::t0() + ChronoDuration::seconds(5));
    assert_eq!(job(&store, id).await?.start_after, retried.start_after);

    assert_none!(store.fetch_next_job(None).await?);
    clock.advance(ChronoDuration::seconds(5));

    let claimed = assert_some!(store.fetch_next_job(None).await?);
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.retry_count, 1);

    assert_compact_json_snapshot!(history(&store, id).await?, @r#"["created", "active", "retry", "active"]"#);

    Ok(())
}

#[tokio::test]
async fn transitions_check_the_current_state() -> anyhow::Result<()> {
    let clock = MockClock::fixed(test_utils::t0());
    let config = test_utils::test_config();
    let (store, queue, _dir) = test_utils::setup_store_with_clock(&config, &clock).await?;

    let id = queue.enqueue_now("report", None, JobOptions::default()).await?;

    assert_matches!(
        store.complete_job_by_id(id).await,
        Err(StorageError::PreconditionFailed { .. })
    );
    assert_matches!(
        store.retry_job(id, 0).await,
        Err(StorageError::PreconditionFailed { .. })
    );
    assert_matches!(
        store.complete_job_by_id(Uuid::new_v4()).await,
        Err(StorageError::JobNotFound(_))
    );

    clock.advance(ChronoDuration::seconds(1));
    assert_some!(store.fetch_next_job(None).await?);
    store.fail_job_by_id(id, "disk full").await?;

    let failed = job(&store, id).await?;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.failed_message.as_deref(), Some("disk full"));
    assert_eq!(failed.failed_on, Some(test_utils::t0() + ChronoDuration::seconds(1)));

    assert_matches!(
        store.fail_job_by_id(id, "again").await,
        Err(StorageError::PreconditionFailed { .. })
    );

    let states = store.get_job_states(id).await?;
    let last = assert_some!(states.last());
    assert_eq!(last.state, JobState::Failed);
    assert_eq!(last.message.as_deref(), Some("disk full"));

    Ok(())
}

#[tokio::test]
async fn duplicate_ids_are_rejected() -> anyhow::Result<()> {
    let config = test_utils::test_config();
    let (store, _dir) = test_utils::setup_store(&config).await?;

    let now = Utc::now();
    let job = Job::new("report", JobData::new(), now, now);
    store.insert_job(&job).await?;

    assert_matches!(
        store.insert_job(&job).await,
        Err(StorageError::DuplicateKey(id)) if id == job.id
    );

    Ok(())
}

#[tokio::test]
async fn cancel_and_resume_keep_start_after() -> anyhow::Result<()> {
    let clock = MockClock::fixed(test_utils::t0());
    let config = test_utils::test_config();
    let (store, queue, _dir) = test_utils::setup_store_with_clock(&config, &clock).await?;

    let start_after = test_utils::t0() + ChronoDuration::minutes(10);
    let id = queue
        .enqueue("report", start_after, None, JobOptions::default())
        .await?;

    queue.cancel(id).await?;
    let cancelled = job(&store, id).await?;
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert_eq!(cancelled.cancelled_on, Some(test_utils::t0()));

    assert_matches!(
        queue.cancel(id).await,
        Err(StorageError::PreconditionFailed { .. })
    );

    clock.advance(ChronoDuration::hours(1));
    assert_none!(store.fetch_next_job(None).await?);

    queue.resume(id).await?;
    let resumed = job(&store, id).await?;
    assert_eq!(resumed.state, JobState::Created);
    assert_eq!(resumed.start_after, start_after);
    assert_none!(resumed.cancelled_on);

    assert_matches!(
        queue.resume(id).await,
        Err(StorageError::PreconditionFailed { .. })
    );
    assert_matches!(
        queue.resume(Uuid::new_v4()).await,
        Err(StorageError::JobNotFound(_))
    );

    let claimed = assert_some!(store.fetch_next_job(None).await?);
    assert_eq!(claimed.id, id);

    assert_compact_json_snapshot!(history(&store, id).await?, @r#"["created", "cancelled", "created", "active"]"#);

    Ok(())
}

#[tokio::test]
async fn latest_jobs_are_paged_newest_first() -> anyhow::Result<()> {
    let clock = MockClock::fixed(test_utils::t0());
    let config = test_utils::test_config();
    let (store, queue, _dir) = test_utils::setup_store_with_clock(&config, &clock).await?;

    for n in 0..5 {
        queue
            .enqueue_now(&format!("job-{n}"), None, JobOptions::default())
            .await?;
        clock.advance(ChronoDuration::seconds(1));
    }

    let names = |jobs: Vec<Job>| jobs.into_iter().map(|job| job.job_name).collect::<Vec<_>>();

    let page = store.get_latest_jobs(1, 2, None).await?;
    assert_eq!(names(page), ["job-4", "job-3"]);
    let page = store.get_latest_jobs(3, 2, None).await?;
    assert_eq!(names(page), ["job-0"]);
    assert!(store.get_latest_jobs(4, 2, None).await?.is_empty());

    let claimed = assert_some!(store.fetch_next_job(None).await?);
    store.complete_job_by_id(claimed.id).await?;

    let completed = store.get_latest_jobs(1, 10, Some(JobState::Completed)).await?;
    assert_eq!(names(completed), ["job-0"]);
    let created = store.get_latest_jobs(1, 10, Some(JobState::Created)).await?;
    assert_eq!(created.len(), 4);

    Ok(())
}

#[tokio::test]
async fn inactive_servers_are_removed() -> anyhow::Result<()> {
    let clock = MockClock::fixed(test_utils::t0());
    let config = test_utils::test_config();
    let (store, _queue, _dir) = test_utils::setup_store_with_clock(&config, &clock).await?;

    let other = SqliteJobStore::new(
        store.pool().clone(),
        &test_utils::test_config().server_name("other-server"),
    )
    .with_clock(Arc::new(clock.clone()));
    other.start_storage().await?;
    assert_eq!(store.get_job_servers().await?.len(), 2);

    clock.advance(ChronoDuration::minutes(3));
    store.update_heartbeat().await?;

    assert_eq!(store.remove_inactive_servers(Duration::from_secs(120)).await?, 1);
    assert_eq!(store.remove_inactive_servers(Duration::from_secs(120)).await?, 0);

    let servers = store.get_job_servers().await?;
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].id, "test-server");
    assert_eq!(servers[0].last_heartbeat, test_utils::t0() + ChronoDuration::minutes(3));

    // A purged server registers itself again with its next heartbeat.
    other.update_heartbeat().await?;
    assert_eq!(store.get_job_servers().await?.len(), 2);

    Ok(())
}

#[tokio::test]
async fn cron_schedules_are_upserted() -> anyhow::Result<()> {
    let clock = MockClock::fixed(test_utils::t0());
    let config = test_utils::test_config();
    let (store, queue, _dir) = test_utils::setup_store_with_clock(&config, &clock).await?;

    let call = DeferredCall::new("reports", "build").arg("usage").arg(7);
    queue
        .add_or_update_cron("report", "0 * * * *", &call, CronOptions::default())
        .await?;

    clock.advance(ChronoDuration::hours(1));
    let options = CronOptions::default().time_zone("Europe/Berlin");
    queue
        .add_or_update_cron("report", "*/5 * * * *", &call, options)
        .await?;

    let crons = store.get_crons().await?;
    assert_eq!(crons.len(), 1);
    let cron = &crons[0];
    assert_eq!(cron.name, "report");
    assert_eq!(cron.cron_expression, "*/5 * * * *");
    assert_eq!(cron.time_zone.as_deref(), Some("Europe/Berlin"));
    assert_eq!(cron.created_at, test_utils::t0());
    assert_eq!(cron.updated_at, test_utils::t0() + ChronoDuration::hours(1));
    assert_eq!(jobyard::codec::decode(&cron.data)?, call);

    assert!(queue.remove_cron("report").await?);
    assert!(!queue.remove_cron("report").await?);
    assert!(store.get_crons().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn invalid_crons_are_rejected() -> anyhow::Result<()> {
    let config = test_utils::test_config();
    let (store, _dir) = test_utils::setup_store(&config).await?;
    let queue = JobQueue::new(store.clone());
    let call = DeferredCall::new("reports", "build");

    assert_matches!(
        queue
            .add_or_update_cron("report", "61 * * * *", &call, CronOptions::default())
            .await,
        Err(EnqueueError::InvalidCron(CronError::InvalidExpression { .. }))
    );
    assert_matches!(
        queue
            .add_or_update_cron("report", "* * * *", &call, CronOptions::default())
            .await,
        Err(EnqueueError::InvalidCron(CronError::InvalidExpression { .. }))
    );

    let options = CronOptions::default().time_zone("Mars/Olympus_Mons");
    assert_matches!(
        queue
            .add_or_update_cron("report", "* * * * *", &call, options)
            .await,
        Err(EnqueueError::InvalidCron(CronError::InvalidTimeZone(_)))
    );

    assert!(store.get_crons().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn typed_jobs_run_to_completion() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob {
        value: String,
    }

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = Arc<Mutex<Vec<String>>>;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.lock().unwrap().push(self.value.clone());
            Ok(())
        }
    }

    let config = test_utils::test_config();
    let (store, _dir) = test_utils::setup_store(&config).await?;
    let queue = JobQueue::new(store.clone());
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut ids = Vec::new();
    for value in ["foo", "bar", "baz"] {
        let job = TestJob {
            value: value.to_string(),
        };
        ids.push(job.enqueue(&queue).await?);
    }

    let runner = test_utils::create_test_runner(store.clone(), log.clone(), config)
        .register::<TestJob>()
        .start()
        .await?;
    runner.wait_for_shutdown().await;

    let mut values = log.lock().unwrap().clone();
    values.sort();
    assert_eq!(values, ["bar", "baz", "foo"]);

    let mut histories = Vec::new();
    for id in ids {
        let job = job(&store, id).await?;
        assert_eq!(job.state, JobState::Completed);
        assert_some!(job.completed_on);
        histories.push(history(&store, id).await?);
    }

    assert_eq!(histories.len(), 3);
    assert!(histories.iter().all(|states| *states == histories[0]));
    assert_compact_json_snapshot!(histories[0], @r#"["created", "active", "completed"]"#);

    Ok(())
}

#[tokio::test]
async fn jobs_are_locked_while_running() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        job_started_barrier: Arc<Barrier>,
        assertions_finished_barrier: Arc<Barrier>,
    }

    let config = test_utils::test_config();
    let (store, _dir) = test_utils::setup_store(&config).await?;
    let queue = JobQueue::new(store.clone());

    let test_context = TestContext {
        job_started_barrier: Arc::new(Barrier::new(2)),
        assertions_finished_barrier: Arc::new(Barrier::new(2)),
    };

    let id = queue.enqueue_now("test", None, JobOptions::default()).await?;

    let runner = test_utils::create_test_runner(store.clone(), test_context.clone(), config)
        .register_fn("test", |ctx: TestContext, _job: JobContext| async move {
            ctx.job_started_barrier.wait().await;
            ctx.assertions_finished_barrier.wait().await;
            Ok::<_, anyhow::Error>(())
        })
        .start()
        .await?;

    test_context.job_started_barrier.wait().await;

    assert_eq!(job(&store, id).await?.state, JobState::Active);
    assert_none!(store.fetch_next_job(None).await?);

    test_context.assertions_finished_barrier.wait().await;
    runner.wait_for_shutdown().await;

    assert_eq!(job(&store, id).await?.state, JobState::Completed);

    Ok(())
}

#[tokio::test]
async fn exhausted_jobs_keep_their_failure_message() -> anyhow::Result<()> {
    let config = test_utils::test_config();
    let (store, _dir) = test_utils::setup_store(&config).await?;
    let queue = JobQueue::new(store.clone());

    let id = queue
        .enqueue_now("flaky", None, JobOptions::default().retry(1, 0))
        .await?;

    let runner = test_utils::create_test_runner(store.clone(), (), config)
        .register_fn("flaky", |(), _job: JobContext| async move {
            Err::<(), _>(anyhow::anyhow!("upstream unavailable"))
        })
        .start()
        .await?;
    runner.wait_for_shutdown().await;

    let failed = job(&store, id).await?;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.failed_message.as_deref(), Some("upstream unavailable"));

    assert_compact_json_snapshot!(history(&store, id).await?, @r#"["created", "active", "retry", "active", "failed"]"#);

    Ok(())
}

#[tokio::test]
async fn zero_delay_retries_run_again_right_away() -> anyhow::Result<()> {
    let config = test_utils::test_config();
    let (store, _dir) = test_utils::setup_store(&config).await?;
    let queue = JobQueue::new(store.clone());
    let attempts = Arc::new(AtomicU8::new(0));

    let id = queue
        .enqueue_now("flaky", None, JobOptions::default().retry(3, 0))
        .await?;

    let runner = test_utils::create_test_runner(store.clone(), attempts.clone(), config)
        .register_fn("flaky", |attempts: Arc<AtomicU8>, job: JobContext| async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(attempt > 0, "first attempt fails");
            assert_eq!(job.retry_count, 1);
            Ok::<_, anyhow::Error>(())
        })
        .start()
        .await?;
    runner.wait_for_shutdown().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let completed = job(&store, id).await?;
    assert_eq!(completed.state, JobState::Completed);
    assert_eq!(completed.retry_count, 1);

    assert_compact_json_snapshot!(history(&store, id).await?, @r#"["created", "active", "retry", "active", "completed"]"#);

    Ok(())
}

#[tokio::test]
async fn higher_priority_jobs_start_first() -> anyhow::Result<()> {
    #[derive(Clone, Default)]
    struct TestContext {
        started: Arc<Mutex<Vec<i16>>>,
        finished: Arc<Mutex<Vec<(i16, Instant)>>>,
    }

    let config = test_utils::test_config().worker_count(2);
    let (store, _dir) = test_utils::setup_store(&config).await?;
    let queue = JobQueue::new(store.clone());
    let context = TestContext::default();

    for priority in [1, 0, 1, 0] {
        let data = JobData::new().with("priority", priority)?;
        queue
            .enqueue_now("sorted", Some(data), JobOptions::default().priority(priority))
            .await?;
    }

    let runner = test_utils::create_test_runner(store.clone(), context.clone(), config)
        .register_fn("sorted", |ctx: TestContext, job: JobContext| async move {
            let priority = job.data.get::<i16>("priority")?.unwrap_or_default();
            ctx.started.lock().unwrap().push(priority);
            tokio::time::sleep(Duration::from_millis(200)).await;
            ctx.finished.lock().unwrap().push((priority, Instant::now()));
            Ok::<_, anyhow::Error>(())
        })
        .start()
        .await?;
    runner.wait_for_shutdown().await;

    assert_eq!(*context.started.lock().unwrap(), [0, 0, 1, 1]);

    let finished = context.finished.lock().unwrap().clone();
    let urgent = finished
        .iter()
        .filter(|(priority, _)| *priority == 0)
        .map(|(_, at)| *at)
        .collect::<Vec<_>>();
    assert_eq!(urgent.len(), 2);
    let spread = urgent[0].max(urgent[1]) - urgent[0].min(urgent[1]);
    assert!(spread < Duration::from_millis(100), "finished {spread:?} apart");

    Ok(())
}

#[tokio::test]
async fn retried_jobs_count_every_attempt() -> anyhow::Result<()> {
    let config = test_utils::test_config();
    let (store, _dir) = test_utils::setup_store(&config).await?;
    let queue = JobQueue::new(store.clone());
    let attempts = Arc::new(AtomicU8::new(0));

    let data = JobData::new().with("throwAtCount", 1)?;
    let id = queue
        .enqueue_now("flaky", Some(data), JobOptions::default().retry(2, 0))
        .await?;

    let runner = test_utils::create_test_runner(store.clone(), attempts.clone(), config)
        .register_fn("flaky", |attempts: Arc<AtomicU8>, job: JobContext| async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            let throw_at = job.data.get::<i32>("throwAtCount")?.unwrap_or_default();
            anyhow::ensure!(job.retry_count > throw_at, "attempt {} failed", job.retry_count);
            Ok::<_, anyhow::Error>(())
        })
        .start()
        .await?;
    runner.wait_for_shutdown().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let completed = job(&store, id).await?;
    assert_eq!(completed.state, JobState::Completed);
    assert_eq!(completed.retry_count, 2);
    assert_none!(completed.failed_message);

    assert_compact_json_snapshot!(
        history(&store, id).await?,
        @r#"["created", "active", "retry", "active", "retry", "active", "completed"]"#
    );

    Ok(())
}

#[tokio::test]
async fn delayed_retries_end_in_failure() -> anyhow::Result<()> {
    let config = test_utils::test_config();
    let (store, _dir) = test_utils::setup_store(&config).await?;
    let queue = JobQueue::new(store.clone());

    let id = queue
        .enqueue_now("broken", None, JobOptions::default().retry(2, 500))
        .await?;

    let runner = jobyard::Runner::new(store.clone(), (), config)
        .register_fn("broken", |(), _job: JobContext| async move {
            Err::<(), _>(anyhow::anyhow!("always throws"))
        })
        .start()
        .await?;

    let mut retry_counts = Vec::new();
    let failed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let job = job(&store, id).await?;
            match job.state {
                JobState::Failed => return Ok::<_, anyhow::Error>(job),
                JobState::Retry => retry_counts.push(job.retry_count),
                _ => {}
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await??;

    runner.shutdown();
    runner.wait_for_shutdown().await;

    retry_counts.dedup();
    assert_eq!(retry_counts, [1, 2]);

    assert_eq!(failed.retry_count, 2);
    assert_eq!(failed.failed_message.as_deref(), Some("always throws"));

    assert_compact_json_snapshot!(
        history(&store, id).await?,
        @r#"["created", "active", "retry", "active", "retry", "active", "failed"]"#
    );

    Ok(())
}

#[tokio::test]
async fn panicking_jobs_fail_with_the_panic_message() -> anyhow::Result<()> {
    let config = test_utils::test_config();
    let (store, _dir) = test_utils::setup_store(&config).await?;
    let queue = JobQueue::new(store.clone());

    let id = queue.enqueue_now("explode", None, JobOptions::default()).await?;

    let runner = test_utils::create_test_runner(store.clone(), (), config)
        .register_fn("explode", |(), _job: JobContext| async move {
            if true {
                panic!("out of cheese");
            }
            Ok::<_, anyhow::Error>(())
        })
        .start()
        .await?;
    runner.wait_for_shutdown().await;

    let failed = job(&store, id).await?;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.retry_count, 0);
    assert_eq!(
        failed.failed_message.as_deref(),
        Some("job panicked: out of cheese")
    );

    Ok(())
}

#[tokio::test]
async fn jobs_without_a_handler_fail() -> anyhow::Result<()> {
    let config = test_utils::test_config();
    let (store, _dir) = test_utils::setup_store(&config).await?;
    let queue = JobQueue::new(store.clone());

    let id = queue.enqueue_now("unknown", None, JobOptions::default()).await?;

    let runner = test_utils::create_test_runner(store.clone(), (), config)
        .register_fn("known", |(), _job: JobContext| async move { Ok::<_, anyhow::Error>(()) })
        .start()
        .await?;
    runner.wait_for_shutdown().await;

    let failed = job(&store, id).await?;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(
        failed.failed_message.as_deref(),
        Some("no handler registered for job `unknown`")
    );

    Ok(())
}

#[tokio::test]
async fn slow_jobs_time_out() -> anyhow::Result<()> {
    let config = test_utils::test_config().job_timeout(Duration::from_millis(100));
    let (store, _dir) = test_utils::setup_store(&config).await?;
    let queue = JobQueue::new(store.clone());

    let id = queue.enqueue_now("slow", None, JobOptions::default()).await?;

    let runner = test_utils::create_test_runner(store.clone(), (), config)
        .register_fn("slow", |(), _job: JobContext| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, anyhow::Error>(())
        })
        .start()
        .await?;
    runner.wait_for_shutdown().await;

    let failed = job(&store, id).await?;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(
        failed.failed_message.as_deref(),
        Some("job exceeded its execution timeout of 100 ms")
    );

    Ok(())
}

#[tokio::test]
async fn running_jobs_observe_shutdown() -> anyhow::Result<()> {
    let config = test_utils::test_config();
    let (store, _dir) = test_utils::setup_store(&config).await?;
    let queue = JobQueue::new(store.clone());
    let started = Arc::new(Barrier::new(2));

    let id = queue.enqueue_now("wait", None, JobOptions::default()).await?;

    let runner = jobyard::Runner::new(store.clone(), started.clone(), config)
        .register_fn("wait", |started: Arc<Barrier>, job: JobContext| async move {
            started.wait().await;
            job.cancellation.cancelled().await;
            Ok::<_, anyhow::Error>(())
        })
        .start()
        .await?;

    started.wait().await;
    assert!(!runner.is_shutting_down());
    runner.shutdown();
    runner.shutdown();
    runner.wait_for_shutdown().await;

    assert_eq!(job(&store, id).await?.state, JobState::Completed);

    Ok(())
}

#[tokio::test]
async fn deferred_calls_run_their_target() -> anyhow::Result<()> {
    let config = test_utils::test_config();
    let (store, _dir) = test_utils::setup_store(&config).await?;
    let queue = JobQueue::new(store.clone());
    let log = Arc::new(Mutex::new(Vec::new()));

    let call = DeferredCall::new("reports", "build").arg("usage").arg(3);
    let id = queue
        .enqueue_call(&call, queue.now(), JobOptions::default())
        .await?;

    let runner = test_utils::create_test_runner(store.clone(), log.clone(), config)
        .register_call(
            "reports",
            "build",
            |log: Arc<Mutex<Vec<String>>>, args| async move {
                let kind = args.get::<String>(0)?;
                let days = args.get::<i64>(1)?;
                log.lock().unwrap().push(format!("{kind}:{days}"));
                Ok::<_, anyhow::Error>(())
            },
        )
        .start()
        .await?;
    runner.wait_for_shutdown().await;

    assert_eq!(*log.lock().unwrap(), ["usage:3"]);

    let job = job(&store, id).await?;
    assert_eq!(job.job_name, "deferred_call");
    assert_eq!(job.state, JobState::Completed);

    Ok(())
}

#[tokio::test]
async fn due_crons_enqueue_one_job_per_occurrence() -> anyhow::Result<()> {
    let config = test_utils::test_config();
    let (store, _dir) = test_utils::setup_store(&config).await?;
    let log = Arc::new(Mutex::new(Vec::new()));

    // `* * * * *` always has an occurrence within the last minute.
    let runner = jobyard::Runner::new(store.clone(), log.clone(), config)
        .register_call(
            "reports",
            "build",
            |log: Arc<Mutex<Vec<String>>>, args| async move {
                log.lock().unwrap().push(args.get::<String>(0)?);
                Ok::<_, anyhow::Error>(())
            },
        )
        .cron(
            "every-minute",
            "* * * * *",
            DeferredCall::new("reports", "build").arg("usage"),
            CronOptions::default(),
        )?
        .start()
        .await?;

    let ran = tokio::time::timeout(Duration::from_secs(10), async {
        while log.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert_ok!(ran);

    // Several more cron ticks pass without a second job.
    tokio::time::sleep(Duration::from_millis(300)).await;
    runner.shutdown();
    runner.wait_for_shutdown().await;

    assert_eq!(*log.lock().unwrap(), ["usage"]);

    let jobs = store.get_latest_jobs(1, 10, None).await?;
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.job_name, "deferred_call");
    assert_eq!(job.queue, "cron");
    assert_eq!(job.throttle_key.as_deref(), Some("every-minute"));
    assert_eq!(job.throttle_seconds, Some(60));
    assert_eq!(job.state, JobState::Completed);

    let crons = store.get_crons().await?;
    assert_eq!(crons.len(), 1);
    assert_eq!(crons[0].name, "every-minute");

    Ok(())
}
