use super::{
    CANCELLABLE, JobStore, NOTIFICATION_BUFFER, NewJobReceiver, ServerIdentity, chrono_duration,
    missing_or_precondition, page_offset,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::errors::StorageError;
use crate::schema::{Cron, Job, JobServerEntry, JobState, JobStateEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgListener, PgPool};
use sqlx::types::Json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/postgres");

/// Channel new-job notifications are published on.
pub const NEW_JOB_CHANNEL: &str = "jobyard_new_job";

const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A [`JobStore`] on PostgreSQL.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of servers can poll the
/// same table without blocking each other. Inserting a job that is ready to
/// run publishes a notification on [`NEW_JOB_CHANNEL`].
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    server: ServerIdentity,
}

impl PgJobStore {
    /// Create a store on `pool` for the server described by `config`.
    pub fn new(pool: PgPool, config: &Config) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            server: ServerIdentity::from_config(config),
        }
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn insert_state(
    conn: &mut PgConnection,
    job_id: Uuid,
    state: JobState,
    message: Option<&str>,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO job_states (id, job_id, state, message, created_at) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Uuid::new_v4())
    .bind(job_id)
    .bind(state)
    .bind(message)
    .bind(at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn job_exists(conn: &mut PgConnection, id: Uuid) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM jobs WHERE id = $1)")
        .bind(id)
        .fetch_one(conn)
        .await
}

/// Append the history row of a transition, or explain why its update matched
/// nothing.
async fn record_transition(
    conn: &mut PgConnection,
    id: Uuid,
    updated: bool,
    state: JobState,
    message: Option<&str>,
    at: DateTime<Utc>,
    expected: &'static str,
) -> Result<(), StorageError> {
    if !updated {
        let exists = job_exists(&mut *conn, id).await?;
        return Err(missing_or_precondition(id, exists, expected));
    }

    insert_state(conn, id, state, message, at).await?;
    Ok(())
}

async fn notify_new_job(conn: &mut PgConnection, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(NEW_JOB_CHANNEL)
        .bind(id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn start_storage(&self) -> Result<(), StorageError> {
        MIGRATOR.run(&self.pool).await?;

        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM job_servers WHERE id = $1")
            .bind(&self.server.name)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO job_servers (id, data, last_heartbeat) VALUES ($1, $2, $3)")
            .bind(&self.server.name)
            .bind(Json(self.server.registration(now)))
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(server.name = %self.server.name, "Registered job server");
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r"
            INSERT INTO jobs (
                id, job_name, data, state, start_after, created_on, priority, queue,
                retry_max_count, retry_count, retry_delay_ms, server_name,
                throttle_key, throttle_seconds
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ",
        )
        .bind(job.id)
        .bind(&job.job_name)
        .bind(Json(&job.data))
        .bind(JobState::Created)
        .bind(job.start_after)
        .bind(job.created_on)
        .bind(job.priority)
        .bind(&job.queue)
        .bind(job.retry_max_count)
        .bind(job.retry_count)
        .bind(job.retry_delay_ms)
        .bind(&job.server_name)
        .bind(&job.throttle_key)
        .bind(job.throttle_seconds)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                return Err(StorageError::DuplicateKey(job.id));
            }
            Err(error) => return Err(error.into()),
        }

        insert_state(&mut tx, job.id, JobState::Created, None, job.created_on).await?;

        if job.start_after <= now {
            notify_new_job(&mut tx, job.id).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fetch_next_job(&self, hint: Option<Uuid>) -> Result<Option<Job>, StorageError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>(
            r"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE state < $1
                  AND start_after < $2
                  AND queue = ANY($3)
                  AND ($4::uuid IS NULL OR id = $4)
                ORDER BY priority, created_on, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET state = $1, started_on = $2, server_name = $5
            FROM next_job
            WHERE jobs.id = next_job.id
            RETURNING jobs.*
            ",
        )
        .bind(JobState::Active)
        .bind(now)
        .bind(&self.server.claim_queues)
        .bind(hint)
        .bind(&self.server.name)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = job else {
            tx.rollback().await?;
            return Ok(None);
        };

        insert_state(&mut tx, job.id, JobState::Active, None, now).await?;
        tx.commit().await?;

        trace!(job.id = %job.id, "Claimed job");
        Ok(Some(job))
    }

    async fn complete_job_by_id(&self, id: Uuid) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_scalar::<_, Uuid>(
            "UPDATE jobs SET state = $2, completed_on = $3 WHERE id = $1 AND state = $4 RETURNING id",
        )
        .bind(id)
        .bind(JobState::Completed)
        .bind(now)
        .bind(JobState::Active)
        .fetch_optional(&mut *tx)
        .await?;

        record_transition(
            &mut tx,
            id,
            updated.is_some(),
            JobState::Completed,
            None,
            now,
            JobState::Active.as_str(),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fail_job_by_id(&self, id: Uuid, message: &str) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_scalar::<_, Uuid>(
            r"
            UPDATE jobs SET state = $2, failed_on = $3, failed_message = $4
            WHERE id = $1 AND state = $5
            RETURNING id
            ",
        )
        .bind(id)
        .bind(JobState::Failed)
        .bind(now)
        .bind(message)
        .bind(JobState::Active)
        .fetch_optional(&mut *tx)
        .await?;

        record_transition(
            &mut tx,
            id,
            updated.is_some(),
            JobState::Failed,
            Some(message),
            now,
            JobState::Active.as_str(),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn retry_job(&self, id: Uuid, delay_ms: i32) -> Result<Job, StorageError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>(
            r"
            UPDATE jobs
            SET state = $2,
                retry_count = retry_count + 1,
                start_after = start_after + $3::float8 * INTERVAL '1 millisecond',
                completed_on = NULL
            WHERE id = $1 AND state = $4
            RETURNING *
            ",
        )
        .bind(id)
        .bind(JobState::Retry)
        .bind(f64::from(delay_ms))
        .bind(JobState::Active)
        .fetch_optional(&mut *tx)
        .await?;

        record_transition(
            &mut tx,
            id,
            job.is_some(),
            JobState::Retry,
            None,
            now,
            JobState::Active.as_str(),
        )
        .await?;

        tx.commit().await?;
        job.ok_or(StorageError::JobNotFound(id))
    }

    async fn cancel_job_by_id(&self, id: Uuid) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_scalar::<_, Uuid>(
            "UPDATE jobs SET state = $2, cancelled_on = $3 WHERE id = $1 AND state < $4 RETURNING id",
        )
        .bind(id)
        .bind(JobState::Cancelled)
        .bind(now)
        .bind(JobState::Completed)
        .fetch_optional(&mut *tx)
        .await?;

        record_transition(
            &mut tx,
            id,
            updated.is_some(),
            JobState::Cancelled,
            None,
            now,
            CANCELLABLE,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn resume_job(&self, id: Uuid) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let start_after = sqlx::query_scalar::<_, DateTime<Utc>>(
            r"
            UPDATE jobs SET state = $2, completed_on = NULL, cancelled_on = NULL
            WHERE id = $1 AND state = $3
            RETURNING start_after
            ",
        )
        .bind(id)
        .bind(JobState::Created)
        .bind(JobState::Cancelled)
        .fetch_optional(&mut *tx)
        .await?;

        record_transition(
            &mut tx,
            id,
            start_after.is_some(),
            JobState::Created,
            None,
            now,
            JobState::Cancelled.as_str(),
        )
        .await?;

        if start_after.is_some_and(|start_after| start_after <= now) {
            notify_new_job(&mut tx, id).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_job_by_id(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn get_job_states(&self, job_id: Uuid) -> Result<Vec<JobStateEntry>, StorageError> {
        let states = sqlx::query_as::<_, JobStateEntry>(
            "SELECT * FROM job_states WHERE job_id = $1 ORDER BY seq",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(states)
    }

    async fn get_latest_jobs(
        &self,
        page: u32,
        limit: u32,
        state: Option<JobState>,
    ) -> Result<Vec<Job>, StorageError> {
        let jobs = sqlx::query_as::<_, Job>(
            r"
            SELECT * FROM jobs
            WHERE ($1::smallint IS NULL OR state = $1)
            ORDER BY created_on DESC, id DESC
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(state)
        .bind(i64::from(limit))
        .bind(page_offset(page, limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn get_job_by_throttle(&self, throttle_key: &str) -> Result<Option<Job>, StorageError> {
        let job = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE throttle_key = $1 ORDER BY created_on DESC, id DESC LIMIT 1",
        )
        .bind(throttle_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn add_or_update_cron(&self, cron: &Cron) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO crons (name, cron_expression, data, time_zone, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO UPDATE
            SET cron_expression = EXCLUDED.cron_expression,
                data = EXCLUDED.data,
                time_zone = EXCLUDED.time_zone,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(&cron.name)
        .bind(&cron.cron_expression)
        .bind(&cron.data)
        .bind(&cron.time_zone)
        .bind(cron.created_at)
        .bind(cron.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_crons(&self) -> Result<Vec<Cron>, StorageError> {
        let crons = sqlx::query_as::<_, Cron>("SELECT * FROM crons ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(crons)
    }

    async fn delete_cron(&self, name: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM crons WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_heartbeat(&self) -> Result<(), StorageError> {
        let now = self.clock.now();
        sqlx::query(
            r"
            INSERT INTO job_servers (id, data, last_heartbeat) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET last_heartbeat = EXCLUDED.last_heartbeat
            ",
        )
        .bind(&self.server.name)
        .bind(Json(self.server.registration(now)))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job_servers(&self) -> Result<Vec<JobServerEntry>, StorageError> {
        let servers = sqlx::query_as::<_, JobServerEntry>("SELECT * FROM job_servers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(servers)
    }

    async fn remove_inactive_servers(&self, older_than: Duration) -> Result<u64, StorageError> {
        let cutoff = self.clock.now() - chrono_duration(older_than);
        let result = sqlx::query("DELETE FROM job_servers WHERE last_heartbeat < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn subscribe_new_jobs(&self) -> Result<Option<NewJobReceiver>, StorageError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NEW_JOB_CHANNEL).await?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    notification = listener.recv() => match notification {
                        Ok(notification) => {
                            let Ok(id) = notification.payload().parse::<Uuid>() else {
                                continue;
                            };
                            // A full buffer already guarantees a wake-up.
                            if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(id) {
                                break;
                            }
                        }
                        Err(error) => {
                            warn!(%error, "New-job listener failed, reconnecting…");
                            tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                        }
                    },
                }
            }
            debug!("New-job listener stopped");
        });

        Ok(Some(rx))
    }
}
