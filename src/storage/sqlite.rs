use super::{
    CANCELLABLE, JobStore, NewJobReceiver, ServerIdentity, chrono_duration,
    missing_or_precondition, page_offset,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::errors::StorageError;
use crate::schema::{Cron, Job, JobServerEntry, JobState, JobStateEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/sqlite");

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONNECTIONS: u32 = 8;

/// A [`JobStore`] on an embedded SQLite database.
///
/// SQLite has no row locks; the claim is a single `UPDATE … RETURNING`
/// statement, which SQLite's database-wide write lock makes atomic. There is no
/// push channel, servers find new jobs by polling.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    server: ServerIdentity,
}

impl SqliteJobStore {
    /// Create a store on an existing pool.
    pub fn new(pool: SqlitePool, config: &Config) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            server: ServerIdentity::from_config(config),
        }
    }

    /// Open (and create if missing) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>, config: &Config) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        Ok(Self::new(pool, config))
    }

    /// A private in-memory database, gone when the store is dropped.
    pub async fn in_memory(config: &Config) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // Every connection to `:memory:` is its own database, so keep exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self::new(pool, config))
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn insert_state(
    conn: &mut SqliteConnection,
    job_id: Uuid,
    state: JobState,
    message: Option<&str>,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO job_states (id, job_id, state, message, created_at) VALUES (?, ?, ?, ?, ?)")
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(state)
        .bind(message)
        .bind(at)
        .execute(conn)
        .await?;
    Ok(())
}

async fn job_exists(conn: &mut SqliteConnection, id: Uuid) -> Result<bool, sqlx::Error> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE id = ?")
        .bind(id)
        .fetch_one(conn)
        .await?;
    Ok(count > 0)
}

async fn record_transition(
    conn: &mut SqliteConnection,
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

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn start_storage(&self) -> Result<(), StorageError> {
        MIGRATOR.run(&self.pool).await?;

        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM job_servers WHERE id = ?")
            .bind(&self.server.name)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO job_servers (id, data, last_heartbeat) VALUES (?, ?, ?)")
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
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r"
            INSERT INTO jobs (
                id, job_name, data, state, start_after, created_on, priority, queue,
                retry_max_count, retry_count, retry_delay_ms, server_name,
                throttle_key, throttle_seconds
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_next_job(&self, hint: Option<Uuid>) -> Result<Option<Job>, StorageError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>(
            r"
            UPDATE jobs
            SET state = ?1, started_on = ?2, server_name = ?3
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE state < ?1
                  AND start_after < ?2
                  AND queue IN (SELECT value FROM json_each(?4))
                  AND (?5 IS NULL OR id = ?5)
                ORDER BY priority, created_on, id
                LIMIT 1
            )
            RETURNING *
            ",
        )
        .bind(JobState::Active)
        .bind(now)
        .bind(&self.server.name)
        .bind(Json(&self.server.claim_queues))
        .bind(hint)
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
            "UPDATE jobs SET state = ?, completed_on = ? WHERE id = ? AND state = ? RETURNING id",
        )
        .bind(JobState::Completed)
        .bind(now)
        .bind(id)
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
            UPDATE jobs SET state = ?, failed_on = ?, failed_message = ?
            WHERE id = ? AND state = ?
            RETURNING id
            ",
        )
        .bind(JobState::Failed)
        .bind(now)
        .bind(message)
        .bind(id)
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
            SET state = ?, retry_count = retry_count + 1, completed_on = NULL
            WHERE id = ? AND state = ?
            RETURNING *
            ",
        )
        .bind(JobState::Retry)
        .bind(id)
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

        let mut job = job.ok_or(StorageError::JobNotFound(id))?;

        // Timestamps are stored as text; shift in Rust to keep their encoding uniform.
        job.start_after += chrono::Duration::milliseconds(i64::from(delay_ms));
        sqlx::query("UPDATE jobs SET start_after = ? WHERE id = ?")
            .bind(job.start_after)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn cancel_job_by_id(&self, id: Uuid) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_scalar::<_, Uuid>(
            "UPDATE jobs SET state = ?, cancelled_on = ? WHERE id = ? AND state < ? RETURNING id",
        )
        .bind(JobState::Cancelled)
        .bind(now)
        .bind(id)
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

        let updated = sqlx::query_scalar::<_, Uuid>(
            r"
            UPDATE jobs SET state = ?, completed_on = NULL, cancelled_on = NULL
            WHERE id = ? AND state = ?
            RETURNING id
            ",
        )
        .bind(JobState::Created)
        .bind(id)
        .bind(JobState::Cancelled)
        .fetch_optional(&mut *tx)
        .await?;

        record_transition(
            &mut tx,
            id,
            updated.is_some(),
            JobState::Created,
            None,
            now,
            JobState::Cancelled.as_str(),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_job_by_id(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn get_job_states(&self, job_id: Uuid) -> Result<Vec<JobStateEntry>, StorageError> {
        let states = sqlx::query_as::<_, JobStateEntry>(
            "SELECT * FROM job_states WHERE job_id = ? ORDER BY rowid",
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
            WHERE (?1 IS NULL OR state = ?1)
            ORDER BY created_on DESC, id DESC
            LIMIT ?2 OFFSET ?3
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
            "SELECT * FROM jobs WHERE throttle_key = ? ORDER BY created_on DESC, id DESC LIMIT 1",
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
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE
            SET cron_expression = excluded.cron_expression,
                data = excluded.data,
                time_zone = excluded.time_zone,
                updated_at = excluded.updated_at
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
        let result = sqlx::query("DELETE FROM crons WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_heartbeat(&self) -> Result<(), StorageError> {
        let now = self.clock.now();
        sqlx::query(
            r"
            INSERT INTO job_servers (id, data, last_heartbeat) VALUES (?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET last_heartbeat = excluded.last_heartbeat
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
        let result = sqlx::query("DELETE FROM job_servers WHERE last_heartbeat < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn subscribe_new_jobs(&self) -> Result<Option<NewJobReceiver>, StorageError> {
        Ok(None)
    }
}
