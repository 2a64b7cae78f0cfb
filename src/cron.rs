//! Cron schedules.
//!
//! Expressions use the standard five Unix fields (minute, hour, day of month,
//! month, day of week, with both 0 and 7 meaning Sunday) and are evaluated in
//! the schedule's time zone. A schedule fires at most once per occurrence:
//! each tick enqueues a job if an occurrence happened within the last minute
//! and no job for the same schedule was created within the last minute.
//! Occurrences missed while no server was running are skipped.

use crate::codec::{DEFERRED_CALL_JOB, DESCRIPTOR_KEY};
use crate::errors::{CronError, EnqueueError, StorageError};
use crate::job_data::JobData;
use crate::queue::{JobOptions, JobQueue};
use crate::schema::Cron;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use futures_util::StreamExt;
use futures_util::stream;
use std::str::FromStr;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Queue that jobs enqueued by cron schedules are placed on.
///
/// Every server claims from it in addition to its configured queues.
pub const CRON_QUEUE: &str = "cron";

/// How long an occurrence stays due, and how far apart two jobs of the same
/// schedule must be created.
const DUE_WINDOW: Duration = Duration::seconds(60);

/// Parse a five-field cron expression.
pub fn parse_cron_expression(expression: &str) -> Result<Schedule, CronError> {
    let invalid = |reason: String| CronError::InvalidExpression {
        expression: expression.to_string(),
        reason,
    };

    let fields = expression.split_whitespace().collect::<Vec<_>>();
    let [minute, hour, day_of_month, month, day_of_week] = fields.as_slice() else {
        return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
    };

    // The `cron` crate wants a seconds and a year field and counts weekdays from 1 = Sunday.
    let converted = format!(
        "0 {minute} {hour} {day_of_month} {month} {} *",
        normalize_day_of_week(day_of_week)
    );

    Schedule::from_str(&converted).map_err(|error| invalid(error.to_string()))
}

/// Replace numeric weekdays (0-7, Sunday = 0 or 7) with their names.
fn normalize_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };

            // Ranges running into Sunday as 7 wrap around in the `cron` crate; list their days.
            if let Some((start, "7")) = range.split_once('-') {
                if let Some(days) = days_until_sunday(start, step) {
                    return days;
                }
            }

            let range = match range.split_once('-') {
                Some((start, end)) => format!("{}-{}", day_name(start), day_name(end)),
                None => day_name(range).to_string(),
            };

            match step {
                Some(step) => format!("{range}/{step}"),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Expand `start-7` (with an optional step) into a list of day names.
fn days_until_sunday(start: &str, step: Option<&str>) -> Option<String> {
    let start = DAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(start))
        .or_else(|| start.parse::<usize>().ok().filter(|day| *day <= 7))?;
    let step = match step {
        Some(step) => step.parse::<usize>().ok().filter(|step| *step > 0)?,
        None => 1,
    };

    let days = (start..=7)
        .step_by(step)
        .map(|day| DAY_NAMES[day % 7])
        .collect::<Vec<_>>();
    Some(days.join(","))
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn day_name(token: &str) -> &str {
    match token {
        "0" | "7" => "SUN",
        "1" => "MON",
        "2" => "TUE",
        "3" => "WED",
        "4" => "THU",
        "5" => "FRI",
        "6" => "SAT",
        other => other,
    }
}

/// Parse an IANA time zone name. `None` and blank names mean UTC.
pub fn parse_time_zone(time_zone: Option<&str>) -> Result<Tz, CronError> {
    match time_zone.map(str::trim) {
        None | Some("") => Ok(Tz::UTC),
        Some(name) => name
            .parse()
            .map_err(|_| CronError::InvalidTimeZone(name.to_string())),
    }
}

/// The first occurrence at or after `from`, evaluated in `time_zone`.
pub fn next_occurrence(
    schedule: &Schedule,
    time_zone: Tz,
    from: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    // `Schedule::after` is exclusive.
    let start = (from - Duration::nanoseconds(1)).with_timezone(&time_zone);
    schedule
        .after(&start)
        .next()
        .map(|next| next.with_timezone(&Utc))
}

/// Whether an occurrence happened within the minute before `now`.
pub fn is_due(schedule: &Schedule, time_zone: Tz, now: DateTime<Utc>) -> bool {
    let Some(next) = next_occurrence(schedule, time_zone, now - DUE_WINDOW) else {
        return false;
    };

    let elapsed = now - next;
    elapsed >= Duration::zero() && elapsed < DUE_WINDOW
}

/// Whether a schedule should enqueue a job at `now`.
///
/// `last_created_on` is the creation time of the most recent job the schedule
/// enqueued, if any.
pub fn should_schedule(
    expression: &str,
    time_zone: Option<&str>,
    now: DateTime<Utc>,
    last_created_on: Option<DateTime<Utc>>,
) -> Result<bool, CronError> {
    let schedule = parse_cron_expression(expression)?;
    let time_zone = parse_time_zone(time_zone)?;

    if !is_due(&schedule, time_zone, now) {
        return Ok(false);
    }

    Ok(last_created_on.is_none_or(|last| now >= last + DUE_WINDOW))
}

/// Periodically turns due cron schedules into jobs.
#[derive(Debug)]
pub(crate) struct CronEngine {
    pub(crate) queue: JobQueue,
    pub(crate) interval: std::time::Duration,
    pub(crate) parallelism: usize,
    pub(crate) shutdown: CancellationToken,
}

impl CronEngine {
    pub(crate) async fn run(self) {
        loop {
            let started = Instant::now();
            if let Err(error) = self.tick().await {
                error!(%error, "Failed to load cron schedules");
            }

            let wait = self.interval.saturating_sub(started.elapsed());
            trace!("Checking cron schedules again in {wait:?}…");
            tokio::select! {
                () = sleep(wait) => {}
                () = self.shutdown.cancelled() => break,
            }
        }

        debug!("Cron engine stopped");
    }

    async fn tick(&self) -> Result<(), StorageError> {
        let crons = self.queue.store().get_crons().await?;
        let now = self.queue.now();

        stream::iter(crons)
            .for_each_concurrent(self.parallelism, |cron| async move {
                if let Err(error) = self.process(&cron, now).await {
                    warn!(cron.name = %cron.name, %error, "Failed to process cron schedule");
                }
            })
            .await;

        Ok(())
    }

    async fn process(&self, cron: &Cron, now: DateTime<Utc>) -> Result<(), EnqueueError> {
        let last_created_on = self
            .queue
            .store()
            .get_job_by_throttle(&cron.name)
            .await?
            .map(|job| job.created_on);

        if !should_schedule(
            &cron.cron_expression,
            cron.time_zone.as_deref(),
            now,
            last_created_on,
        )? {
            return Ok(());
        }

        let data = JobData::new().with(DESCRIPTOR_KEY, &cron.data)?;
        let options = JobOptions::default()
            .queue(CRON_QUEUE)
            .throttle(&cron.name, std::time::Duration::from_secs(60));

        let id = self
            .queue
            .enqueue(DEFERRED_CALL_JOB, now, Some(data), options)
            .await?;

        info!(cron.name = %cron.name, job.id = %id, "Enqueued cron job");
        Ok(())
    }
}
