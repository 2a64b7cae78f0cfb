use crate::cron::CRON_QUEUE;
use crate::schema::DEFAULT_QUEUE;
use std::collections::BTreeSet;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_CRON_POLL_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_SERVER_PURGE_AFTER: Duration = Duration::from_secs(2 * 60);
const DEFAULT_SERVER_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Settings of a server instance.
///
/// Build one with [`Config::default`] and the consuming setters, then hand it
/// to the store and the [`Runner`](crate::Runner).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of jobs executing at once.
    pub worker_count: usize,
    /// How long the dispatch loop sleeps when nothing is eligible.
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to each poll sleep.
    pub poll_jitter: Duration,
    /// Period of the cron engine.
    pub cron_poll_interval: Duration,
    /// Period of the heartbeat task.
    pub heartbeat_interval: Duration,
    /// Servers whose heartbeat is older than this are purged.
    pub server_purge_after: Duration,
    /// Period of the purge task.
    pub server_maintenance_interval: Duration,
    /// Queues this server claims from, besides the reserved cron queue.
    pub queues: BTreeSet<String>,
    /// Whether to subscribe to new-job notifications when the store offers them.
    pub listen_notify: bool,
    /// Identity written to claimed jobs and to the server registry.
    pub server_name: String,
    /// Upper bound on a single job execution.
    pub job_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());

        Self {
            worker_count: cpus * 2,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_jitter: Duration::ZERO,
            cron_poll_interval: DEFAULT_CRON_POLL_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            server_purge_after: DEFAULT_SERVER_PURGE_AFTER,
            server_maintenance_interval: DEFAULT_SERVER_MAINTENANCE_INTERVAL,
            queues: BTreeSet::from([DEFAULT_QUEUE.to_string()]),
            listen_notify: true,
            server_name: host_name(),
            job_timeout: None,
        }
    }
}

impl Config {
    /// Set the number of concurrently executing jobs.
    ///
    /// Values below one are raised to one.
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    /// Set how often the dispatch loop polls for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// The actual jitter applied will be a random value between 0 and the
    /// specified duration.
    pub fn poll_jitter(mut self, jitter: Duration) -> Self {
        self.poll_jitter = jitter;
        self
    }

    /// Set the period of the cron engine.
    pub fn cron_poll_interval(mut self, interval: Duration) -> Self {
        self.cron_poll_interval = interval;
        self
    }

    /// Set the period of the heartbeat task.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set how stale a heartbeat may get before the server is purged.
    pub fn server_purge_after(mut self, after: Duration) -> Self {
        self.server_purge_after = after;
        self
    }

    /// Set the period of the purge task.
    pub fn server_maintenance_interval(mut self, interval: Duration) -> Self {
        self.server_maintenance_interval = interval;
        self
    }

    /// Replace the set of queues this server claims from.
    ///
    /// Blank names are dropped; an empty set falls back to `"default"`.
    pub fn queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues
            .into_iter()
            .map(Into::into)
            .filter(|queue| !queue.trim().is_empty())
            .collect();
        if self.queues.is_empty() {
            self.queues.insert(DEFAULT_QUEUE.to_string());
        }
        self
    }

    /// Enable or disable new-job notifications.
    pub fn listen_notify(mut self, enabled: bool) -> Self {
        self.listen_notify = enabled;
        self
    }

    /// Set the server identity.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Bound each job execution; jobs running longer fail.
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// The queues passed to the claim: the configured ones plus the cron queue.
    pub fn claim_queues(&self) -> Vec<String> {
        let mut queues = self.queues.clone();
        queues.insert(CRON_QUEUE.to_string());
        queues.into_iter().collect()
    }
}

fn host_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().trim().to_string())
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "jobyard".to_string())
}
