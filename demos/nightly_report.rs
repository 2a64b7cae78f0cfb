//! A small job server on an SQLite file.
//!
//! It registers a typed job and a cron schedule that calls `reports.build`
//! every minute, enqueues a handful of jobs and runs until Ctrl-C (or, with
//! `--drain`, until the queue is empty).
//!
//! ```bash
//! RUST_LOG=jobyard=debug cargo run --example nightly_report -- --database demo.db
//! ```

use anyhow::Result;
use clap::Parser;
use jobyard::{
    BackgroundJob, Config, CronOptions, DeferredCall, JobQueue, JobStore, Runner, SqliteJobStore,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
struct Args {
    /// SQLite database file
    #[arg(long, default_value = "jobyard-demo.db")]
    database: PathBuf,

    /// Number of concurrently running jobs
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// How many greeting jobs to enqueue on start
    #[arg(long, default_value_t = 5)]
    jobs: u32,

    /// Time zone of the report schedule
    #[arg(long)]
    time_zone: Option<String>,

    /// Stop once no job is left to run
    #[arg(long)]
    drain: bool,
}

#[derive(Debug, Clone)]
struct AppContext {
    region: String,
}

#[derive(Serialize, Deserialize)]
struct Greeting {
    recipient: String,
}

impl BackgroundJob for Greeting {
    const JOB_NAME: &'static str = "greeting";
    const RETRY_MAX_COUNT: i32 = 2;
    const RETRY_DELAY_MS: i32 = 1_000;
    type Context = AppContext;

    async fn run(&self, ctx: Self::Context) -> Result<()> {
        info!(region = %ctx.region, "Hello, {}!", self.recipient);
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = Config::default()
        .worker_count(args.workers)
        .poll_interval(Duration::from_secs(1))
        .cron_poll_interval(Duration::from_secs(5))
        .listen_notify(false);

    let store = Arc::new(SqliteJobStore::open(&args.database, &config).await?);
    store.start_storage().await?;

    let mut cron_options = CronOptions::default();
    if let Some(time_zone) = args.time_zone {
        cron_options = cron_options.time_zone(time_zone);
    }

    let mut runner = Runner::new(store.clone(), AppContext { region: "eu".into() }, config)
        .register::<Greeting>()
        .register_call("reports", "build", |ctx: AppContext, args| async move {
            let kind = args.get::<String>(0)?;
            info!(region = %ctx.region, %kind, "Building report");
            Ok::<_, anyhow::Error>(())
        })
        .cron(
            "minutely-report",
            "* * * * *",
            DeferredCall::new("reports", "build").arg("usage"),
            cron_options,
        )?;

    if args.drain {
        runner = runner.shutdown_when_queue_empty();
    }

    let queue = JobQueue::new(store);
    for n in 0..args.jobs {
        Greeting {
            recipient: format!("visitor #{n}"),
        }
        .enqueue(&queue)
        .await?;
    }
    info!(jobs = args.jobs, "Enqueued greeting jobs");

    let handle = runner.start().await?;

    if !args.drain {
        tokio::signal::ctrl_c().await?;
        info!("Shutting down…");
        handle.shutdown();
    }

    handle.wait_for_shutdown().await;

    for job in queue.store().get_latest_jobs(1, 10, None).await? {
        info!(job.id = %job.id, job.name = %job.job_name, state = %job.state, "Job");
    }

    Ok(())
}
