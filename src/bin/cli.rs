//! Small demo/ops binary: seed a queue from a newline-delimited URL list
//! and drain it, printing each job as it is handed out.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use crawlqueue::{Job, QueueError, QueueOpts, Scheduler};

/// Run a crawl-scheduling queue against a list of seed URLs.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Newline-delimited file of URLs to seed the queue with.
    #[arg(long)]
    seeds: Option<PathBuf>,

    /// Directory to store the queue database in. Omit for in-memory.
    #[arg(long)]
    path: Option<PathBuf>,

    /// Reopen an existing database instead of recreating it.
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// Maximum concurrently in-flight jobs per group.
    #[arg(long, default_value_t = 1)]
    group_parallelism: usize,

    /// Seconds of post-completion delay enforced per group.
    #[arg(long, default_value_t = 0.0)]
    throttle: f64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut opts = QueueOpts::default()
        .with_group_parallelism(cli.group_parallelism)
        .with_throttle(cli.throttle);
    if let Some(path) = cli.path {
        opts = opts.with_path(path);
    }
    if cli.resume {
        opts = opts.resuming();
    }

    let scheduler = Scheduler::open(opts)?;

    if let Some(seeds) = cli.seeds {
        let contents = fs::read_to_string(&seeds)?;
        let jobs = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .enumerate()
            .map(|(i, url)| Job::new(format!("seed-{i}"), url));
        scheduler.put_many(jobs)?;
        tracing::info!(path = %seeds.display(), "seeded queue");
    }

    loop {
        match scheduler.get_nowait() {
            Ok(job) => {
                tracing::info!(id = %job.id, url = %job.url, "picked up job");
                scheduler.task_done(&job)?;
            }
            Err(QueueError::Drained) => {
                tracing::info!("queue drained");
                break;
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}
