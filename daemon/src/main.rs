use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::sync::broadcast;

use clientnotes::broadcast::{JobStatusView, JobUpdate};
use clientnotes::config::{load_config, Config};
use clientnotes::db::{default_database_path, Database};
use clientnotes::pipeline::{Pipeline, PipelineConfig};
use clientnotes::remote::WebDriverConnector;
use clientnotes::scheduler::ScheduleTrigger;
use clientnotes::secrets::{expand_home, Credentials};
use clientnotes::telemetry::init_logging;
use clientnotes::worker::{DateRange, JobKind, WorkerPool};
use clientnotes::{JobStatus, JobStore};

/// Runs client note report jobs against the remote system.
#[derive(Parser, Debug)]
#[command(name = "clientnotes")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "CLIENTNOTES_CONFIG", default_value = "~/.clientnotes/config.json")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker pool and schedule trigger until Ctrl-C
    Run,

    /// Submit one manual job, wait for it, and print its final status as JSON
    Once {
        /// First day of the report (YYYY-MM-DD)
        #[arg(long)]
        start: String,

        /// Last day of the report (YYYY-MM-DD)
        #[arg(long)]
        end: String,

        /// Maximum number of clients to enrich; 0 means all
        #[arg(long, default_value_t = 0)]
        limit: u32,

        /// Submitter recorded on the job
        #[arg(long, default_value = "cli")]
        owner: String,
    },
}

/// Everything a command needs, wired from configuration.
struct Runtime {
    config: Config,
    store: Arc<JobStore>,
    pipeline: Arc<Pipeline>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = PathBuf::from(expand_home(&cli.config));
    let config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    init_logging(&config.logging)?;

    info!("Starting clientnotes v{}", env!("CARGO_PKG_VERSION"));

    let runtime = build_runtime(config)?;
    match cli.command {
        Command::Run => run(runtime),
        Command::Once {
            start,
            end,
            limit,
            owner,
        } => once(runtime, &start, &end, limit, &owner),
    }
}

fn build_runtime(config: Config) -> anyhow::Result<Runtime> {
    let credentials = Credentials::resolve(&config.credentials).context("resolving credentials")?;
    let connector = WebDriverConnector::new(config.remote.clone())?;

    let store = Arc::new(JobStore::new());
    let db_path = config
        .database_path
        .as_deref()
        .map(|p| PathBuf::from(expand_home(p)))
        .or_else(default_database_path);
    match db_path {
        Some(path) => match Database::open(&path) {
            Ok(db) => {
                store.set_database(db);
                info!("Job store database initialized successfully");
            }
            Err(e) => error!("Failed to open job database, history will not persist: {}", e),
        },
        None => warn!("Could not determine database path, history will not persist"),
    }

    let pipeline = Arc::new(Pipeline::new(
        Arc::new(PipelineConfig::from_config(&config)),
        Arc::new(connector),
        Arc::new(credentials),
    ));

    Ok(Runtime {
        config,
        store,
        pipeline,
    })
}

fn run(runtime: Runtime) -> anyhow::Result<()> {
    let Runtime {
        config,
        store,
        pipeline,
    } = runtime;

    let queued = store.restore_from_database()?;
    let pool = WorkerPool::start(pipeline, Arc::clone(&store), config.worker_count)?;
    let queue = pool.queue();
    for id in queued {
        if let Err(e) = queue.requeue(id) {
            warn!("Could not requeue job {}: {}", id, e);
        }
    }

    // Kept alive so the trigger loop keeps listening for manual runs.
    let (_trigger_tx, trigger_rx) = broadcast::channel::<JobKind>(16);
    let scheduler = ScheduleTrigger::new(&config.schedule, queue.clone());
    let scheduler_handle = scheduler.start(trigger_rx)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("installing Ctrl-C handler")?;

    info!(
        "clientnotes running with {} workers; press Ctrl-C to stop",
        pool.worker_count()
    );
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(500));
    }

    info!("Shutting down...");
    scheduler.stop();
    if scheduler_handle.join().is_err() {
        error!("Scheduler thread panicked");
    }
    pool.shutdown();
    if pool.active_count() > 0 {
        info!("Waiting for {} running jobs to finish", pool.active_count());
    }
    pool.wait();
    Ok(())
}

/// Runs one manual job in the foreground. History is not restored: a
/// `run` daemon may own the same database, and its in-flight jobs are not
/// ours to fail.
fn once(runtime: Runtime, start: &str, end: &str, limit: u32, owner: &str) -> anyhow::Result<()> {
    let Runtime { store, pipeline, .. } = runtime;

    let range = DateRange::parse(start, end)?;
    let pool = WorkerPool::start(pipeline, Arc::clone(&store), 1)?;

    let id = pool.queue().submit(JobKind::Manual, range, limit, owner)?;
    let subscription = store.subscribe(id)?;
    for entry in &subscription.snapshot.logs {
        eprintln!("{}", entry.message);
    }
    for event in subscription.receiver.iter() {
        match event.update {
            JobUpdate::Log { entry } => eprintln!("{}", entry.message),
            JobUpdate::Status { status, .. } => eprintln!("-- {}", status),
            JobUpdate::Counters { .. } => {}
        }
    }

    pool.shutdown();
    pool.wait();

    let status = store
        .get_status(id)
        .context("job disappeared from the store")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    report_exit(&status)
}

fn report_exit(status: &JobStatusView) -> anyhow::Result<()> {
    match status.status {
        JobStatus::Completed => Ok(()),
        other => bail!(
            "job {} ended {}: {}",
            status.id,
            other.as_str(),
            status.error_message.as_deref().unwrap_or("no error recorded")
        ),
    }
}
