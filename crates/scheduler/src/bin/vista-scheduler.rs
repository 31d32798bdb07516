//! vista-scheduler: materializes the views declared in a TOML definitions file.
//!
//! With `--once` a single cycle is run and the process exits non-zero if any
//! view failed. Otherwise cycles repeat every `cycle_interval_secs` until
//! Ctrl-C, which cancels every in-flight run. Unless `--run-date` pins the
//! date, views are rebound when the local date changes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::Parser;
use tracing::{info, warn};

use vista_core::config::load_dotenv;
use vista_core::{Config, ViewId};
use vista_driver::{
    DigestRegistry, DriverRegistry, FilesystemDriver, FilesystemExecutor, InlineHasher,
    LocalFileHasher, MountedPathHasher, NoOpDriver, Resource, ShellDriver,
};
use vista_scheduler::{
    CycleOptions, FileStateStore, Scheduler, SchedulerConfig, ViewDefinitions, ViewGraph,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Partitioned view materialization scheduler.
#[derive(Parser, Debug)]
#[command(name = "vista-scheduler", version, about)]
struct Cli {
    /// TOML file with view definitions.
    #[arg(long, env = "VISTA_VIEWS_FILE")]
    views: Option<PathBuf>,

    /// TOML file with scheduler settings.
    #[arg(long, env = "VISTA_SCHEDULER_FILE")]
    config: Option<PathBuf>,

    /// Directory for persisted view state.
    #[arg(long, env = "VISTA_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Base directory for local resources and driver output.
    #[arg(long, env = "VISTA_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Date partition templates are bound against (YYYY-MM-DD, default today).
    #[arg(long, env = "VISTA_RUN_DATE")]
    run_date: Option<NaiveDate>,

    /// Ignore every persisted digest in the first cycle.
    #[arg(long)]
    force: bool,

    /// Ignore the persisted digest of one view (url path), repeatable.
    #[arg(long = "force-view")]
    force_views: Vec<String>,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(views) = cli.views.clone() {
        config.paths.views_file = views;
    }
    if let Some(file) = cli.config.clone() {
        config.paths.scheduler_file = Some(file);
    }
    if let Some(dir) = cli.state_dir.clone() {
        config.paths.state_dir = dir;
    }
    if let Some(dir) = cli.work_dir.clone() {
        config.paths.work_dir = dir;
    }
    config.log_summary();

    let scheduler_config = match &config.paths.scheduler_file {
        Some(path) => SchedulerConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let mut defaults = SchedulerConfig::default();
            defaults.apply_env_overrides();
            defaults.validate()?;
            defaults
        }
    };

    let run_date = cli.run_date.unwrap_or_else(|| Local::now().date_naive());
    let definitions = ViewDefinitions::from_file(&config.paths.views_file)
        .with_context(|| format!("failed to load {}", config.paths.views_file.display()))?;
    let views = definitions
        .bind(run_date)
        .context("failed to bind view definitions")?;
    info!(views = views.len(), %run_date, "view definitions bound");

    let graph = ViewGraph::build(views)?;
    let work_dir = &config.paths.work_dir;

    let drivers = DriverRegistry::new()
        .with(NoOpDriver::new())?
        .with(FilesystemDriver::with_executor(FilesystemExecutor::with_base_dir(work_dir)))?
        .with(ShellDriver::new(work_dir))?;

    let mut digests = DigestRegistry::empty();
    digests.register(Resource::LOCAL, LocalFileHasher::with_base(work_dir));
    digests.register(Resource::INLINE, InlineHasher);
    let mounts = scheduler_config
        .hdfs_mounts
        .iter()
        .fold(MountedPathHasher::new(), |hasher, (prefix, root)| {
            hasher.mount(prefix.clone(), root.clone())
        });
    digests.register(Resource::DISTRIBUTED, mounts);

    let store = FileStateStore::new(&config.paths.state_dir)
        .with_context(|| format!("failed to open state dir {}", config.paths.state_dir.display()))?;

    let interval = scheduler_config.cycle_interval();
    let mut scheduler = Scheduler::new(scheduler_config, graph, drivers, Arc::new(store))?
        .with_digest_registry(digests);

    let cancel = scheduler.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            cancel.cancel_all();
        }
    });

    let mut options = if cli.force {
        CycleOptions::forced()
    } else {
        CycleOptions::default()
    };
    for path in &cli.force_views {
        match scheduler.graph().views().iter().find(|v| &v.id.url_path() == path) {
            Some(view) => options = options.force_view(view.id.clone()),
            None => warn!(view = %path, "--force-view matches no defined view"),
        }
    }

    if cli.once {
        let report = scheduler.run_cycle(options).await?;
        report.log_summary();
        let failed: Vec<&ViewId> = report.failed().map(|o| &o.view).collect();
        if !failed.is_empty() {
            anyhow::bail!("{} view(s) failed", failed.len());
        }
        return Ok(());
    }

    // forced rematerialization applies to the first cycle only
    if options.force || !options.force_views.is_empty() {
        scheduler.run_cycle(options).await?.log_summary();
    }

    // without --run-date, partitions follow the calendar day
    let mut bound_date = run_date;
    scheduler
        .run_with(interval, |scheduler| {
            let today = cli.run_date.unwrap_or_else(|| Local::now().date_naive());
            if today == bound_date {
                return Ok(());
            }
            info!(from = %bound_date, to = %today, "run date rolled over, rebinding views");
            scheduler.replace_graph(ViewGraph::build(definitions.bind(today)?)?)?;
            bound_date = today;
            Ok(())
        })
        .await?;
    Ok(())
}
