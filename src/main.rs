use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use adscope::api::ApiClient;
use adscope::config;
use adscope::db::{self, SqliteTaskSource};
use adscope::poller::{TaskEvent, TaskPoller, TaskSource};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusSource {
    /// Poll the backend status endpoint
    Api,
    /// Read status straight from the task table
    Store,
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Watch unfinished background tasks until they complete or fail"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Where task status is read from
    #[arg(long, value_enum, default_value = "api")]
    source: StatusSource,

    /// Seconds between scans of the task table for newly created tasks
    #[arg(long, default_value = "30")]
    rescan_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let source: Arc<dyn TaskSource> = match args.source {
        StatusSource::Api => {
            let api = ApiClient::from_config(&cfg)?;
            match api.health().await {
                Ok(health) => info!(status = ?health.status, "backend reachable"),
                Err(err) => warn!(%err, "backend health check failed; polling anyway"),
            }
            Arc::new(api)
        }
        StatusSource::Store => Arc::new(SqliteTaskSource::new(pool.clone())),
    };
    let (poller, mut events) = TaskPoller::new(source, cfg.poller());

    let mut rescan = tokio::time::interval(Duration::from_secs(args.rescan_seconds.max(1)));
    let mut abandoned: HashSet<String> = HashSet::new();
    info!(source = ?args.source, "task watcher started");

    loop {
        tokio::select! {
            _ = rescan.tick() => {
                match db::list_unfinished(&pool).await {
                    Ok(tasks) => {
                        let mut added = 0;
                        for task in tasks {
                            if abandoned.contains(&task.id) {
                                continue;
                            }
                            if poller.watch(task) {
                                added += 1;
                            }
                        }
                        if added > 0 {
                            info!(added, active = poller.active_ids().len(), "picked up unfinished tasks");
                        }
                    }
                    Err(err) => error!(?err, "failed to scan task table"),
                }
            }
            Some(event) = events.recv() => {
                let task = event.task().clone();
                match &event {
                    TaskEvent::Completed(_) => info!(id = %task.id, kind = %task.kind, result = ?task.result, "task completed"),
                    TaskEvent::Failed(_) => warn!(id = %task.id, kind = %task.kind, error = ?task.error, "task failed"),
                    TaskEvent::Abandoned { reason, .. } => {
                        warn!(id = %task.id, ?reason, "stopped watching task");
                        abandoned.insert(task.id.clone());
                        poller.remove(&task.id);
                        continue;
                    }
                }
                if let Err(err) = db::save_task(&pool, &task).await {
                    error!(?err, id = %task.id, "failed to persist task result");
                }
                // Terminal tasks stay out of the poller once persisted.
                poller.remove(&task.id);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down task watcher");
                break;
            }
        }
    }

    poller.shutdown();
    Ok(())
}
