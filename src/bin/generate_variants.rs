use anyhow::{anyhow, Result};
use clap::Parser;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use adscope::api::ApiClient;
use adscope::config;
use adscope::db;
use adscope::model::{NewTask, Task, KIND_KEYWORD_VARIANTS};
use adscope::poller::{TaskEvent, TaskPoller};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Submit a keyword-variant generation task and wait for its result"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Owner (user id) recorded on the task
    #[arg(long)]
    owner: String,

    /// Seed keyword; repeat for several
    #[arg(long = "keyword", required = true)]
    keywords: Vec<String>,

    /// Ad library item the variants are generated for
    #[arg(long)]
    ad_id: Option<String>,

    /// Return right after the task is created
    #[arg(long)]
    no_wait: bool,
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
    let api = ApiClient::from_config(&cfg)?;

    let mut metadata = Map::new();
    metadata.insert("keywords".into(), json!(args.keywords));
    if let Some(ad_id) = &args.ad_id {
        metadata.insert("ad_id".into(), Value::String(ad_id.clone()));
    }
    let new_task = NewTask {
        kind: KIND_KEYWORD_VARIANTS.to_string(),
        owner: args.owner.clone(),
        metadata: metadata.clone(),
    };

    let created = api.create_task(&new_task).await?;
    let mut task = Task::new(created.id.clone(), &args.owner, KIND_KEYWORD_VARIANTS)
        .with_metadata(metadata);
    task.status = created.status;
    db::save_task(&pool, &task).await?;
    info!(id = %task.id, status = %task.status, "variant generation submitted");
    println!("task {} {}", task.id, task.status);

    if args.no_wait {
        return Ok(());
    }

    let (poller, mut events) = TaskPoller::new(Arc::new(api), cfg.poller());
    poller.watch(task);

    let event = events
        .recv()
        .await
        .ok_or_else(|| anyhow!("poller stopped before the task finished"))?;
    poller.shutdown();

    let task = event.task().clone();
    db::save_task(&pool, &task).await?;
    match event {
        TaskEvent::Completed(_) => {
            let result = task.result.map(Value::Object).unwrap_or(Value::Null);
            println!("completed: {}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        TaskEvent::Failed(_) => Err(anyhow!(
            "variant generation failed: {}",
            task.error.unwrap_or_else(|| "unknown error".into())
        )),
        TaskEvent::Abandoned { reason, .. } => Err(anyhow!(
            "gave up waiting for task {} ({:?}), last status {}",
            task.id,
            reason,
            task.status
        )),
    }
}
