//! Task record store: the persisted `tasks` table and the repository
//! functions over it.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

use crate::error::FetchError;
use crate::model::{Task, TaskSnapshot, TaskStatus};
use crate::poller::TaskSource;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url: {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn encode_map(map: &Map<String, Value>) -> Result<String> {
    serde_json::to_string(map).context("failed to encode JSON column")
}

fn decode_map(raw: &str) -> Result<Map<String, Value>> {
    serde_json::from_str(raw).with_context(|| format!("invalid JSON column: {}", raw))
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let status: String = row.get("status");
    let metadata: String = row.get("metadata");
    let result: Option<String> = row.get("result");
    Ok(Task {
        id: row.get("id"),
        owner: row.get("owner"),
        kind: row.get("kind"),
        status: TaskStatus::from_str(&status).map_err(|e| anyhow!(e))?,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        metadata: decode_map(&metadata)?,
        result: result.as_deref().map(decode_map).transpose()?,
        error: row.get("error"),
    })
}

/// Insert a new task record with a fresh id in `pending` status.
#[instrument(skip_all)]
pub async fn create_task(
    pool: &Pool,
    owner: &str,
    kind: &str,
    metadata: Map<String, Value>,
) -> Result<Task> {
    let task = Task::new(uuid::Uuid::new_v4().to_string(), owner, kind).with_metadata(metadata);
    insert_task(pool, &task).await?;
    Ok(task)
}

#[instrument(skip_all)]
pub async fn insert_task(pool: &Pool, task: &Task) -> Result<()> {
    let result = task.result.as_ref().map(encode_map).transpose()?;
    sqlx::query(
        "INSERT INTO tasks (id, owner, kind, status, metadata, result, error, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&task.id)
    .bind(&task.owner)
    .bind(&task.kind)
    .bind(task.status.as_str())
    .bind(encode_map(&task.metadata)?)
    .bind(result)
    .bind(&task.error)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Insert or wholesale-replace a task record.
#[instrument(skip_all)]
pub async fn save_task(pool: &Pool, task: &Task) -> Result<()> {
    let result = task.result.as_ref().map(encode_map).transpose()?;
    sqlx::query(
        "INSERT INTO tasks (id, owner, kind, status, metadata, result, error, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET status = excluded.status, metadata = excluded.metadata, result = excluded.result, error = excluded.error, updated_at = excluded.updated_at",
    )
    .bind(&task.id)
    .bind(&task.owner)
    .bind(&task.kind)
    .bind(task.status.as_str())
    .bind(encode_map(&task.metadata)?)
    .bind(result)
    .bind(&task.error)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_task(pool: &Pool, id: &str) -> Result<Option<Task>> {
    let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(task_from_row).transpose()
}

/// Tasks newest first, optionally narrowed to one owner and/or one status.
#[instrument(skip_all)]
pub async fn list_tasks(
    pool: &Pool,
    owner: Option<&str>,
    status: Option<TaskStatus>,
) -> Result<Vec<Task>> {
    let rows = sqlx::query(
        "SELECT * FROM tasks WHERE (?1 IS NULL OR owner = ?1) AND (?2 IS NULL OR status = ?2) ORDER BY created_at DESC",
    )
    .bind(owner)
    .bind(status.map(|s| s.as_str()))
    .fetch_all(pool)
    .await?;
    rows.iter().map(task_from_row).collect()
}

/// Tasks still `pending` or `processing`, oldest first.
#[instrument(skip_all)]
pub async fn list_unfinished(pool: &Pool) -> Result<Vec<Task>> {
    let rows = sqlx::query(
        "SELECT * FROM tasks WHERE status IN ('pending', 'processing') ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(task_from_row).collect()
}

/// Move a task forward according to `snapshot`. Regressions and changes to a
/// terminal task are rejected.
#[instrument(skip_all)]
pub async fn update_status(pool: &Pool, id: &str, snapshot: &TaskSnapshot) -> Result<Task> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(row) = row else {
        return Err(anyhow!("task {} not found", id));
    };
    let mut task = task_from_row(&row)?;
    let from = task.status;
    if !task.apply(snapshot) {
        return Err(anyhow!(
            "illegal status transition for task {}: {} -> {}",
            id,
            from,
            snapshot.status
        ));
    }
    let result = task.result.as_ref().map(encode_map).transpose()?;
    sqlx::query("UPDATE tasks SET status = ?, result = ?, error = ?, updated_at = ? WHERE id = ?")
        .bind(task.status.as_str())
        .bind(result)
        .bind(&task.error)
        .bind(task.updated_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(task)
}

#[instrument(skip_all)]
pub async fn delete_task(pool: &Pool, id: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Reads task status straight from the `tasks` table.
#[derive(Debug, Clone)]
pub struct SqliteTaskSource {
    pool: Pool,
}

impl SqliteTaskSource {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskSource for SqliteTaskSource {
    async fn fetch_task(&self, id: &str) -> Result<TaskSnapshot, FetchError> {
        match get_task(&self.pool, id).await {
            Ok(Some(task)) => Ok(TaskSnapshot::from(&task)),
            Ok(None) => Err(FetchError::NotFound(id.to_string())),
            Err(err) => Err(FetchError::store(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn metadata() -> Map<String, Value> {
        json!({ "keyword": "trail shoes" }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let pool = setup_pool().await;
        let task = create_task(&pool, "user-1", "keyword_variants", metadata())
            .await
            .unwrap();
        let loaded = get_task(&pool, &task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.metadata["keyword"], "trail shoes");
        assert!(loaded.result.is_none());

        assert!(delete_task(&pool, &task.id).await.unwrap());
        assert!(!delete_task(&pool, &task.id).await.unwrap());
        assert!(get_task(&pool, &task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_moves_forward_only() {
        let pool = setup_pool().await;
        let task = create_task(&pool, "user-1", "keyword_variants", metadata())
            .await
            .unwrap();

        update_status(&pool, &task.id, &TaskSnapshot::status(TaskStatus::Processing))
            .await
            .unwrap();
        assert!(update_status(&pool, &task.id, &TaskSnapshot::status(TaskStatus::Pending))
            .await
            .is_err());

        let result = json!({ "variants_generated": 5 }).as_object().cloned().unwrap();
        let done = update_status(&pool, &task.id, &TaskSnapshot::completed(result))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);

        let err = update_status(&pool, &task.id, &TaskSnapshot::failed("late"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("illegal status transition"));

        let stored = get_task(&pool, &task.id).await.unwrap().unwrap();
        assert_eq!(stored.result.unwrap()["variants_generated"], 5);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let pool = setup_pool().await;
        let a = create_task(&pool, "alice", "keyword_variants", Map::new()).await.unwrap();
        let _b = create_task(&pool, "bob", "market_insight", Map::new()).await.unwrap();
        update_status(&pool, &a.id, &TaskSnapshot::failed("quota exceeded"))
            .await
            .unwrap();

        assert_eq!(list_tasks(&pool, None, None).await.unwrap().len(), 2);
        let alice = list_tasks(&pool, Some("alice"), None).await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].error.as_deref(), Some("quota exceeded"));
        let failed = list_tasks(&pool, None, Some(TaskStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);

        let unfinished = list_unfinished(&pool).await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].owner, "bob");
    }

    #[tokio::test]
    async fn test_source_reports_missing_task() {
        let pool = setup_pool().await;
        let source = SqliteTaskSource::new(pool.clone());
        let err = source.fetch_task("nope").await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound(id) if id == "nope"));

        let task = create_task(&pool, "alice", "keyword_variants", Map::new()).await.unwrap();
        let snapshot = source.fetch_task(&task.id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Pending);
    }

    #[test]
    fn prepare_url_passes_memory_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }
}
