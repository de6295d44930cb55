use adscope::db::{self, SqliteTaskSource};
use adscope::model::{TaskSnapshot, TaskStatus, KIND_KEYWORD_VARIANTS};
use adscope::poller::{PollerConfig, TaskEvent, TaskPoller};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn fast_config() -> PollerConfig {
    PollerConfig {
        poll_interval: Duration::from_millis(20),
        max_observation: Duration::from_secs(30),
        max_consecutive_failures: 5,
    }
}

async fn next_event(events: &mut tokio::sync::mpsc::UnboundedReceiver<TaskEvent>) -> TaskEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for task event")
        .expect("event channel closed")
}

#[tokio::test]
async fn poller_follows_task_table_to_completion() {
    let pool = setup_pool().await;
    let metadata = json!({ "keywords": ["trail running shoes"] })
        .as_object()
        .cloned()
        .unwrap();
    let task = db::create_task(&pool, "user-1", KIND_KEYWORD_VARIANTS, metadata)
        .await
        .unwrap();

    let (poller, mut events) =
        TaskPoller::new(Arc::new(SqliteTaskSource::new(pool.clone())), fast_config());
    assert!(poller.watch(task.clone()));

    // The external processor picks the task up, then finishes it.
    db::update_status(&pool, &task.id, &TaskSnapshot::status(TaskStatus::Processing))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(poller.task(&task.id).unwrap().status, TaskStatus::Processing);

    let result = json!({ "variants_generated": 5 }).as_object().cloned().unwrap();
    db::update_status(&pool, &task.id, &TaskSnapshot::completed(result.clone()))
        .await
        .unwrap();

    match next_event(&mut events).await {
        TaskEvent::Completed(done) => {
            assert_eq!(done.id, task.id);
            assert_eq!(done.result, Some(result));
            assert_eq!(done.metadata["keywords"][0], "trail running shoes");
        }
        other => panic!("expected completion, got {:?}", other),
    }
    assert!(poller.active_ids().is_empty());
    assert!(!poller.is_ticking());
}

#[tokio::test]
async fn watching_unfinished_tasks_from_the_store() {
    let pool = setup_pool().await;
    let a = db::create_task(&pool, "user-1", KIND_KEYWORD_VARIANTS, Map::new())
        .await
        .unwrap();
    let b = db::create_task(&pool, "user-1", "market_insight", Map::new())
        .await
        .unwrap();
    db::update_status(&pool, &b.id, &TaskSnapshot::failed("no ads matched filters"))
        .await
        .unwrap();

    let (poller, mut events) =
        TaskPoller::new(Arc::new(SqliteTaskSource::new(pool.clone())), fast_config());
    for task in db::list_unfinished(&pool).await.unwrap() {
        poller.watch(task);
    }
    assert_eq!(poller.active_ids(), vec![a.id.clone()]);

    db::update_status(&pool, &a.id, &TaskSnapshot::failed("generation crashed"))
        .await
        .unwrap();
    let event = next_event(&mut events).await;
    assert!(matches!(event, TaskEvent::Failed(_)));
    db::save_task(&pool, event.task()).await.unwrap();

    let stored = db::get_task(&pool, &a.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("generation crashed"));
    assert!(db::list_unfinished(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn deleted_record_is_eventually_abandoned() {
    let pool = setup_pool().await;
    let task = db::create_task(&pool, "user-1", KIND_KEYWORD_VARIANTS, Map::new())
        .await
        .unwrap();
    let cfg = PollerConfig {
        max_consecutive_failures: 3,
        ..fast_config()
    };
    let (poller, mut events) = TaskPoller::new(Arc::new(SqliteTaskSource::new(pool.clone())), cfg);
    poller.watch(task.clone());
    assert!(db::delete_task(&pool, &task.id).await.unwrap());

    match next_event(&mut events).await {
        TaskEvent::Abandoned { task: gone, .. } => assert_eq!(gone.id, task.id),
        other => panic!("expected abandonment, got {:?}", other),
    }
}
