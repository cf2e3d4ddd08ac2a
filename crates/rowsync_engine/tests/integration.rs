//! End-to-end tests: SQLite-backed engines against an in-memory remote.

use rowsync_engine::{
    ManualConnectivity, MemoryRemote, RemoteError, RemoteMethod, RetryConfig, SqliteDriver,
    SyncConfig, SyncEngine, SyncError, SyncState, SyncStatus,
};
use rowsync_protocol::{
    ChangeReason, CheckpointAdvance, FilterSet, QueryRequest, RowMap, SyncMode,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const TODOS: &str = "CREATE TABLE todos (
    id TEXT PRIMARY KEY, title TEXT, owner TEXT,
    created_at TEXT, updated_at TEXT, deleted_at TEXT, synced_at TEXT
)";

struct Device {
    engine: Arc<SyncEngine>,
    network: Arc<ManualConnectivity>,
}

async fn device(remote: &Arc<MemoryRemote>, config: SyncConfig) -> Device {
    let driver = SqliteDriver::open_in_memory().unwrap();
    driver.execute_batch(TODOS).unwrap();
    let network = Arc::new(ManualConnectivity::new(true));
    let engine = SyncEngine::init(config, Arc::new(driver), remote.clone(), network.clone())
        .await
        .unwrap();
    Device { engine, network }
}

fn config() -> SyncConfig {
    SyncConfig::new(["todos"]).with_push_retry(RetryConfig::no_retry())
}

fn obj(value: Value) -> RowMap {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

fn remote_row(id: &str, title: &str, updated_at: &str) -> RowMap {
    obj(json!({
        "id": id,
        "title": title,
        "owner": "alice",
        "created_at": updated_at,
        "updated_at": updated_at,
        "deleted_at": null,
    }))
}

async fn local_title(engine: &SyncEngine, id: &str) -> Option<String> {
    let response = engine
        .execute(
            QueryRequest::select("todos")
                .eq("id", id)
                .mode(SyncMode::LocalOnly),
        )
        .await
        .unwrap();
    response
        .data
        .first()
        .and_then(|row| row.get("title"))
        .and_then(|title| title.as_str().map(str::to_string))
}

async fn local_count(engine: &SyncEngine, include_deleted: bool) -> usize {
    engine
        .execute(
            QueryRequest::select("todos")
                .include_deleted(include_deleted)
                .mode(SyncMode::LocalOnly),
        )
        .await
        .unwrap()
        .data
        .len()
}

async fn insert_local(engine: &SyncEngine, payload: Value) {
    engine
        .execute(QueryRequest::insert("todos", payload).mode(SyncMode::LocalOnly))
        .await
        .unwrap();
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test]
async fn two_devices_converge() {
    let remote = Arc::new(MemoryRemote::new());
    let phone = device(&remote, config()).await;
    let laptop = device(&remote, config()).await;

    insert_local(&phone.engine, json!({ "id": "a", "title": "buy milk" })).await;
    assert!(phone.engine.sync_all(true).await.unwrap().is_success());
    assert!(laptop.engine.sync_all(true).await.unwrap().is_success());
    assert_eq!(local_title(&laptop.engine, "a").await.as_deref(), Some("buy milk"));

    settle().await;
    laptop
        .engine
        .execute(
            QueryRequest::update("todos", json!({ "title": "buy oat milk" }))
                .eq("id", "a")
                .mode(SyncMode::LocalOnly),
        )
        .await
        .unwrap();
    laptop.engine.sync_all(true).await.unwrap();
    phone.engine.sync_all(true).await.unwrap();
    assert_eq!(local_title(&phone.engine, "a").await.as_deref(), Some("buy oat milk"));

    settle().await;
    phone
        .engine
        .execute(
            QueryRequest::delete("todos")
                .eq("id", "a")
                .mode(SyncMode::LocalOnly),
        )
        .await
        .unwrap();
    phone.engine.sync_all(true).await.unwrap();
    assert_eq!(local_count(&phone.engine, true).await, 0, "tombstone purged after push");
    assert!(remote.row("todos", "a").unwrap()["deleted_at"].is_string());

    laptop.engine.sync_all(true).await.unwrap();
    assert_eq!(local_count(&laptop.engine, true).await, 0, "deletion pulled");
}

#[tokio::test]
async fn newer_remote_row_overwrites_synced_local_row() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed("todos", [remote_row("r", "draft", "2024-01-01T00:00:00.000Z")]);
    let dev = device(&remote, config()).await;
    dev.engine.sync_all(true).await.unwrap();
    assert_eq!(local_title(&dev.engine, "r").await.as_deref(), Some("draft"));

    remote.seed("todos", [remote_row("r", "final", "2024-02-01T00:00:00.000Z")]);
    dev.engine.sync_all(true).await.unwrap();
    assert_eq!(local_title(&dev.engine, "r").await.as_deref(), Some("final"));
}

#[tokio::test]
async fn unsynced_local_edit_survives_pull() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed("todos", [remote_row("r", "draft", "2024-01-01T00:00:00.000Z")]);
    let dev = device(&remote, config()).await;
    dev.engine.pull("todos", &FilterSet::new()).await.unwrap();

    dev.engine
        .execute(
            QueryRequest::update("todos", json!({ "title": "mine" }))
                .eq("id", "r")
                .mode(SyncMode::LocalOnly),
        )
        .await
        .unwrap();
    remote.seed("todos", [remote_row("r", "theirs", "2024-01-02T00:00:00.000Z")]);
    dev.engine.pull("todos", &FilterSet::new()).await.unwrap();
    assert_eq!(local_title(&dev.engine, "r").await.as_deref(), Some("mine"));
    assert_eq!(dev.engine.pending_counts("todos").await.unwrap().upserts, 1);

    let conflicts = dev.engine.recent_conflicts();
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].is_skip());
}

#[tokio::test]
async fn checkpoint_never_moves_backward() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed("todos", [remote_row("r", "x", "2024-03-01T00:00:00.000Z")]);
    let dev = device(&remote, config()).await;
    dev.engine.pull("todos", &FilterSet::new()).await.unwrap();

    let checkpoints = dev.engine.checkpoints();
    let all = FilterSet::new();
    let before = checkpoints.get("todos", &all).await.unwrap();
    assert_eq!(before.last_synced_at, "2024-03-01T00:00:00.000Z");
    assert_eq!(before.last_synced_at_pk.as_deref(), Some("r"));

    let after = checkpoints
        .advance("todos", &all, CheckpointAdvance::synced("2024-01-01T00:00:00.000Z", "z"))
        .await
        .unwrap();
    assert_eq!(after, before);

    // A late row older than the checkpoint is not fetched again.
    remote.seed("todos", [remote_row("late", "x", "2024-02-01T00:00:00.000Z")]);
    dev.engine.pull("todos", &FilterSet::new()).await.unwrap();
    assert!(local_title(&dev.engine, "late").await.is_none());
    assert_eq!(checkpoints.get("todos", &all).await.unwrap(), before);
}

#[tokio::test]
async fn filtered_pulls_keep_separate_checkpoints() {
    let remote = Arc::new(MemoryRemote::new());
    let mut bob = remote_row("b", "bob's", "2024-01-02T00:00:00.000Z");
    bob.insert("owner".into(), json!("bob"));
    remote.seed(
        "todos",
        [remote_row("a", "alice's", "2024-01-01T00:00:00.000Z"), bob],
    );
    let dev = device(&remote, config()).await;

    let alice = FilterSet::new().eq("owner", "alice");
    dev.engine.pull("todos", &alice).await.unwrap();
    assert!(local_title(&dev.engine, "a").await.is_some());
    assert!(local_title(&dev.engine, "b").await.is_none());

    dev.engine.pull("todos", &FilterSet::new()).await.unwrap();
    assert!(local_title(&dev.engine, "b").await.is_some());

    let records = dev.engine.checkpoints().list().await.unwrap();
    assert_eq!(records.len(), 2);
    let alice_record = dev.engine.checkpoints().get("todos", &alice).await.unwrap();
    assert_eq!(alice_record.last_synced_at, "2024-01-01T00:00:00.000Z");
}

#[tokio::test]
async fn queued_write_applies_once_and_is_not_pushed_again() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, config()).await;

    let response = dev
        .engine
        .execute(QueryRequest::insert("todos", json!({ "id": "q", "title": "queued" })))
        .await
        .unwrap();
    let ticket = response.pending.expect("localFirst insert is queued");
    assert!(ticket.applied().await);
    dev.engine.wait_for_queue().await;

    assert_eq!(remote.call_count(RemoteMethod::Insert), 1);
    assert_eq!(dev.engine.pending_counts("todos").await.unwrap().total(), 0);
    assert_eq!(dev.engine.queue_stats().applied, 1);

    let report = dev.engine.sync_all(true).await.unwrap();
    assert_eq!(report.push.upserted(), 0);
    assert_eq!(remote.call_count(RemoteMethod::Upsert), 0);
    assert_eq!(remote.call_count(RemoteMethod::Insert), 1);
}

#[tokio::test]
async fn queued_update_of_unpushed_row_reaches_remote_on_next_cycle() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, config()).await;

    dev.engine
        .execute(QueryRequest::upsert("todos", json!({ "id": "a", "title": "draft" })))
        .await
        .unwrap();
    let response = dev
        .engine
        .execute(QueryRequest::update("todos", json!({ "title": "final" })).eq("id", "a"))
        .await
        .unwrap();
    assert!(response.pending.expect("localFirst update is queued").applied().await);
    assert!(remote.row("todos", "a").is_none());
    assert_eq!(dev.engine.pending_counts("todos").await.unwrap().upserts, 1);

    let report = dev.engine.sync_all(true).await.unwrap();
    assert_eq!(report.push.upserted(), 1);
    assert_eq!(remote.row("todos", "a").unwrap()["title"], json!("final"));
    assert_eq!(dev.engine.pending_counts("todos").await.unwrap().total(), 0);
}

#[tokio::test]
async fn failed_push_leaves_rows_pending() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, config()).await;
    insert_local(&dev.engine, json!({ "id": "a", "title": "x" })).await;

    remote.fail_next_on(RemoteMethod::Upsert, 1, RemoteError::new("connection reset"));
    let report = dev.engine.sync_all(true).await.unwrap();
    assert_eq!(report.failed_tables, vec!["todos".to_string()]);
    assert_eq!(dev.engine.sync_status(), SyncState::Error);
    assert_eq!(dev.engine.row_status("todos", "a"), Some(SyncStatus::Error));
    assert_eq!(dev.engine.pending_counts("todos").await.unwrap().upserts, 1);
    assert!(remote.row("todos", "a").is_none());

    let report = dev.engine.sync_all(true).await.unwrap();
    assert!(report.is_success());
    assert_eq!(dev.engine.sync_status(), SyncState::Synced);
    assert_eq!(dev.engine.row_status("todos", "a"), Some(SyncStatus::Success));
    assert_eq!(dev.engine.pending_counts("todos").await.unwrap().total(), 0);
    assert!(remote.row("todos", "a").is_some());
}

#[tokio::test]
async fn duplicate_key_marks_whole_chunk_synced() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, config()).await;
    let rows: Vec<Value> = (0..500)
        .map(|i| json!({ "id": format!("row-{i:03}"), "title": "bulk" }))
        .collect();
    insert_local(&dev.engine, Value::Array(rows)).await;

    remote.fail_next_on(
        RemoteMethod::Upsert,
        1,
        RemoteError::duplicate_key("duplicate key value violates unique constraint \"todos_pkey\""),
    );
    let report = dev.engine.push().await;
    let todos = report.table("todos").unwrap();
    assert!(todos.is_success());
    assert_eq!(todos.upserted, 500);
    assert_eq!(remote.call_count(RemoteMethod::Upsert), 1);
    assert_eq!(dev.engine.pending_counts("todos").await.unwrap().total(), 0);
}

#[tokio::test]
async fn concurrent_table_syncs_send_one_batch() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, config()).await;
    insert_local(&dev.engine, json!({ "id": "a" })).await;
    remote.set_latency(Duration::from_millis(30));

    let (first, second) = tokio::join!(
        dev.engine.sync_table("todos"),
        dev.engine.sync_table("todos")
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(first.is_some() != second.is_some());
    assert_eq!(remote.call_count(RemoteMethod::Upsert), 1);
}

#[tokio::test]
async fn offline_cycle_is_skipped_unless_forced() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, config()).await;
    insert_local(&dev.engine, json!({ "id": "a" })).await;

    dev.network.set_online(false);
    assert!(dev.engine.sync_all(false).await.is_none());
    assert_eq!(remote.write_count(), 0);
    assert_eq!(dev.engine.sync_status(), SyncState::Idle);

    dev.network.set_online(true);
    assert!(dev.engine.sync_all(false).await.is_some());
    assert!(remote.row("todos", "a").is_some());
}

#[tokio::test]
async fn transaction_commits_atomically() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, config()).await;

    let err = dev
        .engine
        .with_transaction(|tx| async move {
            tx.execute(QueryRequest::insert("todos", json!({ "id": "a" }))).await?;
            tx.execute(QueryRequest::insert("todos", json!({ "id": "b" }))).await?;
            Err::<(), _>(SyncError::local("changed my mind"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::TransactionRollback(_)));
    assert_eq!(local_count(&dev.engine, true).await, 0);
    dev.engine.wait_for_queue().await;
    assert_eq!(remote.write_count(), 0);

    let mut events = dev.engine.subscribe();
    dev.engine
        .with_transaction(|tx| async move {
            tx.execute(QueryRequest::insert("todos", json!({ "id": "a" }))).await?;
            tx.execute(QueryRequest::insert("todos", json!({ "id": "b" }))).await?;
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(local_count(&dev.engine, false).await, 2);
    let change = events.recv().await.unwrap();
    assert_eq!(change.reason, ChangeReason::Transaction);
    assert_eq!(change.rows, 2);

    dev.engine.wait_for_queue().await;
    assert_eq!(remote.rows("todos").len(), 2);
}

#[tokio::test]
async fn nested_and_direct_writes_inside_transaction_fail() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, config()).await;
    let engine = Arc::clone(&dev.engine);

    let nested = dev
        .engine
        .with_transaction(|_| async move {
            engine
                .with_transaction(|_| async { Ok(()) })
                .await
        })
        .await;
    assert!(matches!(nested, Err(SyncError::NestedTransaction)));

    let engine = Arc::clone(&dev.engine);
    let direct = dev
        .engine
        .with_transaction(|_| async move {
            engine
                .execute(QueryRequest::insert("todos", json!({ "id": "a" })))
                .await
        })
        .await;
    assert!(matches!(direct, Err(SyncError::NestedTransaction)));
    assert_eq!(local_count(&dev.engine, true).await, 0);
}

#[tokio::test]
async fn fetch_older_pages_backward() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed(
        "todos",
        (1..=5).map(|day| remote_row(&format!("d{day}"), "old", &format!("2024-01-0{day}T00:00:00.000Z"))),
    );
    let dev = device(&remote, config()).await;
    let all = FilterSet::new();

    let page = dev.engine.fetch_older("todos", &all, None, 2).await.unwrap();
    assert_eq!(page.applied, 2);
    assert!(page.has_more);
    assert_eq!(page.oldest.as_deref(), Some("2024-01-04T00:00:00.000Z"));

    let page = dev.engine.fetch_older("todos", &all, None, 2).await.unwrap();
    assert_eq!(page.oldest.as_deref(), Some("2024-01-02T00:00:00.000Z"));

    let page = dev.engine.fetch_older("todos", &all, None, 2).await.unwrap();
    assert_eq!(page.applied, 1);
    assert!(!page.has_more);
    assert_eq!(local_count(&dev.engine, false).await, 5);

    let record = dev.engine.checkpoints().get("todos", &all).await.unwrap();
    assert_eq!(record.last_synced_at_pk, None, "backfill leaves the checkpoint alone");
}

#[tokio::test]
async fn pull_emits_change_events() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed(
        "todos",
        [
            remote_row("a", "x", "2024-01-01T00:00:00.000Z"),
            remote_row("b", "y", "2024-01-02T00:00:00.000Z"),
        ],
    );
    let dev = device(&remote, config()).await;
    let mut events = dev.engine.subscribe();
    dev.engine.pull("todos", &FilterSet::new()).await.unwrap();

    let mut pulled = 0;
    while let Ok(change) = events.try_recv() {
        assert_eq!(change.table, "todos");
        if change.reason == ChangeReason::Pull {
            pulled += change.rows;
        }
    }
    assert_eq!(pulled, 2);
}

#[tokio::test]
async fn checkpoints_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.db");
    let remote = Arc::new(MemoryRemote::new());
    remote.seed("todos", [remote_row("r", "x", "2024-01-01T00:00:00.000Z")]);

    {
        let driver = SqliteDriver::open(&path).unwrap();
        driver.execute_batch(TODOS).unwrap();
        let engine = SyncEngine::init(
            config(),
            Arc::new(driver),
            remote.clone(),
            Arc::new(ManualConnectivity::default()),
        )
        .await
        .unwrap();
        engine.pull("todos", &FilterSet::new()).await.unwrap();
        engine.shutdown();
    }

    let driver = SqliteDriver::open(&path).unwrap();
    let engine = SyncEngine::init(
        config(),
        Arc::new(driver),
        remote.clone(),
        Arc::new(ManualConnectivity::default()),
    )
    .await
    .unwrap();
    let record = engine.checkpoints().get("todos", &FilterSet::new()).await.unwrap();
    assert_eq!(record.last_synced_at, "2024-01-01T00:00:00.000Z");
    assert_eq!(local_title(&engine, "r").await.as_deref(), Some("x"));
}
