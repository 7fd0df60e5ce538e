//! SQLite provider semantics: durable history, peek-lock queues, and a full
//! pipeline run against a database file.
mod common;

use std::sync::Arc;
use std::time::Duration;

use ferroflow::client::Client;
use ferroflow::pipeline::{self, WORKFLOW_IMAGE_PIPELINE};
use ferroflow::providers::{
    ExecutionMetadata, Provider, SqliteProvider, WorkItem,
};
use ferroflow::runtime::{ActivityRegistry, Runtime, WorkflowRegistry};
use ferroflow::{Event, EventKind, WorkflowStatus};

use common::{make_png, MemoryImageSource, RecordingSink};

#[tokio::test]
async fn create_instance_conflicts_on_duplicate_id() {
    let provider = SqliteProvider::new_in_memory().await.unwrap();
    provider.create_instance("i1", "W", "x").await.unwrap();
    let err = provider.create_instance("i1", "W", "x").await.unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err}");

    let snapshot = provider.instance_snapshot("i1").await.unwrap();
    assert_eq!(snapshot.workflow_name, "W");
    assert_eq!(snapshot.status, "Pending");
}

#[tokio::test]
async fn fetch_and_ack_commit_history_and_clear_the_batch() {
    let provider = SqliteProvider::new_in_memory().await.unwrap();
    provider.create_instance("i1", "W", "x").await.unwrap();
    provider
        .enqueue_workflow_work(
            WorkItem::StartWorkflow {
                instance: "i1".into(),
                workflow: "W".into(),
                input: "x".into(),
            },
            None,
        )
        .await
        .unwrap();

    let item = provider
        .fetch_workflow_item(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("one batch");
    assert_eq!(item.instance, "i1");
    assert_eq!(item.messages.len(), 1);
    assert!(item.history.is_empty());

    let delta = vec![Event::new(
        1,
        EventKind::WorkflowStarted {
            name: "W".into(),
            input: "x".into(),
        },
    )];
    provider
        .ack_workflow_item(
            &item.lock_token,
            delta,
            Vec::new(),
            Vec::new(),
            ExecutionMetadata {
                status: Some("Running".into()),
                output: None,
            },
        )
        .await
        .unwrap();

    let history = provider.read("i1").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event_id, 1);
    assert_eq!(provider.instance_snapshot("i1").await.unwrap().status, "Running");

    // Batch consumed, nothing left to fetch
    assert!(provider
        .fetch_workflow_item(Duration::from_secs(5))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn abandoned_batch_is_redelivered() {
    let provider = SqliteProvider::new_in_memory().await.unwrap();
    provider.create_instance("i1", "W", "x").await.unwrap();
    provider
        .enqueue_workflow_work(
            WorkItem::CancelInstance {
                instance: "i1".into(),
                reason: "test".into(),
            },
            None,
        )
        .await
        .unwrap();

    let item = provider
        .fetch_workflow_item(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("one batch");
    // While locked, the instance yields no further batches
    assert!(provider
        .fetch_workflow_item(Duration::from_secs(5))
        .await
        .unwrap()
        .is_none());

    provider.abandon_workflow_item(&item.lock_token).await.unwrap();
    let redelivered = provider
        .fetch_workflow_item(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("redelivery");
    assert_eq!(redelivered.messages, item.messages);
}

#[tokio::test]
async fn expired_worker_lock_makes_item_visible_again() {
    let provider = SqliteProvider::new_in_memory().await.unwrap();
    let invoke = WorkItem::ActivityInvoke {
        instance: "i1".into(),
        id: 1,
        name: "A".into(),
        input: "x".into(),
        attempt: 1,
    };
    provider.enqueue_worker_work(invoke.clone(), None).await.unwrap();

    let (item, _token) = provider
        .dequeue_worker_peek_lock(Duration::from_millis(50))
        .await
        .unwrap()
        .expect("item");
    assert_eq!(item, invoke);
    assert!(provider
        .dequeue_worker_peek_lock(Duration::from_millis(50))
        .await
        .unwrap()
        .is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let (redelivered, token) = provider
        .dequeue_worker_peek_lock(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("redelivery after expiry");
    assert_eq!(redelivered, invoke);

    provider.ack_worker(&token).await.unwrap();
    assert!(provider
        .dequeue_worker_peek_lock(Duration::from_secs(5))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn delayed_enqueue_stays_invisible_until_due() {
    let provider = SqliteProvider::new_in_memory().await.unwrap();
    let invoke = WorkItem::ActivityInvoke {
        instance: "i1".into(),
        id: 1,
        name: "A".into(),
        input: "x".into(),
        attempt: 2,
    };
    provider
        .enqueue_worker_work(invoke.clone(), Some(Duration::from_millis(150)))
        .await
        .unwrap();

    assert!(provider
        .dequeue_worker_peek_lock(Duration::from_secs(5))
        .await
        .unwrap()
        .is_none());
    tokio::time::sleep(Duration::from_millis(200)).await;
    let (item, _token) = provider
        .dequeue_worker_peek_lock(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("visible after delay");
    assert_eq!(item, invoke);
}

#[tokio::test]
async fn pipeline_completes_against_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("flow.db");
    let provider = Arc::new(SqliteProvider::new(db_path.to_str().unwrap()).await.unwrap());

    let source = Arc::new(MemoryImageSource::new([(
        "snap.png".to_string(),
        make_png(320, 240),
    )]));
    let sink = Arc::new(RecordingSink::new());
    let activities =
        pipeline::register_activities(ActivityRegistry::builder(), source, sink.clone()).build();
    let workflows = pipeline::register_workflows(WorkflowRegistry::builder()).build();
    let runtime = Runtime::start_with_store(provider.clone(), activities, workflows)
        .await
        .expect("runtime");
    let client = Client::new(provider.clone() as Arc<dyn Provider>);

    client
        .start_workflow(WORKFLOW_IMAGE_PIPELINE, "img::snap.png", "snap.png")
        .await
        .expect("start");
    let status = client
        .wait_for_workflow("img::snap.png", Duration::from_secs(10))
        .await
        .expect("terminal status");
    assert!(matches!(status, WorkflowStatus::Completed { .. }));
    assert_eq!(sink.records().len(), 1);
    assert_eq!(sink.records()[0].format, "PNG");

    runtime.shutdown().await;

    // State survives in the file: a fresh provider sees the same history
    let reopened = SqliteProvider::new(db_path.to_str().unwrap()).await.unwrap();
    let history = reopened.read("img::snap.png").await;
    assert!(history.last().unwrap().is_terminal());
    assert_eq!(reopened.list_instances().await, vec!["img::snap.png"]);
}
