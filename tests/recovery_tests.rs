//! Crash-and-restart behavior: a second runtime over the same store resumes
//! an in-flight instance by replay, without re-running completed steps.
mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use ferroflow::client::Client;
use ferroflow::pipeline::{self, MetadataRecord, MetadataSink, WORKFLOW_IMAGE_PIPELINE};
use ferroflow::providers::{InMemoryProvider, Provider, WorkItem};
use ferroflow::runtime::{
    ActivityRegistry, Runtime, RuntimeOptions, WorkflowRegistry,
};
use ferroflow::{EventKind, WorkflowStatus};

use common::{make_jpeg, MemoryImageSource, RecordingSink};

/// Sink that never returns, simulating a host that dies mid-store.
struct HangingSink;

#[async_trait]
impl MetadataSink for HangingSink {
    async fn persist(&self, _record: &MetadataRecord) -> Result<(), String> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

fn short_lock_options() -> RuntimeOptions {
    RuntimeOptions {
        lock_timeout: Duration::from_millis(200),
        ..RuntimeOptions::default()
    }
}

async fn wait_for_history<F: Fn(&[ferroflow::Event]) -> bool>(
    client: &Client,
    instance: &str,
    predicate: F,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let history = client.read_history(instance).await;
        if predicate(&history) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "history condition not reached, have: {history:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn restarted_runtime_resumes_without_rerunning_completed_steps() {
    let provider = Arc::new(InMemoryProvider::new());
    let client = Client::new(provider.clone() as Arc<dyn Provider>);
    let source = Arc::new(MemoryImageSource::new([(
        "photo.jpg".to_string(),
        make_jpeg(100, 50),
    )]));

    // First host: extract succeeds, store hangs mid-invocation
    let activities = pipeline::register_activities(
        ActivityRegistry::builder(),
        source.clone(),
        Arc::new(HangingSink),
    )
    .build();
    let workflows = pipeline::register_workflows(WorkflowRegistry::builder()).build();
    let first = Runtime::start_with_options(
        provider.clone(),
        activities,
        workflows,
        short_lock_options(),
    )
    .await
    .expect("first runtime");

    client
        .start_workflow(WORKFLOW_IMAGE_PIPELINE, "img::photo.jpg", "photo.jpg")
        .await
        .expect("start");

    // Wait until the store step is durably scheduled, then kill the host
    wait_for_history(&client, "img::photo.jpg", |history| {
        history
            .iter()
            .any(|e| matches!(&e.kind, EventKind::ActivityScheduled { id: 2, .. }))
    })
    .await;
    first.shutdown().await;
    assert_eq!(source.fetches(), 1);

    // Second host over the same store, with a working sink
    let sink = Arc::new(RecordingSink::new());
    let activities = pipeline::register_activities(
        ActivityRegistry::builder(),
        source.clone(),
        sink.clone(),
    )
    .build();
    let workflows = pipeline::register_workflows(WorkflowRegistry::builder()).build();
    let second = Runtime::start_with_options(
        provider.clone(),
        activities,
        workflows,
        short_lock_options(),
    )
    .await
    .expect("second runtime");

    let status = client
        .wait_for_workflow("img::photo.jpg", Duration::from_secs(5))
        .await
        .expect("terminal status");
    assert!(
        matches!(status, WorkflowStatus::Completed { .. }),
        "expected completion, got {status:?}"
    );

    // Replay resumed from history: the completed extract never re-ran
    assert_eq!(source.fetches(), 1, "extract must run exactly once");
    assert_eq!(sink.records().len(), 1);

    let history = client.read_history("img::photo.jpg").await;
    let extract_schedules = history
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::ActivityScheduled { id: 1, .. }))
        .count();
    assert_eq!(extract_schedules, 1);

    second.shutdown().await;
}

#[tokio::test]
async fn redelivered_completion_after_terminal_state_changes_nothing() {
    let provider = Arc::new(InMemoryProvider::new());
    let client = Client::new(provider.clone() as Arc<dyn Provider>);
    let source = Arc::new(MemoryImageSource::new([(
        "photo.jpg".to_string(),
        make_jpeg(20, 20),
    )]));
    let sink = Arc::new(RecordingSink::new());

    let activities =
        pipeline::register_activities(ActivityRegistry::builder(), source, sink.clone()).build();
    let workflows = pipeline::register_workflows(WorkflowRegistry::builder()).build();
    let runtime = Runtime::start_with_store(provider.clone(), activities, workflows)
        .await
        .expect("runtime");

    client
        .start_workflow(WORKFLOW_IMAGE_PIPELINE, "img::photo.jpg", "photo.jpg")
        .await
        .expect("start");
    client
        .wait_for_workflow("img::photo.jpg", Duration::from_secs(5))
        .await
        .expect("terminal status");
    let before = client.read_history("img::photo.jpg").await;

    // Simulate an at-least-once queue redelivering an old completion
    provider
        .enqueue_workflow_work(
            WorkItem::ActivityCompleted {
                instance: "img::photo.jpg".to_string(),
                id: 1,
                result: "stale".to_string(),
            },
            None,
        )
        .await
        .expect("enqueue");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let after = client.read_history("img::photo.jpg").await;
    assert_eq!(before, after, "terminal history must not change");
    assert_eq!(sink.records().len(), 1);

    runtime.shutdown().await;
}
