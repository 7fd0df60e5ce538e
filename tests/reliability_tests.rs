//! Retry, timeout, and failure-exhaustion behavior of the worker dispatcher.
mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use ferroflow::client::Client;
use ferroflow::pipeline::{self, ImageSource, WORKFLOW_IMAGE_PIPELINE};
use ferroflow::providers::{InMemoryProvider, Provider};
use ferroflow::runtime::{
    ActivityRegistry, RetryPolicy, Runtime, RuntimeOptions, WorkflowRegistry,
};
use ferroflow::{EventKind, WorkflowStatus};

use common::{make_jpeg, MemoryImageSource, RecordingSink};

fn retry_options(max_attempts: u32, activity_timeout: Duration) -> RuntimeOptions {
    RuntimeOptions {
        activity_timeout,
        default_retry: RetryPolicy::new(max_attempts, Duration::from_millis(10)),
        ..RuntimeOptions::default()
    }
}

async fn start_runtime(
    source: Arc<dyn ImageSource>,
    sink: Arc<RecordingSink>,
    options: RuntimeOptions,
) -> (Arc<Runtime>, Client) {
    let provider = Arc::new(InMemoryProvider::new());
    let activities =
        pipeline::register_activities(ActivityRegistry::builder(), source, sink).build();
    let workflows = pipeline::register_workflows(WorkflowRegistry::builder()).build();
    let runtime = Runtime::start_with_options(provider.clone(), activities, workflows, options)
        .await
        .expect("runtime start");
    (runtime, Client::new(provider as Arc<dyn Provider>))
}

#[tokio::test]
async fn missing_image_fails_after_exhausting_attempts() {
    let source = Arc::new(MemoryImageSource::new(std::iter::empty::<(String, Vec<u8>)>()));
    let sink = Arc::new(RecordingSink::new());
    let (runtime, client) = start_runtime(
        source.clone(),
        sink.clone(),
        retry_options(3, Duration::from_secs(5)),
    )
    .await;

    client
        .start_workflow(WORKFLOW_IMAGE_PIPELINE, "img::ghost.jpg", "ghost.jpg")
        .await
        .expect("start");
    let status = client
        .wait_for_workflow("img::ghost.jpg", Duration::from_secs(5))
        .await
        .expect("terminal status");

    let WorkflowStatus::Failed { error } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert!(error.starts_with("not found:"), "unexpected: {error}");
    assert_eq!(source.fetches(), 3, "expected all attempts to run");
    assert_eq!(sink.write_attempts(), 0, "store must never run");

    // Intermediate attempts never reach history: exactly one schedule and
    // one failure for the extract step.
    let history = client.read_history("img::ghost.jpg").await;
    let kinds: Vec<&'static str> = history.iter().map(|e| e.kind_name()).collect();
    assert_eq!(
        kinds,
        vec!["WorkflowStarted", "ActivityScheduled", "ActivityFailed", "WorkflowFailed"]
    );

    runtime.shutdown().await;
}

/// Source whose first fetch hangs long enough to trip the activity timeout;
/// later fetches return promptly.
struct SlowFirstSource {
    files: HashMap<String, Vec<u8>>,
    slow_for: Duration,
    fetches: AtomicUsize,
}

#[async_trait]
impl ImageSource for SlowFirstSource {
    async fn fetch(&self, file_name: &str) -> Result<Vec<u8>, String> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            tokio::time::sleep(self.slow_for).await;
        }
        self.files
            .get(file_name)
            .cloned()
            .ok_or_else(|| format!("not found: {file_name}"))
    }
}

#[tokio::test]
async fn timed_out_attempt_is_retried_and_succeeds() {
    let source = Arc::new(SlowFirstSource {
        files: HashMap::from([("slow.jpg".to_string(), make_jpeg(32, 32))]),
        slow_for: Duration::from_secs(2),
        fetches: AtomicUsize::new(0),
    });
    let sink = Arc::new(RecordingSink::new());
    let (runtime, client) = start_runtime(
        source.clone(),
        sink.clone(),
        retry_options(2, Duration::from_millis(100)),
    )
    .await;

    client
        .start_workflow(WORKFLOW_IMAGE_PIPELINE, "img::slow.jpg", "slow.jpg")
        .await
        .expect("start");
    let status = client
        .wait_for_workflow("img::slow.jpg", Duration::from_secs(10))
        .await
        .expect("terminal status");

    assert!(
        matches!(status, WorkflowStatus::Completed { .. }),
        "expected completion, got {status:?}"
    );
    assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(sink.records().len(), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn timeout_with_single_attempt_fails_workflow() {
    let source = Arc::new(
        MemoryImageSource::new([("slow.jpg".to_string(), make_jpeg(8, 8))])
            .with_delay(Duration::from_secs(2)),
    );
    let sink = Arc::new(RecordingSink::new());
    let (runtime, client) = start_runtime(
        source,
        sink.clone(),
        retry_options(1, Duration::from_millis(100)),
    )
    .await;

    client
        .start_workflow(WORKFLOW_IMAGE_PIPELINE, "img::slow.jpg", "slow.jpg")
        .await
        .expect("start");
    let status = client
        .wait_for_workflow("img::slow.jpg", Duration::from_secs(5))
        .await
        .expect("terminal status");

    let WorkflowStatus::Failed { error } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert_eq!(error, "timeout");
    assert_eq!(sink.write_attempts(), 0);

    runtime.shutdown().await;
}

#[tokio::test]
async fn flaky_sink_recovers_on_retry() {
    let source = Arc::new(MemoryImageSource::new([(
        "photo.jpg".to_string(),
        make_jpeg(16, 16),
    )]));
    let sink = Arc::new(RecordingSink::failing_first(1));
    let (runtime, client) = start_runtime(
        source,
        sink.clone(),
        retry_options(3, Duration::from_secs(5)),
    )
    .await;

    client
        .start_workflow(WORKFLOW_IMAGE_PIPELINE, "img::photo.jpg", "photo.jpg")
        .await
        .expect("start");
    let status = client
        .wait_for_workflow("img::photo.jpg", Duration::from_secs(5))
        .await
        .expect("terminal status");

    assert!(matches!(status, WorkflowStatus::Completed { .. }));
    assert_eq!(sink.write_attempts(), 2);
    assert_eq!(sink.records().len(), 1);

    // The retried store attempt produced one ActivityScheduled, not two
    let history = client.read_history("img::photo.jpg").await;
    let schedules = history
        .iter()
        .filter(|e| matches!(e.kind, EventKind::ActivityScheduled { .. }))
        .count();
    assert_eq!(schedules, 2, "one schedule per pipeline step");

    runtime.shutdown().await;
}
