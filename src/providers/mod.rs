//! Storage provider abstraction: durable history plus two peek-lock queues.
//!
//! The workflow queue carries control messages batched per instance; the
//! worker queue carries activity invocations. Both use peek-lock delivery:
//! a fetched item stays invisible until acked, abandoned, or its lock
//! expires, so a crashed host's work is redelivered instead of lost.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Event;

mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::ProviderError;
pub use in_memory::InMemoryProvider;
pub use sqlite::SqliteProvider;

/// Messages flowing through the workflow and worker queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    /// Start a new instance of the named workflow.
    StartWorkflow {
        instance: String,
        workflow: String,
        input: String,
    },
    /// Invoke an activity on a worker. `attempt` starts at 1 and rides on
    /// the queue item, so retries never touch instance history.
    ActivityInvoke {
        instance: String,
        id: u64,
        name: String,
        input: String,
        attempt: u32,
    },
    /// Activity result routed back to the instance's workflow queue.
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    /// Activity failure (after retries are exhausted) routed back.
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
    },
    /// Request cancellation of a running instance.
    CancelInstance { instance: String, reason: String },
}

impl WorkItem {
    /// Instance this item targets.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartWorkflow { instance, .. }
            | WorkItem::ActivityInvoke { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::CancelInstance { instance, .. } => instance,
        }
    }
}

/// A locked batch of workflow-queue messages for one instance, delivered
/// together with that instance's full history.
#[derive(Debug, Clone)]
pub struct WorkflowItem {
    pub instance: String,
    pub workflow_name: String,
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
}

/// Instance-table updates committed atomically with a history delta on ack.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetadata {
    pub status: Option<String>,
    pub output: Option<String>,
}

/// Row-level view of a workflow instance for status queries and listings.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub instance: String,
    pub workflow_name: String,
    pub status: String,
    pub output: Option<String>,
    pub created_at_ms: u64,
}

/// Durable storage backing the runtime. Implementations must make
/// `ack_workflow_item` atomic: history append, instance metadata update,
/// and enqueue of follow-up items commit or fail together.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Create the instance row. Fails with a conflict error if the instance
    /// already exists.
    async fn create_instance(
        &self,
        instance: &str,
        workflow: &str,
        input: &str,
    ) -> Result<(), ProviderError>;

    /// Read the full ordered history for an instance (empty if none).
    async fn read(&self, instance: &str) -> Vec<Event>;

    /// Fetch the instance row, if any.
    async fn instance_snapshot(&self, instance: &str) -> Option<InstanceSnapshot>;

    /// List all known instance ids.
    async fn list_instances(&self) -> Vec<String>;

    /// Enqueue a message to the workflow queue, optionally delayed.
    async fn enqueue_workflow_work(
        &self,
        item: WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError>;

    /// Enqueue a message to the worker queue, optionally delayed.
    async fn enqueue_worker_work(
        &self,
        item: WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError>;

    /// Atomically lock one instance's visible workflow messages and return
    /// them with the instance history. Returns `None` when no work is ready.
    async fn fetch_workflow_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<WorkflowItem>, ProviderError>;

    /// Commit the results of a processed workflow batch under one lock
    /// token: append the history delta, update instance metadata, enqueue
    /// follow-up items, delete the locked messages, release the lock.
    async fn ack_workflow_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        workflow_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError>;

    /// Release a fetched batch without committing; messages become visible
    /// again for redelivery.
    async fn abandon_workflow_item(&self, lock_token: &str) -> Result<(), ProviderError>;

    /// Lock and return one visible worker-queue item, if any.
    async fn dequeue_worker_peek_lock(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Delete an acked worker item by its lock token.
    async fn ack_worker(&self, lock_token: &str) -> Result<(), ProviderError>;

    /// Make a locked worker item visible again for redelivery.
    async fn abandon_worker(&self, lock_token: &str) -> Result<(), ProviderError>;
}

/// Retry helper for transient provider faults. Permanent and conflict
/// errors surface immediately; retryable ones back off exponentially.
pub async fn execute_with_retry<T, F, Fut>(
    operation: &str,
    max_attempts: u32,
    mut f: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut backoff = Duration::from_millis(10);
    let mut attempt = 1u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.retryable && attempt < max_attempts => {
                tracing::warn!(
                    operation,
                    attempt,
                    error = %e,
                    "retrying transient provider error"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_millis(500));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Convenience alias used across the runtime and client.
pub type SharedProvider = Arc<dyn Provider>;
