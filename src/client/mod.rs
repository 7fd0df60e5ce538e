//! Control-plane client: start, cancel, inspect, and await workflow
//! instances against a provider, without touching the runtime directly.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::providers::{Provider, ProviderError, WorkItem};
use crate::runtime::{WaitError, WorkflowStatus};
use crate::{codec, now_ms, Event};

static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub enum ClientError {
    /// An instance with the same id already exists.
    DuplicateInstance,
    /// The instance id is unknown to the store.
    InstanceNotFound,
    Provider(ProviderError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::DuplicateInstance => write!(f, "duplicate workflow instance"),
            ClientError::InstanceNotFound => write!(f, "workflow instance not found"),
            ClientError::Provider(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        if e.is_conflict() {
            ClientError::DuplicateInstance
        } else {
            ClientError::Provider(e)
        }
    }
}

#[derive(Clone)]
pub struct Client {
    provider: Arc<dyn Provider>,
}

impl Client {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    /// Generate a process-unique instance id. Callers that need stable ids
    /// (e.g. one instance per file) should pass their own instead.
    pub fn new_instance_id() -> String {
        let n = INSTANCE_COUNTER.fetch_add(1, Ordering::SeqCst);
        format!("wf_{}_{}_{}", now_ms(), std::process::id(), n)
    }

    /// Create the instance and enqueue its start message. Fails with
    /// `DuplicateInstance` if the id is already taken.
    pub async fn start_workflow(
        &self,
        workflow: &str,
        instance: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        let input: String = input.into();
        self.provider
            .create_instance(instance, workflow, &input)
            .await?;
        self.provider
            .enqueue_workflow_work(
                WorkItem::StartWorkflow {
                    instance: instance.to_string(),
                    workflow: workflow.to_string(),
                    input,
                },
                None,
            )
            .await?;
        debug!(instance, workflow, "workflow started");
        Ok(())
    }

    pub async fn start_workflow_typed<In: Serialize>(
        &self,
        workflow: &str,
        instance: &str,
        input: &In,
    ) -> Result<(), ClientError> {
        let payload = codec::encode(input)
            .map_err(|e| ClientError::Provider(ProviderError::permanent("encode_input", e)))?;
        self.start_workflow(workflow, instance, payload).await
    }

    /// Request cancellation. The runtime records the request and fails the
    /// instance on its next turn; an already-terminal instance ignores it.
    pub async fn cancel_workflow(
        &self,
        instance: &str,
        reason: impl Into<String>,
    ) -> Result<(), ClientError> {
        if self.provider.instance_snapshot(instance).await.is_none() {
            return Err(ClientError::InstanceNotFound);
        }
        self.provider
            .enqueue_workflow_work(
                WorkItem::CancelInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn get_workflow_status(&self, instance: &str) -> Result<WorkflowStatus, ClientError> {
        let Some(snapshot) = self.provider.instance_snapshot(instance).await else {
            return Ok(WorkflowStatus::NotFound);
        };
        let status = match snapshot.status.as_str() {
            "Completed" => WorkflowStatus::Completed {
                output: snapshot.output.unwrap_or_default(),
            },
            "Failed" => WorkflowStatus::Failed {
                error: snapshot.output.unwrap_or_default(),
            },
            // Pending instances are considered running: work is enqueued.
            _ => WorkflowStatus::Running,
        };
        Ok(status)
    }

    /// Poll until the instance reaches a terminal state or the timeout
    /// elapses. Polling starts tight and backs off to 100ms.
    pub async fn wait_for_workflow(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<WorkflowStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut poll = Duration::from_millis(5);
        loop {
            let status = self
                .get_workflow_status(instance)
                .await
                .map_err(|e| WaitError::Other(e.to_string()))?;
            match status {
                WorkflowStatus::Completed { .. } | WorkflowStatus::Failed { .. } => {
                    return Ok(status);
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(poll).await;
            poll = (poll * 2).min(Duration::from_millis(100));
        }
    }

    /// Await completion and decode the output; a failed instance surfaces
    /// its recorded error.
    pub async fn wait_for_workflow_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Out, WaitError> {
        match self.wait_for_workflow(instance, timeout).await? {
            WorkflowStatus::Completed { output } => {
                codec::decode(&output).map_err(WaitError::Other)
            }
            WorkflowStatus::Failed { error } => Err(WaitError::Other(error)),
            _ => Err(WaitError::Other("workflow not terminal".into())),
        }
    }

    /// Ordered history for an instance, empty if none exists.
    pub async fn read_history(&self, instance: &str) -> Vec<Event> {
        self.provider.read(instance).await
    }

    pub async fn list_instances(&self) -> Vec<String> {
        self.provider.list_instances().await
    }
}
