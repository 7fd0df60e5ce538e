//! Execution engine: a workflow dispatcher that advances instances by
//! replaying history against registered workflow code, and a worker
//! dispatcher that runs activities with per-activity retry and timeout.
//!
//! Activities execute at most once per recorded schedule: the workflow
//! dispatcher only dispatches an invocation when it appends the matching
//! `ActivityScheduled` event, and redelivered batches dedupe against
//! history before dispatching again.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::providers::{
    execute_with_retry, ExecutionMetadata, Provider, WorkItem, WorkflowItem,
};
use crate::{run_turn, Event, EventKind};

pub mod registry;
pub mod replay;

pub use registry::{ActivityRegistry, WorkflowRegistry};

use replay::plan_turn;

/// Observable state of a workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkflowStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: String },
}

/// Error from waiting on an instance to reach a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "timed out waiting for workflow"),
            WaitError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Retry policy applied by the worker dispatcher to a failing activity.
/// `max_attempts` counts the first invocation; 1 means no retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
        }
    }

    /// Delay before the attempt following `attempt`, doubling per attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        (self.initial_backoff * factor).min(Duration::from_secs(5))
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Sleep between polls when a queue is empty.
    pub dispatcher_idle_sleep: Duration,
    /// Peek-lock duration for fetched batches and worker items.
    pub lock_timeout: Duration,
    /// Wall-clock limit on a single activity invocation.
    pub activity_timeout: Duration,
    /// Fallback policy for activities without an explicit one.
    pub default_retry: RetryPolicy,
    /// Per-activity overrides, keyed by activity name.
    pub activity_retry: HashMap<String, RetryPolicy>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep: Duration::from_millis(10),
            lock_timeout: Duration::from_secs(30),
            activity_timeout: Duration::from_secs(30),
            default_retry: RetryPolicy::default(),
            activity_retry: HashMap::new(),
        }
    }
}

impl RuntimeOptions {
    fn retry_for(&self, activity: &str) -> &RetryPolicy {
        self.activity_retry.get(activity).unwrap_or(&self.default_retry)
    }
}

pub struct Runtime {
    provider: Arc<dyn Provider>,
    activities: ActivityRegistry,
    workflows: WorkflowRegistry,
    options: RuntimeOptions,
    running: AtomicBool,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("options", &self.options)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Validate registrations and start dispatcher tasks over the store.
    pub async fn start_with_store(
        provider: Arc<dyn Provider>,
        activities: ActivityRegistry,
        workflows: WorkflowRegistry,
    ) -> Result<Arc<Self>, String> {
        Self::start_with_options(provider, activities, workflows, RuntimeOptions::default()).await
    }

    pub async fn start_with_options(
        provider: Arc<dyn Provider>,
        activities: ActivityRegistry,
        workflows: WorkflowRegistry,
        options: RuntimeOptions,
    ) -> Result<Arc<Self>, String> {
        workflows.validate(&activities)?;
        let rt = Arc::new(Self {
            provider,
            activities,
            workflows,
            options,
            running: AtomicBool::new(true),
            handles: std::sync::Mutex::new(Vec::new()),
        });
        let wf = {
            let rt = rt.clone();
            tokio::spawn(async move { rt.workflow_dispatcher().await })
        };
        let worker = {
            let rt = rt.clone();
            tokio::spawn(async move { rt.worker_dispatcher().await })
        };
        rt.handles.lock().expect("handles lock").extend([wf, worker]);
        info!("runtime started");
        Ok(rt)
    }

    /// Stop dispatcher tasks. In-flight locked items are redelivered after
    /// their lock expires, so shutdown mid-batch loses no work.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().expect("handles lock"));
        for h in handles {
            h.abort();
            let _ = h.await;
        }
        info!("runtime stopped");
    }

    async fn workflow_dispatcher(&self) {
        while self.running.load(Ordering::SeqCst) {
            let fetched = self.provider.fetch_workflow_item(self.options.lock_timeout).await;
            match fetched {
                Ok(Some(item)) => {
                    if let Err(e) = self.process_workflow_item(item).await {
                        error!(error = %e, "failed to process workflow batch");
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(self.options.dispatcher_idle_sleep).await;
                }
                Err(e) => {
                    warn!(error = %e, "fetch_workflow_item failed");
                    tokio::time::sleep(self.options.dispatcher_idle_sleep).await;
                }
            }
        }
    }

    async fn process_workflow_item(&self, item: WorkflowItem) -> Result<(), String> {
        let WorkflowItem {
            instance,
            workflow_name,
            history,
            messages,
            lock_token,
        } = item;

        // Messages for a terminal instance are dropped; ack clears them.
        if history.iter().any(|e| e.is_terminal()) {
            debug!(instance, "dropping messages for terminal instance");
            return self
                .ack(&lock_token, Vec::new(), Vec::new(), ExecutionMetadata::default())
                .await;
        }

        let mut next_event_id = history.iter().map(|e| e.event_id).max().unwrap_or(0) + 1;
        let mut combined = history;
        let mut delta: Vec<Event> = Vec::new();
        let mut metadata = ExecutionMetadata::default();
        let mut canceled = false;

        let mut append = |combined: &mut Vec<Event>, delta: &mut Vec<Event>, kind: EventKind| {
            let ev = Event::new(next_event_id, kind);
            next_event_id += 1;
            combined.push(ev.clone());
            delta.push(ev);
        };

        for msg in messages {
            match msg {
                WorkItem::StartWorkflow { workflow, input, .. } => {
                    if combined.is_empty() {
                        append(
                            &mut combined,
                            &mut delta,
                            EventKind::WorkflowStarted {
                                name: workflow,
                                input,
                            },
                        );
                        metadata.status = Some("Running".into());
                    } else {
                        warn!(instance, "duplicate start message dropped");
                    }
                }
                WorkItem::CancelInstance { reason, .. } => {
                    info!(instance, reason, "canceling workflow instance");
                    append(
                        &mut combined,
                        &mut delta,
                        EventKind::CancelRequested {
                            reason: reason.clone(),
                        },
                    );
                    let error = format!("canceled: {reason}");
                    append(
                        &mut combined,
                        &mut delta,
                        EventKind::WorkflowFailed {
                            error: error.clone(),
                        },
                    );
                    metadata = ExecutionMetadata {
                        status: Some("Failed".into()),
                        output: Some(error),
                    };
                    canceled = true;
                    break;
                }
                WorkItem::ActivityCompleted { id, result, .. } => {
                    if has_unresolved_schedule(&combined, id) {
                        append(
                            &mut combined,
                            &mut delta,
                            EventKind::ActivityCompleted { id, result },
                        );
                    } else {
                        warn!(instance, id, "dropping uncorrelated activity completion");
                    }
                }
                WorkItem::ActivityFailed { id, error, .. } => {
                    if has_unresolved_schedule(&combined, id) {
                        append(
                            &mut combined,
                            &mut delta,
                            EventKind::ActivityFailed { id, error },
                        );
                    } else {
                        warn!(instance, id, "dropping uncorrelated activity failure");
                    }
                }
                WorkItem::ActivityInvoke { .. } => {
                    warn!(instance, "activity invocation on workflow queue dropped");
                }
            }
        }

        if canceled {
            return self.ack(&lock_token, delta, Vec::new(), metadata).await;
        }

        let name = workflow_started_name(&combined).unwrap_or(workflow_name);
        let Some(handler) = self.workflows.get(&name) else {
            warn!(instance, workflow = name, "unknown workflow");
            let error = format!("unknown workflow:{name}");
            append(
                &mut combined,
                &mut delta,
                EventKind::WorkflowFailed {
                    error: error.clone(),
                },
            );
            let metadata = ExecutionMetadata {
                status: Some("Failed".into()),
                output: Some(error),
            };
            return self.ack(&lock_token, delta, Vec::new(), metadata).await;
        };

        let input = workflow_started_input(&combined).unwrap_or_default();
        let turn = run_turn(combined.clone(), |ctx| handler.invoke(ctx, input));
        let plan = plan_turn(&instance, &combined, turn);
        debug!(
            instance,
            workflow = name,
            new_events = plan.history_delta.len(),
            dispatches = plan.worker_items.len(),
            "advanced workflow turn"
        );

        delta.extend(plan.history_delta);
        if plan.metadata.status.is_some() {
            metadata = plan.metadata;
        }
        self.ack(&lock_token, delta, plan.worker_items, metadata).await
    }

    async fn ack(
        &self,
        lock_token: &str,
        delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), String> {
        let result = execute_with_retry("ack_workflow_item", 5, || {
            self.provider.ack_workflow_item(
                lock_token,
                delta.clone(),
                worker_items.clone(),
                Vec::new(),
                metadata.clone(),
            )
        })
        .await;
        if let Err(e) = result {
            let _ = self.provider.abandon_workflow_item(lock_token).await;
            return Err(e.to_string());
        }
        Ok(())
    }

    async fn worker_dispatcher(&self) {
        while self.running.load(Ordering::SeqCst) {
            let dequeued = self
                .provider
                .dequeue_worker_peek_lock(self.options.lock_timeout)
                .await;
            match dequeued {
                Ok(Some((item, token))) => {
                    if let Err(e) = self.process_worker_item(item, &token).await {
                        warn!(error = %e, "worker item failed, abandoning for redelivery");
                        let _ = self.provider.abandon_worker(&token).await;
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(self.options.dispatcher_idle_sleep).await;
                }
                Err(e) => {
                    warn!(error = %e, "dequeue_worker_peek_lock failed");
                    tokio::time::sleep(self.options.dispatcher_idle_sleep).await;
                }
            }
        }
    }

    async fn process_worker_item(&self, item: WorkItem, token: &str) -> Result<(), String> {
        let WorkItem::ActivityInvoke {
            instance,
            id,
            name,
            input,
            attempt,
        } = item
        else {
            warn!("non-invoke item on worker queue dropped");
            return self
                .provider
                .ack_worker(token)
                .await
                .map_err(|e| e.to_string());
        };

        let Some(handler) = self.activities.get(&name) else {
            warn!(instance, activity = name, "unknown activity");
            self.provider
                .enqueue_workflow_work(
                    WorkItem::ActivityFailed {
                        instance,
                        id,
                        error: format!("unknown activity:{name}"),
                    },
                    None,
                )
                .await
                .map_err(|e| e.to_string())?;
            return self
                .provider
                .ack_worker(token)
                .await
                .map_err(|e| e.to_string());
        };

        debug!(instance, activity = name, id, attempt, "invoking activity");
        let outcome = match tokio::time::timeout(
            self.options.activity_timeout,
            handler.invoke(input.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err("timeout".to_string()),
        };

        match outcome {
            Ok(result) => {
                self.provider
                    .enqueue_workflow_work(
                        WorkItem::ActivityCompleted { instance, id, result },
                        None,
                    )
                    .await
                    .map_err(|e| e.to_string())?;
            }
            Err(error) => {
                let policy = self.options.retry_for(&name);
                if attempt < policy.max_attempts {
                    let delay = policy.backoff_for(attempt);
                    warn!(
                        instance,
                        activity = name,
                        attempt,
                        error,
                        delay_ms = delay.as_millis() as u64,
                        "activity failed, retrying"
                    );
                    self.provider
                        .enqueue_worker_work(
                            WorkItem::ActivityInvoke {
                                instance,
                                id,
                                name,
                                input,
                                attempt: attempt + 1,
                            },
                            Some(delay),
                        )
                        .await
                        .map_err(|e| e.to_string())?;
                } else {
                    warn!(
                        instance,
                        activity = name,
                        attempt,
                        error,
                        "activity failed, attempts exhausted"
                    );
                    self.provider
                        .enqueue_workflow_work(
                            WorkItem::ActivityFailed { instance, id, error },
                            None,
                        )
                        .await
                        .map_err(|e| e.to_string())?;
                }
            }
        }

        self.provider
            .ack_worker(token)
            .await
            .map_err(|e| e.to_string())
    }
}

fn has_unresolved_schedule(history: &[Event], id: u64) -> bool {
    let mut scheduled = false;
    for e in history {
        match &e.kind {
            EventKind::ActivityScheduled { id: eid, .. } if *eid == id => scheduled = true,
            EventKind::ActivityCompleted { id: eid, .. }
            | EventKind::ActivityFailed { id: eid, .. }
                if *eid == id =>
            {
                return false;
            }
            _ => {}
        }
    }
    scheduled
}

fn workflow_started_name(history: &[Event]) -> Option<String> {
    history.iter().find_map(|e| match &e.kind {
        EventKind::WorkflowStarted { name, .. } => Some(name.clone()),
        _ => None,
    })
}

fn workflow_started_input(history: &[Event]) -> Option<String> {
    history.iter().find_map(|e| match &e.kind {
        EventKind::WorkflowStarted { input, .. } => Some(input.clone()),
        _ => None,
    })
}
