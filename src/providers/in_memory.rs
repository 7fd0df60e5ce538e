//! In-memory provider for tests and demos. Mirrors the durable semantics of
//! the SQLite provider: append-only history, peek-lock queues with delayed
//! visibility, and per-instance locking of workflow batches.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{now_ms, Event};

use super::{ExecutionMetadata, InstanceSnapshot, Provider, ProviderError, WorkItem, WorkflowItem};

#[derive(Debug, Clone)]
struct QueueEntry {
    item: WorkItem,
    visible_at: u64,
    lock_token: Option<String>,
    locked_until: u64,
}

impl QueueEntry {
    fn available(&self, now: u64) -> bool {
        self.visible_at <= now && (self.lock_token.is_none() || self.locked_until <= now)
    }
}

#[derive(Debug, Default)]
struct State {
    instances: HashMap<String, InstanceSnapshot>,
    histories: HashMap<String, Vec<Event>>,
    workflow_queue: Vec<QueueEntry>,
    worker_queue: Vec<QueueEntry>,
}

/// Shared-nothing-persistence provider backed by mutexed maps.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
    token_counter: AtomicU64,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_token(&self) -> String {
        let n = self.token_counter.fetch_add(1, Ordering::SeqCst);
        format!("mem_lock_{}_{}", now_ms(), n)
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    async fn create_instance(
        &self,
        instance: &str,
        workflow: &str,
        _input: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        if state.instances.contains_key(instance) {
            return Err(ProviderError::conflict(
                "create_instance",
                format!("instance already exists: {instance}"),
            ));
        }
        state.instances.insert(
            instance.to_string(),
            InstanceSnapshot {
                instance: instance.to_string(),
                workflow_name: workflow.to_string(),
                status: "Pending".to_string(),
                output: None,
                created_at_ms: now_ms(),
            },
        );
        Ok(())
    }

    async fn read(&self, instance: &str) -> Vec<Event> {
        self.state
            .lock()
            .await
            .histories
            .get(instance)
            .cloned()
            .unwrap_or_default()
    }

    async fn instance_snapshot(&self, instance: &str) -> Option<InstanceSnapshot> {
        self.state.lock().await.instances.get(instance).cloned()
    }

    async fn list_instances(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state.instances.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn enqueue_workflow_work(
        &self,
        item: WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let visible_at = now_ms() + delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        self.state.lock().await.workflow_queue.push(QueueEntry {
            item,
            visible_at,
            lock_token: None,
            locked_until: 0,
        });
        Ok(())
    }

    async fn enqueue_worker_work(
        &self,
        item: WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let visible_at = now_ms() + delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        self.state.lock().await.worker_queue.push(QueueEntry {
            item,
            visible_at,
            lock_token: None,
            locked_until: 0,
        });
        Ok(())
    }

    async fn fetch_workflow_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<WorkflowItem>, ProviderError> {
        let mut state = self.state.lock().await;
        let now = now_ms();

        // Pick the instance of the oldest available message, skipping
        // instances that currently hold a batch lock.
        let locked_instances: std::collections::HashSet<String> = state
            .workflow_queue
            .iter()
            .filter(|e| e.lock_token.is_some() && e.locked_until > now)
            .map(|e| e.item.instance().to_string())
            .collect();
        let candidate = state
            .workflow_queue
            .iter()
            .find(|e| e.available(now) && !locked_instances.contains(e.item.instance()))
            .map(|e| e.item.instance().to_string());
        let Some(instance) = candidate else {
            return Ok(None);
        };

        let token = self.next_token();
        let locked_until = now + lock_timeout.as_millis() as u64;
        let mut messages = Vec::new();
        for entry in state.workflow_queue.iter_mut() {
            if entry.item.instance() == instance && entry.available(now) {
                entry.lock_token = Some(token.clone());
                entry.locked_until = locked_until;
                messages.push(entry.item.clone());
            }
        }
        let history = state.histories.get(&instance).cloned().unwrap_or_default();
        let workflow_name = state
            .instances
            .get(&instance)
            .map(|s| s.workflow_name.clone())
            .unwrap_or_default();
        Ok(Some(WorkflowItem {
            instance,
            workflow_name,
            history,
            messages,
            lock_token: token,
        }))
    }

    async fn ack_workflow_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        workflow_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let instance = state
            .workflow_queue
            .iter()
            .find(|e| e.lock_token.as_deref() == Some(lock_token))
            .map(|e| e.item.instance().to_string())
            .ok_or_else(|| {
                ProviderError::permanent("ack_workflow_item", format!("unknown lock token: {lock_token}"))
            })?;

        state
            .workflow_queue
            .retain(|e| e.lock_token.as_deref() != Some(lock_token));

        let history = state.histories.entry(instance.clone()).or_default();
        for ev in history_delta {
            if ev.event_id == 0 {
                return Err(ProviderError::permanent(
                    "ack_workflow_item",
                    "history event with unassigned event_id",
                ));
            }
            history.push(ev);
        }

        if let Some(snapshot) = state.instances.get_mut(&instance) {
            if let Some(status) = metadata.status {
                snapshot.status = status;
            }
            if metadata.output.is_some() {
                snapshot.output = metadata.output;
            }
        }

        let now = now_ms();
        for item in worker_items {
            state.worker_queue.push(QueueEntry {
                item,
                visible_at: now,
                lock_token: None,
                locked_until: 0,
            });
        }
        for item in workflow_items {
            state.workflow_queue.push(QueueEntry {
                item,
                visible_at: now,
                lock_token: None,
                locked_until: 0,
            });
        }
        Ok(())
    }

    async fn abandon_workflow_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        for entry in state.workflow_queue.iter_mut() {
            if entry.lock_token.as_deref() == Some(lock_token) {
                entry.lock_token = None;
                entry.locked_until = 0;
            }
        }
        Ok(())
    }

    async fn dequeue_worker_peek_lock(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut state = self.state.lock().await;
        let now = now_ms();
        let token = self.next_token();
        for entry in state.worker_queue.iter_mut() {
            if entry.available(now) {
                entry.lock_token = Some(token.clone());
                entry.locked_until = now + lock_timeout.as_millis() as u64;
                return Ok(Some((entry.item.clone(), token)));
            }
        }
        Ok(None)
    }

    async fn ack_worker(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state
            .worker_queue
            .retain(|e| e.lock_token.as_deref() != Some(lock_token));
        Ok(())
    }

    async fn abandon_worker(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        for entry in state.worker_queue.iter_mut() {
            if entry.lock_token.as_deref() == Some(lock_token) {
                entry.lock_token = None;
                entry.locked_until = 0;
            }
        }
        Ok(())
    }
}
