//! Minimal deterministic workflow core for durable sequential pipelines.
//!
//! This crate exposes a replay-driven programming model that records
//! append-only `Event`s per workflow instance and replays them to make
//! workflow logic deterministic. It provides:
//!
//! - Public data model: `Event`, `EventKind`, `Action`
//! - A `WorkflowContext` with futures that schedule activities using
//!   stable correlation IDs and resolve from recorded history
//! - A single-poll turn driver, `run_turn`, used by the runtime's
//!   dispatcher to advance an instance one decision at a time
//! - Provider-backed durability (`providers`), the execution engine
//!   (`runtime`), a control-plane `client`, and the image metadata
//!   `pipeline` with its directory `trigger`
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod client;
pub mod pipeline;
pub mod providers;
pub mod runtime;
pub mod trigger;

pub use runtime::{WaitError, WorkflowStatus};

/// First event id assigned within a fresh instance history.
pub const INITIAL_EVENT_ID: u64 = 1;

// Internal codec utilities for typed I/O (kept private; public API remains ergonomic)
pub(crate) mod codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;

    pub fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        // If the value is a JSON string, return raw content so plain strings
        // round-trip unquoted through activity payloads.
        match serde_json::to_value(v) {
            Ok(Value::String(s)) => Ok(s),
            Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        match serde_json::from_str::<T>(s) {
            Ok(v) => Ok(v),
            Err(_) => {
                // Fallback: treat the raw payload as a JSON string value
                let val = Value::String(s.to_string());
                serde_json::from_value(val).map_err(|e| e.to_string())
            }
        }
    }
}

/// Append-only history entry persisted by a provider and consumed during
/// replay. `event_id` is monotonic within an instance; replaying the ordered
/// sequence deterministically reproduces the same scheduling decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub event_id: u64,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn new(event_id: u64, kind: EventKind) -> Self {
        Self {
            event_id,
            timestamp_ms: now_ms(),
            kind,
        }
    }

    /// Stable name of the event kind, used as the `event_type` column by
    /// durable providers.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            EventKind::WorkflowStarted { .. } => "WorkflowStarted",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::CancelRequested { .. } => "CancelRequested",
            EventKind::WorkflowCompleted { .. } => "WorkflowCompleted",
            EventKind::WorkflowFailed { .. } => "WorkflowFailed",
        }
    }

    /// Whether this event terminates its instance.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::WorkflowCompleted { .. } | EventKind::WorkflowFailed { .. }
        )
    }
}

/// Variants use stable correlation IDs to pair activity schedules with their
/// completions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    /// Instance was created and started by workflow name with input.
    WorkflowStarted { name: String, input: String },
    /// Activity was scheduled with a unique correlation id and input.
    ActivityScheduled { id: u64, name: String, input: String },
    /// Activity completed successfully with a result.
    ActivityCompleted { id: u64, result: String },
    /// Activity failed with an error string (recorded after retries are
    /// exhausted; intermediate attempts never reach history).
    ActivityFailed { id: u64, error: String },
    /// Cancellation was requested; a terminal `WorkflowFailed` follows.
    CancelRequested { reason: String },
    /// Workflow completed with a final output.
    WorkflowCompleted { output: String },
    /// Workflow failed with a final error.
    WorkflowFailed { error: String },
}

/// Declarative decisions produced by a workflow turn. The runtime
/// materializes these into `ActivityScheduled` events and worker dispatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity { id: u64, name: String, input: String },
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug)]
struct CtxInner {
    history: Vec<Event>,
    actions: Vec<Action>,
    next_correlation_id: u64,
    claimed_activity_ids: std::collections::HashSet<u64>,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        // Next correlation id follows the max id found in history
        let mut max_id = 0u64;
        for ev in &history {
            if let EventKind::ActivityScheduled { id, .. }
            | EventKind::ActivityCompleted { id, .. }
            | EventKind::ActivityFailed { id, .. } = &ev.kind
            {
                max_id = max_id.max(*id);
            }
        }
        Self {
            history,
            actions: Vec::new(),
            next_correlation_id: max_id.saturating_add(1),
            claimed_activity_ids: Default::default(),
        }
    }

    fn record_action(&mut self, a: Action) {
        self.actions.push(a);
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }
}

/// User-facing workflow context for scheduling activities replay-safely.
///
/// Workflow code must be a pure function of its input and prior activity
/// results: no clock reads, random values, or external I/O belong here.
/// Those go inside activities, which run at most once per recorded schedule.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl WorkflowContext {
    /// Construct a context over an existing history vector.
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    /// Schedule an activity and return a future correlated to it. On replay,
    /// a recorded completion resolves the future without re-invocation.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> ActivityFuture {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.inner.lock().expect("ctx lock");
        // Adopt an existing scheduled activity id that matches and isn't claimed yet
        let adopted_id = {
            let claimed = &inner.claimed_activity_ids;
            inner.history.iter().find_map(|e| match &e.kind {
                EventKind::ActivityScheduled { id, name: n, input: inp }
                    if n == &name && inp == &input && !claimed.contains(id) =>
                {
                    Some(*id)
                }
                _ => None,
            })
        };
        let id = adopted_id.unwrap_or_else(|| inner.next_id());
        inner.claimed_activity_ids.insert(id);
        drop(inner);
        ActivityFuture {
            id,
            name,
            input,
            scheduled: Cell::new(false),
            ctx: self.clone(),
        }
    }

    /// Typed helper: serializes the input and decodes the activity result.
    pub async fn schedule_activity_typed<In, Out>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<Out, String>
    where
        In: Serialize,
        Out: serde::de::DeserializeOwned,
    {
        let payload = codec::encode(input)?;
        let raw = self.schedule_activity(name, payload).await?;
        codec::decode::<Out>(&raw)
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().expect("ctx lock").actions)
    }
}

/// Future for a scheduled activity, resolved from history during replay.
pub struct ActivityFuture {
    id: u64,
    name: String,
    input: String,
    scheduled: Cell<bool>,
    ctx: WorkflowContext,
}

impl Future for ActivityFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.inner.lock().expect("ctx lock");
        for e in &inner.history {
            match &e.kind {
                EventKind::ActivityCompleted { id, result } if *id == this.id => {
                    return Poll::Ready(Ok(result.clone()));
                }
                EventKind::ActivityFailed { id, error } if *id == this.id => {
                    return Poll::Ready(Err(error.clone()));
                }
                _ => {}
            }
        }
        if !this.scheduled.replace(true) {
            inner.record_action(Action::CallActivity {
                id: this.id,
                name: this.name.clone(),
                input: this.input.clone(),
            });
        }
        Poll::Pending
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future + ?Sized>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let w = noop_waker();
    let mut cx = Context::from_waker(&w);
    fut.poll(&mut cx)
}

/// Result of replaying a single workflow turn: the decisions recorded while
/// polling and, if the workflow ran to its end, the final output.
pub struct TurnResult {
    pub actions: Vec<Action>,
    pub output: Option<Result<String, String>>,
}

/// Poll the workflow once against the provided history. Completed activities
/// resolve from recorded events; the first unresolved schedule surfaces as an
/// `Action` for the runtime to dispatch.
pub fn run_turn<F>(history: Vec<Event>, workflow: impl FnOnce(WorkflowContext) -> F) -> TurnResult
where
    F: Future<Output = Result<String, String>>,
{
    let ctx = WorkflowContext::new(history);
    let mut fut = Box::pin(workflow(ctx.clone()));
    match poll_once(fut.as_mut()) {
        Poll::Ready(out) => TurnResult {
            actions: ctx.take_actions(),
            output: Some(out),
        },
        Poll::Pending => TurnResult {
            actions: ctx.take_actions(),
            output: None,
        },
    }
}
