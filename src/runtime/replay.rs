//! Turn planning: converts the decisions of a replayed workflow turn into a
//! history delta, worker dispatches, and instance metadata, deduplicating
//! against what history already records.
use crate::{Action, Event, EventKind, TurnResult};

use crate::providers::{ExecutionMetadata, WorkItem};

/// Outcome of planning one turn, ready to hand to `ack_workflow_item`.
#[derive(Debug, Default)]
pub struct TurnPlan {
    pub history_delta: Vec<Event>,
    pub worker_items: Vec<WorkItem>,
    pub metadata: ExecutionMetadata,
}

fn already_scheduled(history: &[Event], delta: &[Event], id: u64) -> bool {
    history
        .iter()
        .chain(delta.iter())
        .any(|e| matches!(&e.kind, EventKind::ActivityScheduled { id: eid, .. } if *eid == id))
}

/// Translate a `TurnResult` into durable effects.
///
/// Actions whose correlation id already appears as an `ActivityScheduled`
/// event produce no new history or dispatch, which keeps replay idempotent
/// when a batch is redelivered. A terminal output appends the matching
/// terminal event and flips the instance status.
pub fn plan_turn(instance: &str, history: &[Event], turn: TurnResult) -> TurnPlan {
    let mut next_event_id = history.iter().map(|e| e.event_id).max().unwrap_or(0) + 1;
    let mut plan = TurnPlan::default();

    for action in turn.actions {
        let Action::CallActivity { id, name, input } = action;
        if already_scheduled(history, &plan.history_delta, id) {
            continue;
        }
        plan.history_delta.push(Event::new(
            next_event_id,
            EventKind::ActivityScheduled {
                id,
                name: name.clone(),
                input: input.clone(),
            },
        ));
        next_event_id += 1;
        plan.worker_items.push(WorkItem::ActivityInvoke {
            instance: instance.to_string(),
            id,
            name,
            input,
            attempt: 1,
        });
    }

    match turn.output {
        Some(Ok(output)) => {
            plan.history_delta.push(Event::new(
                next_event_id,
                EventKind::WorkflowCompleted {
                    output: output.clone(),
                },
            ));
            plan.metadata = ExecutionMetadata {
                status: Some("Completed".into()),
                output: Some(output),
            };
        }
        Some(Err(error)) => {
            plan.history_delta.push(Event::new(
                next_event_id,
                EventKind::WorkflowFailed {
                    error: error.clone(),
                },
            ));
            plan.metadata = ExecutionMetadata {
                status: Some("Failed".into()),
                output: Some(error),
            };
        }
        None => {}
    }

    plan
}
