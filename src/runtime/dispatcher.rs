//! Dispatcher loop: claims due workflows and drives them.
//!
//! One background task polls storage for entities whose ETA has come due,
//! hands each to the scheduler (per-id serialization), waits for the batch,
//! then sleeps until the next poll interval or an external trigger
//! (`create*` / `raise_event`) fires. Cancellation stops new claims but the
//! in-flight batch is drained.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use futures::future::join_all;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::raise_event_inner;
use crate::model::{WorkflowEntity, WorkflowState};
use crate::runtime::context::WorkflowContext;
use crate::runtime::registry::WorkflowOptions;
use crate::runtime::scheduler::{RunWorkflowFn, WorkScheduler};
use crate::runtime::Shared;
use crate::storage::{DueWorkflow, StorageError};
use crate::WorkflowError;

pub(crate) fn start_dispatcher(
    shared: Arc<Shared>,
    scheduler: Arc<WorkScheduler>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let run: RunWorkflowFn = {
            let shared = shared.clone();
            Arc::new(move |due| {
                let shared = shared.clone();
                run_workflow(shared, due).boxed()
            })
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let now = shared.clock.now_utc();
            match shared.storage.poll_due(shared.options.max_batch, now).await {
                Ok(items) => {
                    if !items.is_empty() {
                        debug!(
                            target: "tenacity::dispatcher",
                            count = items.len(),
                            "claimed due workflows"
                        );
                    }
                    let handles: Vec<JoinHandle<()>> = items
                        .into_iter()
                        .filter_map(|item| scheduler.submit(item, run.clone()))
                        .collect();
                    join_all(handles).await;
                }
                Err(e) => {
                    warn!(target: "tenacity::dispatcher", error = %e, "poll_due failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = shared.trigger.notified() => {}
                _ = tokio::time::sleep(shared.options.poll_interval) => {}
            }
        }
        debug!(target: "tenacity::dispatcher", "dispatcher stopped");
    })
}

/// Drive one claimed workflow: reload, garbage-collect expired terminals,
/// rehydrate the handler by type name, run it, and translate the outcome
/// into the entity's next persisted state.
pub(crate) async fn run_workflow(shared: Arc<Shared>, due: DueWorkflow) {
    let id = due.entity.id.clone();
    // The entity may have advanced between the poll and this run.
    let entity = match shared.storage.get_workflow(&id).await {
        Ok(Some(e)) => e,
        Ok(None) => return,
        Err(e) => {
            warn!(target: "tenacity::dispatcher", workflow_id = %id, error = %e, "reload failed");
            return;
        }
    };

    let now = shared.clock.now_utc();
    let registration = shared.workflows.resolve(&entity.type_name);

    if entity.state.is_terminal() {
        if entity.utc_eta <= now {
            let drop_history = registration
                .as_ref()
                .map_or(true, |r| r.options.delete_history);
            if drop_history {
                let _ = shared.storage.delete_history(&id).await;
            }
            let _ = shared.storage.delete_workflow(&id).await;
            debug!(target: "tenacity::dispatcher", workflow_id = %id, "garbage-collected terminal workflow");
        }
        return;
    }

    // A coalesced claim may arrive after the run it chased already pushed
    // the ETA forward; nothing is due until then.
    if entity.utc_eta > now {
        return;
    }

    let Some(registration) = registration else {
        let mut wf = entity;
        wf.state = WorkflowState::Failed;
        wf.response = Some(format!("unknown workflow type: {}", wf.type_name));
        wf.utc_eta = now + preserve(WorkflowOptions::default().failure_preserve_time);
        wf.utc_updated = now;
        error!(
            target: "tenacity::dispatcher",
            workflow_id = %wf.id,
            workflow_type = %wf.type_name,
            "no registration for workflow type; failing instance"
        );
        let _ = save_with_retry(&shared, &mut wf).await;
        return;
    };

    let mut entity = entity;
    entity.state = WorkflowState::Running;
    entity.utc_updated = now;
    if let Err(e) = save_with_retry(&shared, &mut entity).await {
        // Another worker owns it; the poll lease arbitrates.
        warn!(target: "tenacity::dispatcher", workflow_id = %id, error = %e, "could not mark running");
        return;
    }

    let ctx = WorkflowContext::new(shared.clone(), entity.clone());
    let input = entity.input.clone();
    let result = registration.handler.invoke(ctx.clone(), input).await;

    let mut after = ctx.entity_snapshot();
    let now = shared.clock.now_utc();
    let options = &registration.options;
    match result {
        Ok(output) => {
            after.state = WorkflowState::Completed;
            after.response = Some(output);
            after.utc_eta = now + preserve(options.preserve_time);
            after.utc_updated = now;
            after.current_waiting_id = None;
            debug!(
                target: "tenacity::dispatcher",
                workflow_id = %after.id,
                workflow_type = %after.type_name,
                "workflow completed"
            );
            finish_terminal(&shared, after).await;
        }
        Err(WorkflowError::Suspended) => {
            // The primitive already persisted the revival ETA; only the
            // state changes here.
            after.state = WorkflowState::Suspended;
            after.utc_updated = now;
            debug!(
                target: "tenacity::dispatcher",
                workflow_id = %after.id,
                eta = %after.utc_eta,
                "workflow suspended"
            );
            let _ = save_with_retry(&shared, &mut after).await;
        }
        Err(WorkflowError::ActivityFailed { message }) => {
            after.state = WorkflowState::Failed;
            after.response = Some(message.clone());
            after.utc_eta = now + preserve(options.failure_preserve_time);
            after.utc_updated = now;
            after.current_waiting_id = None;
            warn!(
                target: "tenacity::dispatcher",
                workflow_id = %after.id,
                workflow_type = %after.type_name,
                error = %message,
                "workflow failed"
            );
            finish_terminal(&shared, after).await;
        }
        Err(WorkflowError::Fatal { message }) => {
            after.state = WorkflowState::Failed;
            after.response = Some(message.clone());
            after.utc_eta = now + preserve(options.failure_preserve_time);
            after.utc_updated = now;
            after.current_waiting_id = None;
            error!(
                target: "tenacity::dispatcher",
                workflow_id = %after.id,
                workflow_type = %after.type_name,
                error = %message,
                "workflow failed fatally"
            );
            finish_terminal(&shared, after).await;
        }
    }
}

fn preserve(d: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::days(1))
}

/// Persist a terminal workflow. When the instance has a live parent, the
/// terminal save and the parent's ETA bump commit atomically, then the child
/// id is raised as an event so a parent waiting by event also unblocks.
async fn finish_terminal(shared: &Arc<Shared>, mut child: WorkflowEntity) {
    let Some(parent_id) = child.parent_id.clone() else {
        let _ = save_with_retry(shared, &mut child).await;
        return;
    };

    let attempts = shared.options.save_retry_attempts;
    for attempt in 0..attempts {
        let parent = match shared.storage.get_workflow(&parent_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(target: "tenacity::dispatcher", workflow_id = %child.id, error = %e, "parent load failed");
                None
            }
        };
        let Some(mut parent) = parent.filter(|p| !p.state.is_terminal()) else {
            let _ = save_with_retry(shared, &mut child).await;
            return;
        };

        let now = shared.clock.now_utc();
        parent.utc_eta = now;
        parent.utc_updated = now;
        match shared.storage.update_workflow_pair(&mut child, &mut parent).await {
            Ok(()) => {
                let child_id = child.id.clone();
                let _ = raise_event_inner(
                    &shared.storage,
                    &shared.clock,
                    &shared.trigger,
                    &parent_id,
                    &child_id,
                    &"Success",
                    false,
                )
                .await;
                shared.trigger.notify_one();
                return;
            }
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                if e.is_conflict() {
                    if let Ok(Some(latest)) = shared.storage.get_workflow(&child.id).await {
                        child.etag = latest.etag;
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(10 << attempt)).await;
            }
            Err(e) => {
                warn!(
                    target: "tenacity::dispatcher",
                    workflow_id = %child.id,
                    error = %e,
                    "terminal save with parent wake failed"
                );
                return;
            }
        }
    }
}

/// Optimistic save with bounded retry. Contention refreshes the etag and
/// reapplies; exhaustion leaves the cycle to the poll lease.
pub(crate) async fn save_with_retry(
    shared: &Arc<Shared>,
    workflow: &mut WorkflowEntity,
) -> Result<(), StorageError> {
    let attempts = shared.options.save_retry_attempts.max(1);
    for attempt in 0..attempts {
        match shared.storage.update_workflow(workflow).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                if e.is_conflict() {
                    if let Ok(Some(latest)) = shared.storage.get_workflow(&workflow.id).await {
                        workflow.etag = latest.etag;
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(10 << attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(StorageError::retryable(
        "update_workflow",
        format!("save retries exhausted for {}", workflow.id),
    ))
}
