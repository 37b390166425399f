//! Daily scheduler: enqueues workflows registered as daily once per UTC day.
//!
//! Every hour, for each daily type, attempt to create an instance whose id is
//! `"{type}-{YYYY-MM-DD}"`. Duplicates collide on the id and are silently
//! ignored, which yields at-most-once-per-UTC-day across any number of
//! engine replicas.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::WorkflowEntity;
use crate::runtime::Shared;

const TICK: std::time::Duration = std::time::Duration::from_secs(60 * 60);

pub(crate) fn start_daily_scheduler(shared: Arc<Shared>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let daily_types = shared.workflows.daily_types();
        if daily_types.is_empty() {
            return;
        }
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let today = shared.clock.now_utc().format("%Y-%m-%d").to_string();
            for type_name in &daily_types {
                let id = format!("{type_name}-{today}");
                let now = shared.clock.now_utc();
                let entity = WorkflowEntity::new(id.clone(), type_name.clone(), "null", now, now);
                match shared.storage.insert_workflow(&entity).await {
                    Ok(()) => {
                        debug!(
                            target: "tenacity::daily",
                            workflow_id = %id,
                            workflow_type = %type_name,
                            "enqueued daily workflow"
                        );
                        shared.trigger.notify_one();
                    }
                    Err(e) if e.is_conflict() => {} // already enqueued today
                    Err(e) => {
                        warn!(target: "tenacity::daily", workflow_type = %type_name, error = %e, "daily enqueue failed");
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(TICK) => {}
            }
        }
    })
}
