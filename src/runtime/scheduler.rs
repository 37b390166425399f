//! Per-workflow work scheduler.
//!
//! Serializes execution by workflow id within one process: while an id is
//! running, a second claim for it is parked, and parking again replaces the
//! parked payload: only the freshest claim matters, the run reloads the
//! entity anyway. Total in-flight runs are bounded by a
//! semaphore; cross-process exclusion is the storage lease's job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::storage::DueWorkflow;

/// Continuation invoked for each claimed workflow.
pub(crate) type RunWorkflowFn = Arc<dyn Fn(DueWorkflow) -> BoxFuture<'static, ()> + Send + Sync>;

enum Slot {
    Running,
    RunningQueued(DueWorkflow),
}

pub(crate) struct WorkScheduler {
    slots: Mutex<HashMap<String, Slot>>,
    permits: Arc<Semaphore>,
}

impl WorkScheduler {
    pub fn new(max_parallel_workflows: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_parallel_workflows.max(1))),
        })
    }

    /// Number of ids currently running or parked. Test hook.
    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.slots.lock().expect("scheduler mutex poisoned").len()
    }

    /// Submit a claimed workflow. Returns a join handle when this submission
    /// started a new task; `None` when it coalesced into an existing one.
    pub fn submit(self: &Arc<Self>, item: DueWorkflow, run: RunWorkflowFn) -> Option<JoinHandle<()>> {
        let id = item.entity.id.clone();
        {
            let mut slots = self.slots.lock().expect("scheduler mutex poisoned");
            if let Some(slot) = slots.get_mut(&id) {
                *slot = Slot::RunningQueued(item);
                return None;
            }
            slots.insert(id.clone(), Slot::Running);
        }

        let scheduler = self.clone();
        Some(tokio::spawn(async move {
            let mut current = item;
            loop {
                let permit = scheduler
                    .permits
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("scheduler semaphore closed");
                run(current).await;
                drop(permit);

                let mut slots = scheduler.slots.lock().expect("scheduler mutex poisoned");
                match slots.remove(&id) {
                    Some(Slot::RunningQueued(next)) => {
                        slots.insert(id.clone(), Slot::Running);
                        current = next;
                    }
                    _ => break,
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkflowEntity;
    use chrono::Utc;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn due(id: &str) -> DueWorkflow {
        let now = Utc::now();
        DueWorkflow {
            entity: WorkflowEntity::new(id, "Test", "", now, now),
            locked_until: now + chrono::Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn coalesces_submissions_for_a_running_id() {
        let scheduler = WorkScheduler::new(4);
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let runs_c = runs.clone();
        let gate_c = gate.clone();
        let run: RunWorkflowFn = Arc::new(move |_item| {
            let runs = runs_c.clone();
            let gate = gate_c.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                let _ = gate.acquire().await;
            }
            .boxed()
        });

        let handle = scheduler.submit(due("w1"), run.clone()).expect("first submit spawns");
        // While w1 runs, further submissions coalesce into one parked payload.
        assert!(scheduler.submit(due("w1"), run.clone()).is_none());
        assert!(scheduler.submit(due("w1"), run.clone()).is_none());
        assert_eq!(scheduler.in_flight(), 1);

        // Let the first run and the single coalesced follow-up finish.
        gate.add_permits(2);
        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn distinct_ids_run_concurrently() {
        let scheduler = WorkScheduler::new(4);
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let started = Arc::new(AtomicUsize::new(0));

        let gate_c = gate.clone();
        let started_c = started.clone();
        let run: RunWorkflowFn = Arc::new(move |_item| {
            let gate = gate_c.clone();
            let started = started_c.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                let _ = gate.acquire().await;
            }
            .boxed()
        });

        let h1 = scheduler.submit(due("a"), run.clone()).unwrap();
        let h2 = scheduler.submit(due("b"), run.clone()).unwrap();

        // Both ids get a task despite neither having finished.
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while started.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("both workflows should start");

        gate.add_permits(2);
        h1.await.unwrap();
        h2.await.unwrap();
    }
}
