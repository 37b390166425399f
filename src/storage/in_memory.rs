//! Reference in-memory storage backend.
//!
//! Maps behind a single tokio mutex, so every multi-entity operation is
//! trivially atomic. Used by the test suite and as a baseline for real
//! backends: the etag, poll-lock and lease semantics here are the contract a
//! production implementation has to reproduce.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{DueWorkflow, LockHandle, Storage, StorageError};
use crate::clock::{SharedClock, SystemClock};
use crate::model::{ActivityEntity, EventRoute, WorkflowEntity};

const POLL_LEASE: Duration = Duration::seconds(60);
const LOCK_TTL: Duration = Duration::seconds(59);
const LOCK_RETRY_ATTEMPTS: u32 = 30;
const LOCK_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(20);

struct StoredWorkflow {
    entity: WorkflowEntity,
    poll_locked_until: Option<DateTime<Utc>>,
}

struct ExecutionLock {
    token: String,
    expires: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    workflows: HashMap<String, StoredWorkflow>,
    // workflow_id -> activity_id -> entity
    activities: HashMap<String, BTreeMap<String, ActivityEntity>>,
    // workflow_id -> event_name -> route
    routes: HashMap<String, HashMap<String, EventRoute>>,
    next_sequence: HashMap<String, u64>,
    locks: HashMap<(String, u64), ExecutionLock>,
}

pub struct InMemoryStorage {
    clock: SharedClock,
    state: Mutex<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Lease and poll-lock expiry follow the given clock, which keeps the
    /// backend honest under a `ManualClock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    fn commit_workflow(state: &mut State, workflow: &mut WorkflowEntity) -> Result<(), StorageError> {
        let stored = state
            .workflows
            .get_mut(&workflow.id)
            .ok_or_else(|| StorageError::permanent("update_workflow", format!("workflow not found: {}", workflow.id)))?;
        if stored.entity.etag != workflow.etag {
            return Err(StorageError::contention(
                "update_workflow",
                format!(
                    "etag mismatch for {}: stored {} vs caller {}",
                    workflow.id, stored.entity.etag, workflow.etag
                ),
            ));
        }
        workflow.etag += 1;
        stored.entity = workflow.clone();
        stored.poll_locked_until = None;
        Ok(())
    }

    fn commit_activity(state: &mut State, activity: &mut ActivityEntity) -> Result<(), StorageError> {
        let per_workflow = state
            .activities
            .get_mut(&activity.workflow_id)
            .and_then(|m| m.get_mut(&activity.id))
            .ok_or_else(|| {
                StorageError::permanent(
                    "update_activity",
                    format!("activity not found: {}/{}", activity.workflow_id, activity.id),
                )
            })?;
        if per_workflow.etag != activity.etag {
            return Err(StorageError::contention(
                "update_activity",
                format!(
                    "etag mismatch for {}/{}: stored {} vs caller {}",
                    activity.workflow_id, activity.id, per_workflow.etag, activity.etag
                ),
            ));
        }
        activity.etag += 1;
        *per_workflow = activity.clone();
        Ok(())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_workflow(&self, workflow: &WorkflowEntity) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.workflows.contains_key(&workflow.id) {
            return Err(StorageError::already_exists(
                "insert_workflow",
                format!("workflow already exists: {}", workflow.id),
            ));
        }
        state.workflows.insert(
            workflow.id.clone(),
            StoredWorkflow {
                entity: workflow.clone(),
                poll_locked_until: None,
            },
        );
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowEntity>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.workflows.get(id).map(|s| s.entity.clone()))
    }

    async fn update_workflow(&self, workflow: &mut WorkflowEntity) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        Self::commit_workflow(&mut state, workflow)
    }

    async fn update_workflow_pair(
        &self,
        first: &mut WorkflowEntity,
        second: &mut WorkflowEntity,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        // Validate both etags before writing either, so the pair commits or
        // fails as a unit.
        for wf in [&*first, &*second] {
            let stored = state.workflows.get(&wf.id).ok_or_else(|| {
                StorageError::permanent("update_workflow_pair", format!("workflow not found: {}", wf.id))
            })?;
            if stored.entity.etag != wf.etag {
                return Err(StorageError::contention(
                    "update_workflow_pair",
                    format!("etag mismatch for {}", wf.id),
                ));
            }
        }
        Self::commit_workflow(&mut state, first)?;
        Self::commit_workflow(&mut state, second)
    }

    async fn delete_workflow(&self, id: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.workflows.remove(id);
        Ok(())
    }

    async fn insert_activity(
        &self,
        activity: &mut ActivityEntity,
        routes: &[EventRoute],
        workflow: Option<&mut WorkflowEntity>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        // Validate everything before mutating anything; the insert is
        // transactional across activity, routes, and workflow.
        let duplicate = state
            .activities
            .get(&activity.workflow_id)
            .map_or(false, |m| m.contains_key(&activity.id));
        if duplicate {
            return Err(StorageError::already_exists(
                "insert_activity",
                format!("activity already exists: {}/{}", activity.workflow_id, activity.id),
            ));
        }
        if let Some(wf) = workflow.as_deref() {
            match state.workflows.get(&wf.id) {
                Some(s) if s.entity.etag != wf.etag => {
                    return Err(StorageError::contention(
                        "insert_activity",
                        format!("etag mismatch for workflow {}", wf.id),
                    ));
                }
                None => {
                    return Err(StorageError::permanent(
                        "insert_activity",
                        format!("workflow not found: {}", wf.id),
                    ));
                }
                _ => {}
            }
        }
        let seq = state.next_sequence.entry(activity.workflow_id.clone()).or_insert(0);
        *seq += 1;
        activity.sequence_id = *seq;
        state
            .activities
            .entry(activity.workflow_id.clone())
            .or_default()
            .insert(activity.id.clone(), activity.clone());
        for route in routes {
            state
                .routes
                .entry(route.workflow_id.clone())
                .or_default()
                .insert(route.event_name.clone(), route.clone());
        }
        if let Some(wf) = workflow {
            Self::commit_workflow(&mut state, wf)?;
        }
        Ok(())
    }

    async fn get_activity(
        &self,
        workflow_id: &str,
        activity_id: &str,
    ) -> Result<Option<ActivityEntity>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .activities
            .get(workflow_id)
            .and_then(|m| m.get(activity_id))
            .cloned())
    }

    async fn update_activity_and_workflow(
        &self,
        activity: &mut ActivityEntity,
        workflow: &mut WorkflowEntity,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let stored_act = state
            .activities
            .get(&activity.workflow_id)
            .and_then(|m| m.get(&activity.id));
        match stored_act {
            Some(a) if a.etag != activity.etag => {
                return Err(StorageError::contention(
                    "update_activity_and_workflow",
                    format!("etag mismatch for activity {}/{}", activity.workflow_id, activity.id),
                ));
            }
            None => {
                return Err(StorageError::permanent(
                    "update_activity_and_workflow",
                    format!("activity not found: {}/{}", activity.workflow_id, activity.id),
                ));
            }
            _ => {}
        }
        match state.workflows.get(&workflow.id) {
            Some(s) if s.entity.etag != workflow.etag => {
                return Err(StorageError::contention(
                    "update_activity_and_workflow",
                    format!("etag mismatch for workflow {}", workflow.id),
                ));
            }
            None => {
                return Err(StorageError::permanent(
                    "update_activity_and_workflow",
                    format!("workflow not found: {}", workflow.id),
                ));
            }
            _ => {}
        }
        Self::commit_activity(&mut state, activity)?;
        Self::commit_workflow(&mut state, workflow)
    }

    async fn poll_due(&self, max: usize, now: DateTime<Utc>) -> Result<Vec<DueWorkflow>, StorageError> {
        let mut state = self.state.lock().await;
        let mut due: Vec<String> = state
            .workflows
            .values()
            .filter(|s| s.entity.utc_eta <= now)
            .filter(|s| s.poll_locked_until.map_or(true, |until| until <= now))
            .map(|s| s.entity.id.clone())
            .collect();
        due.sort_by_key(|id| state.workflows[id].entity.utc_eta);
        due.truncate(max);

        let locked_until = now + POLL_LEASE;
        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(stored) = state.workflows.get_mut(&id) {
                stored.poll_locked_until = Some(locked_until);
                claimed.push(DueWorkflow {
                    entity: stored.entity.clone(),
                    locked_until,
                });
            }
        }
        Ok(claimed)
    }

    async fn acquire_lock(&self, workflow_id: &str, sequence_id: u64) -> Result<LockHandle, StorageError> {
        let key = (workflow_id.to_string(), sequence_id);
        for attempt in 0..LOCK_RETRY_ATTEMPTS {
            {
                let mut state = self.state.lock().await;
                let now = self.clock.now_utc();
                let held = state.locks.get(&key).map_or(false, |l| l.expires > now);
                if !held {
                    let token = Uuid::new_v4().to_string();
                    let expires = now + LOCK_TTL;
                    state.locks.insert(
                        key.clone(),
                        ExecutionLock {
                            token: token.clone(),
                            expires,
                        },
                    );
                    return Ok(LockHandle {
                        workflow_id: workflow_id.to_string(),
                        sequence_id,
                        token,
                        expires,
                    });
                }
            }
            tracing::debug!(
                target: "tenacity::storage",
                workflow_id,
                sequence_id,
                attempt,
                "execution lease held elsewhere; retrying"
            );
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }
        Err(StorageError::retryable(
            "acquire_lock",
            format!(
                "lease for {workflow_id}/{sequence_id} still held after {LOCK_RETRY_ATTEMPTS} attempts"
            ),
        ))
    }

    async fn release_lock(&self, handle: &LockHandle) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let key = (handle.workflow_id.clone(), handle.sequence_id);
        if state.locks.get(&key).map_or(false, |l| l.token == handle.token) {
            state.locks.remove(&key);
        }
        Ok(())
    }

    async fn get_event_route(
        &self,
        workflow_id: &str,
        event_name: &str,
    ) -> Result<Option<EventRoute>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .routes
            .get(workflow_id)
            .and_then(|m| m.get(event_name))
            .cloned())
    }

    async fn delete_history(&self, workflow_id: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.activities.remove(workflow_id);
        state.routes.remove(workflow_id);
        state.next_sequence.remove(workflow_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkflowState;

    fn workflow(id: &str, eta_offset_secs: i64) -> WorkflowEntity {
        let now = Utc::now();
        WorkflowEntity::new(id, "Test", "", now + Duration::seconds(eta_offset_secs), now)
    }

    #[tokio::test]
    async fn insert_is_unique_per_id() {
        let store = InMemoryStorage::new();
        let wf = workflow("w1", 0);
        store.insert_workflow(&wf).await.unwrap();
        let err = store.insert_workflow(&wf).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn stale_etag_is_retryable_contention() {
        let store = InMemoryStorage::new();
        let mut wf = workflow("w1", 0);
        store.insert_workflow(&wf).await.unwrap();

        let mut stale = wf.clone();
        store.update_workflow(&mut wf).await.unwrap();
        assert_eq!(wf.etag, 1);

        stale.state = WorkflowState::Running;
        let err = store.update_workflow(&mut stale).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn poll_due_orders_by_eta_and_locks() {
        let store = InMemoryStorage::new();
        let now = Utc::now();
        let late = workflow("late", -10);
        let early = workflow("early", -60);
        let future = workflow("future", 3600);
        for wf in [&late, &early, &future] {
            store.insert_workflow(wf).await.unwrap();
        }

        let due = store.poll_due(10, now).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|d| d.entity.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);

        // Claimed entities are poll-locked: a second poll sees nothing.
        assert!(store.poll_due(10, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_clears_poll_lock() {
        let store = InMemoryStorage::new();
        let now = Utc::now();
        store.insert_workflow(&workflow("w1", -1)).await.unwrap();

        let due = store.poll_due(10, now).await.unwrap();
        assert_eq!(due.len(), 1);
        let mut wf = due[0].entity.clone();
        store.update_workflow(&mut wf).await.unwrap();

        let again = store.poll_due(10, now).await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn insert_activity_assigns_increasing_sequence_ids() {
        let store = InMemoryStorage::new();
        let now = Utc::now();
        let mut a = ActivityEntity::new("a", "w1", "Step", "{}", now, now);
        let mut b = ActivityEntity::new("b", "w1", "Step", "{}", now, now);
        store.insert_activity(&mut a, &[], None).await.unwrap();
        store.insert_activity(&mut b, &[], None).await.unwrap();
        assert_eq!(a.sequence_id, 1);
        assert_eq!(b.sequence_id, 2);

        let err = store
            .insert_activity(&mut ActivityEntity::new("a", "w1", "Step", "{}", now, now), &[], None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn routes_upsert_and_resolve() {
        let store = InMemoryStorage::new();
        let now = Utc::now();
        let route = EventRoute {
            workflow_id: "w1".into(),
            event_name: "approve".into(),
            activity_id: "act-1".into(),
        };
        let mut act = ActivityEntity::new("act-1", "w1", "WaitForExternalEvents", "[]", now, now);
        store
            .insert_activity(&mut act, std::slice::from_ref(&route), None)
            .await
            .unwrap();

        let found = store.get_event_route("w1", "approve").await.unwrap().unwrap();
        assert_eq!(found.activity_id, "act-1");
        assert!(store.get_event_route("w1", "reject").await.unwrap().is_none());

        store.delete_history("w1").await.unwrap();
        assert!(store.get_event_route("w1", "approve").await.unwrap().is_none());
        assert!(store.get_activity("w1", "act-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let store = InMemoryStorage::new();
        let handle = store.acquire_lock("w1", 1).await.unwrap();
        // A different sequence id is an independent lease.
        let other = store.acquire_lock("w1", 2).await.unwrap();
        store.release_lock(&other).await.unwrap();
        store.release_lock(&handle).await.unwrap();
        // Release is idempotent.
        store.release_lock(&handle).await.unwrap();
        let reacquired = store.acquire_lock("w1", 1).await.unwrap();
        assert_ne!(reacquired.token, handle.token);
    }
}
