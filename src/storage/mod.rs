//! Storage abstraction for durable workflow state.
//!
//! A [`Storage`] implementation persists entities, answers due-work queries
//! and arbitrates leases. It is a pure storage layer: it never interprets
//! workflow semantics, never creates entities on its own, and never decides
//! control flow. The engine computes every state transition and hands the
//! backend explicit records to write.
//!
//! # Implementor obligations
//!
//! - Single-entity writes are atomic. The multi-entity operations
//!   ([`Storage::update_activity_and_workflow`],
//!   [`Storage::update_workflow_pair`], [`Storage::insert_activity`]) are
//!   atomic across everything they touch.
//! - Every update checks the caller's etag and fails with a retryable
//!   contention error on mismatch; on success the backend bumps the etag both
//!   in storage and on the caller's entity.
//! - [`Storage::poll_due`] marks returned workflows poll-locked atomically
//!   with the query, and returns them in ascending `utc_eta` order.
//! - [`Storage::insert_activity`] assigns a strictly increasing
//!   `sequence_id` per workflow.
//! - A successful workflow update clears the poll lock, so a revived entity
//!   becomes claimable as soon as its new ETA is due.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{ActivityEntity, EventRoute, WorkflowEntity};

pub mod error;
pub mod in_memory;

pub use error::StorageError;
pub use in_memory::InMemoryStorage;

/// A due workflow claimed by `poll_due`, poll-locked until roughly
/// `now + 60s` so other pollers skip it.
#[derive(Debug, Clone)]
pub struct DueWorkflow {
    pub entity: WorkflowEntity,
    pub locked_until: DateTime<Utc>,
}

/// Opaque handle for a per-workflow execution lease. Held for the duration
/// of one activity invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub workflow_id: String,
    pub sequence_id: u64,
    pub token: String,
    pub expires: DateTime<Utc>,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a new workflow entity. Fails with an `already_exists` conflict
    /// if the id is taken.
    async fn insert_workflow(&self, workflow: &WorkflowEntity) -> Result<(), StorageError>;

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowEntity>, StorageError>;

    /// Optimistic-concurrency save. Clears any poll lock on the entity.
    async fn update_workflow(&self, workflow: &mut WorkflowEntity) -> Result<(), StorageError>;

    /// Atomic save of two workflow entities (child terminal + parent wake).
    async fn update_workflow_pair(
        &self,
        first: &mut WorkflowEntity,
        second: &mut WorkflowEntity,
    ) -> Result<(), StorageError>;

    /// Delete a workflow by id. Idempotent.
    async fn delete_workflow(&self, id: &str) -> Result<(), StorageError>;

    /// Insert an activity, assigning its `sequence_id`, upserting the given
    /// event routes, and saving the workflow entity when provided, all in one
    /// transaction.
    async fn insert_activity(
        &self,
        activity: &mut ActivityEntity,
        routes: &[EventRoute],
        workflow: Option<&mut WorkflowEntity>,
    ) -> Result<(), StorageError>;

    async fn get_activity(
        &self,
        workflow_id: &str,
        activity_id: &str,
    ) -> Result<Option<ActivityEntity>, StorageError>;

    /// Atomic save of an activity outcome together with its workflow entity.
    async fn update_activity_and_workflow(
        &self,
        activity: &mut ActivityEntity,
        workflow: &mut WorkflowEntity,
    ) -> Result<(), StorageError>;

    /// Workflows with `utc_eta <= now` that are not poll-locked, in ascending
    /// ETA order, at most `max` of them. Each returned entity is poll-locked
    /// atomically with the query. Terminal entities are included so the
    /// dispatcher can garbage-collect them once retention expires.
    async fn poll_due(&self, max: usize, now: DateTime<Utc>) -> Result<Vec<DueWorkflow>, StorageError>;

    /// Acquire the execution lease for `(workflow_id, sequence_id)`.
    /// Blocking with bounded retry; when the retry budget is exhausted the
    /// error is surfaced to the caller rather than swallowed.
    async fn acquire_lock(&self, workflow_id: &str, sequence_id: u64) -> Result<LockHandle, StorageError>;

    /// Idempotent lease release.
    async fn release_lock(&self, handle: &LockHandle) -> Result<(), StorageError>;

    async fn get_event_route(
        &self,
        workflow_id: &str,
        event_name: &str,
    ) -> Result<Option<EventRoute>, StorageError>;

    /// Remove all activity entities and event routes for a workflow.
    async fn delete_history(&self, workflow_id: &str) -> Result<(), StorageError>;
}
