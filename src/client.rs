//! Public API for creating workflows, querying status, and raising events.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::codec::Json;
use crate::model::{ActivityState, EventOutcome, WorkflowEntity, WorkflowState};
use crate::storage::{Storage, StorageError};

/// Error type returned by the client surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// `create_unique` hit an existing workflow id.
    AlreadyExists(String),
    /// Unknown workflow id (only raised when asked to).
    NotFound(String),
    /// `raise_event` on a workflow that is not currently waiting for the
    /// event (only raised when asked to).
    NotWaiting(String),
    Storage(StorageError),
    Codec(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::AlreadyExists(id) => write!(f, "workflow already exists: {id}"),
            ClientError::NotFound(id) => write!(f, "workflow not found: {id}"),
            ClientError::NotWaiting(id) => write!(f, "workflow not waiting for event: {id}"),
            ClientError::Storage(e) => write!(f, "storage error: {e}"),
            ClientError::Codec(e) => write!(f, "codec error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<StorageError> for ClientError {
    fn from(e: StorageError) -> Self {
        ClientError::Storage(e)
    }
}

/// Error type returned by [`Client::wait_for_workflow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "timed out waiting for workflow"),
            WaitError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Point-in-time view of a workflow instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStatus {
    pub state: WorkflowState,
    pub date_created: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// Encoded result when `Completed`.
    pub result: Option<String>,
    /// Error string when `Failed`.
    pub error: Option<String>,
}

impl WorkflowStatus {
    fn from_entity(entity: &WorkflowEntity) -> Self {
        Self {
            state: entity.state,
            date_created: entity.utc_created,
            last_update: entity.utc_updated,
            result: match entity.state {
                WorkflowState::Completed => entity.response.clone(),
                _ => None,
            },
            error: match entity.state {
                WorkflowState::Failed => entity.response.clone(),
                _ => None,
            },
        }
    }
}

/// Thin handle over storage plus the engine's dispatcher trigger.
#[derive(Clone)]
pub struct Client {
    storage: Arc<dyn Storage>,
    clock: SharedClock,
    trigger: Arc<Notify>,
}

impl Client {
    pub(crate) fn from_parts(storage: Arc<dyn Storage>, clock: SharedClock, trigger: Arc<Notify>) -> Self {
        Self {
            storage,
            clock,
            trigger,
        }
    }

    /// Create a workflow with a generated id, due immediately.
    pub async fn create<In>(&self, type_name: &str, input: &In) -> Result<String, ClientError>
    where
        In: Serialize + ?Sized,
    {
        let id = Uuid::new_v4().to_string();
        let eta = self.clock.now_utc();
        self.create_inner(type_name, input, &id, eta, false).await
    }

    /// Create with a caller-supplied id. Idempotent: an existing instance
    /// with the same id wins silently.
    pub async fn create_with_id<In>(
        &self,
        type_name: &str,
        input: &In,
        id: &str,
    ) -> Result<String, ClientError>
    where
        In: Serialize + ?Sized,
    {
        let eta = self.clock.now_utc();
        self.create_inner(type_name, input, id, eta, false).await
    }

    /// Create a workflow that first becomes due at `at`.
    pub async fn create_at<In>(
        &self,
        type_name: &str,
        input: &In,
        at: DateTime<Utc>,
    ) -> Result<String, ClientError>
    where
        In: Serialize + ?Sized,
    {
        let id = Uuid::new_v4().to_string();
        self.create_inner(type_name, input, &id, at, false).await
    }

    pub async fn create_at_with_id<In>(
        &self,
        type_name: &str,
        input: &In,
        at: DateTime<Utc>,
        id: &str,
    ) -> Result<String, ClientError>
    where
        In: Serialize + ?Sized,
    {
        self.create_inner(type_name, input, id, at, false).await
    }

    /// Like [`Client::create_with_id`], but a duplicate id is an error.
    pub async fn create_unique<In>(
        &self,
        type_name: &str,
        input: &In,
        id: &str,
    ) -> Result<String, ClientError>
    where
        In: Serialize + ?Sized,
    {
        let eta = self.clock.now_utc();
        self.create_inner(type_name, input, id, eta, true).await
    }

    async fn create_inner<In>(
        &self,
        type_name: &str,
        input: &In,
        id: &str,
        eta: DateTime<Utc>,
        unique: bool,
    ) -> Result<String, ClientError>
    where
        In: Serialize + ?Sized,
    {
        let encoded = Json::encode(input).map_err(ClientError::Codec)?;
        let now = self.clock.now_utc();
        let entity = WorkflowEntity::new(id, type_name, encoded, eta, now);
        match self.storage.insert_workflow(&entity).await {
            Ok(()) => {
                tracing::debug!(
                    target: "tenacity::client",
                    workflow_id = %id,
                    workflow_type = %type_name,
                    eta = %eta,
                    "workflow created"
                );
                self.trigger.notify_one();
                Ok(id.to_string())
            }
            Err(e) if e.is_conflict() => {
                if unique {
                    Err(ClientError::AlreadyExists(id.to_string()))
                } else {
                    Ok(id.to_string())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current status, or `None` for an unknown id.
    pub async fn status(&self, id: &str) -> Result<Option<WorkflowStatus>, ClientError> {
        let entity = self.storage.get_workflow(id).await?;
        Ok(entity.as_ref().map(WorkflowStatus::from_entity))
    }

    /// Deliver an external event to a waiting workflow. The first delivery
    /// for a wait wins; later ones are ignored. Lookup misses are silent
    /// unless `throw_if_not_found`.
    pub async fn raise_event<V>(
        &self,
        id: &str,
        name: &str,
        value: &V,
        throw_if_not_found: bool,
    ) -> Result<(), ClientError>
    where
        V: Serialize + ?Sized,
    {
        raise_event_inner(&self.storage, &self.clock, &self.trigger, id, name, value, throw_if_not_found).await
    }

    /// Poll until the workflow reaches a terminal state or the timeout
    /// elapses.
    pub async fn wait_for_workflow(&self, id: &str, timeout: Duration) -> Result<WorkflowStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.status(id).await {
                Ok(Some(status)) if status.state.is_terminal() => return Ok(status),
                Ok(_) => {}
                Err(e) => return Err(WaitError::Other(e.to_string())),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Shared implementation of event delivery, also used by the engine to wake
/// parents of finished child workflows.
pub(crate) async fn raise_event_inner<V>(
    storage: &Arc<dyn Storage>,
    clock: &SharedClock,
    trigger: &Arc<Notify>,
    workflow_id: &str,
    name: &str,
    value: &V,
    throw_if_not_found: bool,
) -> Result<(), ClientError>
where
    V: Serialize + ?Sized,
{
    let miss = |err: ClientError| if throw_if_not_found { Err(err) } else { Ok(()) };

    let Some(mut workflow) = storage.get_workflow(workflow_id).await? else {
        return miss(ClientError::NotFound(workflow_id.to_string()));
    };
    let Some(route) = storage.get_event_route(workflow_id, name).await? else {
        return miss(ClientError::NotWaiting(workflow_id.to_string()));
    };
    // The waiting pointer short-circuits delivery to stale routes.
    if workflow.current_waiting_id.as_deref() != Some(route.activity_id.as_str()) {
        return miss(ClientError::NotWaiting(workflow_id.to_string()));
    }
    let Some(mut activity) = storage.get_activity(workflow_id, &route.activity_id).await? else {
        return miss(ClientError::NotWaiting(workflow_id.to_string()));
    };
    if activity.state.is_terminal() {
        // First delivery won; this one is a no-op.
        return miss(ClientError::NotWaiting(workflow_id.to_string()));
    }

    let encoded_value = Json::encode(value).map_err(ClientError::Codec)?;
    let outcome = EventOutcome {
        name: Some(name.to_string()),
        value: Some(encoded_value),
    };
    let payload = Json::encode(&outcome).map_err(ClientError::Codec)?;

    const ATTEMPTS: u32 = 5;
    for attempt in 0..ATTEMPTS {
        let now = clock.now_utc();
        activity.state = ActivityState::Completed;
        activity.response = Some(payload.clone());
        activity.utc_updated = now;
        workflow.current_waiting_id = None;
        workflow.utc_eta = now;
        workflow.utc_updated = now;
        match storage.update_activity_and_workflow(&mut activity, &mut workflow).await {
            Ok(()) => {
                tracing::debug!(
                    target: "tenacity::client",
                    workflow_id,
                    event = name,
                    "event delivered"
                );
                trigger.notify_one();
                return Ok(());
            }
            Err(e) if e.is_conflict() && attempt + 1 < ATTEMPTS => {
                let Some(latest_act) = storage.get_activity(workflow_id, &route.activity_id).await? else {
                    return miss(ClientError::NotWaiting(workflow_id.to_string()));
                };
                if latest_act.state.is_terminal() {
                    // Raced with the timeout write or another delivery.
                    return miss(ClientError::NotWaiting(workflow_id.to_string()));
                }
                activity = latest_act;
                let Some(latest_wf) = storage.get_workflow(workflow_id).await? else {
                    return miss(ClientError::NotFound(workflow_id.to_string()));
                };
                workflow = latest_wf;
            }
            Err(e) if e.is_retryable() && attempt + 1 < ATTEMPTS => {
                tokio::time::sleep(Duration::from_millis(10 << attempt)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ClientError::Storage(StorageError::retryable(
        "raise_event",
        format!("delivery retries exhausted for {workflow_id}/{name}"),
    )))
}
