//! Durable entity model.
//!
//! Two entity kinds are persisted: one [`WorkflowEntity`] per workflow
//! instance and one [`ActivityEntity`] per durable call site evaluated so far
//! by that workflow. [`EventRoute`] is the secondary record that lets
//! `raise_event` find a waiting activity without scanning.
//!
//! Activity identity is the replay key: it is deterministic relative to the
//! workflow, so re-executing orchestration code turns every already-finished
//! durable call into a single point lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Reserved method name for durable timers.
pub const DELAY_METHOD: &str = "Delay";
/// Reserved method name for external-event waits.
pub const WAIT_EVENTS_METHOD: &str = "WaitForExternalEvents";

/// Optimistic-concurrency version counter. Bumped by storage on every write.
pub type Etag = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Queued,
    Running,
    Suspended,
    Completed,
    Failed,
}

impl WorkflowState {
    /// Terminal states are sticky: only garbage collection removes the entity.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityState {
    Queued,
    Completed,
    Failed,
}

impl ActivityState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActivityState::Completed | ActivityState::Failed)
    }
}

/// One workflow instance.
///
/// `utc_eta` is the only scheduling input the dispatcher inspects: a
/// suspended workflow is revived when `utc_eta <= now`. While
/// `current_waiting_id` is set the workflow is blocked on that activity and
/// both the event delivery and the timeout fire the same revival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEntity {
    pub id: String,
    /// Registered type name used to rehydrate the handler.
    pub type_name: String,
    /// Opaque encoded input.
    pub input: String,
    pub state: WorkflowState,
    /// Encoded result when `Completed`, error string when `Failed`.
    pub response: Option<String>,
    pub utc_created: DateTime<Utc>,
    pub utc_updated: DateTime<Utc>,
    pub utc_eta: DateTime<Utc>,
    /// Set when spawned as a child workflow.
    pub parent_id: Option<String>,
    /// Activity id this workflow is blocked on, if any.
    pub current_waiting_id: Option<String>,
    pub etag: Etag,
}

impl WorkflowEntity {
    pub fn new(
        id: impl Into<String>,
        type_name: impl Into<String>,
        input: impl Into<String>,
        eta: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            input: input.into(),
            state: WorkflowState::Queued,
            response: None,
            utc_created: now,
            utc_updated: now,
            utc_eta: eta,
            parent_id: None,
            current_waiting_id: None,
            etag: 0,
        }
    }
}

/// One persisted durable call site.
///
/// `id` is unique within the owning workflow and stable across replays.
/// `sequence_id` is storage-assigned, strictly increasing per workflow, and
/// doubles as the execution-lease key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntity {
    pub id: String,
    pub workflow_id: String,
    /// Name used to re-resolve the handler in the activity registry.
    pub method: String,
    /// Opaque encoded argument tuple.
    pub parameters: String,
    pub state: ActivityState,
    pub response: Option<String>,
    pub utc_created: DateTime<Utc>,
    pub utc_updated: DateTime<Utc>,
    pub utc_eta: DateTime<Utc>,
    pub sequence_id: u64,
    pub etag: Etag,
}

impl ActivityEntity {
    pub fn new(
        id: impl Into<String>,
        workflow_id: impl Into<String>,
        method: impl Into<String>,
        parameters: impl Into<String>,
        eta: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            method: method.into(),
            parameters: parameters.into(),
            state: ActivityState::Queued,
            response: None,
            utc_created: now,
            utc_updated: now,
            utc_eta: eta,
            sequence_id: 0,
            etag: 0,
        }
    }
}

/// Secondary record keyed `(workflow_id, event_name)` pointing at the
/// activity currently subscribed to that name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRoute {
    pub workflow_id: String,
    pub event_name: String,
    pub activity_id: String,
}

/// Outcome of an external-event wait: the delivered `(name, value)` pair, or
/// `(None, None)` when the wait timed out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOutcome {
    pub name: Option<String>,
    pub value: Option<String>,
}

/// Identity for a call site that dedupes on arguments:
/// `hex(sha256(method | params))[..16]`.
pub fn unique_activity_id(method: &str, params: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"|");
    hasher.update(params.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Identity for a call site keyed by encounter order rather than arguments.
/// The counter is per method name within one replay, and replay determinism
/// makes it stable across runs.
pub fn sequenced_activity_id(method: &str, n: u64) -> String {
    format!("{method}#{n}")
}

/// Deterministic child workflow id: one child per type per parent.
pub fn child_workflow_id(parent_id: &str, child_type: &str) -> String {
    format!("{parent_id}::{child_type}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_id_is_stable_and_arg_sensitive() {
        let a = unique_activity_id("Charge", "{\"amount\":5}");
        let b = unique_activity_id("Charge", "{\"amount\":5}");
        let c = unique_activity_id("Charge", "{\"amount\":6}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn terminal_states() {
        assert!(WorkflowState::Completed.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(!WorkflowState::Suspended.is_terminal());
        assert!(ActivityState::Failed.is_terminal());
        assert!(!ActivityState::Queued.is_terminal());
    }
}
