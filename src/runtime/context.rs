//! Workflow and activity execution contexts.
//!
//! [`WorkflowContext`] is the replay engine. Every durable primitive follows
//! the same shape: derive the deterministic activity key, consult storage,
//! and only do real work when no terminal record exists. A completed record
//! short-circuits the call and advances the workflow's virtual clock; a far
//! ETA persists the workflow's revival time and unwinds the whole run with
//! [`WorkflowError::Suspended`].
//!
//! Within one workflow instance execution is single-threaded; the context's
//! internal mutex only bridges the dispatcher's view of the entity with the
//! handler's.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Json;
use crate::model::{
    child_workflow_id, sequenced_activity_id, unique_activity_id, ActivityEntity, ActivityState,
    EventOutcome, EventRoute, WorkflowEntity, WorkflowState, DELAY_METHOD, WAIT_EVENTS_METHOD,
};
use crate::runtime::registry::ActivityRegistration;
use crate::runtime::{DependencyScope, Shared};
use crate::storage::{LockHandle, StorageError};
use crate::WorkflowError;

const SAVE_ATTEMPTS: u32 = 5;
const EVENT_POLL_SLICE: StdDuration = StdDuration::from_millis(250);

struct CtxState {
    entity: WorkflowEntity,
    virtual_now: DateTime<Utc>,
    sequence_counters: HashMap<String, u64>,
    in_activity: bool,
    /// Set once this run performs any non-replayed work; gates trace output.
    live_work: bool,
}

/// Handle given to workflow orchestration code for scheduling durable work.
#[derive(Clone)]
pub struct WorkflowContext {
    shared: Arc<Shared>,
    state: Arc<Mutex<CtxState>>,
}

impl WorkflowContext {
    pub(crate) fn new(shared: Arc<Shared>, entity: WorkflowEntity) -> Self {
        let virtual_now = entity.utc_created;
        Self {
            shared,
            state: Arc::new(Mutex::new(CtxState {
                entity,
                virtual_now,
                sequence_counters: HashMap::new(),
                in_activity: false,
                live_work: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxState> {
        self.state.lock().expect("workflow context mutex poisoned")
    }

    pub fn workflow_id(&self) -> String {
        self.lock().entity.id.clone()
    }

    pub fn workflow_type(&self) -> String {
        self.lock().entity.type_name.clone()
    }

    /// Deterministic "now": the workflow's creation time, advanced to each
    /// consumed primitive's completion time. Identical across replays.
    pub fn current_utc(&self) -> DateTime<Utc> {
        self.lock().virtual_now
    }

    /// True while this run is still consuming previously persisted results.
    pub fn is_replaying(&self) -> bool {
        !self.lock().live_work
    }

    pub(crate) fn entity_snapshot(&self) -> WorkflowEntity {
        self.lock().entity.clone()
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        if self.is_replaying() {
            return;
        }
        let (id, ty) = self.identity();
        tracing::info!(target: "tenacity::workflow", workflow_id = %id, workflow_type = %ty, "{}", message.into());
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        if self.is_replaying() {
            return;
        }
        let (id, ty) = self.identity();
        tracing::warn!(target: "tenacity::workflow", workflow_id = %id, workflow_type = %ty, "{}", message.into());
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        if self.is_replaying() {
            return;
        }
        let (id, ty) = self.identity();
        tracing::error!(target: "tenacity::workflow", workflow_id = %id, workflow_type = %ty, "{}", message.into());
    }

    fn identity(&self) -> (String, String) {
        let g = self.lock();
        (g.entity.id.clone(), g.entity.type_name.clone())
    }

    // ========================================================================
    // Durable primitives
    // ========================================================================

    /// Schedule an activity and return its decoded result, short-circuited by
    /// the persisted record on replay. A stored failure is re-raised as
    /// [`WorkflowError::ActivityFailed`] on every replay at this call site.
    pub async fn schedule_activity<Out, In>(&self, method: &str, args: &In) -> Result<Out, WorkflowError>
    where
        Out: DeserializeOwned,
        In: Serialize + ?Sized,
    {
        let eta = self.current_utc();
        self.schedule_activity_at(method, args, eta).await
    }

    /// Schedule an activity that must not run before `eta`. A far ETA
    /// suspends the workflow until it is due.
    pub async fn schedule_activity_at<Out, In>(
        &self,
        method: &str,
        args: &In,
        eta: DateTime<Utc>,
    ) -> Result<Out, WorkflowError>
    where
        Out: DeserializeOwned,
        In: Serialize + ?Sized,
    {
        self.ensure_orchestrating()?;
        let params = Json::encode(args).map_err(WorkflowError::fatal)?;
        let registration = self
            .shared
            .activities
            .resolve(method)
            .ok_or_else(|| WorkflowError::fatal(format!("unknown activity: {method}")))?;
        let key = if registration.unique_by_args {
            unique_activity_id(method, &params)
        } else {
            self.next_sequence_key(method)
        };
        let raw = self
            .run_keyed_activity(method, &key, &params, eta, Some(registration))
            .await?;
        Json::decode(&raw).map_err(WorkflowError::fatal)
    }

    /// Durable timer: suspends until `current_utc() + duration` has passed.
    pub async fn delay(&self, duration: StdDuration) -> Result<(), WorkflowError> {
        let span = ChronoDuration::from_std(duration)
            .map_err(|e| WorkflowError::fatal(format!("delay out of range: {e}")))?;
        self.delay_until(self.current_utc() + span).await
    }

    /// Durable timer with an absolute due time. The key incorporates `until`,
    /// so distinct due times are distinct durable records.
    pub async fn delay_until(&self, until: DateTime<Utc>) -> Result<(), WorkflowError> {
        self.ensure_orchestrating()?;
        let params = Json::encode(&until).map_err(WorkflowError::fatal)?;
        let key = unique_activity_id(DELAY_METHOD, &params);
        self.run_keyed_activity(DELAY_METHOD, &key, &params, until, None)
            .await?;
        Ok(())
    }

    /// Wait for any of `names` to be raised against this workflow, up to
    /// `max_wait`. Returns the delivered `(name, value)` pair, or an empty
    /// outcome on timeout. Keyed by call-site order, so the same names can be
    /// awaited repeatedly.
    pub async fn wait_for_events(
        &self,
        names: &[&str],
        max_wait: StdDuration,
    ) -> Result<EventOutcome, WorkflowError> {
        self.ensure_orchestrating()?;
        let span = ChronoDuration::from_std(max_wait)
            .map_err(|e| WorkflowError::fatal(format!("max_wait out of range: {e}")))?;
        let until = self.current_utc() + span;
        let key = self.next_sequence_key(WAIT_EVENTS_METHOD);
        let names_owned: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let params = Json::encode(&names_owned).map_err(WorkflowError::fatal)?;

        loop {
            let act = match self.load_activity(&key).await? {
                Some(a) if a.state == ActivityState::Completed => {
                    let raw = self.consume_completed(&a);
                    return Json::decode(&raw).map_err(WorkflowError::fatal);
                }
                Some(a) if a.state == ActivityState::Failed => {
                    return Err(WorkflowError::ActivityFailed {
                        message: a.response.unwrap_or_default(),
                    });
                }
                Some(a) => a,
                None => {
                    let workflow_id = self.workflow_id();
                    let routes: Vec<EventRoute> = names_owned
                        .iter()
                        .map(|name| EventRoute {
                            workflow_id: workflow_id.clone(),
                            event_name: name.clone(),
                            activity_id: key.clone(),
                        })
                        .collect();
                    self.create_waiting_activity(&key, &params, until, &routes).await?;
                    continue;
                }
            };

            self.mark_live();
            let now = self.shared.clock.now_utc();
            let remaining = act.utc_eta - now;
            if remaining > self.suspend_threshold() {
                // Re-arm the waiting pointer before unwinding; the event and
                // the timeout both revive through utc_eta.
                let waiting_key = key.clone();
                let eta = act.utc_eta;
                self.save_entity_with(move |wf| {
                    wf.current_waiting_id = Some(waiting_key.clone());
                    wf.utc_eta = eta;
                })
                .await?;
                // An event raised in the save window already completed the
                // activity; consume it instead of suspending.
                if let Some(latest) = self.load_activity(&key).await? {
                    if latest.state.is_terminal() {
                        continue;
                    }
                }
                return Err(WorkflowError::Suspended);
            }
            if remaining > ChronoDuration::zero() {
                // Short slices so an in-process wait observes a raised event
                // promptly instead of sleeping out the full window.
                let slice = remaining.to_std().unwrap_or_default().min(EVENT_POLL_SLICE);
                tokio::time::sleep(slice).await;
                continue;
            }

            // Timed out with no delivery: the workflow itself writes the
            // timeout completion. Losing the race to raise_event is fine, the
            // next lookup returns whatever got persisted first.
            let mut act = act;
            let lease = self.acquire_lease(act.sequence_id).await?;
            let timeout_payload = Json::encode(&EventOutcome::default()).map_err(WorkflowError::fatal)?;
            let _won = self.finish_activity(&mut act, Ok(timeout_payload), true).await?;
            let _ = self.shared.storage.release_lock(&lease).await;
        }
    }

    /// Spawn (or replay) a child workflow and await its result. The child id
    /// is deterministic on parent id and child type: one child per type per
    /// parent. The parent suspends until the child reaches a terminal state;
    /// child termination bumps the parent's ETA for a prompt wake-up.
    pub async fn schedule_child_workflow<Out, In>(
        &self,
        type_name: &str,
        input: &In,
    ) -> Result<Out, WorkflowError>
    where
        Out: DeserializeOwned,
        In: Serialize + ?Sized,
    {
        self.ensure_orchestrating()?;
        if !self.shared.workflows.has(type_name) {
            return Err(WorkflowError::fatal(format!("unknown workflow type: {type_name}")));
        }
        let parent_id = self.workflow_id();
        let child_id = child_workflow_id(&parent_id, type_name);

        loop {
            let child = self
                .shared
                .storage
                .get_workflow(&child_id)
                .await
                .map_err(Self::storage_err)?;
            match child {
                None => {
                    let now = self.shared.clock.now_utc();
                    let encoded = Json::encode(input).map_err(WorkflowError::fatal)?;
                    let mut entity = WorkflowEntity::new(child_id.clone(), type_name, encoded, now, now);
                    entity.parent_id = Some(parent_id.clone());
                    match self.shared.storage.insert_workflow(&entity).await {
                        Ok(()) => self.shared.trigger.notify_one(),
                        Err(e) if e.is_conflict() => {}
                        Err(e) => return Err(Self::storage_err(e)),
                    }
                    continue;
                }
                Some(child) if child.state == WorkflowState::Completed => {
                    self.advance_virtual_clock(child.utc_updated);
                    let raw = child.response.unwrap_or_else(|| "null".to_string());
                    return Json::decode(&raw).map_err(WorkflowError::fatal);
                }
                Some(child) if child.state == WorkflowState::Failed => {
                    return Err(WorkflowError::ActivityFailed {
                        message: child.response.unwrap_or_default(),
                    });
                }
                Some(_) => {
                    self.mark_live();
                    let backstop = self.shared.clock.now_utc()
                        + ChronoDuration::from_std(self.shared.options.child_wait_backstop)
                            .unwrap_or_else(|_| ChronoDuration::seconds(60));
                    self.save_entity_with(move |wf| wf.utc_eta = backstop).await?;
                    // Cheap recheck closes the terminal-during-save window.
                    if let Some(c) = self
                        .shared
                        .storage
                        .get_workflow(&child_id)
                        .await
                        .map_err(Self::storage_err)?
                    {
                        if c.state.is_terminal() {
                            continue;
                        }
                    }
                    return Err(WorkflowError::Suspended);
                }
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Lookup-first execution loop shared by activities and timers.
    /// `registration = None` runs no handler and completes with `"null"`
    /// (timers).
    async fn run_keyed_activity(
        &self,
        method: &str,
        key: &str,
        params: &str,
        eta: DateTime<Utc>,
        registration: Option<Arc<ActivityRegistration>>,
    ) -> Result<String, WorkflowError> {
        loop {
            let mut act = match self.load_activity(key).await? {
                Some(a) if a.state == ActivityState::Completed => {
                    return Ok(self.consume_completed(&a));
                }
                Some(a) if a.state == ActivityState::Failed => {
                    return Err(WorkflowError::ActivityFailed {
                        message: a.response.unwrap_or_default(),
                    });
                }
                Some(a) => a,
                None => {
                    self.create_activity(key, method, params, eta).await?;
                    continue;
                }
            };

            self.mark_live();
            let lease = self.acquire_lease(act.sequence_id).await?;
            let now = self.shared.clock.now_utc();
            let remaining = act.utc_eta - now;
            if remaining > self.suspend_threshold() {
                let _ = self.shared.storage.release_lock(&lease).await;
                let due = act.utc_eta;
                self.save_entity_with(move |wf| wf.utc_eta = due).await?;
                return Err(WorkflowError::Suspended);
            }
            if remaining > ChronoDuration::zero() {
                // Near-term ETA: wait in-process rather than paying a
                // suspend/replay round trip.
                tokio::time::sleep(remaining.to_std().unwrap_or_default()).await;
            }

            let outcome = match &registration {
                Some(reg) => {
                    self.set_in_activity(true);
                    let actx = ActivityContext {
                        workflow_id: act.workflow_id.clone(),
                        workflow_type: self.workflow_type(),
                        method: method.to_string(),
                        sequence_id: act.sequence_id,
                        scope: self.shared.scope.clone(),
                    };
                    let result = reg.handler.invoke(actx, params.to_string()).await;
                    self.set_in_activity(false);
                    result
                }
                None => Ok("null".to_string()),
            };

            let _won = self.finish_activity(&mut act, outcome, false).await?;
            let _ = self.shared.storage.release_lock(&lease).await;
            // Loop back to the lookup; the next pass consumes the terminal
            // record (or re-raises its failure).
        }
    }

    fn ensure_orchestrating(&self) -> Result<(), WorkflowError> {
        if self.lock().in_activity {
            return Err(WorkflowError::fatal(
                "durable primitive invoked while an activity is running; activities must be leaves",
            ));
        }
        Ok(())
    }

    fn set_in_activity(&self, value: bool) {
        self.lock().in_activity = value;
    }

    fn mark_live(&self) {
        self.lock().live_work = true;
    }

    fn next_sequence_key(&self, method: &str) -> String {
        let mut g = self.lock();
        let counter = g.sequence_counters.entry(method.to_string()).or_insert(0);
        let n = *counter;
        *counter += 1;
        sequenced_activity_id(method, n)
    }

    fn advance_virtual_clock(&self, to: DateTime<Utc>) {
        let mut g = self.lock();
        if to > g.virtual_now {
            g.virtual_now = to;
        }
    }

    fn consume_completed(&self, act: &ActivityEntity) -> String {
        self.advance_virtual_clock(act.utc_updated);
        act.response.clone().unwrap_or_else(|| "null".to_string())
    }

    fn suspend_threshold(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.shared.options.suspend_threshold)
            .unwrap_or_else(|_| ChronoDuration::seconds(15))
    }

    fn storage_err(e: StorageError) -> WorkflowError {
        WorkflowError::fatal(format!("storage error: {e}"))
    }

    async fn load_activity(&self, key: &str) -> Result<Option<ActivityEntity>, WorkflowError> {
        let workflow_id = self.workflow_id();
        self.shared
            .storage
            .get_activity(&workflow_id, key)
            .await
            .map_err(Self::storage_err)
    }

    async fn acquire_lease(&self, sequence_id: u64) -> Result<LockHandle, WorkflowError> {
        let workflow_id = self.workflow_id();
        self.shared
            .storage
            .acquire_lock(&workflow_id, sequence_id)
            .await
            .map_err(Self::storage_err)
    }

    async fn create_activity(
        &self,
        key: &str,
        method: &str,
        params: &str,
        eta: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        let now = self.shared.clock.now_utc();
        let workflow_id = self.workflow_id();
        let mut act = ActivityEntity::new(key, workflow_id, method, params, eta, now);
        match self.shared.storage.insert_activity(&mut act, &[], None).await {
            Ok(()) => Ok(()),
            // Another replica created it first; the caller re-reads.
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(Self::storage_err(e)),
        }
    }

    async fn create_waiting_activity(
        &self,
        key: &str,
        params: &str,
        until: DateTime<Utc>,
        routes: &[EventRoute],
    ) -> Result<(), WorkflowError> {
        let now = self.shared.clock.now_utc();
        let workflow_id = self.workflow_id();
        let mut act = ActivityEntity::new(key, workflow_id, WAIT_EVENTS_METHOD, params, until, now);
        for attempt in 0..SAVE_ATTEMPTS {
            let mut wf = self.entity_snapshot();
            wf.current_waiting_id = Some(key.to_string());
            wf.utc_eta = until;
            wf.utc_updated = now;
            match self
                .shared
                .storage
                .insert_activity(&mut act, routes, Some(&mut wf))
                .await
            {
                Ok(()) => {
                    self.replace_entity(wf);
                    return Ok(());
                }
                Err(e) if e.is_conflict() && !e.is_retryable() => return Ok(()),
                Err(e) if e.is_retryable() && attempt + 1 < SAVE_ATTEMPTS => {
                    if e.is_conflict() {
                        self.refresh_entity().await?;
                    }
                    tokio::time::sleep(StdDuration::from_millis(10 << attempt)).await;
                }
                Err(e) => return Err(Self::storage_err(e)),
            }
        }
        Err(WorkflowError::fatal("persistent contention creating event wait"))
    }

    /// Save the workflow entity with `mutate` applied, retrying bounded
    /// contention by reloading and reapplying.
    async fn save_entity_with<F>(&self, mutate: F) -> Result<(), WorkflowError>
    where
        F: Fn(&mut WorkflowEntity),
    {
        for attempt in 0..SAVE_ATTEMPTS {
            let mut wf = self.entity_snapshot();
            mutate(&mut wf);
            wf.utc_updated = self.shared.clock.now_utc();
            match self.shared.storage.update_workflow(&mut wf).await {
                Ok(()) => {
                    self.replace_entity(wf);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt + 1 < SAVE_ATTEMPTS => {
                    if e.is_conflict() {
                        self.refresh_entity().await?;
                    }
                    tokio::time::sleep(StdDuration::from_millis(10 << attempt)).await;
                }
                Err(e) => return Err(Self::storage_err(e)),
            }
        }
        Err(WorkflowError::fatal("persistent contention saving workflow"))
    }

    /// Persist an activity outcome atomically with the workflow entity.
    /// Returns `false` when another writer made the activity terminal first.
    async fn finish_activity(
        &self,
        act: &mut ActivityEntity,
        response: Result<String, String>,
        clear_waiting: bool,
    ) -> Result<bool, WorkflowError> {
        let (state, payload) = match response {
            Ok(r) => (ActivityState::Completed, r),
            Err(m) => (ActivityState::Failed, m),
        };
        for attempt in 0..SAVE_ATTEMPTS {
            let now = self.shared.clock.now_utc();
            act.state = state;
            act.response = Some(payload.clone());
            act.utc_updated = now;
            let mut wf = self.entity_snapshot();
            if clear_waiting {
                wf.current_waiting_id = None;
            }
            wf.utc_updated = now;
            match self.shared.storage.update_activity_and_workflow(act, &mut wf).await {
                Ok(()) => {
                    self.replace_entity(wf);
                    return Ok(true);
                }
                Err(e) if e.is_conflict() => {
                    match self.load_activity(&act.id).await? {
                        Some(latest) if latest.state.is_terminal() => return Ok(false),
                        Some(latest) => *act = latest,
                        None => {
                            return Err(WorkflowError::fatal(format!(
                                "activity vanished during save: {}",
                                act.id
                            )))
                        }
                    }
                    self.refresh_entity().await?;
                }
                Err(e) if e.is_retryable() && attempt + 1 < SAVE_ATTEMPTS => {
                    tokio::time::sleep(StdDuration::from_millis(10 << attempt)).await;
                }
                Err(e) => return Err(Self::storage_err(e)),
            }
        }
        Err(WorkflowError::fatal("persistent contention finishing activity"))
    }

    fn replace_entity(&self, entity: WorkflowEntity) {
        self.lock().entity = entity;
    }

    async fn refresh_entity(&self) -> Result<(), WorkflowError> {
        let id = self.workflow_id();
        match self
            .shared
            .storage
            .get_workflow(&id)
            .await
            .map_err(Self::storage_err)?
        {
            Some(latest) => {
                self.replace_entity(latest);
                Ok(())
            }
            None => Err(WorkflowError::fatal(format!("workflow entity disappeared: {id}"))),
        }
    }
}

/// Context handed to activity handlers.
///
/// Activities are leaf nodes: they cannot schedule durable work, but they can
/// emit correlated logs and resolve shared dependencies from the engine's
/// [`DependencyScope`].
#[derive(Clone)]
pub struct ActivityContext {
    workflow_id: String,
    workflow_type: String,
    method: String,
    sequence_id: u64,
    scope: Arc<DependencyScope>,
}

impl ActivityContext {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    /// Resolve a shared dependency registered on the engine.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.scope.resolve::<T>()
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "tenacity::activity",
            workflow_id = %self.workflow_id,
            workflow_type = %self.workflow_type,
            method = %self.method,
            sequence_id = %self.sequence_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        tracing::warn!(
            target: "tenacity::activity",
            workflow_id = %self.workflow_id,
            workflow_type = %self.workflow_type,
            method = %self.method,
            sequence_id = %self.sequence_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        tracing::error!(
            target: "tenacity::activity",
            workflow_id = %self.workflow_id,
            workflow_type = %self.workflow_type,
            method = %self.method,
            sequence_id = %self.sequence_id,
            "{}",
            message.into()
        );
    }
}
