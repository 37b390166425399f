//! Registries for workflow and activity handlers.
//!
//! Both registries are immutable once built and owned by the engine
//! instance: rehydrating a workflow after a restart is a plain name lookup,
//! and there is no process-global state. Typed registration wraps handlers
//! with the JSON codec so user code works with real types while storage only
//! ever sees opaque strings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::codec::Json;
use crate::runtime::context::{ActivityContext, WorkflowContext};
use crate::WorkflowError;

/// Trait implemented by workflow handlers the dispatcher can drive.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn invoke(&self, ctx: WorkflowContext, input: String) -> Result<String, WorkflowError>;
}

/// Function wrapper that implements `WorkflowHandler`.
pub struct FnWorkflow<F, Fut>(pub F)
where
    F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, WorkflowError>> + Send + 'static;

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F, Fut>
where
    F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, WorkflowError>> + Send + 'static,
{
    async fn invoke(&self, ctx: WorkflowContext, input: String) -> Result<String, WorkflowError> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers.
///
/// Activities are leaves: they may do arbitrary I/O but cannot schedule
/// durable work. Failures are plain strings; the engine persists them on the
/// activity entity and re-raises them as `ActivityFailed` on every replay.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, parameters: String) -> Result<String, String>;
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, parameters: String) -> Result<String, String> {
        (self.0)(ctx, parameters).await
    }
}

/// Per-type retention and history policy, supplied at registration.
#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    /// How long a completed workflow entity is retained before deletion.
    pub preserve_time: Duration,
    /// How long a failed workflow entity is retained before deletion.
    pub failure_preserve_time: Duration,
    /// Whether activity entities and event routes are dropped together with
    /// the workflow at garbage collection.
    pub delete_history: bool,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            preserve_time: Duration::from_secs(24 * 60 * 60),
            failure_preserve_time: Duration::from_secs(7 * 24 * 60 * 60),
            delete_history: true,
        }
    }
}

pub struct WorkflowRegistration {
    pub handler: Arc<dyn WorkflowHandler>,
    pub options: WorkflowOptions,
    /// Enqueued once per UTC day by the daily scheduler.
    pub daily: bool,
}

pub struct ActivityRegistration {
    pub handler: Arc<dyn ActivityHandler>,
    /// When true (the default) the activity's replay key is derived from its
    /// arguments; when false, from a per-replay call-site counter.
    pub unique_by_args: bool,
}

/// Immutable name → registration map for workflows.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    inner: Arc<HashMap<String, Arc<WorkflowRegistration>>>,
}

impl WorkflowRegistry {
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder { map: HashMap::new() }
    }

    pub fn resolve(&self, type_name: &str) -> Option<Arc<WorkflowRegistration>> {
        let found = self.inner.get(type_name).cloned();
        if found.is_none() {
            tracing::debug!(
                target: "tenacity::registry",
                type_name,
                registered = ?self.inner.keys().collect::<Vec<_>>(),
                "workflow type lookup miss"
            );
        }
        found
    }

    pub fn has(&self, type_name: &str) -> bool {
        self.inner.contains_key(type_name)
    }

    pub fn daily_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .iter()
            .filter(|(_, reg)| reg.daily)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

pub struct WorkflowRegistryBuilder {
    map: HashMap<String, Arc<WorkflowRegistration>>,
}

impl WorkflowRegistryBuilder {
    pub fn build(self) -> WorkflowRegistry {
        WorkflowRegistry {
            inner: Arc::new(self.map),
        }
    }

    /// Register a typed workflow handler under `type_name` with default
    /// options. Duplicate names panic: registration is wiring code and a
    /// clash is a deployment bug.
    pub fn register<In, Out, F, Fut>(self, type_name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        self.register_with(type_name, WorkflowOptions::default(), f)
    }

    pub fn register_with<In, Out, F, Fut>(
        mut self,
        type_name: impl Into<String>,
        options: WorkflowOptions,
        f: F,
    ) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        let type_name = type_name.into();
        self.insert(type_name, options, false, f);
        self
    }

    /// Register a workflow the daily scheduler enqueues once per UTC day.
    pub fn register_daily<In, Out, F, Fut>(
        mut self,
        type_name: impl Into<String>,
        options: WorkflowOptions,
        f: F,
    ) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        let type_name = type_name.into();
        self.insert(type_name, options, true, f);
        self
    }

    fn insert<In, Out, F, Fut>(&mut self, type_name: String, options: WorkflowOptions, daily: bool, f: F)
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        if self.map.contains_key(&type_name) {
            panic!("duplicate workflow registration: {type_name}");
        }
        let wrapper = move |ctx: WorkflowContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = Json::decode(&input_s).map_err(WorkflowError::fatal)?;
                let out: Out = f_inner(ctx, input).await?;
                Json::encode(&out).map_err(WorkflowError::fatal)
            }
        };
        self.map.insert(
            type_name,
            Arc::new(WorkflowRegistration {
                handler: Arc::new(FnWorkflow(wrapper)),
                options,
                daily,
            }),
        );
    }
}

/// Immutable name → registration map for activities.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    inner: Arc<HashMap<String, Arc<ActivityRegistration>>>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder { map: HashMap::new() }
    }

    pub fn resolve(&self, method: &str) -> Option<Arc<ActivityRegistration>> {
        let found = self.inner.get(method).cloned();
        if found.is_none() {
            tracing::debug!(
                target: "tenacity::registry",
                method,
                registered = ?self.inner.keys().collect::<Vec<_>>(),
                "activity lookup miss"
            );
        }
        found
    }
}

pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<ActivityRegistration>>,
}

impl ActivityRegistryBuilder {
    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }

    /// Register a typed activity keyed by its arguments (the default):
    /// calling it twice with the same arguments replays one record.
    pub fn register<In, Out, F, Fut>(self, method: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.insert(method.into(), true, f)
    }

    /// Register an activity keyed by call-site order instead of arguments:
    /// every textual call gets its own record even with identical inputs.
    pub fn register_unkeyed<In, Out, F, Fut>(self, method: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.insert(method.into(), false, f)
    }

    fn insert<In, Out, F, Fut>(mut self, method: String, unique_by_args: bool, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        if self.map.contains_key(&method) {
            panic!("duplicate activity registration: {method}");
        }
        let wrapper = move |ctx: ActivityContext, params_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = Json::decode(&params_s)?;
                let out: Out = f_inner(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.map.insert(
            method,
            Arc::new(ActivityRegistration {
                handler: Arc::new(FnActivity(wrapper)),
                unique_by_args,
            }),
        );
        self
    }
}
