//! Engine assembly: configuration, shared plumbing, and lifecycle.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::clock::{SharedClock, SystemClock};
use crate::storage::Storage;

pub mod context;
pub(crate) mod daily;
pub(crate) mod dispatcher;
pub mod registry;
pub(crate) mod scheduler;

use registry::{ActivityRegistry, WorkflowRegistry};
use scheduler::WorkScheduler;

/// Engine tuning knobs. The defaults match the documented semantics:
/// a 15 s poll interval, a 15 s suspend threshold (anything due sooner is
/// waited out in-process), and at most 100 workflows in flight.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Upper bound on dispatcher sleep between polls; external triggers cut
    /// it short.
    pub poll_interval: Duration,
    /// Maximum entities claimed per poll.
    pub max_batch: usize,
    /// In-process parallelism bound across workflow instances.
    pub max_parallel_workflows: usize,
    /// ETAs further away than this suspend the workflow instead of sleeping
    /// in-process.
    pub suspend_threshold: Duration,
    /// Re-examination interval for a parent waiting on a child, in case the
    /// child's completion bump is lost.
    pub child_wait_backstop: Duration,
    /// Bounded retries for optimistic-concurrency saves.
    pub save_retry_attempts: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            max_batch: 32,
            max_parallel_workflows: 100,
            suspend_threshold: Duration::from_secs(15),
            child_wait_backstop: Duration::from_secs(60),
            save_retry_attempts: 5,
        }
    }
}

/// Type-map of shared dependencies resolvable from activity code.
///
/// Bindings are resolved at activity-run time with a plain map lookup; most
/// activities simply capture what they need, the scope exists for resources
/// shared process-wide (connection pools, API clients).
#[derive(Default)]
pub struct DependencyScope {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl DependencyScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provide<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.entries.insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    pub fn resolve<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|entry| entry.downcast::<T>().ok())
    }
}

/// Everything the dispatcher, contexts, and client share.
pub(crate) struct Shared {
    pub storage: Arc<dyn Storage>,
    pub clock: SharedClock,
    pub workflows: WorkflowRegistry,
    pub activities: ActivityRegistry,
    pub scope: Arc<DependencyScope>,
    /// Woken by `create*` and `raise_event` so due work is picked up without
    /// waiting out the poll interval.
    pub trigger: Arc<Notify>,
    pub options: EngineOptions,
}

/// The durable workflow engine: background dispatcher plus daily scheduler
/// over a storage backend.
pub struct Engine {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Start with the system clock, an empty dependency scope, and default
    /// options.
    pub async fn start(
        storage: Arc<dyn Storage>,
        workflows: WorkflowRegistry,
        activities: ActivityRegistry,
    ) -> Arc<Self> {
        Self::start_with(
            storage,
            workflows,
            activities,
            Arc::new(SystemClock),
            DependencyScope::default(),
            EngineOptions::default(),
        )
        .await
    }

    pub async fn start_with(
        storage: Arc<dyn Storage>,
        workflows: WorkflowRegistry,
        activities: ActivityRegistry,
        clock: SharedClock,
        scope: DependencyScope,
        options: EngineOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times).
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let shared = Arc::new(Shared {
            storage,
            clock,
            workflows,
            activities,
            scope: Arc::new(scope),
            trigger: Arc::new(Notify::new()),
            options,
        });

        let engine = Arc::new(Self {
            shared: shared.clone(),
            cancel: CancellationToken::new(),
            joins: Mutex::new(Vec::new()),
        });

        let work_scheduler = WorkScheduler::new(shared.options.max_parallel_workflows);
        let dispatcher_handle =
            dispatcher::start_dispatcher(shared.clone(), work_scheduler, engine.cancel.clone());
        let daily_handle = daily::start_daily_scheduler(shared.clone(), engine.cancel.clone());
        {
            let mut joins = engine.joins.lock().await;
            joins.push(dispatcher_handle);
            joins.push(daily_handle);
        }

        engine
    }

    /// Client handle wired to this engine's trigger, so creates and raised
    /// events wake the dispatcher immediately.
    pub fn client(&self) -> Client {
        Client::from_parts(
            self.shared.storage.clone(),
            self.shared.clock.clone(),
            self.shared.trigger.clone(),
        )
    }

    /// Stop claiming work and wait for background tasks. In-flight activity
    /// invocations are not interrupted; the current batch drains.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.shared.trigger.notify_waiters();
        let mut joins = self.joins.lock().await;
        for handle in joins.drain(..) {
            let _ = handle.await;
        }
    }
}
