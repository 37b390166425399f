//! # Tenacity: durable workflow engine
//!
//! Tenacity executes long-running, user-defined procedures whose progress
//! survives process restarts and crashes. A workflow interleaves
//! deterministic orchestration code with side-effecting *activities*; every
//! activity outcome is persisted before the workflow observes it, so
//! re-running the workflow (after a crash, or after suspending for a timer)
//! deterministically replays to the point where new work is required.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tenacity::storage::InMemoryStorage;
//! use tenacity::{ActivityRegistry, Engine, WorkflowContext, WorkflowRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // 1. Register activities (your side effects)
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx, name: String| async move {
//!         Ok(format!("Hello, {name}!"))
//!     })
//!     .build();
//!
//! // 2. Register workflows (your orchestration logic)
//! let workflows = WorkflowRegistry::builder()
//!     .register("HelloWorld", |ctx: WorkflowContext, name: String| async move {
//!         let greeting: String = ctx.schedule_activity("Greet", &name).await?;
//!         Ok(greeting)
//!     })
//!     .build();
//!
//! // 3. Start the engine over a storage backend
//! let storage = Arc::new(InMemoryStorage::new());
//! let engine = Engine::start(storage, workflows, activities).await;
//!
//! // 4. Create an instance and wait for it
//! let client = engine.client();
//! let id = client.create("HelloWorld", &"World").await?;
//! let status = client.wait_for_workflow(&id, std::time::Duration::from_secs(5)).await?;
//! println!("{:?}", status.result);
//! # Ok(())
//! # }
//! ```
//!
//! ## Key concepts
//!
//! - **Workflows**: orchestration functions, replayed deterministically from
//!   their persisted activity records. Control flow, decisions, waiting.
//! - **Activities**: single-purpose side effects (DB calls, API calls).
//!   Executed at most once per durable call site; results are persisted.
//! - **Durable primitives**: `schedule_activity`, `delay`,
//!   `wait_for_events`, `schedule_child_workflow`. Each is a commit point
//!   that consults storage before doing real work.
//! - **Suspension**: a primitive whose due time is far away persists the
//!   workflow's ETA and unwinds with [`WorkflowError::Suspended`]; the
//!   dispatcher re-drives the workflow when the ETA comes due.
//! - **Virtual clock**: [`WorkflowContext::current_utc`] is deterministic
//!   across replays; it advances only when a durable primitive completes.

use serde::{Deserialize, Serialize};

pub mod client;
pub mod clock;
pub mod model;
pub mod runtime;
pub mod storage;

pub use client::{Client, ClientError, WaitError, WorkflowStatus};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use model::{
    ActivityEntity, ActivityState, EventOutcome, EventRoute, WorkflowEntity, WorkflowState,
};
pub use runtime::context::{ActivityContext, WorkflowContext};
pub use runtime::registry::{
    ActivityRegistry, ActivityRegistryBuilder, WorkflowOptions, WorkflowRegistry,
    WorkflowRegistryBuilder,
};
pub use runtime::{DependencyScope, Engine, EngineOptions};

/// Error type flowing through workflow orchestration code.
///
/// Only [`WorkflowError::ActivityFailed`] is meant to be observed and
/// handled by workflow authors. [`WorkflowError::Suspended`] is the engine's
/// own non-local exit: a durable primitive raises it to unwind the workflow
/// so the dispatcher can save it and re-drive it later. User code propagates
/// it with `?` and never matches on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowError {
    /// Internal signal: unwind, save, re-drive when the ETA is due.
    /// Never surfaces to callers and is never logged as an error.
    Suspended,
    /// A durable, terminal failure of a single activity. Stored on the
    /// activity entity and re-raised on every replay at that call site.
    ActivityFailed { message: String },
    /// Serialization errors, unknown types, leaf-rule violations. The
    /// workflow is marked `Failed` with this diagnostic.
    Fatal { message: String },
}

impl WorkflowError {
    pub fn fatal(message: impl Into<String>) -> Self {
        WorkflowError::Fatal {
            message: message.into(),
        }
    }

    /// True for the engine's internal suspension signal.
    pub fn is_suspension(&self) -> bool {
        matches!(self, WorkflowError::Suspended)
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowError::Suspended => write!(f, "workflow suspended"),
            WorkflowError::ActivityFailed { message } => write!(f, "activity failed: {message}"),
            WorkflowError::Fatal { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<String> for WorkflowError {
    fn from(message: String) -> Self {
        WorkflowError::Fatal { message }
    }
}

impl From<&str> for WorkflowError {
    fn from(message: &str) -> Self {
        WorkflowError::Fatal {
            message: message.to_string(),
        }
    }
}

// Internal codec for typed I/O. Payloads are opaque strings to storage; the
// registries and context decode at the boundary.
pub(crate) mod codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;

    pub struct Json;

    impl Json {
        /// Plain JSON strings are stored raw so results read naturally in
        /// status queries and logs.
        pub fn encode<T: Serialize + ?Sized>(v: &T) -> Result<String, String> {
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }

        pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    // Raw string stored by encode(); re-wrap and try again.
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn strings_round_trip_raw() {
            let enc = Json::encode(&"hi".to_string()).unwrap();
            assert_eq!(enc, "hi");
            let dec: String = Json::decode(&enc).unwrap();
            assert_eq!(dec, "hi");
        }

        #[test]
        fn structs_round_trip_as_json() {
            #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
            struct P {
                n: u32,
            }
            let enc = Json::encode(&P { n: 7 }).unwrap();
            assert_eq!(enc, "{\"n\":7}");
            let dec: P = Json::decode(&enc).unwrap();
            assert_eq!(dec, P { n: 7 });
        }

        #[test]
        fn unit_encodes_as_null() {
            assert_eq!(Json::encode(&()).unwrap(), "null");
            let _: () = Json::decode("null").unwrap();
        }
    }
}
