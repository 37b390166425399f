//! External event delivery, routing, and the daily scheduler.

use std::sync::Arc;
use std::time::Duration;

use tenacity::storage::InMemoryStorage;
use tenacity::{
    ActivityRegistry, ClientError, DependencyScope, Engine, ManualClock, SystemClock,
    WorkflowContext, WorkflowError, WorkflowRegistry, WorkflowState,
};

mod common;

async fn start_engine(
    storage: Arc<InMemoryStorage>,
    workflows: WorkflowRegistry,
) -> Arc<Engine> {
    Engine::start_with(
        storage,
        workflows,
        ActivityRegistry::builder().build(),
        Arc::new(SystemClock),
        DependencyScope::new(),
        common::fast_options(),
    )
    .await
}

fn approval_workflow() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register("Approval", |ctx: WorkflowContext, _input: String| async move {
            let outcome = ctx.wait_for_events(&["approve"], Duration::from_secs(10)).await?;
            Ok::<_, WorkflowError>(outcome.value)
        })
        .build()
}

#[tokio::test]
async fn first_event_delivery_wins() {
    let storage = Arc::new(InMemoryStorage::new());
    let engine = start_engine(storage, approval_workflow()).await;
    let client = engine.client();

    let id = client.create("Approval", "").await.unwrap();
    assert!(common::wait_for_state(&client, &id, WorkflowState::Suspended, 2_000).await);

    client.raise_event(&id, "approve", "first", false).await.unwrap();
    // The wait is terminal after the first completion; the second value must
    // not take effect.
    client.raise_event(&id, "approve", "second", false).await.unwrap();

    let status = client.wait_for_workflow(&id, Duration::from_secs(3)).await.unwrap();
    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.result.as_deref(), Some("first"));

    engine.shutdown().await;
}

#[tokio::test]
async fn raise_event_misses_are_silent_unless_asked() {
    let storage = Arc::new(InMemoryStorage::new());
    let workflows = WorkflowRegistry::builder()
        .register("Echo", |_ctx: WorkflowContext, input: String| async move {
            Ok::<_, WorkflowError>(input)
        })
        .build();
    let engine = start_engine(storage, workflows).await;
    let client = engine.client();

    // Unknown workflow id.
    assert!(matches!(
        client.raise_event("nope", "approve", "x", true).await,
        Err(ClientError::NotFound(_))
    ));
    client.raise_event("nope", "approve", "x", false).await.unwrap();

    // Known workflow that never waited for events.
    let id = client.create("Echo", "hi").await.unwrap();
    client.wait_for_workflow(&id, Duration::from_secs(5)).await.unwrap();
    assert!(matches!(
        client.raise_event(&id, "approve", "x", true).await,
        Err(ClientError::NotWaiting(_))
    ));
    client.raise_event(&id, "approve", "x", false).await.unwrap();

    engine.shutdown().await;
}

#[tokio::test]
async fn matching_event_name_is_returned_to_the_workflow() {
    let storage = Arc::new(InMemoryStorage::new());
    let workflows = WorkflowRegistry::builder()
        .register("EitherOf", |ctx: WorkflowContext, _input: String| async move {
            let outcome = ctx
                .wait_for_events(&["approve", "reject"], Duration::from_secs(10))
                .await?;
            Ok::<_, WorkflowError>(format!(
                "{}={}",
                outcome.name.unwrap_or_default(),
                outcome.value.unwrap_or_default()
            ))
        })
        .build();
    let engine = start_engine(storage, workflows).await;
    let client = engine.client();

    let id = client.create("EitherOf", "").await.unwrap();
    assert!(common::wait_for_state(&client, &id, WorkflowState::Suspended, 2_000).await);

    client.raise_event(&id, "reject", "too-slow", true).await.unwrap();

    let status = client.wait_for_workflow(&id, Duration::from_secs(3)).await.unwrap();
    assert_eq!(status.result.as_deref(), Some("reject=too-slow"));

    engine.shutdown().await;
}

#[tokio::test]
async fn create_unique_rejects_duplicates_and_create_is_idempotent() {
    let storage = Arc::new(InMemoryStorage::new());
    let workflows = WorkflowRegistry::builder()
        .register("Echo", |_ctx: WorkflowContext, input: String| async move {
            Ok::<_, WorkflowError>(input)
        })
        .build();
    let engine = start_engine(storage, workflows).await;
    let client = engine.client();

    let id = client.create_unique("Echo", "one", "fixed-id").await.unwrap();
    assert_eq!(id, "fixed-id");
    assert!(matches!(
        client.create_unique("Echo", "two", "fixed-id").await,
        Err(ClientError::AlreadyExists(_))
    ));

    // Plain create with the same id silently keeps the existing instance.
    let again = client.create_with_id("Echo", "three", "fixed-id").await.unwrap();
    assert_eq!(again, "fixed-id");
    let status = client.wait_for_workflow(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.result.as_deref(), Some("one"));

    engine.shutdown().await;
}

#[tokio::test]
async fn daily_scheduler_enqueues_once_per_utc_day() {
    let start: chrono::DateTime<chrono::Utc> = "2026-03-01T10:00:00Z".parse().unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let storage = Arc::new(InMemoryStorage::with_clock(clock.clone()));

    let workflows = WorkflowRegistry::builder()
        .register_daily(
            "Nightly",
            tenacity::WorkflowOptions::default(),
            |_ctx: WorkflowContext, _input: ()| async move { Ok::<_, WorkflowError>("ran".to_string()) },
        )
        .build();

    let engine = Engine::start_with(
        storage.clone(),
        workflows,
        ActivityRegistry::builder().build(),
        clock,
        DependencyScope::new(),
        common::fast_options(),
    )
    .await;
    let client = engine.client();

    // The scheduler ticks at startup and derives the id from the UTC date.
    let id = "Nightly-2026-03-01";
    let status = client.wait_for_workflow(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.result.as_deref(), Some("ran"));

    // A second enqueue attempt for the same day collides on the id and is
    // silently ignored: the completed instance is untouched.
    let dup = client.create_with_id("Nightly", &(), id).await.unwrap();
    assert_eq!(dup, id);
    let status = client.status(id).await.unwrap().unwrap();
    assert_eq!(status.state, WorkflowState::Completed);

    engine.shutdown().await;
}
