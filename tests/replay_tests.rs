//! Replay determinism and at-most-once execution.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tenacity::model::unique_activity_id;
use tenacity::storage::{InMemoryStorage, Storage};
use tenacity::{
    ActivityRegistry, ActivityState, DependencyScope, Engine, SystemClock, WorkflowContext,
    WorkflowError, WorkflowRegistry, WorkflowState,
};

mod common;

fn counting_activity(
    counter: Arc<AtomicUsize>,
) -> impl Fn(tenacity::ActivityContext, String) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u64, String>> + Send>>
       + Clone {
    move |_ctx, _input: String| {
        let counter = counter.clone();
        Box::pin(async move { Ok(counter.fetch_add(1, Ordering::SeqCst) as u64) })
    }
}

#[tokio::test]
async fn activities_execute_once_across_suspension_replay() {
    let storage = Arc::new(InMemoryStorage::new());
    let step_a = Arc::new(AtomicUsize::new(0));
    let step_b = Arc::new(AtomicUsize::new(0));

    let a = step_a.clone();
    let b = step_b.clone();
    let activities = ActivityRegistry::builder()
        .register("StepA", move |_ctx, input: String| {
            let a = a.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(format!("A({input})"))
            }
        })
        .register("StepB", move |_ctx, input: String| {
            let b = b.clone();
            async move {
                b.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(format!("B({input})"))
            }
        })
        .build();

    let workflows = WorkflowRegistry::builder()
        .register("Chain", |ctx: WorkflowContext, input: String| async move {
            let first: String = ctx.schedule_activity("StepA", &input).await?;
            // The timer forces a suspension; the replay afterwards must
            // short-circuit StepA from its stored record.
            ctx.delay(Duration::from_secs(1)).await?;
            let second: String = ctx.schedule_activity("StepB", &first).await?;
            Ok::<_, WorkflowError>(second)
        })
        .build();

    let engine = Engine::start_with(
        storage.clone(),
        workflows,
        activities,
        Arc::new(SystemClock),
        DependencyScope::new(),
        common::fast_options(),
    )
    .await;
    let client = engine.client();

    let id = client.create("Chain", "x").await.unwrap();
    let status = client.wait_for_workflow(&id, Duration::from_secs(8)).await.unwrap();
    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.result.as_deref(), Some("B(A(x))"));

    // At-most-once: the replay consumed stored results instead of re-running.
    assert_eq!(step_a.load(Ordering::SeqCst), 1);
    assert_eq!(step_b.load(Ordering::SeqCst), 1);

    // The replay key is a deterministic function of method and arguments,
    // so the record is a point lookup.
    let key = unique_activity_id("StepA", "x");
    let record = storage.get_activity(&id, &key).await.unwrap().unwrap();
    assert_eq!(record.state, ActivityState::Completed);
    assert_eq!(record.response.as_deref(), Some("A(x)"));

    engine.shutdown().await;
}

#[tokio::test]
async fn argument_keyed_calls_dedupe_identical_arguments() {
    let storage = Arc::new(InMemoryStorage::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let activities = ActivityRegistry::builder()
        .register("Next", counting_activity(counter.clone()))
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("Dedupe", |ctx: WorkflowContext, _input: String| async move {
            let n1: u64 = ctx.schedule_activity("Next", "same").await?;
            let n2: u64 = ctx.schedule_activity("Next", "same").await?;
            let n3: u64 = ctx.schedule_activity("Next", "other").await?;
            Ok::<_, WorkflowError>(format!("{n1}-{n2}-{n3}"))
        })
        .build();

    let engine = Engine::start_with(
        storage,
        workflows,
        activities,
        Arc::new(SystemClock),
        DependencyScope::new(),
        common::fast_options(),
    )
    .await;
    let client = engine.client();

    let id = client.create("Dedupe", "").await.unwrap();
    let status = client.wait_for_workflow(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.state, WorkflowState::Completed);
    // Same arguments resolve to the same durable record; only two runs.
    assert_eq!(status.result.as_deref(), Some("0-0-1"));
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn sequence_keyed_calls_get_distinct_stable_records() {
    let storage = Arc::new(InMemoryStorage::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let activities = ActivityRegistry::builder()
        .register_unkeyed("Tick", counting_activity(counter.clone()))
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("Ticker", |ctx: WorkflowContext, _input: String| async move {
            let t1: u64 = ctx.schedule_activity("Tick", "").await?;
            // Suspension in the middle: the counter-derived keys must line
            // up again on replay.
            ctx.delay(Duration::from_millis(600)).await?;
            let t2: u64 = ctx.schedule_activity("Tick", "").await?;
            Ok::<_, WorkflowError>(format!("{t1}-{t2}"))
        })
        .build();

    let engine = Engine::start_with(
        storage,
        workflows,
        activities,
        Arc::new(SystemClock),
        DependencyScope::new(),
        common::fast_options(),
    )
    .await;
    let client = engine.client();

    let id = client.create("Ticker", "").await.unwrap();
    let status = client.wait_for_workflow(&id, Duration::from_secs(6)).await.unwrap();
    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.result.as_deref(), Some("0-1"));
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn virtual_clock_is_anchored_and_advances_at_primitives() {
    let storage = Arc::new(InMemoryStorage::new());
    let workflows = WorkflowRegistry::builder()
        .register("Clocked", |ctx: WorkflowContext, _input: String| async move {
            let before = ctx.current_utc();
            ctx.delay(Duration::from_secs(1)).await?;
            let after = ctx.current_utc();
            let advanced = (after - before) >= chrono::Duration::milliseconds(900);
            Ok::<_, WorkflowError>(advanced.to_string())
        })
        .build();

    let engine = Engine::start_with(
        storage,
        workflows,
        ActivityRegistry::builder().build(),
        Arc::new(SystemClock),
        DependencyScope::new(),
        common::fast_options(),
    )
    .await;
    let client = engine.client();

    let id = client.create("Clocked", "").await.unwrap();
    let status = client.wait_for_workflow(&id, Duration::from_secs(6)).await.unwrap();
    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.result.as_deref(), Some("true"));

    engine.shutdown().await;
}

#[tokio::test]
async fn terminal_workflows_are_garbage_collected_after_retention() {
    let storage = Arc::new(InMemoryStorage::new());
    let activities = ActivityRegistry::builder()
        .register("Touch", |_ctx, input: String| async move { Ok::<_, String>(input) })
        .build();
    let options = tenacity::WorkflowOptions {
        preserve_time: Duration::from_millis(300),
        failure_preserve_time: Duration::from_millis(300),
        delete_history: true,
    };
    let workflows = WorkflowRegistry::builder()
        .register_with("Brief", options, |ctx: WorkflowContext, input: String| async move {
            let _: String = ctx.schedule_activity("Touch", &input).await?;
            Ok::<_, WorkflowError>(input)
        })
        .build();

    let engine = Engine::start_with(
        storage.clone(),
        workflows,
        activities,
        Arc::new(SystemClock),
        DependencyScope::new(),
        common::fast_options(),
    )
    .await;
    let client = engine.client();

    let id = client.create("Brief", "x").await.unwrap();
    let status = client.wait_for_workflow(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.state, WorkflowState::Completed);

    // Once the retention window passes, the dispatcher deletes the entity
    // and, per the registration's policy, its activity history.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if client.status(&id).await.unwrap().is_none() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "workflow was not garbage-collected");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let key = unique_activity_id("Touch", "x");
    assert!(storage.get_activity(&id, &key).await.unwrap().is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn activity_results_survive_engine_restart() {
    let storage = Arc::new(InMemoryStorage::new());
    let counter = Arc::new(AtomicUsize::new(0));

    fn build_registries(
        counter: Arc<AtomicUsize>,
    ) -> (WorkflowRegistry, ActivityRegistry) {
        let activities = ActivityRegistry::builder()
            .register("Record", move |_ctx, input: String| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(format!("saw:{input}"))
                }
            })
            .build();
        let workflows = WorkflowRegistry::builder()
            .register("Restartable", |ctx: WorkflowContext, input: String| async move {
                let first: String = ctx.schedule_activity("Record", &input).await?;
                ctx.delay(Duration::from_secs(2)).await?;
                Ok::<_, WorkflowError>(first)
            })
            .build();
        (workflows, activities)
    }

    let (workflows, activities) = build_registries(counter.clone());
    let engine = Engine::start_with(
        storage.clone(),
        workflows,
        activities,
        Arc::new(SystemClock),
        DependencyScope::new(),
        common::fast_options(),
    )
    .await;
    let client = engine.client();
    let id = client.create("Restartable", "v1").await.unwrap();

    // Let the first run execute the activity and suspend on the timer, then
    // kill the engine: a crash between commit points.
    assert!(common::wait_for_state(&client, &id, WorkflowState::Suspended, 2_000).await);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    engine.shutdown().await;

    // A new engine over the same storage finishes the workflow by replaying
    // the stored activity result, not by re-running the side effect.
    let (workflows, activities) = build_registries(counter.clone());
    let engine = Engine::start_with(
        storage,
        workflows,
        activities,
        Arc::new(SystemClock),
        DependencyScope::new(),
        common::fast_options(),
    )
    .await;
    let client = engine.client();
    let status = client.wait_for_workflow(&id, Duration::from_secs(8)).await.unwrap();
    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.result.as_deref(), Some("saw:v1"));
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    engine.shutdown().await;
}
