#![allow(dead_code)]

use std::time::Duration;

use tenacity::{Client, EngineOptions, WorkflowState};

/// Engine options scaled down for tests: quick polls and a small suspend
/// threshold so short timers exercise the suspend/replay path.
pub fn fast_options() -> EngineOptions {
    EngineOptions {
        poll_interval: Duration::from_millis(100),
        suspend_threshold: Duration::from_millis(300),
        child_wait_backstop: Duration::from_secs(1),
        ..EngineOptions::default()
    }
}

/// Poll until the workflow reaches `state`, up to `timeout_ms`.
pub async fn wait_for_state(client: &Client, id: &str, state: WorkflowState, timeout_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(Some(status)) = client.status(id).await {
            if status.state == state {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
