//! Injectable UTC clock.
//!
//! Everything in the engine that needs "now" goes through [`Clock`]: the
//! dispatcher's due-work polling, lease expiry in storage implementations,
//! and the anchor of each workflow's virtual clock. Swapping in a
//! [`ManualClock`] makes time-dependent behavior testable without sleeping.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Monotonic-enough UTC source. Implementations must be cheap to call.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Shared clock handle as the engine stores it.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().expect("clock mutex poisoned") = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut g = self.now.lock().expect("clock mutex poisoned");
        *g += by;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_only_on_demand() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now_utc(), start);
        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now_utc(), start + Duration::seconds(30));
    }
}
