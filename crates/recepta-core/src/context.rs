use uuid::Uuid;

use crate::clock::Clock;
use crate::types::{RunId, Timestamp};

/// Per-call context threaded through every operation that crosses a
/// suspension point: the run being executed (if any), a correlation id for
/// log stitching, and an optional absolute deadline.
#[derive(Clone, Debug)]
pub struct Context {
    pub run_id: Option<RunId>,
    pub correlation_id: Uuid,
    pub deadline: Option<Timestamp>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            run_id: None,
            correlation_id: Uuid::new_v4(),
            deadline: None,
        }
    }

    pub fn for_run(run_id: RunId) -> Self {
        Self {
            run_id: Some(run_id),
            correlation_id: Uuid::new_v4(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Timestamp) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Remaining time until the deadline, if one is set. `None` means
    /// unbounded; `Some(zero)` means already past.
    pub fn remaining(&self, clock: &dyn Clock) -> Option<std::time::Duration> {
        self.deadline.map(|d| {
            (d - clock.now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO)
        })
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn remaining_clamps_at_zero() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let ctx = Context::new().with_deadline(start + Duration::seconds(30));
        assert_eq!(
            ctx.remaining(&clock),
            Some(std::time::Duration::from_secs(30))
        );
        clock.advance(Duration::seconds(45));
        assert_eq!(ctx.remaining(&clock), Some(std::time::Duration::ZERO));
    }
}
