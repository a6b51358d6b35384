use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use recepta_core::clock::Clock;
use recepta_core::constants::{
    BREAKER_CLOSE_SUCCESSES, BREAKER_OPEN_SECS, BREAKER_TRIP_RATIO, BREAKER_WINDOW,
};
use recepta_core::error::TransmitterError;
use recepta_core::types::{OrganisationId, Timestamp};

// ── Per-organisation state ───────────────────────────────────────────────────

#[derive(Debug)]
enum State {
    /// Rolling window of the last samples; `true` = breaker-relevant failure.
    Closed { window: VecDeque<bool> },
    Open { until: Timestamp },
    /// One probe at a time; `successes` consecutive probe successes so far.
    HalfOpen { successes: u32, probing: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerSnapshot {
    Closed,
    Open,
    HalfOpen,
}

// ── CircuitBreaker ───────────────────────────────────────────────────────────

/// Per-organisation circuit breaker.
///
/// CLOSED trips to OPEN when more than half of the last
/// [`BREAKER_WINDOW`] samples failed (once the window is full). OPEN
/// rejects everything for [`BREAKER_OPEN_SECS`], then HALF_OPEN admits one
/// probe at a time; [`BREAKER_CLOSE_SUCCESSES`] consecutive successes close
/// it, any failure re-opens it.
pub struct CircuitBreaker {
    clock: Arc<dyn Clock>,
    orgs: Mutex<HashMap<OrganisationId, State>>,
}

impl CircuitBreaker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            orgs: Mutex::new(HashMap::new()),
        }
    }

    /// Gate a call. `Err` short-circuits the call as `Unavailable`.
    pub fn admit(&self, org: &OrganisationId) -> Result<(), TransmitterError> {
        let now = self.clock.now();
        let mut orgs = self.orgs.lock().unwrap();
        let state = orgs.entry(org.clone()).or_insert_with(|| State::Closed {
            window: VecDeque::with_capacity(BREAKER_WINDOW),
        });
        match state {
            State::Closed { .. } => Ok(()),
            State::Open { until } => {
                if now < *until {
                    return Err(TransmitterError::circuit_open(org.as_str()));
                }
                // Open interval elapsed: admit a single probe.
                *state = State::HalfOpen {
                    successes: 0,
                    probing: true,
                };
                Ok(())
            }
            State::HalfOpen { probing, .. } => {
                if *probing {
                    return Err(TransmitterError::circuit_open(org.as_str()));
                }
                *probing = true;
                Ok(())
            }
        }
    }

    /// Record the outcome of an admitted call. `failure` means a
    /// breaker-relevant failure (5xx, 429, timeout, transport error); a
    /// definitive 4xx counts as a success sample because the holder is up.
    pub fn record(&self, org: &OrganisationId, failure: bool) {
        let now = self.clock.now();
        let mut orgs = self.orgs.lock().unwrap();
        let state = orgs.entry(org.clone()).or_insert_with(|| State::Closed {
            window: VecDeque::with_capacity(BREAKER_WINDOW),
        });
        match state {
            State::Closed { window } => {
                if window.len() == BREAKER_WINDOW {
                    window.pop_front();
                }
                window.push_back(failure);
                if window.len() == BREAKER_WINDOW {
                    let failures = window.iter().filter(|&&f| f).count();
                    if failures as f64 / window.len() as f64 > BREAKER_TRIP_RATIO {
                        *state = State::Open {
                            until: now + chrono::Duration::seconds(BREAKER_OPEN_SECS),
                        };
                    }
                }
            }
            State::Open { .. } => {
                // A call admitted before the trip finished late; ignore.
            }
            State::HalfOpen { successes, probing } => {
                *probing = false;
                if failure {
                    *state = State::Open {
                        until: now + chrono::Duration::seconds(BREAKER_OPEN_SECS),
                    };
                } else {
                    *successes += 1;
                    if *successes >= BREAKER_CLOSE_SUCCESSES {
                        *state = State::Closed {
                            window: VecDeque::with_capacity(BREAKER_WINDOW),
                        };
                    }
                }
            }
        }
    }

    pub fn snapshot(&self, org: &OrganisationId) -> BreakerSnapshot {
        let orgs = self.orgs.lock().unwrap();
        match orgs.get(org) {
            None | Some(State::Closed { .. }) => BreakerSnapshot::Closed,
            Some(State::Open { .. }) => BreakerSnapshot::Open,
            Some(State::HalfOpen { .. }) => BreakerSnapshot::HalfOpen,
        }
    }
}
