use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use recepta_core::types::OrganisationId;

struct Bucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(qps: f64, burst: f64) -> Self {
        Self {
            qps,
            burst,
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.last_refill = now;
    }

    /// Take one token, or say how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.qps))
        }
    }
}

/// Per-organisation token bucket. Calls await their turn rather than erroring;
/// back-pressure reaches the worker as elapsed time, and job deadlines cap
/// how long anyone waits.
pub struct RateLimiter {
    default_qps: f64,
    overrides: HashMap<OrganisationId, f64>,
    buckets: Mutex<HashMap<OrganisationId, Bucket>>,
}

impl RateLimiter {
    pub fn new(default_qps: f64, overrides: HashMap<OrganisationId, f64>) -> Self {
        Self {
            default_qps,
            overrides,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn qps_for(&self, org: &OrganisationId) -> f64 {
        self.overrides.get(org).copied().unwrap_or(self.default_qps)
    }

    /// Wait until a token for `org` is available, then consume it.
    pub async fn acquire(&self, org: &OrganisationId) {
        loop {
            let wait = {
                let now = Instant::now();
                let mut buckets = self.buckets.lock().unwrap();
                let qps = self.qps_for(org);
                let bucket = buckets
                    .entry(org.clone())
                    .or_insert_with(|| Bucket::new(qps, qps.max(1.0)));
                match bucket.try_take(now) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}
