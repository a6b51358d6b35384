//! Per-run aggregation: outcome counters, per-organisation breakdown, and a
//! fixed-bucket latency histogram good enough for p50/p95/p99.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{RunId, Timestamp};

// ── LatencyHistogram ─────────────────────────────────────────────────────────

/// Upper bounds (milliseconds) of the histogram buckets; the last bucket is
/// unbounded.
pub const LATENCY_BUCKETS_MS: [u64; 12] = [
    10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000,
];

/// Fixed-bucket latency histogram. Quantiles are read as the upper bound of
/// the bucket containing the target rank, which is the usual operational
/// resolution for batch reporting.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyHistogram {
    /// One count per bucket in [`LATENCY_BUCKETS_MS`], plus the overflow
    /// bucket at the end.
    counts: Vec<u64>,
    total: u64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            counts: vec![0; LATENCY_BUCKETS_MS.len() + 1],
            total: 0,
        }
    }

    pub fn record(&mut self, duration_ms: u64) {
        if self.counts.is_empty() {
            self.counts = vec![0; LATENCY_BUCKETS_MS.len() + 1];
        }
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| duration_ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.counts[idx] += 1;
        self.total += 1;
    }

    pub fn count(&self) -> u64 {
        self.total
    }

    /// Quantile in milliseconds; `q` in (0, 1]. None while empty.
    pub fn quantile(&self, q: f64) -> Option<u64> {
        if self.total == 0 {
            return None;
        }
        let rank = ((q * self.total as f64).ceil() as u64).clamp(1, self.total);
        let mut seen = 0u64;
        for (idx, &c) in self.counts.iter().enumerate() {
            seen += c;
            if seen >= rank {
                return Some(if idx < LATENCY_BUCKETS_MS.len() {
                    LATENCY_BUCKETS_MS[idx]
                } else {
                    // Overflow bucket: report the last bound as a floor.
                    LATENCY_BUCKETS_MS[LATENCY_BUCKETS_MS.len() - 1]
                });
            }
        }
        None
    }

    pub fn p50(&self) -> Option<u64> {
        self.quantile(0.50)
    }

    pub fn p95(&self) -> Option<u64> {
        self.quantile(0.95)
    }

    pub fn p99(&self) -> Option<u64> {
        self.quantile(0.99)
    }
}

// ── RunReport ────────────────────────────────────────────────────────────────

/// Per-organisation slice of a run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgBreakdown {
    pub processed: u64,
    pub success: u64,
    pub errors: u64,
    pub skipped: u64,
}

/// Aggregate of one scheduler execution. Built incrementally as jobs
/// terminate; finalised when the last job of the run lands.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub started_at: Timestamp,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
    /// Jobs enqueued for this run; completion is reached when
    /// `total_processed == dispatched`.
    pub dispatched: u64,
    pub total_success: u64,
    pub total_errors: u64,
    pub total_skipped: u64,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub processing_by_organisation: BTreeMap<String, OrgBreakdown>,
    pub latency: LatencyHistogram,
    #[serde(default)]
    pub version: u64,
}

impl RunReport {
    pub fn new(run_id: RunId, started_at: Timestamp, dispatched: u64) -> Self {
        Self {
            run_id,
            started_at,
            completed_at: None,
            dispatched,
            total_success: 0,
            total_errors: 0,
            total_skipped: 0,
            errors_by_kind: BTreeMap::new(),
            processing_by_organisation: BTreeMap::new(),
            latency: LatencyHistogram::new(),
            version: 0,
        }
    }

    pub fn total_processed(&self) -> u64 {
        self.total_success + self.total_errors + self.total_skipped
    }

    pub fn record_success(&mut self, org: &str, duration_ms: u64) {
        self.total_success += 1;
        self.latency.record(duration_ms);
        let slot = self.processing_by_organisation.entry(org.into()).or_default();
        slot.processed += 1;
        slot.success += 1;
    }

    pub fn record_skipped(&mut self, org: &str, duration_ms: u64) {
        self.total_skipped += 1;
        self.latency.record(duration_ms);
        let slot = self.processing_by_organisation.entry(org.into()).or_default();
        slot.processed += 1;
        slot.skipped += 1;
    }

    pub fn record_error(&mut self, org: &str, error_class: &str, duration_ms: u64) {
        self.total_errors += 1;
        self.latency.record(duration_ms);
        *self.errors_by_kind.entry(error_class.into()).or_default() += 1;
        let slot = self.processing_by_organisation.entry(org.into()).or_default();
        slot.processed += 1;
        slot.errors += 1;
    }

    /// True once every dispatched job has terminated.
    pub fn is_complete(&self) -> bool {
        self.total_processed() >= self.dispatched
    }

    pub fn finalise(&mut self, at: Timestamp) {
        self.completed_at = Some(at);
    }
}
