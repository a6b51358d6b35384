//! recepta-queue
//!
//! Durable at-least-once job queue over the store's `jobs` collection, with
//! a non-authoritative in-memory index for cheap candidate selection. Every
//! state change is a conditional write on the job row, so multiple nodes
//! lease from the same store without a global lock; index staleness is
//! resolved by re-reading the row before acting on it.
//!
//! Ordering is best-effort priority-then-FIFO. Duplicates can surface after
//! lease expiry, which is why downstream writes are idempotent.

use chrono::Duration;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use recepta_core::clock::Clock;
use recepta_core::constants::{JOB_BACKOFF_BASE_SECS, JOB_BACKOFF_MAX_SECS, JOB_MAX_ATTEMPTS};
use recepta_core::error::ReceptaError;
use recepta_core::job::{dedup_key, JobKind, JobStatus, Lease, SyncJob};
use recepta_core::types::{AccountId, ClientId, ConsentId, JobId, OrganisationId, RunId};
use recepta_store::{Collection, Store};

// ── Config ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long terminal job rows are retained before the sweep removes them.
    pub terminal_retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: JOB_MAX_ATTEMPTS,
            backoff_base: Duration::seconds(JOB_BACKOFF_BASE_SECS),
            backoff_max: Duration::seconds(JOB_BACKOFF_MAX_SECS),
            terminal_retention: Duration::days(7),
        }
    }
}

/// Exponential retry backoff for attempt `attempts` (the new, incremented
/// count).
fn backoff(config: &QueueConfig, attempts: u32) -> Duration {
    let factor = 1i64 << attempts.saturating_sub(1).min(16);
    (config.backoff_base * factor as i32).min(config.backoff_max)
}

// ── Enqueue input ────────────────────────────────────────────────────────────

/// What a producer knows about a job; the queue mints the rest.
#[derive(Clone, Debug)]
pub struct NewJob {
    pub kind: JobKind,
    pub consent_id: ConsentId,
    pub account_id: Option<AccountId>,
    pub client_id: ClientId,
    pub organisation_id: OrganisationId,
    pub priority: i32,
    pub run_id: RunId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(JobId),
    /// A non-terminal job with the same `(kind, consent, account)` already
    /// existed; its priority was raised to the max of old and new.
    Merged(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Merged(id) => *id,
        }
    }
}

// ── In-memory index ──────────────────────────────────────────────────────────

/// Lease-candidate ordering: highest priority first, then oldest first.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyEntry {
    neg_priority: i64,
    created_at_ms: i64,
    organisation_id: String,
    job_id: String,
}

impl ReadyEntry {
    fn of(job: &SyncJob) -> Self {
        Self {
            neg_priority: -(job.priority as i64),
            created_at_ms: job.created_at.timestamp_millis(),
            organisation_id: job.organisation_id.to_string(),
            job_id: job.job_id.to_string(),
        }
    }
}

#[derive(Default)]
struct QueueIndex {
    ready: BTreeSet<ReadyEntry>,
    /// dedup key → (org, job id) for every known non-terminal job.
    dedup: HashMap<String, (OrganisationId, JobId)>,
}

// ── JobQueue ─────────────────────────────────────────────────────────────────

pub struct JobQueue {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    index: Mutex<QueueIndex>,
}

impl JobQueue {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            config,
            index: Mutex::new(QueueIndex::default()),
        }
    }

    /// Rebuild the in-memory index from the store. Run at startup; the index
    /// self-heals afterwards as rows are re-read.
    pub fn rebuild_index(&self) -> Result<usize, ReceptaError> {
        let mut fresh = QueueIndex::default();
        let mut page_token: Option<String> = None;
        let mut seen = 0;
        loop {
            let page = self.store.query::<SyncJob>(
                Collection::Jobs,
                None,
                1024,
                page_token.as_deref(),
                |j: &SyncJob| !j.status.is_terminal(),
            )?;
            for v in &page.items {
                seen += 1;
                fresh
                    .dedup
                    .insert(v.doc.dedup_key(), (v.doc.organisation_id.clone(), v.doc.job_id));
                if v.doc.status == JobStatus::Pending {
                    fresh.ready.insert(ReadyEntry::of(&v.doc));
                }
            }
            match page.next {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        *self.index.lock().unwrap() = fresh;
        info!(jobs = seen, "queue index rebuilt");
        Ok(seen)
    }

    fn load(&self, org: &OrganisationId, job_id: &JobId) -> Result<Option<SyncJob>, ReceptaError> {
        Ok(self
            .store
            .get::<SyncJob>(Collection::Jobs, org.as_str(), &job_id.to_string())?
            .map(|v| {
                let mut job = v.doc;
                job.version = v.version;
                job
            }))
    }

    fn persist(&self, job: &SyncJob) -> Result<u64, ReceptaError> {
        self.store.upsert(
            Collection::Jobs,
            job.organisation_id.as_str(),
            &job.job_id.to_string(),
            job,
            Some(job.version),
            self.clock.now(),
        )
    }

    // ── enqueue ──────────────────────────────────────────────────────────────

    /// Create a job, or merge into the existing non-terminal job with the
    /// same dedup identity (priority max-merge, `updated_at` advances).
    pub fn enqueue(&self, new: NewJob) -> Result<EnqueueOutcome, ReceptaError> {
        let key = dedup_key(new.kind, &new.consent_id, new.account_id.as_ref());

        let existing = {
            let index = self.index.lock().unwrap();
            index.dedup.get(&key).cloned()
        };
        if let Some((org, job_id)) = existing {
            match self.load(&org, &job_id)? {
                Some(mut job) if !job.status.is_terminal() => {
                    let merged_priority = job.priority.max(new.priority);
                    let old_entry = ReadyEntry::of(&job);
                    job.priority = merged_priority;
                    job.updated_at = self.clock.now();
                    match self.persist(&job) {
                        Ok(version) => {
                            job.version = version;
                            let mut index = self.index.lock().unwrap();
                            if index.ready.remove(&old_entry) {
                                index.ready.insert(ReadyEntry::of(&job));
                            }
                            debug!(job_id = %job.job_id, priority = merged_priority, "enqueue merged");
                            return Ok(EnqueueOutcome::Merged(job.job_id));
                        }
                        Err(ReceptaError::Conflict { .. }) => {
                            // Raced with a worker; the job exists, good enough.
                            return Ok(EnqueueOutcome::Merged(job.job_id));
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ => {
                    // Terminal or vanished: fall through to create, dropping
                    // the stale dedup entry.
                    self.index.lock().unwrap().dedup.remove(&key);
                }
            }
        }

        let now = self.clock.now();
        let job = SyncJob {
            job_id: JobId::generate(),
            kind: new.kind,
            consent_id: new.consent_id,
            account_id: new.account_id,
            client_id: new.client_id,
            organisation_id: new.organisation_id,
            priority: new.priority,
            attempts: 0,
            max_attempts: self.config.max_attempts,
            status: JobStatus::Pending,
            lease: None,
            next_visible_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            run_id: new.run_id,
            version: 0,
        };
        self.persist(&job)?;
        let mut index = self.index.lock().unwrap();
        index
            .dedup
            .insert(key, (job.organisation_id.clone(), job.job_id));
        index.ready.insert(ReadyEntry::of(&job));
        Ok(EnqueueOutcome::Created(job.job_id))
    }

    // ── lease ────────────────────────────────────────────────────────────────

    /// Claim up to `n` leasable jobs for `node`. Candidates come from the
    /// index in priority-then-FIFO order; each claim is a conditional write,
    /// and rows locked by other nodes are skipped without blocking.
    pub fn lease(
        &self,
        n: usize,
        node: &str,
        duration: Duration,
    ) -> Result<Vec<SyncJob>, ReceptaError> {
        let now = self.clock.now();
        let candidates: Vec<ReadyEntry> = {
            let index = self.index.lock().unwrap();
            index.ready.iter().cloned().collect()
        };

        let mut leased = Vec::new();
        for entry in candidates {
            if leased.len() >= n {
                break;
            }
            let org = OrganisationId::new(entry.organisation_id.clone());
            let job_id = match entry.job_id.parse::<uuid::Uuid>() {
                Ok(u) => JobId(u),
                Err(_) => continue,
            };
            let Some(mut job) = self.load(&org, &job_id)? else {
                self.index.lock().unwrap().ready.remove(&entry);
                continue;
            };
            if job.status.is_terminal() || job.status == JobStatus::Leased {
                self.index.lock().unwrap().ready.remove(&entry);
                continue;
            }
            if !job.leasable(now) {
                continue;
            }
            job.status = JobStatus::Leased;
            job.lease = Some(Lease {
                node: node.to_string(),
                until: now + duration,
            });
            job.next_visible_at = None;
            job.updated_at = now;
            match self.persist(&job) {
                Ok(version) => {
                    job.version = version;
                    self.index.lock().unwrap().ready.remove(&entry);
                    leased.push(job);
                }
                Err(ReceptaError::Conflict { .. }) => {
                    // Another node won this row; leave the entry for re-check.
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(leased)
    }

    // ── ack / nack ───────────────────────────────────────────────────────────

    /// `LEASED → DONE`. Idempotent: acking an already-terminal job is a
    /// no-op.
    pub fn ack(&self, job: &SyncJob) -> Result<(), ReceptaError> {
        let Some(mut fresh) = self.load(&job.organisation_id, &job.job_id)? else {
            return Ok(());
        };
        if fresh.status.is_terminal() {
            return Ok(());
        }
        fresh.status = JobStatus::Done;
        fresh.lease = None;
        fresh.updated_at = self.clock.now();
        self.persist(&fresh)?;
        self.finish(&fresh)?;
        Ok(())
    }

    /// Failure report. Retryable failures below the attempt cap return the
    /// job to PENDING with exponential backoff; everything else is DEAD.
    pub fn nack(&self, job: &SyncJob, reason: &str, retryable: bool) -> Result<JobStatus, ReceptaError> {
        let Some(mut fresh) = self.load(&job.organisation_id, &job.job_id)? else {
            return Ok(JobStatus::Dead);
        };
        if fresh.status.is_terminal() {
            return Ok(fresh.status);
        }
        let now = self.clock.now();
        fresh.attempts += 1;
        fresh.last_error = Some(reason.to_string());
        fresh.updated_at = now;
        fresh.lease = None;

        let status = if retryable && fresh.attempts < fresh.max_attempts {
            fresh.status = JobStatus::Pending;
            fresh.next_visible_at = Some(now + backoff(&self.config, fresh.attempts));
            let version = self.persist(&fresh)?;
            fresh.version = version;
            self.index.lock().unwrap().ready.insert(ReadyEntry::of(&fresh));
            JobStatus::Pending
        } else {
            fresh.status = JobStatus::Dead;
            self.persist(&fresh)?;
            self.finish(&fresh)?;
            warn!(job_id = %fresh.job_id, attempts = fresh.attempts, reason, "job dead-lettered");
            JobStatus::Dead
        };
        Ok(status)
    }

    /// Drop terminal bookkeeping: dedup entry and retention stamp.
    fn finish(&self, job: &SyncJob) -> Result<(), ReceptaError> {
        self.index.lock().unwrap().dedup.remove(&job.dedup_key());
        self.store.set_expiry(
            Collection::Jobs,
            job.organisation_id.as_str(),
            &job.job_id.to_string(),
            self.clock.now() + self.config.terminal_retention,
        )
    }

    // ── lease recovery ───────────────────────────────────────────────────────

    /// Return jobs with lapsed leases to PENDING. `attempts` is untouched:
    /// lease expiry is not an observed failure.
    pub fn recover_expired(&self) -> Result<usize, ReceptaError> {
        let now = self.clock.now();
        let mut recovered = 0;
        let mut page_token: Option<String> = None;
        loop {
            let page = self.store.query::<SyncJob>(
                Collection::Jobs,
                None,
                1024,
                page_token.as_deref(),
                |j: &SyncJob| j.lease_expired(now),
            )?;
            for v in &page.items {
                let mut job = v.doc.clone();
                job.version = v.version;
                let node = job.lease.as_ref().map(|l| l.node.clone()).unwrap_or_default();
                job.status = JobStatus::Pending;
                job.lease = None;
                job.updated_at = now;
                match self.persist(&job) {
                    Ok(version) => {
                        job.version = version;
                        self.index.lock().unwrap().ready.insert(ReadyEntry::of(&job));
                        recovered += 1;
                        info!(job_id = %job.job_id, node = %node, "expired lease recovered");
                    }
                    Err(ReceptaError::Conflict { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
            match page.next {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(recovered)
    }

    /// Pending depth as seen by the index (the scheduler's back-pressure
    /// signal; staleness is tolerable).
    pub fn depth(&self) -> usize {
        self.index.lock().unwrap().ready.len()
    }

    /// Background lease-recovery loop.
    pub async fn run_recovery_loop(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.recover_expired() {
                        Ok(0) => {}
                        Ok(n) => info!(recovered = n, "lease recovery pass"),
                        Err(e) => warn!(error = %e, "lease recovery failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use recepta_core::clock::ManualClock;

    fn queue() -> (Arc<ManualClock>, JobQueue, tempfile::TempDir) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
        ));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let q = JobQueue::new(store, clock.clone(), QueueConfig::default());
        (clock, q, dir)
    }

    fn new_job(consent: &str, account: Option<&str>, priority: i32) -> NewJob {
        NewJob {
            kind: JobKind::AccountSync,
            consent_id: ConsentId::new(consent),
            account_id: account.map(AccountId::new),
            client_id: ClientId::new("cli-1"),
            organisation_id: OrganisationId::new("org-1"),
            priority,
            run_id: RunId::allocate(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()),
        }
    }

    #[test]
    fn enqueue_dedups_and_merges_priority() {
        let (_clock, q, _dir) = queue();
        let first = q.enqueue(new_job("c1", Some("A1"), 10)).unwrap();
        let second = q.enqueue(new_job("c1", Some("A1"), 25)).unwrap();
        assert!(matches!(first, EnqueueOutcome::Created(_)));
        assert!(matches!(second, EnqueueOutcome::Merged(_)));
        assert_eq!(first.job_id(), second.job_id());
        assert_eq!(q.depth(), 1);

        let leased = q.lease(10, "n1", Duration::seconds(60)).unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].priority, 25);
    }

    #[test]
    fn merge_never_lowers_priority() {
        let (_clock, q, _dir) = queue();
        q.enqueue(new_job("c1", Some("A1"), 50)).unwrap();
        q.enqueue(new_job("c1", Some("A1"), 5)).unwrap();
        let leased = q.lease(1, "n1", Duration::seconds(60)).unwrap();
        assert_eq!(leased[0].priority, 50);
    }

    #[test]
    fn lease_orders_by_priority_then_fifo() {
        let (clock, q, _dir) = queue();
        q.enqueue(new_job("c-low-old", Some("A1"), 1)).unwrap();
        clock.advance(Duration::seconds(1));
        q.enqueue(new_job("c-high", Some("A1"), 9)).unwrap();
        clock.advance(Duration::seconds(1));
        q.enqueue(new_job("c-low-new", Some("A1"), 1)).unwrap();

        let leased = q.lease(3, "n1", Duration::seconds(60)).unwrap();
        let order: Vec<String> = leased.iter().map(|j| j.consent_id.to_string()).collect();
        assert_eq!(order, vec!["c-high", "c-low-old", "c-low-new"]);
    }

    #[test]
    fn leased_jobs_are_not_handed_out_twice() {
        let (_clock, q, _dir) = queue();
        q.enqueue(new_job("c1", Some("A1"), 1)).unwrap();
        let first = q.lease(10, "n1", Duration::seconds(60)).unwrap();
        assert_eq!(first.len(), 1);
        let second = q.lease(10, "n2", Duration::seconds(60)).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn ack_is_terminal_and_never_resurrected() {
        let (clock, q, _dir) = queue();
        q.enqueue(new_job("c1", Some("A1"), 1)).unwrap();
        let leased = q.lease(1, "n1", Duration::seconds(60)).unwrap();
        q.ack(&leased[0]).unwrap();

        // Lease expiry recovery must not touch a DONE job.
        clock.advance(Duration::seconds(120));
        assert_eq!(q.recover_expired().unwrap(), 0);
        assert!(q.lease(10, "n1", Duration::seconds(60)).unwrap().is_empty());

        // The dedup slot is free again.
        let again = q.enqueue(new_job("c1", Some("A1"), 1)).unwrap();
        assert!(matches!(again, EnqueueOutcome::Created(_)));
    }

    #[test]
    fn retryable_nack_backs_off_then_redelivers() {
        let (clock, q, _dir) = queue();
        q.enqueue(new_job("c1", Some("A1"), 1)).unwrap();
        let leased = q.lease(1, "n1", Duration::seconds(60)).unwrap();
        let status = q.nack(&leased[0], "http 503", true).unwrap();
        assert_eq!(status, JobStatus::Pending);

        // Inside the backoff window the job is invisible.
        assert!(q.lease(1, "n1", Duration::seconds(60)).unwrap().is_empty());
        clock.advance(Duration::seconds(JOB_BACKOFF_BASE_SECS + 1));
        let again = q.lease(1, "n1", Duration::seconds(60)).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 1);
        assert_eq!(again[0].last_error.as_deref(), Some("http 503"));
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let config = QueueConfig::default();
        assert_eq!(backoff(&config, 1), Duration::seconds(30));
        assert_eq!(backoff(&config, 2), Duration::seconds(60));
        assert_eq!(backoff(&config, 3), Duration::seconds(120));
        assert_eq!(backoff(&config, 10), Duration::seconds(JOB_BACKOFF_MAX_SECS));
    }

    #[test]
    fn non_retryable_nack_is_dead_immediately() {
        let (_clock, q, _dir) = queue();
        q.enqueue(new_job("c1", Some("A1"), 1)).unwrap();
        let leased = q.lease(1, "n1", Duration::seconds(60)).unwrap();
        let status = q.nack(&leased[0], "http 400", false).unwrap();
        assert_eq!(status, JobStatus::Dead);
        assert!(q.lease(10, "n1", Duration::seconds(60)).unwrap().is_empty());
    }

    #[test]
    fn attempts_exhaustion_goes_dead() {
        let (clock, q, _dir) = queue();
        q.enqueue(new_job("c1", Some("A1"), 1)).unwrap();
        let mut last_status = JobStatus::Pending;
        for _ in 0..JOB_MAX_ATTEMPTS {
            clock.advance(Duration::seconds(JOB_BACKOFF_MAX_SECS + 1));
            let leased = q.lease(1, "n1", Duration::seconds(60)).unwrap();
            assert_eq!(leased.len(), 1);
            last_status = q.nack(&leased[0], "http 503", true).unwrap();
        }
        assert_eq!(last_status, JobStatus::Dead);
        clock.advance(Duration::seconds(JOB_BACKOFF_MAX_SECS + 1));
        assert!(q.lease(10, "n1", Duration::seconds(60)).unwrap().is_empty());
    }

    #[test]
    fn expired_lease_recovers_without_attempt_increment() {
        let (clock, q, _dir) = queue();
        q.enqueue(new_job("c1", Some("A1"), 1)).unwrap();
        let leased = q.lease(1, "n1", Duration::seconds(2)).unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].attempts, 0);

        // The worker crashed; nobody acks. Before expiry nothing happens.
        clock.advance(Duration::seconds(1));
        assert_eq!(q.recover_expired().unwrap(), 0);

        clock.advance(Duration::seconds(2));
        assert_eq!(q.recover_expired().unwrap(), 1);
        let again = q.lease(1, "n2", Duration::seconds(60)).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 0);
        assert_eq!(again[0].job_id, leased[0].job_id);
    }

    #[test]
    fn rebuild_index_restores_pending_and_dedup() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
        ));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        {
            let q = JobQueue::new(store.clone(), clock.clone(), QueueConfig::default());
            q.enqueue(new_job("c1", Some("A1"), 1)).unwrap();
            q.enqueue(new_job("c2", Some("A2"), 2)).unwrap();
        }
        // A new node against the same store.
        let q2 = JobQueue::new(store, clock, QueueConfig::default());
        assert_eq!(q2.depth(), 0);
        assert_eq!(q2.rebuild_index().unwrap(), 2);
        assert_eq!(q2.depth(), 2);
        let merged = q2.enqueue(new_job("c1", Some("A1"), 5)).unwrap();
        assert!(matches!(merged, EnqueueOutcome::Merged(_)));
        let leased = q2.lease(10, "n1", Duration::seconds(60)).unwrap();
        assert_eq!(leased.len(), 2);
    }
}
