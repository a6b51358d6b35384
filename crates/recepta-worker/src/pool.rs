use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use recepta_client::TransmitterClient;
use recepta_consent::ConsentEngine;
use recepta_core::clock::Clock;
use recepta_core::context::Context;
use recepta_core::error::{ReceptaError, TransmitterErrorKind};
use recepta_core::event::{Event, SyncOutcome};
use recepta_core::job::{JobKind, JobStatus, SyncJob};
use recepta_core::types::OrganisationId;
use recepta_events::EventPublisher;
use recepta_queue::JobQueue;
use recepta_store::Store;

use crate::sync::SyncHandlers;

// ── Config ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub node_id: String,
    /// Number of worker tasks (the global in-flight cap).
    pub concurrency: usize,
    /// In-flight jobs allowed per organisation across all workers.
    pub per_org_concurrency: usize,
    /// Jobs leased per worker iteration.
    pub lease_batch: usize,
    /// Lease duration (visibility timeout).
    pub visibility: Duration,
    /// Hard deadline per job; overruns abort and nack as retryable.
    pub job_deadline: std::time::Duration,
    /// Sleep when the queue has nothing leasable.
    pub idle_sleep: std::time::Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node_id: "worker-0".to_string(),
            concurrency: 32,
            per_org_concurrency: 8,
            lease_batch: 8,
            visibility: Duration::seconds(120),
            job_deadline: std::time::Duration::from_secs(90),
            idle_sleep: std::time::Duration::from_millis(500),
        }
    }
}

// ── WorkerPool ───────────────────────────────────────────────────────────────

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    bus: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    handlers: Arc<SyncHandlers>,
    per_org: Mutex<HashMap<OrganisationId, Arc<Semaphore>>>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<JobQueue>,
        store: Arc<Store>,
        engine: Arc<ConsentEngine>,
        client: Arc<TransmitterClient>,
        bus: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        let handlers = Arc::new(SyncHandlers::new(
            store,
            engine,
            client,
            queue.clone(),
            clock.clone(),
        ));
        Arc::new(Self {
            queue,
            bus,
            clock,
            config,
            handlers,
            per_org: Mutex::new(HashMap::new()),
        })
    }

    async fn org_semaphore(&self, org: &OrganisationId) -> Arc<Semaphore> {
        let mut map = self.per_org.lock().await;
        map.entry(org.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_org_concurrency)))
            .clone()
    }

    /// Run `concurrency` worker loops until shutdown, then drain.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut workers = JoinSet::new();
        for i in 0..self.config.concurrency {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { pool.worker_loop(i, shutdown).await });
        }
        while workers.join_next().await.is_some() {}
        info!(node = %self.config.node_id, "worker pool drained");
    }

    async fn worker_loop(&self, worker: usize, shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let jobs = match self.queue.lease(
                self.config.lease_batch,
                &self.config.node_id,
                self.config.visibility,
            ) {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(worker, error = %e, "lease failed");
                    tokio::time::sleep(self.config.idle_sleep).await;
                    continue;
                }
            };
            if jobs.is_empty() {
                tokio::time::sleep(self.config.idle_sleep).await;
                continue;
            }
            // Leased jobs are processed to completion even if shutdown flips
            // mid-batch; the next iteration observes the signal and exits.
            for job in jobs {
                self.process(worker, job).await;
            }
        }
    }

    async fn process(&self, worker: usize, job: SyncJob) {
        let org_gate = self.org_semaphore(&job.organisation_id).await;
        // The semaphore is never closed, so acquisition only ends on a permit.
        let Ok(_org_permit) = org_gate.acquire().await else {
            return;
        };

        let started = std::time::Instant::now();
        let deadline = self.clock.now()
            + Duration::from_std(self.config.job_deadline).unwrap_or(Duration::seconds(90));
        let ctx = Context::for_run(job.run_id.clone()).with_deadline(deadline);

        debug!(worker, job_id = %job.job_id, kind = %job.kind, "job started");
        let result = tokio::time::timeout(
            self.config.job_deadline,
            self.handlers.dispatch(&ctx, &job),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(outcome)) => {
                if let Err(e) = self.queue.ack(&job) {
                    warn!(job_id = %job.job_id, error = %e, "ack failed");
                    return;
                }
                self.emit_done(&job, outcome, duration_ms).await;
            }
            Ok(Err(error)) => {
                self.handle_failure(&job, error, duration_ms).await;
            }
            Err(_elapsed) => {
                self.handle_failure(
                    &job,
                    ReceptaError::Transmitter(recepta_core::error::TransmitterError::network(
                        "job deadline exceeded",
                    )),
                    duration_ms,
                )
                .await;
            }
        }
    }

    /// Failure mapping: Auth keeps retrying on a fresh token until attempts run
    /// out; retryable transport classes back off; everything else is final.
    async fn handle_failure(&self, job: &SyncJob, error: ReceptaError, duration_ms: u64) {
        let retryable = match &error {
            ReceptaError::Transmitter(e) => {
                e.kind == TransmitterErrorKind::Auth || e.is_retryable()
            }
            other => other.is_retryable(),
        };
        let class = error.class();
        warn!(job_id = %job.job_id, kind = %job.kind, error = %error, retryable, "job failed");
        match self.queue.nack(job, &error.to_string(), retryable) {
            Ok(JobStatus::Pending) => {
                // Not terminal; the run hears about it on a later attempt.
            }
            Ok(_terminal) => {
                let event = Event::JobDead {
                    job_id: job.job_id,
                    run_id: job.run_id.clone(),
                    organisation_id: job.organisation_id.clone(),
                    error_class: class.to_string(),
                    duration_ms,
                    at: self.clock.now(),
                };
                if let Err(e) = self.bus.publish(event).await {
                    warn!(job_id = %job.job_id, error = %e, "failed to publish JobDead");
                }
            }
            Err(e) => warn!(job_id = %job.job_id, error = %e, "nack failed"),
        }
    }

    async fn emit_done(&self, job: &SyncJob, outcome: SyncOutcome, duration_ms: u64) {
        let now = self.clock.now();
        if matches!(job.kind, JobKind::AccountSync | JobKind::BalanceSync) {
            if let Some(account_id) = &job.account_id {
                let event = Event::AccountSynced {
                    organisation_id: job.organisation_id.clone(),
                    account_id: account_id.clone(),
                    consent_id: job.consent_id.clone(),
                    run_id: job.run_id.clone(),
                    outcome,
                    at: now,
                };
                if let Err(e) = self.bus.publish(event).await {
                    warn!(job_id = %job.job_id, error = %e, "failed to publish AccountSynced");
                }
            }
        }
        let event = Event::JobDone {
            job_id: job.job_id,
            run_id: job.run_id.clone(),
            organisation_id: job.organisation_id.clone(),
            outcome,
            duration_ms,
            at: now,
        };
        if let Err(e) = self.bus.publish(event).await {
            warn!(job_id = %job.job_id, error = %e, "failed to publish JobDone");
        }
    }
}
