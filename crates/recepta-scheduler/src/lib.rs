//! recepta-scheduler
//!
//! The job producer. Two batch windows a day (one interval firing every
//! 12 h by default) plus a tighter incremental loop that picks up consents
//! never processed before. Each run enumerates due consents, fans one
//! ACCOUNT_SYNC job out per linked account, persists a run document and
//! publishes `BatchStarted`; the [`RunTracker`] folds job terminations from
//! the bus into the report and publishes `BatchCompleted` when the last job
//! of the run lands.

mod tracker;

pub use tracker::RunTracker;

use chrono::Duration;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use recepta_consent::ConsentEngine;
use recepta_core::clock::Clock;
use recepta_core::constants::{
    SCHEDULER_COOLDOWN_SECS, SCHEDULER_INCREMENTAL_SECS, SCHEDULER_PAGE_SIZE,
    SCHEDULER_WINDOW_SECS,
};
use recepta_core::error::ReceptaError;
use recepta_core::event::Event;
use recepta_core::job::JobKind;
use recepta_core::report::RunReport;
use recepta_core::types::RunId;
use recepta_events::EventPublisher;
use recepta_queue::{EnqueueOutcome, JobQueue, NewJob};
use recepta_store::{Collection, Store};

// ── Config ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Consents per feeder page.
    pub batch_size: usize,
    /// Minimum gap between two pickups of the same consent.
    pub cooldown: Duration,
    /// Queue depth above which the feeder sleeps before paging on.
    pub max_depth: usize,
    pub base_priority: i32,
    /// Full-batch window cadence (12 h default → two windows per day).
    pub window_interval: std::time::Duration,
    /// Incremental loop cadence (new consents only).
    pub incremental_interval: std::time::Duration,
    pub backpressure_sleep: std::time::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: SCHEDULER_PAGE_SIZE,
            cooldown: Duration::seconds(SCHEDULER_COOLDOWN_SECS),
            max_depth: 100_000,
            base_priority: 10,
            window_interval: std::time::Duration::from_secs(SCHEDULER_WINDOW_SECS as u64),
            incremental_interval: std::time::Duration::from_secs(
                SCHEDULER_INCREMENTAL_SECS as u64,
            ),
            backpressure_sleep: std::time::Duration::from_secs(1),
        }
    }
}

/// Which feeder pass a run is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchMode {
    /// Everything due (cooldown lapsed or never processed).
    Full,
    /// Only consents never processed before; keeps fresh consents from
    /// waiting half a day for their first sync.
    Incremental,
}

// ── Scheduler ────────────────────────────────────────────────────────────────

pub struct Scheduler {
    engine: Arc<ConsentEngine>,
    queue: Arc<JobQueue>,
    store: Arc<Store>,
    bus: Arc<dyn EventPublisher>,
    tracker: Arc<RunTracker>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        engine: Arc<ConsentEngine>,
        queue: Arc<JobQueue>,
        store: Arc<Store>,
        bus: Arc<dyn EventPublisher>,
        tracker: Arc<RunTracker>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            engine,
            queue,
            store,
            bus,
            tracker,
            clock,
            config,
        }
    }

    /// One feeder pass. Returns the run id and the number of jobs created.
    pub async fn run_batch(
        &self,
        mode: BatchMode,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(RunId, u64), ReceptaError> {
        let started_at = self.clock.now();
        let run_id = RunId::allocate(started_at);
        let mut dispatched: u64 = 0;
        let mut page_token: Option<String> = None;

        'pages: loop {
            // Back-pressure: sleep while the queue is saturated, never block
            // inside a queue write.
            while self.queue.depth() > self.config.max_depth {
                if *shutdown.borrow() {
                    break 'pages;
                }
                debug!(depth = self.queue.depth(), "queue saturated, feeder sleeping");
                tokio::time::sleep(self.config.backpressure_sleep).await;
            }

            let page = self.engine.find_due(
                started_at,
                self.config.cooldown,
                self.config.batch_size,
                page_token.as_deref(),
            )?;

            for v in &page.items {
                let consent = &v.doc;
                if mode == BatchMode::Incremental && consent.last_processed_at.is_some() {
                    continue;
                }
                let age_days = (started_at - consent.created_at).num_days().max(0) as i32;
                let priority = self.config.base_priority + age_days;
                for account_id in &consent.linked_account_ids {
                    let outcome = self.queue.enqueue(NewJob {
                        kind: JobKind::AccountSync,
                        consent_id: consent.consent_id.clone(),
                        account_id: Some(account_id.clone()),
                        client_id: consent.client_id.clone(),
                        organisation_id: consent.organisation_id.clone(),
                        priority,
                        run_id: run_id.clone(),
                    })?;
                    // A merged job still belongs to the run that created it;
                    // only fresh jobs count against this run's completion.
                    if matches!(outcome, EnqueueOutcome::Created(_)) {
                        dispatched += 1;
                    }
                }
                self.engine
                    .record_processed(&consent.client_id, &consent.consent_id, started_at)
                    .await?;
            }

            match page.next {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        let mut report = RunReport::new(run_id.clone(), started_at, dispatched);
        report.version = self.store.upsert(
            Collection::Runs,
            run_id.as_str(),
            "report",
            &report,
            None,
            started_at,
        )?;

        info!(run_id = %run_id, dispatched, mode = ?mode, "batch run started");
        self.bus
            .publish(Event::BatchStarted {
                run_id: run_id.clone(),
                jobs_enqueued: dispatched,
                at: started_at,
            })
            .await?;

        if dispatched == 0 {
            // Nothing to wait for; close the run immediately.
            self.tracker.finalise_empty(report).await?;
        } else {
            self.tracker.register(report).await;
        }
        Ok((run_id, dispatched))
    }

    /// Window + incremental production until shutdown. The first window
    /// fires immediately on start, matching a cron window at boot.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut window = tokio::time::interval(self.config.window_interval);
        window.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut incremental = tokio::time::interval(self.config.incremental_interval);
        incremental.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The window tick at time zero covers the boot batch; skip the
        // incremental tick at time zero so the two do not race.
        incremental.tick().await;

        loop {
            tokio::select! {
                _ = window.tick() => {
                    if let Err(e) = self.run_batch(BatchMode::Full, &shutdown).await {
                        warn!(error = %e, "full batch run failed");
                    }
                }
                _ = incremental.tick() => {
                    if let Err(e) = self.run_batch(BatchMode::Incremental, &shutdown).await {
                        warn!(error = %e, "incremental run failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler stopping");
                        return;
                    }
                }
            }
        }
    }
}
