use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use recepta_core::clock::Clock;
use recepta_core::error::ReceptaError;
use recepta_core::event::{Event, SyncOutcome};
use recepta_core::report::RunReport;
use recepta_core::types::RunId;
use recepta_events::EventPublisher;
use recepta_store::{Collection, Store};

/// Folds `JobDone`/`JobDead` events into the active runs' reports. When a
/// run's processed count reaches its dispatched count the report is
/// finalised, persisted and `BatchCompleted` goes out.
pub struct RunTracker {
    store: Arc<Store>,
    bus: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    active: Mutex<HashMap<RunId, RunReport>>,
}

impl RunTracker {
    pub fn new(store: Arc<Store>, bus: Arc<dyn EventPublisher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            bus,
            clock,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking a run that has jobs in flight.
    pub async fn register(&self, report: RunReport) {
        self.active
            .lock()
            .await
            .insert(report.run_id.clone(), report);
    }

    /// Close out a run that dispatched nothing.
    pub async fn finalise_empty(&self, mut report: RunReport) -> Result<(), ReceptaError> {
        let now = self.clock.now();
        report.finalise(now);
        report.version = self.store.upsert(
            Collection::Runs,
            report.run_id.as_str(),
            "report",
            &report,
            Some(report.version),
            now,
        )?;
        self.bus
            .publish(Event::BatchCompleted {
                run_id: report.run_id.clone(),
                report,
                at: now,
            })
            .await
    }

    async fn fold(&self, event: &Event) -> Result<(), ReceptaError> {
        let run_id: &RunId = match event {
            Event::JobDone { run_id, .. } | Event::JobDead { run_id, .. } => run_id,
            _ => return Ok(()),
        };

        let mut active = self.active.lock().await;
        let Some(report) = active.get_mut(run_id) else {
            // A straggler from a finished run (e.g. a lease-expired duplicate
            // acked late); the report is already closed.
            return Ok(());
        };
        match event {
            Event::JobDone {
                organisation_id,
                outcome,
                duration_ms,
                ..
            } => match outcome {
                SyncOutcome::Success => report.record_success(organisation_id.as_str(), *duration_ms),
                SyncOutcome::Skipped => report.record_skipped(organisation_id.as_str(), *duration_ms),
            },
            Event::JobDead {
                organisation_id,
                error_class,
                duration_ms,
                ..
            } => report.record_error(organisation_id.as_str(), error_class, *duration_ms),
            _ => {}
        }

        let now = self.clock.now();
        report.version = self.store.upsert(
            Collection::Runs,
            report.run_id.as_str(),
            "report",
            report,
            Some(report.version),
            now,
        )?;

        if report.is_complete() {
            let Some(mut done) = active.remove(run_id) else {
                return Ok(());
            };
            drop(active);
            done.finalise(now);
            done.version = self.store.upsert(
                Collection::Runs,
                done.run_id.as_str(),
                "report",
                &done,
                Some(done.version),
                now,
            )?;
            info!(
                run_id = %done.run_id,
                success = done.total_success,
                errors = done.total_errors,
                skipped = done.total_skipped,
                p95_ms = done.latency.p95().unwrap_or(0),
                "batch completed"
            );
            self.bus
                .publish(Event::BatchCompleted {
                    run_id: done.run_id.clone(),
                    report: done,
                    at: now,
                })
                .await?;
        }
        Ok(())
    }

    /// Consume job-termination events from the bus until shutdown. The
    /// receiver is created by the caller before any job can terminate, so
    /// no termination event is missed between wiring and polling.
    pub async fn run(
        self: Arc<Self>,
        mut rx: tokio::sync::broadcast::Receiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.fold(&event).await {
                            warn!(error = %e, "run aggregation failed for event");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "run tracker lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
