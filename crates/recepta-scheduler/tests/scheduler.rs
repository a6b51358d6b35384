//! Feeder and run-aggregation behaviour: fan-out, cooldown, incremental
//! mode, priority ageing, and report completion over the bus.

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use httpmock::MockServer;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use recepta_cache::MemoryCache;
use recepta_client::{RateLimiter, TransmitterClient, TransmitterClientConfig};
use recepta_consent::ConsentEngine;
use recepta_core::clock::{Clock, ManualClock};
use recepta_core::consent::{Consent, ConsentStatus};
use recepta_core::error::ReceptaError;
use recepta_core::event::{Event, SyncOutcome};
use recepta_core::report::RunReport;
use recepta_core::types::{AccountId, ClientId, ConsentId, JobId, OrganisationId, RunId};
use recepta_directory::{ApiFamily, StaticDirectoryResolver, TransmitterEndpoint};
use recepta_events::{EventPublisher, MemoryBus};
use recepta_queue::{JobQueue, QueueConfig};
use recepta_scheduler::{BatchMode, RunTracker, Scheduler, SchedulerConfig};
use recepta_store::{Collection, Store};
use recepta_token::{AccessToken, TokenSource};

struct StubTokens;

#[async_trait]
impl TokenSource for StubTokens {
    async fn token(
        &self,
        _client: &ClientId,
        _org: &OrganisationId,
    ) -> Result<AccessToken, ReceptaError> {
        Ok(AccessToken {
            token: "tok".into(),
            expires_at: Utc::now() + Duration::minutes(15),
        })
    }

    async fn invalidate(&self, _client: &ClientId, _org: &OrganisationId) {}
}

struct Rig {
    clock: Arc<ManualClock>,
    store: Arc<Store>,
    bus: Arc<MemoryBus>,
    queue: Arc<JobQueue>,
    tracker: Arc<RunTracker>,
    scheduler: Arc<Scheduler>,
    _dir: tempfile::TempDir,
}

fn rig(server: &MockServer) -> Rig {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 7, 1, 6, 0, 0).unwrap(),
    ));
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path()).unwrap());
    let cache = Arc::new(MemoryCache::new(clock.clone()));
    let bus = Arc::new(MemoryBus::default());
    let directory = Arc::new(StaticDirectoryResolver::new([TransmitterEndpoint {
        organisation_id: OrganisationId::new("org-1"),
        base_url: server.base_url(),
        token_url: server.url("/token"),
        supported_families: vec![ApiFamily::Accounts, ApiFamily::Consents],
    }]));
    let client = Arc::new(TransmitterClient::new(
        reqwest::Client::new(),
        directory,
        Arc::new(StubTokens),
        RateLimiter::new(10_000.0, HashMap::new()),
        clock.clone(),
        TransmitterClientConfig::default(),
    ));
    let engine = Arc::new(ConsentEngine::new(
        store.clone(),
        cache,
        bus.clone(),
        client,
        clock.clone(),
    ));
    let queue = Arc::new(JobQueue::new(
        store.clone(),
        clock.clone(),
        QueueConfig::default(),
    ));
    let tracker = Arc::new(RunTracker::new(store.clone(), bus.clone(), clock.clone()));
    let scheduler = Arc::new(Scheduler::new(
        engine,
        queue.clone(),
        store.clone(),
        bus.clone(),
        tracker.clone(),
        clock.clone(),
        SchedulerConfig::default(),
    ));
    Rig {
        clock,
        store,
        bus,
        queue,
        tracker,
        scheduler,
        _dir: dir,
    }
}

fn seed_consent(r: &Rig, id: &str, accounts: &[&str], age: Duration) {
    let now = r.clock.now();
    let consent = Consent {
        consent_id: ConsentId::new(id),
        client_id: ClientId::new("cli-1"),
        organisation_id: OrganisationId::new("org-1"),
        status: ConsentStatus::Authorised,
        created_at: now - age,
        status_updated_at: now - age,
        expires_at: Some(now + Duration::days(30)),
        permissions: BTreeSet::new(),
        logged_user_id: "52998224725".into(),
        business_entity_id: None,
        linked_account_ids: accounts.iter().map(|a| AccountId::new(*a)).collect(),
        transaction_from: None,
        transaction_to: None,
        multiple_approval_required: false,
        rejection: None,
        last_processed_at: None,
        version: 0,
    };
    r.store
        .upsert(Collection::Consents, "cli-1", id, &consent, None, now)
        .unwrap();
}

fn shutdown_rx() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    std::mem::forget(tx);
    rx
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

#[tokio::test]
async fn full_batch_fans_out_one_job_per_linked_account() {
    let server = MockServer::start();
    let r = rig(&server);
    let mut rx = r.bus.subscribe();
    seed_consent(&r, "urn:c:1", &["A1", "A2"], Duration::days(1));

    let (run_id, dispatched) = r
        .scheduler
        .run_batch(BatchMode::Full, &shutdown_rx())
        .await
        .unwrap();
    assert_eq!(dispatched, 2);
    assert_eq!(r.queue.depth(), 2);

    let leased = r.queue.lease(10, "n1", Duration::seconds(60)).unwrap();
    assert_eq!(leased.len(), 2);
    assert!(leased.iter().all(|j| j.run_id == run_id));
    let accounts: BTreeSet<String> = leased
        .iter()
        .map(|j| j.account_id.clone().unwrap().to_string())
        .collect();
    assert_eq!(accounts, BTreeSet::from(["A1".to_string(), "A2".to_string()]));

    // Run document persisted with the dispatched count.
    let report = r
        .store
        .get::<RunReport>(Collection::Runs, run_id.as_str(), "report")
        .unwrap()
        .unwrap();
    assert_eq!(report.doc.dispatched, 2);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::BatchStarted { jobs_enqueued: 2, .. })));
}

#[tokio::test]
async fn cooldown_prevents_immediate_repickup() {
    let server = MockServer::start();
    let r = rig(&server);
    seed_consent(&r, "urn:c:1", &["A1"], Duration::days(1));

    let (_, first) = r
        .scheduler
        .run_batch(BatchMode::Full, &shutdown_rx())
        .await
        .unwrap();
    assert_eq!(first, 1);

    // Same consent inside the cooldown: nothing new.
    let (_, second) = r
        .scheduler
        .run_batch(BatchMode::Full, &shutdown_rx())
        .await
        .unwrap();
    assert_eq!(second, 0);

    // Drain the first job so dedup cannot mask the repickup.
    let leased = r.queue.lease(10, "n1", Duration::seconds(60)).unwrap();
    for job in &leased {
        r.queue.ack(job).unwrap();
    }

    // After the cooldown it is due again.
    r.clock.advance(Duration::hours(7));
    let (_, third) = r
        .scheduler
        .run_batch(BatchMode::Full, &shutdown_rx())
        .await
        .unwrap();
    assert_eq!(third, 1);
}

#[tokio::test]
async fn empty_run_completes_immediately() {
    let server = MockServer::start();
    let r = rig(&server);
    let mut rx = r.bus.subscribe();

    let (run_id, dispatched) = r
        .scheduler
        .run_batch(BatchMode::Full, &shutdown_rx())
        .await
        .unwrap();
    assert_eq!(dispatched, 0);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::BatchStarted { .. })));
    let completed = events.iter().find_map(|e| match e {
        Event::BatchCompleted { report, .. } => Some(report),
        _ => None,
    });
    let report = completed.expect("empty run must complete immediately");
    assert_eq!(report.run_id, run_id);
    assert_eq!(report.total_processed(), 0);
    assert!(report.completed_at.is_some());
}

#[tokio::test]
async fn incremental_mode_only_takes_never_processed_consents() {
    let server = MockServer::start();
    let r = rig(&server);
    seed_consent(&r, "urn:c:new", &["A1"], Duration::hours(1));
    seed_consent(&r, "urn:c:old", &["A2"], Duration::days(5));

    // Full pass processes both.
    let (_, full) = r
        .scheduler
        .run_batch(BatchMode::Full, &shutdown_rx())
        .await
        .unwrap();
    assert_eq!(full, 2);

    // A consent arriving afterwards is picked up by the incremental pass
    // even though the others are still inside their cooldown.
    seed_consent(&r, "urn:c:fresh", &["A3"], Duration::zero());
    let (_, incremental) = r
        .scheduler
        .run_batch(BatchMode::Incremental, &shutdown_rx())
        .await
        .unwrap();
    assert_eq!(incremental, 1);
}

#[tokio::test]
async fn older_consents_get_higher_priority() {
    let server = MockServer::start();
    let r = rig(&server);
    seed_consent(&r, "urn:c:young", &["A1"], Duration::days(1));
    seed_consent(&r, "urn:c:ancient", &["A2"], Duration::days(40));

    r.scheduler
        .run_batch(BatchMode::Full, &shutdown_rx())
        .await
        .unwrap();
    let leased = r.queue.lease(10, "n1", Duration::seconds(60)).unwrap();
    // Ancient consent comes out first with the larger priority.
    assert_eq!(leased[0].consent_id.to_string(), "urn:c:ancient");
    assert!(leased[0].priority > leased[1].priority);
}

#[tokio::test]
async fn tracker_folds_job_events_and_completes_the_run() {
    let server = MockServer::start();
    let r = rig(&server);
    seed_consent(&r, "urn:c:1", &["A1", "A2"], Duration::days(1));

    let (run_id, dispatched) = r
        .scheduler
        .run_batch(BatchMode::Full, &shutdown_rx())
        .await
        .unwrap();
    assert_eq!(dispatched, 2);

    let mut rx = r.bus.subscribe();
    let tracker_handle = tokio::spawn(r.tracker.clone().run(r.bus.subscribe(), shutdown_rx()));

    let now = r.clock.now();
    r.bus
        .publish(Event::JobDone {
            job_id: JobId::generate(),
            run_id: run_id.clone(),
            organisation_id: OrganisationId::new("org-1"),
            outcome: SyncOutcome::Success,
            duration_ms: 80,
            at: now,
        })
        .await
        .unwrap();
    r.bus
        .publish(Event::JobDead {
            job_id: JobId::generate(),
            run_id: run_id.clone(),
            organisation_id: OrganisationId::new("org-1"),
            error_class: "server_error".into(),
            duration_ms: 950,
            at: now,
        })
        .await
        .unwrap();

    // Wait for the completion event.
    let report = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            match rx.recv().await.unwrap() {
                Event::BatchCompleted { report, .. } => break report,
                _ => continue,
            }
        }
    })
    .await
    .expect("run must complete");

    assert_eq!(report.run_id, run_id);
    assert_eq!(report.total_success, 1);
    assert_eq!(report.total_errors, 1);
    assert_eq!(report.total_processed(), report.dispatched);
    assert_eq!(report.errors_by_kind["server_error"], 1);
    assert_eq!(report.processing_by_organisation["org-1"].processed, 2);
    assert!(report.latency.p50().is_some());

    // The persisted run document matches.
    let stored = r
        .store
        .get::<RunReport>(Collection::Runs, run_id.as_str(), "report")
        .unwrap()
        .unwrap();
    assert!(stored.doc.completed_at.is_some());
    assert_eq!(stored.doc.total_success, 1);

    tracker_handle.abort();
}

#[tokio::test]
async fn merged_jobs_do_not_count_against_the_new_run() {
    let server = MockServer::start();
    let r = rig(&server);
    seed_consent(&r, "urn:c:1", &["A1"], Duration::days(1));

    let (_, first) = r
        .scheduler
        .run_batch(BatchMode::Full, &shutdown_rx())
        .await
        .unwrap();
    assert_eq!(first, 1);

    // The job is still pending when the consent comes due again: the new run
    // merges instead of double-dispatching.
    r.clock.advance(Duration::hours(7));
    let (_, second) = r
        .scheduler
        .run_batch(BatchMode::Full, &shutdown_rx())
        .await
        .unwrap();
    assert_eq!(second, 0);
    assert_eq!(r.queue.depth(), 1);
}
