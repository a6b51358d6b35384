//! Worker-pool behaviour against a transmitter double: the happy sync path,
//! consent gating, the 404→INACTIVE rule, dead-lettering on bad requests,
//! job deadlines, and idempotent transaction ingestion.

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use httpmock::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use recepta_cache::MemoryCache;
use recepta_client::{RateLimiter, RetryPolicy, TransmitterClient, TransmitterClientConfig};
use recepta_consent::ConsentEngine;
use recepta_core::account::{Account, AccountStatus, BalanceSnapshot, Transaction};
use recepta_core::clock::{Clock, ManualClock};
use recepta_core::consent::{Consent, ConsentStatus, Permission};
use recepta_core::error::ReceptaError;
use recepta_core::event::{Event, SyncOutcome};
use recepta_core::job::{JobKind, JobStatus, SyncJob};
use recepta_core::types::{AccountId, ClientId, ConsentId, OrganisationId, RunId};
use recepta_directory::{ApiFamily, StaticDirectoryResolver, TransmitterEndpoint};
use recepta_events::MemoryBus;
use recepta_queue::{JobQueue, NewJob, QueueConfig};
use recepta_store::{Collection, Store};
use recepta_token::{AccessToken, TokenSource};
use recepta_worker::{WorkerConfig, WorkerPool};

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
    pool: Arc<WorkerPool>,
    _dir: tempfile::TempDir,
}

fn rig(server: &MockServer) -> Rig {
    rig_with_deadline(server, std::time::Duration::from_secs(30))
}

fn rig_with_deadline(server: &MockServer, job_deadline: std::time::Duration) -> Rig {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap(),
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
    let client = Arc::new(
        TransmitterClient::new(
            reqwest::Client::new(),
            directory,
            Arc::new(StubTokens),
            RateLimiter::new(10_000.0, HashMap::new()),
            clock.clone(),
            TransmitterClientConfig::default(),
        )
        .with_retry(RetryPolicy {
            max_attempts: 1,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(1),
        }),
    );
    let engine = Arc::new(ConsentEngine::new(
        store.clone(),
        cache,
        bus.clone(),
        client.clone(),
        clock.clone(),
    ));
    let queue = Arc::new(JobQueue::new(
        store.clone(),
        clock.clone(),
        QueueConfig::default(),
    ));
    let pool = WorkerPool::new(
        queue.clone(),
        store.clone(),
        engine,
        client,
        bus.clone(),
        clock.clone(),
        WorkerConfig {
            node_id: "test-node".into(),
            concurrency: 2,
            per_org_concurrency: 2,
            lease_batch: 4,
            visibility: Duration::seconds(60),
            job_deadline,
            idle_sleep: std::time::Duration::from_millis(20),
        },
    );
    Rig {
        clock,
        store,
        bus,
        queue,
        pool,
        _dir: dir,
    }
}

fn seed_consent(r: &Rig, id: &str, status: ConsentStatus, permissions: &[Permission]) {
    let now = r.clock.now();
    let consent = Consent {
        consent_id: ConsentId::new(id),
        client_id: ClientId::new("cli-1"),
        organisation_id: OrganisationId::new("org-1"),
        status,
        created_at: now - Duration::days(1),
        status_updated_at: now - Duration::days(1),
        expires_at: Some(now + Duration::days(30)),
        permissions: permissions.iter().copied().collect(),
        logged_user_id: "52998224725".into(),
        business_entity_id: None,
        linked_account_ids: BTreeSet::from([AccountId::new("A1")]),
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

fn enqueue(r: &Rig, kind: JobKind, consent: &str) -> recepta_core::types::JobId {
    r.queue
        .enqueue(NewJob {
            kind,
            consent_id: ConsentId::new(consent),
            account_id: Some(AccountId::new("A1")),
            client_id: ClientId::new("cli-1"),
            organisation_id: OrganisationId::new("org-1"),
            priority: 10,
            run_id: RunId::allocate(r.clock.now()),
        })
        .unwrap()
        .job_id()
}

fn mock_identification(server: &MockServer) -> httpmock::Mock<'_> {
    server.mock(|when, then| {
        when.method(GET).path("/open-banking/accounts/v2/accounts/A1");
        then.status(200).json_body(serde_json::json!({
            "data": {
                "accountId": "A1",
                "brandName": "Banco Exemplo",
                "companyCnpj": "11222333000181",
                "type": "CONTA_DEPOSITO_A_VISTA",
                "compeCode": "001",
                "branchCode": "6272",
                "number": "94088392",
                "checkDigit": "4",
                "currency": "BRL"
            },
            "links": {}, "meta": {}
        }));
    })
}

fn mock_balances(server: &MockServer) -> httpmock::Mock<'_> {
    server.mock(|when, then| {
        when.method(GET)
            .path("/open-banking/accounts/v2/accounts/A1/balances");
        then.status(200).json_body(serde_json::json!({
            "data": {
                "availableAmount": {"amount": "100.00", "currency": "BRL"},
                "blockedAmount": {"amount": "0.00", "currency": "BRL"},
                "automaticallyInvestedAmount": {"amount": "0.00", "currency": "BRL"},
                "updateDateTime": "2026-08-01T08:59:00Z"
            },
            "links": {}, "meta": {}
        }));
    })
}

fn mock_no_limits(server: &MockServer) -> httpmock::Mock<'_> {
    server.mock(|when, then| {
        when.method(GET)
            .path("/open-banking/accounts/v2/accounts/A1/overdraft-limits");
        then.status(404);
    })
}

/// Run the pool until `done` reports true (or the timeout hits), then stop
/// the workers and drain.
async fn run_pool_until<F>(r: &Rig, done: F)
where
    F: Fn() -> bool,
{
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(r.pool.clone().run(rx));
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while !done() {
        assert!(
            std::time::Instant::now() < deadline,
            "pool did not reach the expected state in time"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    tx.send(true).unwrap();
    handle.await.unwrap();
}

fn job_status(r: &Rig, job_id: &recepta_core::types::JobId) -> JobStatus {
    r.store
        .get::<SyncJob>(Collection::Jobs, "org-1", &job_id.to_string())
        .unwrap()
        .unwrap()
        .doc
        .status
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

// ── ACCOUNT_SYNC ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn account_sync_happy_path_persists_account_and_balance() {
    let server = MockServer::start();
    mock_identification(&server);
    mock_balances(&server);
    mock_no_limits(&server);
    let r = rig(&server);
    let mut rx = r.bus.subscribe();
    seed_consent(
        &r,
        "urn:c:1",
        ConsentStatus::Authorised,
        &[Permission::AccountsRead, Permission::AccountsBalancesRead],
    );
    let job_id = enqueue(&r, JobKind::AccountSync, "urn:c:1");

    let store = r.store.clone();
    run_pool_until(&r, || {
        store
            .lookup_account("org-1", "A1")
            .unwrap()
            .map(|(_, internal)| {
                store
                    .get::<BalanceSnapshot>(Collection::Balances, "cli-1", &internal.to_string())
                    .unwrap()
                    .is_some()
            })
            .unwrap_or(false)
    })
    .await;

    let (owner, internal) = r.store.lookup_account("org-1", "A1").unwrap().unwrap();
    assert_eq!(owner, "cli-1");
    let account = r
        .store
        .get::<Account>(Collection::Accounts, "cli-1", &internal.to_string())
        .unwrap()
        .unwrap();
    assert_eq!(account.doc.status, AccountStatus::Active);
    assert_eq!(account.doc.brand, "Banco Exemplo");
    assert_eq!(account.doc.last_synced_at, Some(r.clock.now()));

    let balance = r
        .store
        .get::<BalanceSnapshot>(Collection::Balances, "cli-1", &internal.to_string())
        .unwrap()
        .unwrap();
    assert_eq!(balance.doc.available_amount.amount.to_string(), "100.00");
    assert_eq!(balance.doc.available_amount.currency, "BRL");

    assert_eq!(job_status(&r, &job_id), JobStatus::Done);

    let events = drain(&mut rx);
    let synced: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, Event::AccountSynced { outcome: SyncOutcome::Success, .. }))
        .collect();
    assert_eq!(synced.len(), 1);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::JobDone { outcome: SyncOutcome::Success, .. })));
}

#[tokio::test]
async fn non_collectable_consent_skips_without_calling_the_holder() {
    let server = MockServer::start();
    let identification = mock_identification(&server);
    let r = rig(&server);
    let mut rx = r.bus.subscribe();
    seed_consent(
        &r,
        "urn:c:2",
        ConsentStatus::Expired,
        &[Permission::AccountsRead],
    );
    let job_id = enqueue(&r, JobKind::AccountSync, "urn:c:2");

    let store = r.store.clone();
    run_pool_until(&r, || {
        store
            .get::<SyncJob>(Collection::Jobs, "org-1", &job_id.to_string())
            .unwrap()
            .map(|v| v.doc.status == JobStatus::Done)
            .unwrap_or(false)
    })
    .await;

    identification.assert_hits(0);
    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::JobDone { outcome: SyncOutcome::Skipped, .. })));
}

#[tokio::test]
async fn holder_404_marks_account_inactive_and_acks() {
    let server = MockServer::start();
    let mut identification = mock_identification(&server);
    mock_balances(&server);
    mock_no_limits(&server);
    let r = rig(&server);
    seed_consent(
        &r,
        "urn:c:3",
        ConsentStatus::Authorised,
        &[Permission::AccountsRead],
    );

    // First sync ingests the account.
    let first = enqueue(&r, JobKind::AccountSync, "urn:c:3");
    let store = r.store.clone();
    run_pool_until(&r, || {
        store
            .get::<SyncJob>(Collection::Jobs, "org-1", &first.to_string())
            .unwrap()
            .map(|v| v.doc.status == JobStatus::Done)
            .unwrap_or(false)
    })
    .await;

    // The holder stops serving the account.
    identification.delete();
    server.mock(|when, then| {
        when.method(GET).path("/open-banking/accounts/v2/accounts/A1");
        then.status(404);
    });

    let second = enqueue(&r, JobKind::AccountSync, "urn:c:3");
    let store = r.store.clone();
    run_pool_until(&r, || {
        store
            .get::<SyncJob>(Collection::Jobs, "org-1", &second.to_string())
            .unwrap()
            .map(|v| v.doc.status == JobStatus::Done)
            .unwrap_or(false)
    })
    .await;

    let (_, internal) = r.store.lookup_account("org-1", "A1").unwrap().unwrap();
    let account = r
        .store
        .get::<Account>(Collection::Accounts, "cli-1", &internal.to_string())
        .unwrap()
        .unwrap();
    assert_eq!(account.doc.status, AccountStatus::Inactive);
}

#[tokio::test]
async fn bad_request_dead_letters_the_job() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/open-banking/accounts/v2/accounts/A1");
        then.status(400).body("{\"errors\":[]}");
    });
    let r = rig(&server);
    let mut rx = r.bus.subscribe();
    seed_consent(
        &r,
        "urn:c:4",
        ConsentStatus::Authorised,
        &[Permission::AccountsRead],
    );
    let job_id = enqueue(&r, JobKind::AccountSync, "urn:c:4");

    let store = r.store.clone();
    run_pool_until(&r, || {
        store
            .get::<SyncJob>(Collection::Jobs, "org-1", &job_id.to_string())
            .unwrap()
            .map(|v| v.doc.status == JobStatus::Dead)
            .unwrap_or(false)
    })
    .await;

    let events = drain(&mut rx);
    let dead = events.iter().find_map(|e| match e {
        Event::JobDead { error_class, .. } => Some(error_class.clone()),
        _ => None,
    });
    assert_eq!(dead.as_deref(), Some("bad_request"));
}

#[tokio::test]
async fn deadline_overrun_nacks_as_retryable() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/open-banking/accounts/v2/accounts/A1");
        then.status(200)
            .delay(std::time::Duration::from_secs(5))
            .json_body(serde_json::json!({"data": {}}));
    });
    let r = rig_with_deadline(&server, std::time::Duration::from_millis(150));
    seed_consent(
        &r,
        "urn:c:5",
        ConsentStatus::Authorised,
        &[Permission::AccountsRead],
    );
    let job_id = enqueue(&r, JobKind::AccountSync, "urn:c:5");

    let store = r.store.clone();
    run_pool_until(&r, || {
        store
            .get::<SyncJob>(Collection::Jobs, "org-1", &job_id.to_string())
            .unwrap()
            .map(|v| v.doc.status == JobStatus::Pending && v.doc.attempts == 1)
            .unwrap_or(false)
    })
    .await;

    let job = r
        .store
        .get::<SyncJob>(Collection::Jobs, "org-1", &job_id.to_string())
        .unwrap()
        .unwrap();
    assert_eq!(job.doc.attempts, 1);
    assert!(job.doc.next_visible_at.is_some());
}

#[tokio::test]
async fn stale_balance_payload_never_overwrites_newer_snapshot() {
    let server = MockServer::start();
    mock_identification(&server);
    let mut balances = mock_balances(&server);
    mock_no_limits(&server);
    let r = rig(&server);
    seed_consent(
        &r,
        "urn:c:8",
        ConsentStatus::Authorised,
        &[Permission::AccountsRead, Permission::AccountsBalancesRead],
    );

    let first = enqueue(&r, JobKind::AccountSync, "urn:c:8");
    let store = r.store.clone();
    run_pool_until(&r, || {
        store
            .get::<SyncJob>(Collection::Jobs, "org-1", &first.to_string())
            .unwrap()
            .map(|v| v.doc.status == JobStatus::Done)
            .unwrap_or(false)
    })
    .await;

    // The holder now serves an older snapshot (out-of-order replica read).
    balances.delete();
    server.mock(|when, then| {
        when.method(GET)
            .path("/open-banking/accounts/v2/accounts/A1/balances");
        then.status(200).json_body(serde_json::json!({
            "data": {
                "availableAmount": {"amount": "7.77", "currency": "BRL"},
                "blockedAmount": {"amount": "0.00", "currency": "BRL"},
                "automaticallyInvestedAmount": {"amount": "0.00", "currency": "BRL"},
                "updateDateTime": "2026-07-01T00:00:00Z"
            },
            "links": {}, "meta": {}
        }));
    });

    r.clock.advance(Duration::hours(1));
    let second = enqueue(&r, JobKind::BalanceSync, "urn:c:8");
    let store = r.store.clone();
    run_pool_until(&r, || {
        store
            .get::<SyncJob>(Collection::Jobs, "org-1", &second.to_string())
            .unwrap()
            .map(|v| v.doc.status == JobStatus::Done)
            .unwrap_or(false)
    })
    .await;

    let (_, internal) = r.store.lookup_account("org-1", "A1").unwrap().unwrap();
    let balance = r
        .store
        .get::<BalanceSnapshot>(Collection::Balances, "cli-1", &internal.to_string())
        .unwrap()
        .unwrap();
    assert_eq!(
        balance.doc.available_amount.amount.to_string(),
        "100.00",
        "older payload must not win"
    );

    // last_synced_at still advanced: the refresh itself happened.
    let account = r
        .store
        .get::<Account>(Collection::Accounts, "cli-1", &internal.to_string())
        .unwrap()
        .unwrap();
    assert_eq!(account.doc.last_synced_at, Some(r.clock.now()));
}

// ── TX_SYNC ──────────────────────────────────────────────────────────────────

fn mock_transactions(server: &MockServer) -> httpmock::Mock<'_> {
    let tx = |id: &str, amount: &str| {
        serde_json::json!({
            "transactionId": id,
            "transactionName": "PIX",
            "creditDebitType": "CREDITO",
            "amount": {"amount": amount, "currency": "BRL"},
            "transactionDateTime": "2026-07-20T10:00:00Z"
        })
    };
    server.mock(|when, then| {
        when.method(GET)
            .path("/open-banking/accounts/v2/accounts/A1/transactions");
        then.status(200).json_body(serde_json::json!({
            "data": [tx("t1", "10.00"), tx("t2", "25.50"), tx("t3", "3.10")],
            "links": {}, "meta": {"totalRecords": 3, "totalPages": 1}
        }));
    })
}

#[tokio::test]
async fn transaction_ingest_is_idempotent_across_reruns() {
    let server = MockServer::start();
    mock_identification(&server);
    mock_balances(&server);
    mock_no_limits(&server);
    mock_transactions(&server);
    let r = rig(&server);
    seed_consent(
        &r,
        "urn:c:6",
        ConsentStatus::Authorised,
        &[
            Permission::AccountsRead,
            Permission::AccountsBalancesRead,
            Permission::AccountsTransactionsRead,
        ],
    );

    // ACCOUNT_SYNC ingests and chains a TX_SYNC for the same account.
    enqueue(&r, JobKind::AccountSync, "urn:c:6");
    let store = r.store.clone();
    run_pool_until(&r, || store.count(Collection::Transactions) == 3).await;

    let (_, internal) = r.store.lookup_account("org-1", "A1").unwrap().unwrap();
    let first_pass: Vec<Transaction> = r
        .store
        .query::<Transaction>(
            Collection::Transactions,
            Some(&internal.to_string()),
            10,
            None,
            |_| true,
        )
        .unwrap()
        .items
        .into_iter()
        .map(|v| v.doc)
        .collect();
    assert_eq!(first_pass.len(), 3);

    // The cursor is parked on the sync day.
    let account = r
        .store
        .get::<Account>(Collection::Accounts, "cli-1", &internal.to_string())
        .unwrap()
        .unwrap();
    assert_eq!(
        account.doc.last_booking_date_synced,
        Some(r.clock.now().date_naive())
    );

    // A later rerun sees the same holder page again.
    r.clock.advance(Duration::hours(3));
    let rerun = enqueue(&r, JobKind::TxSync, "urn:c:6");
    let store = r.store.clone();
    run_pool_until(&r, || {
        store
            .get::<SyncJob>(Collection::Jobs, "org-1", &rerun.to_string())
            .unwrap()
            .map(|v| v.doc.status == JobStatus::Done)
            .unwrap_or(false)
    })
    .await;

    let second_pass: Vec<Transaction> = r
        .store
        .query::<Transaction>(
            Collection::Transactions,
            Some(&internal.to_string()),
            10,
            None,
            |_| true,
        )
        .unwrap()
        .items
        .into_iter()
        .map(|v| v.doc)
        .collect();
    assert_eq!(second_pass.len(), 3, "rerun must not duplicate rows");
    for (a, b) in first_pass.iter().zip(second_pass.iter()) {
        assert_eq!(a.external_transaction_id, b.external_transaction_id);
        assert_eq!(a.created_at, b.created_at, "first ingest instant must stick");
    }
}

// ── CONSENT_SYNC ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn consent_sync_applies_holder_transition() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET)
            .path("/open-banking/consents/v3/consents/urn:c:7");
        then.status(200).json_body(serde_json::json!({
            "data": {
                "consentId": "urn:c:7",
                "status": "REVOKED",
                "statusUpdateDateTime": "2026-08-01T08:00:00Z",
                "permissions": [],
                "rejection": {"reasonCode": "CUSTOMER_MANUALLY_REVOKED"}
            },
            "links": {}, "meta": {}
        }));
    });
    let r = rig(&server);
    seed_consent(
        &r,
        "urn:c:7",
        ConsentStatus::Authorised,
        &[Permission::AccountsRead],
    );
    let job_id = r
        .queue
        .enqueue(NewJob {
            kind: JobKind::ConsentSync,
            consent_id: ConsentId::new("urn:c:7"),
            account_id: None,
            client_id: ClientId::new("cli-1"),
            organisation_id: OrganisationId::new("org-1"),
            priority: 10,
            run_id: RunId::allocate(r.clock.now()),
        })
        .unwrap()
        .job_id();

    let store = r.store.clone();
    run_pool_until(&r, || {
        store
            .get::<SyncJob>(Collection::Jobs, "org-1", &job_id.to_string())
            .unwrap()
            .map(|v| v.doc.status == JobStatus::Done)
            .unwrap_or(false)
    })
    .await;

    let consent = r
        .store
        .get::<Consent>(Collection::Consents, "cli-1", "urn:c:7")
        .unwrap()
        .unwrap();
    assert_eq!(consent.doc.status, ConsentStatus::Revoked);
    assert_eq!(
        consent.doc.rejection.unwrap().code,
        "CUSTOMER_MANUALLY_REVOKED"
    );
}
