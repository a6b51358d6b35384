use chrono::Duration;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use recepta_cache::MemoryCache;
use recepta_client::wire::{self, ExtensionRequestData};
use recepta_client::TransmitterClient;
use recepta_core::clock::Clock;
use recepta_core::consent::{Consent, ConsentExtension, ConsentRejection, ConsentStatus};
use recepta_core::constants::{
    CONFLICT_MAX_REPLAYS, CONSENT_CACHE_TTL_SECS, EXTENSION_MAX_DAYS, SCHEDULER_PAGE_SIZE,
    SYNC_SWEEP_MIN_AGE_SECS,
};
use recepta_core::context::Context;
use recepta_core::documents::validate_cpf;
use recepta_core::error::ReceptaError;
use recepta_core::event::Event;
use recepta_core::types::{ClientId, ConsentId, Timestamp};
use recepta_events::EventPublisher;
use recepta_store::{consent_retention, Collection, Page, Store};

use crate::codes;

// ── ExtensionRequest ─────────────────────────────────────────────────────────

/// Inbound extension request, already shorn of transport details.
#[derive(Clone, Debug)]
pub struct ExtensionRequest {
    pub new_expires_at: Timestamp,
    /// CPF of the requesting customer.
    pub logged_user_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

// ── ConsentEngine ────────────────────────────────────────────────────────────

pub struct ConsentEngine {
    store: Arc<Store>,
    cache: Arc<MemoryCache>,
    bus: Arc<dyn EventPublisher>,
    client: Arc<TransmitterClient>,
    clock: Arc<dyn Clock>,
}

fn cache_key(consent_id: &ConsentId) -> String {
    format!("consent/{consent_id}")
}

impl ConsentEngine {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<MemoryCache>,
        bus: Arc<dyn EventPublisher>,
        client: Arc<TransmitterClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            bus,
            client,
            clock,
        }
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    /// Read one consent when the owning tenant is known (the fast path).
    pub fn get(
        &self,
        client_id: &ClientId,
        consent_id: &ConsentId,
    ) -> Result<Option<Consent>, ReceptaError> {
        Ok(self
            .store
            .get::<Consent>(Collection::Consents, client_id.as_str(), consent_id.as_str())?
            .map(|v| {
                let mut c = v.doc;
                c.version = v.version;
                c
            }))
    }

    /// Read one consent by id alone. Serves the hot cache first, then scans
    /// partitions; the cache is refilled on a store hit.
    pub async fn find(&self, consent_id: &ConsentId) -> Result<Option<Consent>, ReceptaError> {
        let key = cache_key(consent_id);
        if let Some(bytes) = self.cache.get(&key).await {
            if let Ok(consent) = serde_json::from_slice::<Consent>(&bytes) {
                return Ok(Some(consent));
            }
        }
        let page = self.store.query::<Consent>(
            Collection::Consents,
            None,
            1,
            None,
            |c: &Consent| &c.consent_id == consent_id,
        )?;
        let Some(v) = page.items.into_iter().next() else {
            return Ok(None);
        };
        let mut consent = v.doc;
        consent.version = v.version;
        self.cache
            .put(
                key,
                serde_json::to_vec(&consent)
                    .map_err(|e| ReceptaError::Serialization(e.to_string()))?,
                Duration::seconds(CONSENT_CACHE_TTL_SECS),
            )
            .await;
        Ok(Some(consent))
    }

    pub fn find_by_client(
        &self,
        client_id: &ClientId,
        limit: usize,
        page_token: Option<&str>,
    ) -> Result<Page<Consent>, ReceptaError> {
        self.store.query(
            Collection::Consents,
            Some(client_id.as_str()),
            limit,
            page_token,
            |_| true,
        )
    }

    /// The scheduler's feeder: AUTHORISED consents whose cooldown has lapsed
    /// (or that were never processed), in partition-key order.
    pub fn find_due(
        &self,
        now: Timestamp,
        cooldown: Duration,
        limit: usize,
        page_token: Option<&str>,
    ) -> Result<Page<Consent>, ReceptaError> {
        self.store.query(
            Collection::Consents,
            None,
            limit,
            page_token,
            |c: &Consent| c.is_due(now, cooldown),
        )
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Persist a consent with its carried version, stamp retention, and drop
    /// the cache entry. Returns the consent with the fresh version.
    fn save(&self, mut consent: Consent) -> Result<Consent, ReceptaError> {
        let now = self.clock.now();
        let new_version = self.store.upsert(
            Collection::Consents,
            consent.client_id.as_str(),
            consent.consent_id.as_str(),
            &consent,
            Some(consent.version),
            now,
        )?;
        consent.version = new_version;
        self.store.set_expiry(
            Collection::Consents,
            consent.client_id.as_str(),
            consent.consent_id.as_str(),
            consent_retention(consent.status, consent.expires_at, now),
        )?;
        Ok(consent)
    }

    /// Apply a status transition with bounded optimistic-conflict replays.
    /// Emits `ConsentStatusChanged` after the write lands.
    pub async fn apply_transition(
        &self,
        client_id: &ClientId,
        consent_id: &ConsentId,
        to: ConsentStatus,
        rejection: Option<ConsentRejection>,
    ) -> Result<Consent, ReceptaError> {
        let mut replays = 0;
        loop {
            let consent = self
                .get(client_id, consent_id)?
                .ok_or_else(|| ReceptaError::NotFound(format!("consent {consent_id}")))?;
            let previous = consent.status;
            if previous == to {
                // Reconcile observed no change; nothing to write.
                return Ok(consent);
            }
            let now = self.clock.now();
            let next = consent.transition(to, rejection.clone(), now)?;
            match self.save(next) {
                Ok(saved) => {
                    self.cache.evict(&cache_key(consent_id)).await;
                    info!(consent_id = %consent_id, from = %previous, to = %to, "consent transitioned");
                    self.bus
                        .publish(Event::ConsentStatusChanged {
                            consent_id: consent_id.clone(),
                            client_id: client_id.clone(),
                            previous,
                            new: to,
                            at: now,
                        })
                        .await?;
                    return Ok(saved);
                }
                Err(ReceptaError::Conflict { .. }) if replays < CONFLICT_MAX_REPLAYS => {
                    replays += 1;
                    debug!(consent_id = %consent_id, replays, "transition conflict, replaying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stamp `last_processed_at` (scheduler pickup marker) with replays.
    pub async fn record_processed(
        &self,
        client_id: &ClientId,
        consent_id: &ConsentId,
        at: Timestamp,
    ) -> Result<(), ReceptaError> {
        let mut replays = 0;
        loop {
            let Some(mut consent) = self.get(client_id, consent_id)? else {
                return Err(ReceptaError::NotFound(format!("consent {consent_id}")));
            };
            consent.last_processed_at = Some(at);
            match self.save(consent) {
                Ok(_) => {
                    self.cache.evict(&cache_key(consent_id)).await;
                    return Ok(());
                }
                Err(ReceptaError::Conflict { .. }) if replays < CONFLICT_MAX_REPLAYS => {
                    replays += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── Extension ────────────────────────────────────────────────────────────

    /// Validate and execute an extension: transmitter call, audit row, and
    /// the parent's `expires_at` advanced, in that order.
    pub async fn extend(
        &self,
        client_id: &ClientId,
        consent_id: &ConsentId,
        request: ExtensionRequest,
    ) -> Result<ConsentExtension, ReceptaError> {
        let consent = self
            .get(client_id, consent_id)?
            .ok_or_else(|| ReceptaError::NotFound(format!("consent {consent_id}")))?;

        if consent.status != ConsentStatus::Authorised {
            return Err(ReceptaError::invalid_consent_state(
                codes::INVALID_STATE,
                format!("consent {consent_id} is {}", consent.status),
            ));
        }
        if consent.multiple_approval_required {
            return Err(ReceptaError::invalid_consent_state(
                codes::MULTIPLE_APPROVAL,
                format!("consent {consent_id} requires approval from every representative"),
            ));
        }
        let logged_user = validate_cpf(&request.logged_user_id)?;
        let now = self.clock.now();
        if request.new_expires_at <= now {
            return Err(ReceptaError::validation(
                codes::INVALID_EXPIRY,
                "expiration must be in the future",
            ));
        }
        if request.new_expires_at > now + Duration::days(EXTENSION_MAX_DAYS) {
            return Err(ReceptaError::validation(
                codes::INVALID_EXPIRY,
                format!("expiration must be within {EXTENSION_MAX_DAYS} days"),
            ));
        }

        let ctx = Context::new();
        let response = self
            .client
            .extend_consent(
                &ctx,
                client_id,
                &consent.organisation_id,
                consent_id,
                &ExtensionRequestData {
                    expiration_date_time: request.new_expires_at,
                    logged_user: wire::LoggedUserWire {
                        document: wire::DocumentWire {
                            identification: logged_user.clone(),
                            rel: "CPF".to_string(),
                        },
                    },
                },
            )
            .await?;

        let extension = ConsentExtension {
            id: uuid::Uuid::new_v4(),
            consent_id: consent_id.clone(),
            previous_expires_at: consent.expires_at,
            new_expires_at: response.expiration_date_time,
            requested_at: now,
            logged_user_id: logged_user,
            ip_address: request.ip_address,
            user_agent: request.user_agent,
        };
        self.store.upsert(
            Collection::ConsentExtensions,
            client_id.as_str(),
            &extension.id.to_string(),
            &extension,
            None,
            now,
        )?;

        // Advance the parent's expiry, replaying conflicts.
        let mut replays = 0;
        loop {
            let Some(mut fresh) = self.get(client_id, consent_id)? else {
                return Err(ReceptaError::NotFound(format!("consent {consent_id}")));
            };
            fresh.expires_at = Some(extension.new_expires_at);
            match self.save(fresh) {
                Ok(_) => break,
                Err(ReceptaError::Conflict { .. }) if replays < CONFLICT_MAX_REPLAYS => {
                    replays += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        self.cache.evict(&cache_key(consent_id)).await;

        info!(consent_id = %consent_id, new_expires_at = %extension.new_expires_at, "consent extended");
        self.bus
            .publish(Event::ConsentExtended {
                consent_id: consent_id.clone(),
                client_id: client_id.clone(),
                previous_expires_at: extension.previous_expires_at,
                new_expires_at: extension.new_expires_at,
                at: now,
            })
            .await?;
        Ok(extension)
    }

    // ── Sweeps ───────────────────────────────────────────────────────────────

    /// Expire AUTHORISED consents whose `expires_at` has passed. Returns the
    /// number transitioned.
    pub async fn expiry_sweep(&self) -> Result<usize, ReceptaError> {
        let now = self.clock.now();
        let mut expired = 0;
        let mut page_token: Option<String> = None;
        loop {
            let page = self.store.query::<Consent>(
                Collection::Consents,
                None,
                SCHEDULER_PAGE_SIZE,
                page_token.as_deref(),
                |c: &Consent| c.status == ConsentStatus::Authorised && c.is_expired_at(now),
            )?;
            for v in &page.items {
                match self
                    .apply_transition(
                        &v.doc.client_id,
                        &v.doc.consent_id,
                        ConsentStatus::Expired,
                        None,
                    )
                    .await
                {
                    Ok(_) => expired += 1,
                    Err(ReceptaError::InvalidConsentState { .. }) => {
                        // Another writer got there first; fine.
                    }
                    Err(e) => {
                        warn!(consent_id = %v.doc.consent_id, error = %e, "expiry sweep failed for consent")
                    }
                }
            }
            match page.next {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        if expired > 0 {
            info!(expired, "expiry sweep transitioned consents");
        }
        Ok(expired)
    }

    /// Reconcile stale AWAITING_AUTHORISATION consents against the
    /// transmitter. No-ops when the holder reports the same status; terminal
    /// holder statuses are applied locally (event + cache eviction included).
    pub async fn sync_sweep(&self) -> Result<usize, ReceptaError> {
        let now = self.clock.now();
        let threshold = now - Duration::seconds(SYNC_SWEEP_MIN_AGE_SECS);
        let mut reconciled = 0;
        let mut page_token: Option<String> = None;
        loop {
            let page = self.store.query::<Consent>(
                Collection::Consents,
                None,
                SCHEDULER_PAGE_SIZE,
                page_token.as_deref(),
                |c: &Consent| {
                    c.status == ConsentStatus::AwaitingAuthorisation && c.created_at < threshold
                },
            )?;
            for v in &page.items {
                match self.sync(&v.doc.client_id, &v.doc.consent_id).await {
                    Ok(true) => reconciled += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(consent_id = %v.doc.consent_id, error = %e, "sync sweep failed for consent")
                    }
                }
            }
            match page.next {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(reconciled)
    }

    /// Reconcile one consent against the transmitter's view. Returns whether
    /// a transition was applied. Also the CONSENT_SYNC job handler.
    pub async fn sync(
        &self,
        client_id: &ClientId,
        consent_id: &ConsentId,
    ) -> Result<bool, ReceptaError> {
        let consent = self
            .get(client_id, consent_id)?
            .ok_or_else(|| ReceptaError::NotFound(format!("consent {consent_id}")))?;
        let ctx = Context::new();
        let remote = self
            .client
            .get_consent(&ctx, client_id, &consent.organisation_id, consent_id)
            .await?;
        let remote_status = remote.status_enum()?;
        if remote_status == consent.status {
            return Ok(false);
        }
        let rejection = remote.rejection.map(|r| ConsentRejection {
            code: r.reason_code,
            detail: r.additional_information,
        });
        self.apply_transition(client_id, consent_id, remote_status, rejection)
            .await?;
        Ok(true)
    }

    /// Hourly expiry sweep driven by `interval`, until shutdown flips.
    pub async fn run_expiry_loop(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.expiry_sweep().await {
                        warn!(error = %e, "expiry sweep iteration failed");
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

    /// Reconcile sweep loop (default every 30 min), until shutdown flips.
    pub async fn run_sync_loop(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_sweep().await {
                        warn!(error = %e, "sync sweep iteration failed");
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
