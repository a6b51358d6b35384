use chrono::{Duration, NaiveDate};
use std::sync::Arc;
use tracing::{debug, info, warn};

use recepta_client::wire::{self, OverdraftLimitsData};
use recepta_client::TransmitterClient;
use recepta_consent::ConsentEngine;
use recepta_core::account::{Account, AccountStatus, BalanceSnapshot};
use recepta_core::clock::Clock;
use recepta_core::consent::{Consent, Permission};
use recepta_core::constants::{CONFLICT_MAX_REPLAYS, TX_BOOTSTRAP_WINDOW_DAYS};
use recepta_core::context::Context;
use recepta_core::error::{ReceptaError, TransmitterErrorKind};
use recepta_core::event::SyncOutcome;
use recepta_core::job::{JobKind, SyncJob};
use recepta_core::types::AccountId;
use recepta_queue::{JobQueue, NewJob};
use recepta_store::{Collection, Store};

/// Per-kind job handlers. Every write is a conditional upsert; conflicts
/// replay a bounded number of times and then surface (the queue nacks the
/// job as retryable).
pub(crate) struct SyncHandlers {
    store: Arc<Store>,
    engine: Arc<ConsentEngine>,
    client: Arc<TransmitterClient>,
    queue: Arc<JobQueue>,
    clock: Arc<dyn Clock>,
}

impl SyncHandlers {
    pub fn new(
        store: Arc<Store>,
        engine: Arc<ConsentEngine>,
        client: Arc<TransmitterClient>,
        queue: Arc<JobQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            engine,
            client,
            queue,
            clock,
        }
    }

    pub async fn dispatch(
        &self,
        ctx: &Context,
        job: &SyncJob,
    ) -> Result<SyncOutcome, ReceptaError> {
        match job.kind {
            JobKind::AccountSync => self.account_sync(ctx, job).await,
            JobKind::BalanceSync => self.balance_sync(ctx, job).await,
            JobKind::TxSync => self.tx_sync(ctx, job).await,
            JobKind::ConsentSync => self.consent_sync(job).await,
        }
    }

    /// Load the gating consent. `None` means the job must be skipped: the
    /// consent is gone, no longer AUTHORISED, or does not link the account.
    fn gating_consent(&self, job: &SyncJob) -> Result<Option<Consent>, ReceptaError> {
        let Some(consent) = self.engine.get(&job.client_id, &job.consent_id)? else {
            debug!(job_id = %job.job_id, "consent vanished, skipping");
            return Ok(None);
        };
        let now = self.clock.now();
        if !consent.status.permits_collection() || consent.is_expired_at(now) {
            debug!(job_id = %job.job_id, status = %consent.status, "consent no longer collectable, skipping");
            return Ok(None);
        }
        if let Some(account_id) = &job.account_id {
            if !consent.linked_account_ids.contains(account_id) {
                debug!(job_id = %job.job_id, account_id = %account_id, "account not linked, skipping");
                return Ok(None);
            }
        }
        Ok(Some(consent))
    }

    fn required_account(job: &SyncJob) -> Result<&AccountId, ReceptaError> {
        job.account_id.as_ref().ok_or_else(|| {
            ReceptaError::Fatal(format!("{} job {} without account id", job.kind, job.job_id))
        })
    }

    // ── ACCOUNT_SYNC ─────────────────────────────────────────────────────────

    async fn account_sync(
        &self,
        ctx: &Context,
        job: &SyncJob,
    ) -> Result<SyncOutcome, ReceptaError> {
        let Some(consent) = self.gating_consent(job)? else {
            return Ok(SyncOutcome::Skipped);
        };
        let account_id = Self::required_account(job)?;

        let identification = match self
            .client
            .account_identification(ctx, &job.client_id, &job.organisation_id, account_id)
            .await
        {
            Ok(data) => data,
            Err(ReceptaError::Transmitter(e)) if e.kind == TransmitterErrorKind::NotFound => {
                // The holder no longer serves this account: deactivate ours
                // and treat the job as handled.
                self.mark_account_inactive(job).await?;
                return Ok(SyncOutcome::Success);
            }
            Err(e) => return Err(e),
        };

        // Claim (or find) the one-row-per-holder-account slot.
        let internal_id = uuid::Uuid::new_v4();
        let (owner_client, internal_id) = self.store.claim_account_slot(
            job.organisation_id.as_str(),
            account_id.as_str(),
            job.client_id.as_str(),
            internal_id,
        )?;
        if owner_client != job.client_id.as_str() {
            return Err(ReceptaError::Fatal(format!(
                "account {account_id} at {} already owned by client {owner_client}",
                job.organisation_id
            )));
        }

        let now = self.clock.now();
        let mut replays = 0;
        loop {
            let existing = self.store.get::<Account>(
                Collection::Accounts,
                job.client_id.as_str(),
                &internal_id.to_string(),
            )?;
            let mut account = identification.clone().into_account(
                internal_id,
                job.consent_id.clone(),
                job.client_id.clone(),
                job.organisation_id.clone(),
            )?;
            if let Some(v) = &existing {
                account.last_booking_date_synced = v.doc.last_booking_date_synced;
                account.version = v.version;
            }
            account.status = AccountStatus::Active;
            account.last_synced_at = Some(now);
            match self.store.upsert(
                Collection::Accounts,
                job.client_id.as_str(),
                &internal_id.to_string(),
                &account,
                Some(account.version),
                now,
            ) {
                Ok(_) => break,
                Err(ReceptaError::Conflict { .. }) if replays < CONFLICT_MAX_REPLAYS => {
                    replays += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        self.refresh_balances(ctx, job, internal_id).await?;

        // Transactions ride their own job so a slow holder cannot pin the
        // account refresh; dedup keeps one TX_SYNC in flight per account.
        if consent
            .permissions
            .contains(&Permission::AccountsTransactionsRead)
        {
            self.queue.enqueue(NewJob {
                kind: JobKind::TxSync,
                consent_id: job.consent_id.clone(),
                account_id: Some(account_id.clone()),
                client_id: job.client_id.clone(),
                organisation_id: job.organisation_id.clone(),
                priority: job.priority,
                run_id: job.run_id.clone(),
            })?;
        }

        info!(account_id = %account_id, org = %job.organisation_id, "account synced");
        Ok(SyncOutcome::Success)
    }

    // ── BALANCE_SYNC ─────────────────────────────────────────────────────────

    async fn balance_sync(
        &self,
        ctx: &Context,
        job: &SyncJob,
    ) -> Result<SyncOutcome, ReceptaError> {
        if self.gating_consent(job)?.is_none() {
            return Ok(SyncOutcome::Skipped);
        }
        let account_id = Self::required_account(job)?;
        let Some((_, internal_id)) = self
            .store
            .lookup_account(job.organisation_id.as_str(), account_id.as_str())?
        else {
            // Never fully ingested; a cheap refresh has nothing to refresh.
            warn!(account_id = %account_id, "balance sync before first account sync, skipping");
            return Ok(SyncOutcome::Skipped);
        };
        self.refresh_balances(ctx, job, internal_id).await?;
        self.touch_account(job, internal_id).await?;
        Ok(SyncOutcome::Success)
    }

    async fn refresh_balances(
        &self,
        ctx: &Context,
        job: &SyncJob,
        internal_id: uuid::Uuid,
    ) -> Result<(), ReceptaError> {
        let account_id = Self::required_account(job)?;
        let balances = self
            .client
            .balances(ctx, &job.client_id, &job.organisation_id, account_id)
            .await?;
        // Not every holder exposes overdraft limits; absence is an empty set.
        let limits = match self
            .client
            .overdraft_limits(ctx, &job.client_id, &job.organisation_id, account_id)
            .await
        {
            Ok(l) => l,
            Err(ReceptaError::Transmitter(e)) if e.kind == TransmitterErrorKind::NotFound => {
                OverdraftLimitsData::default()
            }
            Err(e) => return Err(e),
        };
        let snapshot =
            wire::into_snapshot(balances, limits, internal_id, job.consent_id.clone())?;

        let now = self.clock.now();
        let mut replays = 0;
        loop {
            let existing = self.store.get::<BalanceSnapshot>(
                Collection::Balances,
                job.client_id.as_str(),
                &internal_id.to_string(),
            )?;
            if let Some(v) = &existing {
                if v.doc.updated_at > snapshot.updated_at {
                    // The stored snapshot is newer than what the holder just
                    // returned (out-of-order delivery); keep the newest.
                    debug!(account_id = %account_id, "stale balance payload ignored");
                    return Ok(());
                }
            }
            let expected = existing.as_ref().map(|v| v.version).unwrap_or(0);
            match self.store.upsert(
                Collection::Balances,
                job.client_id.as_str(),
                &internal_id.to_string(),
                &snapshot,
                Some(expected),
                now,
            ) {
                Ok(_) => return Ok(()),
                Err(ReceptaError::Conflict { .. }) if replays < CONFLICT_MAX_REPLAYS => {
                    replays += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Advance `last_synced_at` on the stored account row.
    async fn touch_account(
        &self,
        job: &SyncJob,
        internal_id: uuid::Uuid,
    ) -> Result<(), ReceptaError> {
        let now = self.clock.now();
        let mut replays = 0;
        loop {
            let Some(v) = self.store.get::<Account>(
                Collection::Accounts,
                job.client_id.as_str(),
                &internal_id.to_string(),
            )?
            else {
                return Ok(());
            };
            let mut account = v.doc;
            account.last_synced_at = Some(now);
            match self.store.upsert(
                Collection::Accounts,
                job.client_id.as_str(),
                &internal_id.to_string(),
                &account,
                Some(v.version),
                now,
            ) {
                Ok(_) => return Ok(()),
                Err(ReceptaError::Conflict { .. }) if replays < CONFLICT_MAX_REPLAYS => {
                    replays += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn mark_account_inactive(&self, job: &SyncJob) -> Result<(), ReceptaError> {
        let account_id = Self::required_account(job)?;
        let Some((_, internal_id)) = self
            .store
            .lookup_account(job.organisation_id.as_str(), account_id.as_str())?
        else {
            return Ok(());
        };
        let now = self.clock.now();
        let mut replays = 0;
        loop {
            let Some(v) = self.store.get::<Account>(
                Collection::Accounts,
                job.client_id.as_str(),
                &internal_id.to_string(),
            )?
            else {
                return Ok(());
            };
            if v.doc.status == AccountStatus::Inactive {
                return Ok(());
            }
            let mut account = v.doc;
            account.status = AccountStatus::Inactive;
            match self.store.upsert(
                Collection::Accounts,
                job.client_id.as_str(),
                &internal_id.to_string(),
                &account,
                Some(v.version),
                now,
            ) {
                Ok(_) => {
                    info!(account_id = %account_id, org = %job.organisation_id, "account marked inactive");
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

    // ── TX_SYNC ──────────────────────────────────────────────────────────────

    async fn tx_sync(&self, ctx: &Context, job: &SyncJob) -> Result<SyncOutcome, ReceptaError> {
        let Some(consent) = self.gating_consent(job)? else {
            return Ok(SyncOutcome::Skipped);
        };
        let account_id = Self::required_account(job)?;
        let Some((_, internal_id)) = self
            .store
            .lookup_account(job.organisation_id.as_str(), account_id.as_str())?
        else {
            warn!(account_id = %account_id, "transaction sync before first account sync, skipping");
            return Ok(SyncOutcome::Skipped);
        };
        let account = self
            .store
            .get::<Account>(
                Collection::Accounts,
                job.client_id.as_str(),
                &internal_id.to_string(),
            )?
            .ok_or_else(|| ReceptaError::NotFound(format!("account {internal_id}")))?;

        let today = self.clock.now().date_naive();
        // Cursor resume; a fresh account bootstraps from a 90-day window,
        // clipped to the history window the customer actually granted.
        let mut from = match account.doc.last_booking_date_synced {
            Some(cursor) => cursor,
            None => {
                let bootstrap = today - Duration::days(TX_BOOTSTRAP_WINDOW_DAYS);
                match consent.transaction_from {
                    Some(granted) => bootstrap.max(granted.date_naive()),
                    None => bootstrap,
                }
            }
        };

        let mut ingested = 0u64;
        while from <= today {
            let to = (from + Duration::days(TX_BOOTSTRAP_WINDOW_DAYS - 1)).min(today);
            ingested += self
                .ingest_window(ctx, job, internal_id, from, to)
                .await?;
            self.advance_cursor(job, internal_id, to).await?;
            from = to + Duration::days(1);
        }

        info!(account_id = %account_id, ingested, "transactions synced");
        Ok(SyncOutcome::Success)
    }

    async fn ingest_window(
        &self,
        ctx: &Context,
        job: &SyncJob,
        internal_id: uuid::Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<u64, ReceptaError> {
        let account_id = Self::required_account(job)?;
        let now = self.clock.now();
        let mut ingested = 0u64;
        let mut page_url: Option<String> = None;
        loop {
            let (page, next) = self
                .client
                .transactions(
                    ctx,
                    &job.client_id,
                    &job.organisation_id,
                    account_id,
                    from,
                    to,
                    page_url.as_deref(),
                )
                .await?;
            for data in page {
                let tx = data.into_transaction(internal_id, now)?;
                let inserted = self.store.put_if_absent(
                    Collection::Transactions,
                    &internal_id.to_string(),
                    &tx.external_transaction_id,
                    &tx,
                    now,
                )?;
                if inserted {
                    ingested += 1;
                }
            }
            match next {
                Some(url) => page_url = Some(url),
                None => break,
            }
        }
        Ok(ingested)
    }

    async fn advance_cursor(
        &self,
        job: &SyncJob,
        internal_id: uuid::Uuid,
        synced_through: NaiveDate,
    ) -> Result<(), ReceptaError> {
        let now = self.clock.now();
        let mut replays = 0;
        loop {
            let Some(v) = self.store.get::<Account>(
                Collection::Accounts,
                job.client_id.as_str(),
                &internal_id.to_string(),
            )?
            else {
                return Ok(());
            };
            let mut account = v.doc;
            // Never move the cursor backwards; a stale duplicate job may
            // re-run an already-covered window.
            if matches!(account.last_booking_date_synced, Some(c) if c >= synced_through) {
                return Ok(());
            }
            account.last_booking_date_synced = Some(synced_through);
            match self.store.upsert(
                Collection::Accounts,
                job.client_id.as_str(),
                &internal_id.to_string(),
                &account,
                Some(v.version),
                now,
            ) {
                Ok(_) => return Ok(()),
                Err(ReceptaError::Conflict { .. }) if replays < CONFLICT_MAX_REPLAYS => {
                    replays += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── CONSENT_SYNC ─────────────────────────────────────────────────────────

    async fn consent_sync(&self, job: &SyncJob) -> Result<SyncOutcome, ReceptaError> {
        match self.engine.sync(&job.client_id, &job.consent_id).await {
            Ok(_) => Ok(SyncOutcome::Success),
            Err(ReceptaError::NotFound(_)) => Ok(SyncOutcome::Skipped),
            Err(e) => Err(e),
        }
    }
}
