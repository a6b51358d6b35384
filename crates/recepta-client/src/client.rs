use reqwest::Method;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use recepta_core::clock::Clock;
use recepta_core::context::Context;
use recepta_core::error::{ReceptaError, TransmitterError, TransmitterErrorKind};
use recepta_core::types::{AccountId, ClientId, ConsentId, OrganisationId};
use recepta_directory::DirectoryResolver;
use recepta_token::TokenSource;

use crate::breaker::CircuitBreaker;
use crate::limiter::RateLimiter;
use crate::retry::RetryPolicy;
use crate::wire;

// ── Config ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct TransmitterClientConfig {
    /// Value of `x-fapi-customer-ip-address`. Batch pulls originate from the
    /// receptor itself, so this is the institution egress address.
    pub customer_ip: String,
    /// Per-attempt HTTP timeout; the context deadline caps it further.
    pub call_timeout: Duration,
}

impl Default for TransmitterClientConfig {
    fn default() -> Self {
        Self {
            customer_ip: "127.0.0.1".to_string(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

// ── TransmitterClient ────────────────────────────────────────────────────────

/// Typed calls over one shared HTTP engine. The reqwest client carries the
/// mTLS identity; this layer adds FAPI headers, bearer tokens, retry,
/// breaker and rate-limit behaviour.
pub struct TransmitterClient {
    http: reqwest::Client,
    directory: Arc<dyn DirectoryResolver>,
    tokens: Arc<dyn TokenSource>,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    config: TransmitterClientConfig,
}

impl TransmitterClient {
    pub fn new(
        http: reqwest::Client,
        directory: Arc<dyn DirectoryResolver>,
        tokens: Arc<dyn TokenSource>,
        limiter: RateLimiter,
        clock: Arc<dyn Clock>,
        config: TransmitterClientConfig,
    ) -> Self {
        Self {
            http,
            directory,
            tokens,
            breaker: CircuitBreaker::new(clock.clone()),
            limiter,
            retry: RetryPolicy::default(),
            clock,
            config,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    // ── Accounts family ──────────────────────────────────────────────────────

    pub async fn list_accounts(
        &self,
        ctx: &Context,
        client: &ClientId,
        org: &OrganisationId,
    ) -> Result<Vec<wire::AccountData>, ReceptaError> {
        let base = self.base_url(org).await?;
        let url = format!("{base}/open-banking/accounts/v2/accounts");
        let env: wire::Envelope<Vec<wire::AccountData>> =
            self.call(ctx, client, org, Method::GET, url, &[], None).await?;
        Ok(env.data)
    }

    pub async fn account_identification(
        &self,
        ctx: &Context,
        client: &ClientId,
        org: &OrganisationId,
        account: &AccountId,
    ) -> Result<wire::AccountData, ReceptaError> {
        let base = self.base_url(org).await?;
        let url = format!("{base}/open-banking/accounts/v2/accounts/{account}");
        let env: wire::Envelope<wire::AccountData> =
            self.call(ctx, client, org, Method::GET, url, &[], None).await?;
        Ok(env.data)
    }

    pub async fn balances(
        &self,
        ctx: &Context,
        client: &ClientId,
        org: &OrganisationId,
        account: &AccountId,
    ) -> Result<wire::BalancesData, ReceptaError> {
        let base = self.base_url(org).await?;
        let url = format!("{base}/open-banking/accounts/v2/accounts/{account}/balances");
        let env: wire::Envelope<wire::BalancesData> =
            self.call(ctx, client, org, Method::GET, url, &[], None).await?;
        Ok(env.data)
    }

    pub async fn overdraft_limits(
        &self,
        ctx: &Context,
        client: &ClientId,
        org: &OrganisationId,
        account: &AccountId,
    ) -> Result<wire::OverdraftLimitsData, ReceptaError> {
        let base = self.base_url(org).await?;
        let url = format!("{base}/open-banking/accounts/v2/accounts/{account}/overdraft-limits");
        let env: wire::Envelope<wire::OverdraftLimitsData> =
            self.call(ctx, client, org, Method::GET, url, &[], None).await?;
        Ok(env.data)
    }

    /// One page of transactions. Pass `page_url` (the previous page's `next`
    /// link) to continue; otherwise the booking-date window query starts a
    /// fresh listing. Returns the page plus the next link, if any.
    pub async fn transactions(
        &self,
        ctx: &Context,
        client: &ClientId,
        org: &OrganisationId,
        account: &AccountId,
        from: chrono::NaiveDate,
        to: chrono::NaiveDate,
        page_url: Option<&str>,
    ) -> Result<(Vec<wire::TransactionData>, Option<String>), ReceptaError> {
        let (url, query) = match page_url {
            Some(u) => (u.to_string(), Vec::new()),
            None => {
                let base = self.base_url(org).await?;
                (
                    format!("{base}/open-banking/accounts/v2/accounts/{account}/transactions"),
                    vec![
                        ("fromBookingDate".to_string(), from.format("%Y-%m-%d").to_string()),
                        ("toBookingDate".to_string(), to.format("%Y-%m-%d").to_string()),
                    ],
                )
            }
        };
        let env: wire::Envelope<Vec<wire::TransactionData>> =
            self.call(ctx, client, org, Method::GET, url, &query, None).await?;
        let next = env.links.and_then(|l| l.next);
        Ok((env.data, next))
    }

    // ── Consents family ──────────────────────────────────────────────────────

    pub async fn get_consent(
        &self,
        ctx: &Context,
        client: &ClientId,
        org: &OrganisationId,
        consent: &ConsentId,
    ) -> Result<wire::ConsentData, ReceptaError> {
        let base = self.base_url(org).await?;
        let url = format!("{base}/open-banking/consents/v3/consents/{consent}");
        let env: wire::Envelope<wire::ConsentData> =
            self.call(ctx, client, org, Method::GET, url, &[], None).await?;
        Ok(env.data)
    }

    pub async fn extend_consent(
        &self,
        ctx: &Context,
        client: &ClientId,
        org: &OrganisationId,
        consent: &ConsentId,
        request: &wire::ExtensionRequestData,
    ) -> Result<wire::ExtensionResponseData, ReceptaError> {
        let base = self.base_url(org).await?;
        let url = format!("{base}/open-banking/consents/v3/consents/{consent}/extensions");
        let body = serde_json::to_value(wire::Envelope {
            data: request.clone(),
            links: None,
            meta: None,
        })
        .map_err(|e| ReceptaError::Serialization(e.to_string()))?;
        let env: wire::Envelope<wire::ExtensionResponseData> = self
            .call(ctx, client, org, Method::POST, url, &[], Some(body))
            .await?;
        Ok(env.data)
    }

    // ── Engine ───────────────────────────────────────────────────────────────

    async fn base_url(&self, org: &OrganisationId) -> Result<String, ReceptaError> {
        let endpoint = self.directory.resolve(org).await?;
        Ok(endpoint.base_url.trim_end_matches('/').to_string())
    }

    fn attempt_timeout(&self, ctx: &Context) -> Result<Duration, ReceptaError> {
        match ctx.remaining(self.clock.as_ref()) {
            Some(remaining) if remaining.is_zero() => {
                Err(TransmitterError::network("deadline exceeded").into())
            }
            Some(remaining) => Ok(remaining.min(self.config.call_timeout)),
            None => Ok(self.config.call_timeout),
        }
    }

    /// Shared request path: rate limit, breaker gate, bearer token, FAPI
    /// headers, retry policy, and error classification.
    async fn call<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        client: &ClientId,
        org: &OrganisationId,
        method: Method,
        url: String,
        query: &[(String, String)],
        body: Option<serde_json::Value>,
    ) -> Result<T, ReceptaError> {
        let mut attempt = 1u32;
        let mut auth_retried = false;
        loop {
            self.limiter.acquire(org).await;
            self.breaker.admit(org)?;

            let outcome = self
                .attempt_once(ctx, client, org, method.clone(), &url, query, body.as_ref())
                .await;

            match outcome {
                Ok(value) => {
                    self.breaker.record(org, false);
                    return Ok(value);
                }
                Err(CallFailure::Auth(err)) => {
                    // The holder answered, so the org is up; the token is not.
                    self.breaker.record(org, false);
                    self.tokens.invalidate(client, org).await;
                    if !auth_retried {
                        auth_retried = true;
                        debug!(%org, "401 from transmitter, retrying once with fresh token");
                        continue;
                    }
                    return Err(err.into());
                }
                Err(CallFailure::Transmitter(err)) => {
                    self.breaker.record(org, err.kind.is_retryable());
                    if err.is_retryable() && attempt < self.retry.max_attempts {
                        let delay = self.retry.backoff(attempt);
                        warn!(
                            %org, attempt, kind = err.kind.as_str(), delay_ms = delay.as_millis() as u64,
                            "transmitter call failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err.into());
                }
                Err(CallFailure::Other(err)) => {
                    // Token fetch or codec failure; the data call itself did
                    // not complete, so the admitted slot resolves as success
                    // to keep the breaker honest about holder health.
                    self.breaker.record(org, false);
                    return Err(err);
                }
            }
        }
    }

    async fn attempt_once<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        client: &ClientId,
        org: &OrganisationId,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<T, CallFailure> {
        let timeout = self.attempt_timeout(ctx).map_err(|e| match e {
            ReceptaError::Transmitter(t) => CallFailure::Transmitter(t),
            other => CallFailure::Other(other),
        })?;

        let token = self
            .tokens
            .token(client, org)
            .await
            .map_err(CallFailure::Other)?;

        let now = self.clock.now();
        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(&token.token)
            .header("accept", "application/json")
            .header("x-fapi-interaction-id", Uuid::new_v4().to_string())
            .header(
                "x-fapi-auth-date",
                now.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            )
            .header("x-fapi-customer-ip-address", &self.config.customer_ip)
            .timeout(timeout);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| CallFailure::Transmitter(TransmitterError::network(e.to_string())))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| CallFailure::Other(ReceptaError::Serialization(e.to_string())));
        }

        let text = resp.text().await.unwrap_or_default();
        let err = TransmitterError::from_status(status.as_u16(), truncate(&text, 512));
        if err.kind == TransmitterErrorKind::Auth && status.as_u16() == 401 {
            Err(CallFailure::Auth(err))
        } else {
            Err(CallFailure::Transmitter(err))
        }
    }
}

enum CallFailure {
    /// 401: invalidate the token and retry exactly once.
    Auth(TransmitterError),
    /// Classified holder failure; the retry policy decides.
    Transmitter(TransmitterError),
    /// Local failure (token fetch, directory, codec). Surfaced as-is.
    Other(ReceptaError),
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
