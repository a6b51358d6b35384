//! recepta-token
//!
//! Issues and caches OAuth2 client-credentials tokens per
//! `(client institution, holder organisation)` pair. Tokens are opaque; the
//! only claim we track is the expiry. Cache TTL is the token lifetime minus
//! a 60 s safety margin. Concurrent callers for the same pair coalesce onto
//! a single fetch.

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use recepta_cache::MemoryCache;
use recepta_core::clock::Clock;
use recepta_core::constants::TOKEN_EXPIRY_SAFETY_SECS;
use recepta_core::error::{ReceptaError, TransmitterError, TransmitterErrorKind};
use recepta_core::types::{ClientId, OrganisationId, Timestamp};
use recepta_directory::DirectoryResolver;

// ── AccessToken ──────────────────────────────────────────────────────────────

/// Bearer token plus the only claim we interpret.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Timestamp,
}

impl AccessToken {
    /// Usable means at least the safety margin away from expiry.
    pub fn is_usable(&self, now: Timestamp) -> bool {
        now < self.expires_at - Duration::seconds(TOKEN_EXPIRY_SAFETY_SECS)
    }
}

// ── TokenSource port ─────────────────────────────────────────────────────────

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(
        &self,
        client: &ClientId,
        org: &OrganisationId,
    ) -> Result<AccessToken, ReceptaError>;

    /// Drop the cached token (a downstream 401 means it is no good despite
    /// its stated expiry).
    async fn invalidate(&self, client: &ClientId, org: &OrganisationId);
}

// ── Credentials ──────────────────────────────────────────────────────────────

/// OAuth client registration for one tenant. The mTLS identity lives on the
/// HTTP client itself; `client_secret` is only present for organisations
/// that demand it alongside `tls_client_auth`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientCredentials {
    pub oauth_client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_scope() -> String {
    "accounts consents".to_string()
}

// ── TokenProvider ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[allow(dead_code)]
    #[serde(default)]
    token_type: Option<String>,
    expires_in: i64,
}

pub struct TokenProvider {
    http: reqwest::Client,
    directory: Arc<dyn DirectoryResolver>,
    cache: Arc<MemoryCache>,
    clock: Arc<dyn Clock>,
    credentials: HashMap<ClientId, ClientCredentials>,
    /// Per-pair fetch gates: single-flight per `(client, org)`.
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn cache_key(client: &ClientId, org: &OrganisationId) -> String {
    format!("token/{client}/{org}")
}

impl TokenProvider {
    pub fn new(
        http: reqwest::Client,
        directory: Arc<dyn DirectoryResolver>,
        cache: Arc<MemoryCache>,
        clock: Arc<dyn Clock>,
        credentials: HashMap<ClientId, ClientCredentials>,
    ) -> Self {
        Self {
            http,
            directory,
            cache,
            clock,
            credentials,
            flights: Mutex::new(HashMap::new()),
        }
    }

    async fn flight_gate(&self, key: &str) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        flights
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn cached(&self, key: &str) -> Option<AccessToken> {
        let bytes = self.cache.get(key).await?;
        let token: AccessToken = serde_json::from_slice(&bytes).ok()?;
        if token.is_usable(self.clock.now()) {
            Some(token)
        } else {
            None
        }
    }

    async fn fetch(
        &self,
        client: &ClientId,
        org: &OrganisationId,
    ) -> Result<AccessToken, ReceptaError> {
        let creds = self.credentials.get(client).ok_or_else(|| {
            ReceptaError::validation(
                "CLIENTE_DESCONHECIDO",
                format!("no OAuth credentials registered for client {client}"),
            )
        })?;
        let endpoint = self.directory.resolve(org).await?;

        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("scope", creds.scope.clone()),
            ("client_id", creds.oauth_client_id.clone()),
        ];
        if let Some(secret) = &creds.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let resp = self
            .http
            .post(&endpoint.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| TransmitterError::network(format!("token fetch: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let mut err = TransmitterError::from_status(
                status.as_u16(),
                format!("token endpoint for {org}: {body}"),
            );
            // Any token-endpoint rejection is an auth problem for callers.
            if !status.is_server_error() {
                err.kind = TransmitterErrorKind::Auth;
            }
            return Err(err.into());
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ReceptaError::Serialization(format!("token response: {e}")))?;

        let now = self.clock.now();
        let token = AccessToken {
            token: parsed.access_token,
            expires_at: now + Duration::seconds(parsed.expires_in),
        };

        let ttl = Duration::seconds((parsed.expires_in - TOKEN_EXPIRY_SAFETY_SECS).max(1));
        self.cache
            .put(
                cache_key(client, org),
                serde_json::to_vec(&token)
                    .map_err(|e| ReceptaError::Serialization(e.to_string()))?,
                ttl,
            )
            .await;
        debug!(%client, %org, expires_at = %token.expires_at, "token issued");
        Ok(token)
    }
}

#[async_trait]
impl TokenSource for TokenProvider {
    async fn token(
        &self,
        client: &ClientId,
        org: &OrganisationId,
    ) -> Result<AccessToken, ReceptaError> {
        let key = cache_key(client, org);
        if let Some(token) = self.cached(&key).await {
            return Ok(token);
        }
        // Single-flight: whoever wins the gate fetches; the rest find the
        // fresh token in the cache when they get through.
        let gate = self.flight_gate(&key).await;
        let _held = gate.lock().await;
        if let Some(token) = self.cached(&key).await {
            return Ok(token);
        }
        self.fetch(client, org).await
    }

    async fn invalidate(&self, client: &ClientId, org: &OrganisationId) {
        self.cache.evict(&cache_key(client, org)).await;
    }
}
