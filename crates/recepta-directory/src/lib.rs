//! recepta-directory
//!
//! Resolves a holder organisation id to its transmitter base URL, OAuth
//! token endpoint and supported API families. The HTTP implementation keeps
//! a roster snapshot refreshed every two hours (lazy on miss, eager on
//! schedule) and serves stale data for up to one further interval when the
//! directory itself is down.

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use recepta_core::clock::Clock;
use recepta_core::constants::DIRECTORY_REFRESH_SECS;
use recepta_core::error::{ReceptaError, TransmitterError};
use recepta_core::types::{OrganisationId, Timestamp};

// ── Types ────────────────────────────────────────────────────────────────────

/// API families a transmitter advertises.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiFamily {
    Accounts,
    Consents,
}

/// Resolved endpoints for one holder organisation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransmitterEndpoint {
    pub organisation_id: OrganisationId,
    /// Root under which `/open-banking/...` paths hang.
    pub base_url: String,
    /// OAuth2 token endpoint for client-credentials grants.
    pub token_url: String,
    pub supported_families: Vec<ApiFamily>,
}

impl TransmitterEndpoint {
    pub fn supports(&self, family: ApiFamily) -> bool {
        self.supported_families.contains(&family)
    }
}

// ── Port ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait DirectoryResolver: Send + Sync {
    async fn resolve(&self, org: &OrganisationId) -> Result<TransmitterEndpoint, ReceptaError>;
}

// ── Static resolver ──────────────────────────────────────────────────────────

/// Fixed table, used in tests and air-gapped runs.
pub struct StaticDirectoryResolver {
    entries: HashMap<OrganisationId, TransmitterEndpoint>,
}

impl StaticDirectoryResolver {
    pub fn new(entries: impl IntoIterator<Item = TransmitterEndpoint>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (e.organisation_id.clone(), e))
                .collect(),
        }
    }
}

#[async_trait]
impl DirectoryResolver for StaticDirectoryResolver {
    async fn resolve(&self, org: &OrganisationId) -> Result<TransmitterEndpoint, ReceptaError> {
        self.entries
            .get(org)
            .cloned()
            .ok_or_else(|| ReceptaError::NotFound(format!("organisation {org} not in directory")))
    }
}

// ── HTTP resolver ────────────────────────────────────────────────────────────

/// Wire form of one roster entry as served by the participants directory.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RosterEntry {
    organisation_id: String,
    base_url: String,
    token_url: String,
    #[serde(default)]
    api_families: Vec<ApiFamily>,
}

struct Roster {
    fetched_at: Option<Timestamp>,
    entries: HashMap<OrganisationId, TransmitterEndpoint>,
}

/// Roster-backed resolver. `resolve` answers from the snapshot; a snapshot
/// older than the refresh interval is refreshed first (single-flight), and
/// a failed refresh falls back to the stale snapshot for one further
/// interval before erroring.
pub struct HttpDirectoryResolver {
    http: reqwest::Client,
    roster_url: String,
    refresh_interval: Duration,
    clock: Arc<dyn Clock>,
    roster: RwLock<Roster>,
    refresh_gate: Mutex<()>,
}

impl HttpDirectoryResolver {
    pub fn new(http: reqwest::Client, roster_url: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            http,
            roster_url: roster_url.into(),
            refresh_interval: Duration::seconds(DIRECTORY_REFRESH_SECS),
            clock,
            roster: RwLock::new(Roster {
                fetched_at: None,
                entries: HashMap::new(),
            }),
            refresh_gate: Mutex::new(()),
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    fn is_fresh(&self, fetched_at: Option<Timestamp>, now: Timestamp) -> bool {
        matches!(fetched_at, Some(at) if now - at < self.refresh_interval)
    }

    /// Whether a stale snapshot is still within its grace interval.
    fn is_usable(&self, fetched_at: Option<Timestamp>, now: Timestamp) -> bool {
        matches!(fetched_at, Some(at) if now - at < self.refresh_interval * 2)
    }

    async fn fetch_roster(&self) -> Result<HashMap<OrganisationId, TransmitterEndpoint>, ReceptaError>
    {
        let resp = self
            .http
            .get(&self.roster_url)
            .send()
            .await
            .map_err(|e| TransmitterError::network(format!("directory fetch: {e}")))?;
        if !resp.status().is_success() {
            return Err(TransmitterError::from_status(
                resp.status().as_u16(),
                "directory roster fetch failed",
            )
            .into());
        }
        let entries: Vec<RosterEntry> = resp
            .json()
            .await
            .map_err(|e| ReceptaError::Serialization(format!("directory roster: {e}")))?;
        Ok(entries
            .into_iter()
            .map(|e| {
                let org = OrganisationId::new(e.organisation_id);
                (
                    org.clone(),
                    TransmitterEndpoint {
                        organisation_id: org,
                        base_url: e.base_url,
                        token_url: e.token_url,
                        supported_families: e.api_families,
                    },
                )
            })
            .collect())
    }

    /// Refresh unless another caller already did while we waited on the gate.
    async fn refresh(&self) -> Result<(), ReceptaError> {
        let _gate = self.refresh_gate.lock().await;
        let now = self.clock.now();
        if self.is_fresh(self.roster.read().await.fetched_at, now) {
            return Ok(());
        }
        match self.fetch_roster().await {
            Ok(entries) => {
                debug!(organisations = entries.len(), "directory roster refreshed");
                let mut roster = self.roster.write().await;
                roster.fetched_at = Some(now);
                roster.entries = entries;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "directory roster refresh failed");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl DirectoryResolver for HttpDirectoryResolver {
    async fn resolve(&self, org: &OrganisationId) -> Result<TransmitterEndpoint, ReceptaError> {
        let now = self.clock.now();
        let (fetched_at, hit) = {
            let roster = self.roster.read().await;
            (roster.fetched_at, roster.entries.get(org).cloned())
        };

        if self.is_fresh(fetched_at, now) {
            if let Some(ep) = hit {
                return Ok(ep);
            }
            // Fresh roster without the org: a brand-new participant may have
            // registered since the snapshot. One lazy refresh, then give up.
        }

        match self.refresh().await {
            Ok(()) => {}
            Err(e) => {
                // Resolver down: stale reads permitted for one interval.
                if self.is_usable(fetched_at, self.clock.now()) {
                    if let Some(ep) = hit {
                        return Ok(ep);
                    }
                }
                return Err(e);
            }
        }

        self.roster
            .read()
            .await
            .entries
            .get(org)
            .cloned()
            .ok_or_else(|| ReceptaError::NotFound(format!("organisation {org} not in directory")))
    }
}
