use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use recepta_directory::TransmitterEndpoint;
use recepta_token::ClientCredentials;

/// JSON configuration file. CLI flags override the overlapping fields.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeConfig {
    /// Participants-directory roster URL. When absent, `directory` below is
    /// served statically (tests, air-gapped runs).
    #[serde(default)]
    pub roster_url: Option<String>,
    #[serde(default)]
    pub directory: Vec<TransmitterEndpoint>,
    /// OAuth client registrations per tenant (key: client id).
    #[serde(default)]
    pub credentials: HashMap<String, ClientCredentials>,
    /// Path to the mTLS client identity (PEM: certificate + key).
    #[serde(default)]
    pub mtls_identity_pem: Option<String>,
    /// Per-organisation QPS overrides (key: organisation id).
    #[serde(default)]
    pub rate_limits: HashMap<String, f64>,
    #[serde(default = "default_qps")]
    pub default_qps: f64,
    /// Egress address reported in `x-fapi-customer-ip-address`.
    #[serde(default)]
    pub customer_ip: Option<String>,
    /// Full-batch window cadence in seconds (12 h default → two windows/day).
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default)]
    pub incremental_secs: Option<u64>,
    #[serde(default)]
    pub cooldown_secs: Option<i64>,
}

fn default_qps() -> f64 {
    10.0
}

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        Ok(config)
    }
}
