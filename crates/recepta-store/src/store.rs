use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use recepta_core::error::ReceptaError;
use recepta_core::types::Timestamp;

/// Separator between partition and key inside a composed sled key. Neither
/// partitions nor keys may contain this byte.
const SEP: u8 = 0x1f;

// ── Collection ───────────────────────────────────────────────────────────────

/// The fixed set of collections, one sled tree each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Partitioned by client id.
    Consents,
    ConsentExtensions,
    Accounts,
    Balances,
    Transactions,
    /// Partitioned by organisation id.
    Jobs,
    /// Partitioned by run id.
    Runs,
    /// Partitioned by topic.
    Dlq,
}

impl Collection {
    fn tree_name(self) -> &'static str {
        match self {
            Collection::Consents => "consents",
            Collection::ConsentExtensions => "consent_extensions",
            Collection::Accounts => "accounts",
            Collection::Balances => "balances",
            Collection::Transactions => "transactions",
            Collection::Jobs => "jobs",
            Collection::Runs => "runs",
            Collection::Dlq => "dlq",
        }
    }

    pub const ALL: [Collection; 8] = [
        Collection::Consents,
        Collection::ConsentExtensions,
        Collection::Accounts,
        Collection::Balances,
        Collection::Transactions,
        Collection::Jobs,
        Collection::Runs,
        Collection::Dlq,
    ];
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// Stored wrapper around every document.
#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u64,
    updated_at: Timestamp,
    deleted_at: Option<Timestamp>,
    /// Physical-retention deadline; the sweep removes the row after this.
    expires_at: Option<Timestamp>,
    body: Vec<u8>,
}

/// A document together with its stored version, as returned by reads.
#[derive(Clone, Debug)]
pub struct Versioned<T> {
    pub doc: T,
    pub version: u64,
    pub updated_at: Timestamp,
}

/// One page of query results. `next` is an opaque token; pass it back to
/// continue from where this page stopped.
#[derive(Clone, Debug)]
pub struct Page<T> {
    pub items: Vec<Versioned<T>>,
    pub next: Option<String>,
}

// ── Store ────────────────────────────────────────────────────────────────────

/// Partitioned document store. Keys compose as `partition 0x1f key`, so
/// partition scans are prefix scans and iteration order is deterministic
/// (partition, then key, bytewise).
pub struct Store {
    _db: sled::Db,
    consents: sled::Tree,
    consent_extensions: sled::Tree,
    accounts: sled::Tree,
    balances: sled::Tree,
    transactions: sled::Tree,
    jobs: sled::Tree,
    runs: sled::Tree,
    dlq: sled::Tree,
    /// Secondary index: `(organisation_id, external account id)` →
    /// `(client_id, internal uuid)`. Enforces the one-row-per-holder-account
    /// invariant.
    account_index: sled::Tree,
}

fn storage_err(e: impl std::fmt::Display) -> ReceptaError {
    ReceptaError::Storage(e.to_string())
}

fn codec_err(e: impl std::fmt::Display) -> ReceptaError {
    ReceptaError::Serialization(e.to_string())
}

impl Store {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ReceptaError> {
        let db = sled::open(path).map_err(storage_err)?;
        let open = |name: &str| db.open_tree(name).map_err(storage_err);
        Ok(Self {
            consents: open("consents")?,
            consent_extensions: open("consent_extensions")?,
            accounts: open("accounts")?,
            balances: open("balances")?,
            transactions: open("transactions")?,
            jobs: open("jobs")?,
            runs: open("runs")?,
            dlq: open("dlq")?,
            account_index: open("account_index")?,
            _db: db,
        })
    }

    fn tree(&self, c: Collection) -> &sled::Tree {
        match c {
            Collection::Consents => &self.consents,
            Collection::ConsentExtensions => &self.consent_extensions,
            Collection::Accounts => &self.accounts,
            Collection::Balances => &self.balances,
            Collection::Transactions => &self.transactions,
            Collection::Jobs => &self.jobs,
            Collection::Runs => &self.runs,
            Collection::Dlq => &self.dlq,
        }
    }

    fn compose_key(partition: &str, key: &str) -> Vec<u8> {
        let mut k = Vec::with_capacity(partition.len() + 1 + key.len());
        k.extend_from_slice(partition.as_bytes());
        k.push(SEP);
        k.extend_from_slice(key.as_bytes());
        k
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Conditional put. With `expected_version` set, the write succeeds only
    /// if the stored version matches (a missing row counts as version 0);
    /// otherwise [`ReceptaError::Conflict`]. Returns the new version.
    pub fn upsert<T: Serialize>(
        &self,
        c: Collection,
        partition: &str,
        key: &str,
        doc: &T,
        expected_version: Option<u64>,
        now: Timestamp,
    ) -> Result<u64, ReceptaError> {
        let tree = self.tree(c);
        let raw_key = Self::compose_key(partition, key);
        let body = bincode::serialize(doc).map_err(codec_err)?;

        loop {
            let current = tree.get(&raw_key).map_err(storage_err)?;
            let (cur_version, cur_expires) = match &current {
                Some(bytes) => {
                    let env: Envelope = bincode::deserialize(bytes).map_err(codec_err)?;
                    (env.version, env.expires_at)
                }
                None => (0, None),
            };

            if let Some(expected) = expected_version {
                if expected != cur_version {
                    debug!(
                        collection = c.tree_name(),
                        key,
                        expected,
                        found = cur_version,
                        "conditional upsert lost the version race"
                    );
                    return Err(ReceptaError::Conflict {
                        collection: c.tree_name().to_string(),
                        key: key.to_string(),
                        expected,
                        found: cur_version,
                    });
                }
            }

            let next = Envelope {
                version: cur_version + 1,
                updated_at: now,
                deleted_at: None,
                expires_at: cur_expires,
                body: body.clone(),
            };
            let next_bytes = bincode::serialize(&next).map_err(codec_err)?;

            match tree
                .compare_and_swap(&raw_key, current, Some(next_bytes))
                .map_err(storage_err)?
            {
                Ok(()) => return Ok(cur_version + 1),
                Err(_) if expected_version.is_some() => {
                    // Someone else moved the version under us.
                    let found = self
                        .raw_version(c, partition, key)?
                        .unwrap_or(0);
                    debug!(
                        collection = c.tree_name(),
                        key,
                        found,
                        "compare-and-swap lost the version race"
                    );
                    return Err(ReceptaError::Conflict {
                        collection: c.tree_name().to_string(),
                        key: key.to_string(),
                        expected: expected_version.unwrap(),
                        found,
                    });
                }
                Err(_) => continue,
            }
        }
    }

    /// Insert only if the row does not exist (soft-deleted counts as
    /// existing). Returns whether the insert happened.
    pub fn put_if_absent<T: Serialize>(
        &self,
        c: Collection,
        partition: &str,
        key: &str,
        doc: &T,
        now: Timestamp,
    ) -> Result<bool, ReceptaError> {
        let tree = self.tree(c);
        let raw_key = Self::compose_key(partition, key);
        let body = bincode::serialize(doc).map_err(codec_err)?;
        let env = Envelope {
            version: 1,
            updated_at: now,
            deleted_at: None,
            expires_at: None,
            body,
        };
        let bytes = bincode::serialize(&env).map_err(codec_err)?;
        let res = tree
            .compare_and_swap(&raw_key, None as Option<&[u8]>, Some(bytes))
            .map_err(storage_err)?;
        Ok(res.is_ok())
    }

    /// Soft delete: the row stops being readable immediately and is
    /// physically removed by the sweep once `retain_for` has elapsed.
    pub fn soft_delete(
        &self,
        c: Collection,
        partition: &str,
        key: &str,
        now: Timestamp,
        retain_for: chrono::Duration,
    ) -> Result<(), ReceptaError> {
        let tree = self.tree(c);
        let raw_key = Self::compose_key(partition, key);
        loop {
            let current = tree.get(&raw_key).map_err(storage_err)?;
            let Some(bytes) = &current else {
                return Ok(());
            };
            let mut env: Envelope = bincode::deserialize(bytes).map_err(codec_err)?;
            env.version += 1;
            env.deleted_at = Some(now);
            env.expires_at = Some(now + retain_for);
            let next = bincode::serialize(&env).map_err(codec_err)?;
            match tree
                .compare_and_swap(&raw_key, current, Some(next))
                .map_err(storage_err)?
            {
                Ok(()) => return Ok(()),
                Err(_) => continue,
            }
        }
    }

    /// Stamp the physical-retention deadline without touching the document.
    pub fn set_expiry(
        &self,
        c: Collection,
        partition: &str,
        key: &str,
        expires_at: Timestamp,
    ) -> Result<(), ReceptaError> {
        let tree = self.tree(c);
        let raw_key = Self::compose_key(partition, key);
        loop {
            let current = tree.get(&raw_key).map_err(storage_err)?;
            let Some(bytes) = &current else {
                return Ok(());
            };
            let mut env: Envelope = bincode::deserialize(bytes).map_err(codec_err)?;
            env.expires_at = Some(expires_at);
            let next = bincode::serialize(&env).map_err(codec_err)?;
            match tree
                .compare_and_swap(&raw_key, current, Some(next))
                .map_err(storage_err)?
            {
                Ok(()) => return Ok(()),
                Err(_) => continue,
            }
        }
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    /// Read one document. Soft-deleted rows read as absent.
    pub fn get<T: DeserializeOwned>(
        &self,
        c: Collection,
        partition: &str,
        key: &str,
    ) -> Result<Option<Versioned<T>>, ReceptaError> {
        let raw_key = Self::compose_key(partition, key);
        match self.tree(c).get(&raw_key).map_err(storage_err)? {
            Some(bytes) => {
                let env: Envelope = bincode::deserialize(&bytes).map_err(codec_err)?;
                if env.deleted_at.is_some() {
                    return Ok(None);
                }
                let doc = bincode::deserialize(&env.body).map_err(codec_err)?;
                Ok(Some(Versioned {
                    doc,
                    version: env.version,
                    updated_at: env.updated_at,
                }))
            }
            None => Ok(None),
        }
    }

    fn raw_version(
        &self,
        c: Collection,
        partition: &str,
        key: &str,
    ) -> Result<Option<u64>, ReceptaError> {
        let raw_key = Self::compose_key(partition, key);
        match self.tree(c).get(&raw_key).map_err(storage_err)? {
            Some(bytes) => {
                let env: Envelope = bincode::deserialize(&bytes).map_err(codec_err)?;
                Ok(Some(env.version))
            }
            None => Ok(None),
        }
    }

    /// Paged scan in deterministic key order. `partition = None` walks the
    /// whole collection. `filter` is applied post-deserialisation; filtered
    /// and soft-deleted rows do not count against `limit`.
    pub fn query<T: DeserializeOwned>(
        &self,
        c: Collection,
        partition: Option<&str>,
        limit: usize,
        page_token: Option<&str>,
        mut filter: impl FnMut(&T) -> bool,
    ) -> Result<Page<T>, ReceptaError> {
        let tree = self.tree(c);
        let after: Option<Vec<u8>> = match page_token {
            Some(tok) => Some(hex::decode(tok).map_err(|e| {
                ReceptaError::validation("PAGINA_INVALIDA", format!("bad page token: {e}"))
            })?),
            None => None,
        };

        let iter: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> =
            match (partition, &after) {
                (Some(p), None) => {
                    let mut prefix = p.as_bytes().to_vec();
                    prefix.push(SEP);
                    Box::new(tree.scan_prefix(prefix))
                }
                (Some(p), Some(from)) => {
                    let mut upper = p.as_bytes().to_vec();
                    upper.push(SEP + 1);
                    let lower = next_key(from);
                    Box::new(tree.range(lower..upper))
                }
                (None, None) => Box::new(tree.iter()),
                (None, Some(from)) => Box::new(tree.range(next_key(from)..)),
            };

        let mut items = Vec::new();
        let mut last_key: Option<Vec<u8>> = None;
        let mut exhausted = true;
        for entry in iter {
            let (key, bytes) = entry.map_err(storage_err)?;
            if items.len() >= limit {
                exhausted = false;
                break;
            }
            last_key = Some(key.to_vec());
            let env: Envelope = bincode::deserialize(&bytes).map_err(codec_err)?;
            if env.deleted_at.is_some() {
                continue;
            }
            let doc: T = bincode::deserialize(&env.body).map_err(codec_err)?;
            if !filter(&doc) {
                continue;
            }
            items.push(Versioned {
                doc,
                version: env.version,
                updated_at: env.updated_at,
            });
        }

        let next = if exhausted {
            None
        } else {
            last_key.map(|k| hex::encode(k))
        };
        Ok(Page { items, next })
    }

    pub fn count(&self, c: Collection) -> u64 {
        self.tree(c).len() as u64
    }

    // ── Account index ────────────────────────────────────────────────────────

    /// Claim the `(organisation, external account id)` slot. Returns the
    /// already-registered `(client_id, internal_id)` when the slot is taken,
    /// which keeps the at-most-one-Account-row invariant under concurrent
    /// first ingests.
    pub fn claim_account_slot(
        &self,
        organisation_id: &str,
        external_account_id: &str,
        client_id: &str,
        internal_id: uuid::Uuid,
    ) -> Result<(String, uuid::Uuid), ReceptaError> {
        let raw_key = Self::compose_key(organisation_id, external_account_id);
        let mut value = client_id.as_bytes().to_vec();
        value.push(SEP);
        value.extend_from_slice(internal_id.as_bytes());
        match self
            .account_index
            .compare_and_swap(&raw_key, None as Option<&[u8]>, Some(value))
            .map_err(storage_err)?
        {
            Ok(()) => Ok((client_id.to_string(), internal_id)),
            Err(cas) => {
                let bytes = cas.current.ok_or_else(|| {
                    ReceptaError::Storage("account index entry vanished mid-claim".into())
                })?;
                Self::decode_index_value(&bytes)
            }
        }
    }

    /// Look up the owning `(client_id, internal_id)` for a holder account.
    pub fn lookup_account(
        &self,
        organisation_id: &str,
        external_account_id: &str,
    ) -> Result<Option<(String, uuid::Uuid)>, ReceptaError> {
        let raw_key = Self::compose_key(organisation_id, external_account_id);
        match self.account_index.get(&raw_key).map_err(storage_err)? {
            Some(bytes) => Self::decode_index_value(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Value layout: `client_id 0x1f uuid(16 bytes)`. The uuid is fixed-width
    /// and raw, so it is split off by length, not by separator search.
    fn decode_index_value(bytes: &[u8]) -> Result<(String, uuid::Uuid), ReceptaError> {
        if bytes.len() < 17 || bytes[bytes.len() - 17] != SEP {
            return Err(ReceptaError::Storage("malformed account index value".into()));
        }
        let (client_part, uuid_part) = bytes.split_at(bytes.len() - 16);
        let client = String::from_utf8(client_part[..client_part.len() - 1].to_vec())
            .map_err(|e| ReceptaError::Storage(format!("malformed account index value: {e}")))?;
        let id = uuid::Uuid::from_slice(uuid_part)
            .map_err(|e| ReceptaError::Storage(format!("malformed account index value: {e}")))?;
        Ok((client, id))
    }

    // ── Retention sweep ──────────────────────────────────────────────────────

    /// Physically remove rows whose retention deadline has passed. Returns
    /// the number of rows removed.
    pub fn sweep_expired(&self, now: Timestamp) -> Result<usize, ReceptaError> {
        let mut removed = 0;
        for c in Collection::ALL {
            let tree = self.tree(c);
            let mut doomed = Vec::new();
            for entry in tree.iter() {
                let (key, bytes) = entry.map_err(storage_err)?;
                let env: Envelope = bincode::deserialize(&bytes).map_err(codec_err)?;
                if matches!(env.expires_at, Some(at) if at < now) {
                    doomed.push(key);
                }
            }
            let doomed_here = doomed.len();
            for key in doomed {
                tree.remove(&key).map_err(storage_err)?;
                removed += 1;
            }
            if doomed_here > 0 {
                debug!(collection = c.tree_name(), removed = doomed_here, "retention sweep");
            }
        }
        Ok(removed)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), ReceptaError> {
        self._db.flush().map_err(storage_err)?;
        Ok(())
    }
}

/// Smallest key strictly greater than `k` in bytewise order.
fn next_key(k: &[u8]) -> Vec<u8> {
    let mut n = k.to_vec();
    n.push(0);
    n
}
