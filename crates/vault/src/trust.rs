//! Recipient trust tracking
//!
//! Records which recipient set each vault file was last seen with. A file
//! whose header recipients change unexpectedly is reported as `Changed` and
//! destructive commands refuse to touch it until the change is accepted.
//!
//! Storage: ~/.si/vault/trust.json (0600), keyed by canonical path or
//! `sun:<scope>` for remote vaults.

use crate::cipher;
use crate::safe_file;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const SCHEMA_VERSION: u32 = 3;

/// Trust state of one vault file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub path: String,
    pub recipients: Vec<String>,
    pub fingerprint: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Result of comparing a file against its trust record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustCheck {
    Ok,
    FirstSeen,
    Changed { trusted: String, found: String },
}

impl TrustCheck {
    pub fn label(&self) -> &'static str {
        match self {
            TrustCheck::Ok => "ok",
            TrustCheck::FirstSeen => "untrusted",
            TrustCheck::Changed { .. } => "mismatch",
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, TrustCheck::Changed { .. })
    }
}

/// On-disk trust store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustStore {
    pub schema_version: u32,
    #[serde(default)]
    pub entries: BTreeMap<String, TrustRecord>,
    #[serde(skip)]
    path: PathBuf,
}

impl TrustStore {
    /// Load the store; a missing file is an empty store
    pub fn load(path: &Path) -> Result<Self> {
        let mut store = match safe_file::read_optional(path)? {
            None => Self {
                schema_version: SCHEMA_VERSION,
                entries: BTreeMap::new(),
                path: PathBuf::new(),
            },
            Some(bytes) => serde_json::from_slice::<Self>(&bytes)
                .with_context(|| format!("parse trust store {}", path.display()))?,
        };
        store.schema_version = store.schema_version.max(SCHEMA_VERSION);
        store.path = path.to_path_buf();
        Ok(store)
    }

    /// Persist atomically with owner-only permissions
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                safe_file::ensure_private_dir(parent)?;
            }
        }
        let mut data = serde_json::to_vec_pretty(self)?;
        data.push(b'\n');
        safe_file::atomic_write(&self.path, &data, 0o600)
            .with_context(|| format!("write trust store {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&TrustRecord> {
        self.entries.get(key)
    }

    /// Compare a recipient set against the stored record
    pub fn check(&self, key: &str, recipients: &[String]) -> TrustCheck {
        let found = cipher::recipients_fingerprint(recipients);
        match self.entries.get(key) {
            None => TrustCheck::FirstSeen,
            Some(record) if record.fingerprint == found => TrustCheck::Ok,
            Some(record) => TrustCheck::Changed {
                trusted: record.fingerprint.clone(),
                found,
            },
        }
    }

    /// Record a successful read: trust on first sight, refresh on match,
    /// never overwrite a mismatch
    pub fn observe(&mut self, key: &str, recipients: &[String], now: DateTime<Utc>) -> TrustCheck {
        let check = self.check(key, recipients);
        match &check {
            TrustCheck::FirstSeen => {
                self.accept(key, recipients, now);
            }
            TrustCheck::Ok => {
                if let Some(record) = self.entries.get_mut(key) {
                    if now > record.last_seen {
                        record.last_seen = now;
                    }
                }
            }
            TrustCheck::Changed { trusted, found } => {
                debug!(key, trusted = %trusted, found = %found, "trust mismatch observed");
            }
        }
        check
    }

    /// Trust the given recipient set for `key`
    pub fn accept(&mut self, key: &str, recipients: &[String], now: DateTime<Utc>) -> &TrustRecord {
        let mut sorted: Vec<String> = recipients.iter().map(|r| r.trim().to_string()).collect();
        sorted.sort();
        sorted.dedup();
        let fingerprint = cipher::recipients_fingerprint(&sorted);

        let first_seen = self
            .entries
            .get(key)
            .map(|r| r.first_seen)
            .unwrap_or(now);
        self.entries.insert(
            key.to_string(),
            TrustRecord {
                path: key.to_string(),
                recipients: sorted,
                fingerprint,
                first_seen,
                last_seen: now,
            },
        );
        &self.entries[key]
    }

    /// Drop the record for `key`
    pub fn forget(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }
}
