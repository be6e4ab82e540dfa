//! Audit logging for vault operations
//!
//! Every command appends one JSON object per line to the audit log. Entries
//! carry key names, scope, backend and identity fingerprints; never values.
//! Storage: ~/.si/vault/audit.log (0600, directory 0700)

use crate::safe_file;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Outcome recorded for an operation
pub const RESULT_OK: &str = "ok";

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,

    /// Operation name (`set`, `reveal`, `sync.push`, ...)
    pub op: String,

    pub scope: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,

    /// Where the identity came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_fingerprint: Option<String>,

    /// `ok` or the error category
    pub result: String,

    /// Operation-specific counters and labels
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl AuditEntry {
    pub fn new(op: &str, scope: &str) -> Self {
        Self {
            ts: Utc::now(),
            op: op.to_string(),
            scope: scope.to_string(),
            key: None,
            encrypted: None,
            source: None,
            identity_fingerprint: None,
            result: RESULT_OK.to_string(),
            fields: Map::new(),
        }
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = Some(key.to_string());
        self
    }

    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = Some(encrypted);
        self
    }

    pub fn source(mut self, source: impl ToString) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.identity_fingerprint = fingerprint;
        self
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Set a field on an entry that is still being filled in
    pub fn record(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn result(mut self, result: &str) -> Self {
        self.result = result.to_string();
        self
    }

    pub fn succeeded(&self) -> bool {
        self.result == RESULT_OK
    }
}

/// Append-only audit log
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    pub fn with_path(log_path: PathBuf) -> Self {
        Self { log_path }
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    /// Append an entry as one complete line
    pub fn log(&self, entry: &AuditEntry) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            if !parent.exists() {
                safe_file::ensure_private_dir(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&self.log_path)
            .with_context(|| format!("Failed to open audit log at {:?}", self.log_path))?;

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to audit log at {:?}", self.log_path))?;
        Ok(())
    }

    /// Most recent entries first
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.query(AuditQuery::default().limit(limit))
    }

    /// Query with custom filter
    pub fn query(&self, query: AuditQuery) -> Result<Vec<AuditEntry>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.log_path)?;
        let reader = BufReader::new(file);

        let mut entries: Vec<AuditEntry> = reader
            .lines()
            .filter_map(|line| line.ok().and_then(|l| serde_json::from_str(&l).ok()))
            .filter(|entry: &AuditEntry| query.matches(entry))
            .collect();

        // Stable sort keeps append order for equal timestamps
        entries.reverse();
        entries.sort_by(|a, b| b.ts.cmp(&a.ts));

        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }
}

/// Query parameters for the audit log
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    op: Option<String>,
    scope: Option<String>,
    since: Option<DateTime<Utc>>,
    failures: bool,
    limit: Option<usize>,
}

impl AuditQuery {
    pub fn op(mut self, op: &str) -> Self {
        self.op = Some(op.to_string());
        self
    }

    pub fn scope(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Only entries that did not succeed
    pub fn failures(mut self) -> Self {
        self.failures = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(ref op) = self.op {
            if entry.op != *op {
                return false;
            }
        }

        if let Some(ref scope) = self.scope {
            if entry.scope != *scope {
                return false;
            }
        }

        if let Some(since) = self.since {
            if entry.ts < since {
                return false;
            }
        }

        !(self.failures && entry.succeeded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn test_audit_log() {
        let dir = tempdir().unwrap();
        let log = AuditLog::with_path(dir.path().join("vault").join("audit.log"));

        let entry = AuditEntry::new("set", "default")
            .key("API_KEY")
            .encrypted(true)
            .fingerprint(Some("0123456789abcdef".to_string()));
        log.log(&entry).unwrap();

        let entries = log.recent(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].op, "set");
        assert_eq!(entries[0].key.as_deref(), Some("API_KEY"));

        let mode = std::fs::metadata(log.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let dir_mode = std::fs::metadata(log.path().parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn test_fields_are_flattened() {
        let dir = tempdir().unwrap();
        let log = AuditLog::with_path(dir.path().join("audit.log"));
        log.log(&AuditEntry::new("dump", "default").field("decrypted_count", 3))
            .unwrap();

        let raw = std::fs::read_to_string(log.path()).unwrap();
        let value: Value = serde_json::from_str(raw.trim()).unwrap();
        assert_eq!(value["decrypted_count"], 3);
        assert_eq!(value["result"], "ok");
        assert!(value.get("key").is_none());
        assert_eq!(raw.lines().count(), 1);
    }

    #[test]
    fn test_audit_query() {
        let dir = tempdir().unwrap();
        let log = AuditLog::with_path(dir.path().join("audit.log"));

        for i in 0..5 {
            let mut entry = AuditEntry::new(if i % 2 == 0 { "set" } else { "get" }, "default");
            if i == 3 {
                entry = entry.result("decrypt_failed");
            }
            log.log(&entry).unwrap();
        }
        log.log(&AuditEntry::new("set", "prod")).unwrap();

        assert_eq!(log.query(AuditQuery::default().op("set")).unwrap().len(), 4);
        assert_eq!(log.query(AuditQuery::default().scope("prod")).unwrap().len(), 1);
        let failures = log.query(AuditQuery::default().failures()).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].result, "decrypt_failed");
        assert_eq!(log.recent(2).unwrap()[0].scope, "prod");
    }

    #[test]
    fn test_missing_log_is_empty() {
        let dir = tempdir().unwrap();
        let log = AuditLog::with_path(dir.path().join("none.log"));
        assert!(log.recent(5).unwrap().is_empty());
    }
}
