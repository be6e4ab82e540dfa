//! Vault file handle
//!
//! Reads and writes the bytes behind a [`Target`]: a local dotenv file, or in
//! strict sun mode a `vault-backup` object. Local mutations follow
//! lock → read → transform → re-check → atomic write.

use crate::context::Context;
use crate::dotenv::Document;
use crate::error::VaultError;
use crate::header;
use crate::safe_file::{self, FileLock};
use crate::sync;
use crate::target::{Target, TargetBackend};
use crate::trust::{TrustCheck, TrustRecord, TrustStore};
use anyhow::{bail, Context as _, Result};
use chrono::Utc;
use std::path::PathBuf;
use tracing::{debug, warn};

const ENV_ALLOW_SYMLINK: &str = "SI_VAULT_ALLOW_SYMLINK_ENV_FILE";

/// Document plus the digest of the bytes it was read from
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub doc: Document,
    /// `None` when nothing exists yet
    pub digest: Option<String>,
}

impl Snapshot {
    pub fn exists(&self) -> bool {
        self.digest.is_some()
    }
}

/// Handle on one vault target
pub struct Vault<'a> {
    ctx: &'a Context,
    target: Target,
}

impl<'a> Vault<'a> {
    pub fn new(ctx: &'a Context, target: Target) -> Self {
        Self { ctx, target }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn context(&self) -> &Context {
        self.ctx
    }

    /// Read current bytes; a missing file or object is an empty snapshot
    pub fn read(&self) -> Result<Snapshot> {
        match self.target.backend {
            TargetBackend::Local => {
                let path = &self.target.path;
                match safe_file::read_optional(path)? {
                    None => Ok(Snapshot {
                        doc: Document::default(),
                        digest: None,
                    }),
                    Some(bytes) => Ok(Snapshot {
                        digest: Some(safe_file::digest(&bytes)),
                        doc: Document::from_bytes(&bytes)
                            .with_context(|| format!("read {}", path.display()))?,
                    }),
                }
            }
            TargetBackend::Sun => {
                let object = self.target.object_name();
                match sync::get_backup(self.ctx, &object)? {
                    None => Ok(Snapshot {
                        doc: Document::default(),
                        digest: None,
                    }),
                    Some(doc) => Ok(Snapshot {
                        digest: Some(safe_file::digest(&doc.to_bytes())),
                        doc,
                    }),
                }
            }
        }
    }

    /// Read, failing when the vault does not exist
    pub fn read_existing(&self) -> Result<Snapshot> {
        let snapshot = self.read()?;
        if !snapshot.exists() {
            bail!(VaultError::NotInitialized(format!(
                "{} does not exist",
                self.target.display()
            )));
        }
        Ok(snapshot)
    }

    /// Write a document to the target
    fn write(&self, doc: &Document) -> Result<()> {
        match self.target.backend {
            TargetBackend::Local => {
                let path = self.write_path()?;
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        safe_file::ensure_private_dir(parent)?;
                    }
                }
                let mode = safe_file::existing_mode(&path).unwrap_or(0o600);
                safe_file::atomic_write(&path, &doc.to_bytes(), mode)
                    .with_context(|| format!("write {}", path.display()))?;
                debug!(path = %path.display(), "vault file written");
                sync::mirror_after_write(self.ctx, &self.target.object_name(), doc);
                Ok(())
            }
            TargetBackend::Sun => {
                sync::put_backup(self.ctx, &self.target.object_name(), doc)?;
                Ok(())
            }
        }
    }

    fn write_path(&self) -> Result<PathBuf> {
        let path = &self.target.path;
        let allow = self.ctx.env.flag(ENV_ALLOW_SYMLINK);
        safe_file::refuse_symlink(path, allow)?;
        if allow {
            if let Ok(resolved) = std::fs::canonicalize(path) {
                return Ok(resolved);
            }
        }
        Ok(path.clone())
    }

    /// Apply `f` to the current document and write the result if it changed
    ///
    /// A missing vault is always written. A concurrent modification between
    /// read and write is retried once, then reported as a conflict.
    pub fn mutate<T, F>(&self, mut f: F) -> Result<(T, bool)>
    where
        F: FnMut(&mut Document, &Snapshot) -> Result<T>,
    {
        let _lock = match self.target.backend {
            TargetBackend::Local => Some(FileLock::acquire(&self.target.path)?),
            TargetBackend::Sun => None,
        };

        for attempt in 0..2 {
            let snapshot = self.read()?;
            let mut doc = snapshot.doc.clone();
            let out = f(&mut doc, &snapshot)?;

            if snapshot.exists() && doc == snapshot.doc {
                return Ok((out, false));
            }

            if self.target.is_local() {
                let current = safe_file::read_optional(&self.target.path)?
                    .map(|bytes| safe_file::digest(&bytes));
                if current != snapshot.digest {
                    if attempt == 0 {
                        warn!(vault = %self.target.display(), "vault changed during update, retrying");
                        continue;
                    }
                    bail!(VaultError::Conflict(self.target.display()));
                }
            }

            self.write(&doc)?;
            return Ok((out, true));
        }
        bail!(VaultError::Conflict(self.target.display()))
    }

    /// Replace the document wholesale (no transform)
    pub fn replace(&self, doc: &Document) -> Result<bool> {
        let ((), changed) = self.mutate(|current, _| {
            *current = doc.clone();
            Ok(())
        })?;
        Ok(changed)
    }

    fn trust_store(&self) -> Result<TrustStore> {
        TrustStore::load(&self.ctx.trust_store_path())
    }

    /// Compare against the trust store without recording anything
    pub fn trust_check(&self, doc: &Document) -> Result<(TrustCheck, Option<TrustRecord>)> {
        let store = self.trust_store()?;
        let key = self.target.trust_key();
        let check = store.check(&key, &header::recipients(doc));
        Ok((check, store.get(&key).cloned()))
    }

    /// Record a read: trust on first sight, refresh on match, warn on mismatch
    pub fn observe_trust(&self, doc: &Document) -> TrustCheck {
        let recipients = header::recipients(doc);
        if recipients.is_empty() {
            return TrustCheck::FirstSeen;
        }
        let result = self.trust_store().and_then(|mut store| {
            let check = store.observe(&self.target.trust_key(), &recipients, Utc::now());
            if !check.is_changed() {
                store.save()?;
            }
            Ok(check)
        });
        match result {
            Ok(check) => {
                if let TrustCheck::Changed { trusted, found } = &check {
                    warn!(
                        vault = %self.target.display(),
                        trusted = %trusted,
                        found = %found,
                        "vault recipients changed since last trusted"
                    );
                }
                check
            }
            Err(e) => {
                warn!(error = %e, "trust store unavailable");
                TrustCheck::FirstSeen
            }
        }
    }

    /// Guard a destructive operation
    ///
    /// A changed recipient set needs `--force`; interactive callers are
    /// additionally asked to confirm.
    pub fn require_trust(&self, doc: &Document, force: bool) -> Result<TrustCheck> {
        let recipients = header::recipients(doc);
        if recipients.is_empty() {
            return Ok(TrustCheck::FirstSeen);
        }

        let mut store = self.trust_store()?;
        let key = self.target.trust_key();
        let check = store.observe(&key, &recipients, Utc::now());
        match &check {
            TrustCheck::Changed { trusted, found } => {
                let mismatch = VaultError::TrustMismatch {
                    target: self.target.display(),
                    trusted: trusted.clone(),
                    found: found.clone(),
                };
                if !force {
                    bail!(mismatch);
                }
                if self.ctx.interactive {
                    let question = format!(
                        "Vault recipients for {} changed. Continue anyway?",
                        self.target.display()
                    );
                    if !self.ctx.prompter().confirm(&question)? {
                        bail!(mismatch);
                    }
                }
                warn!(vault = %self.target.display(), "proceeding despite trust mismatch (--force)");
            }
            _ => store.save()?,
        }
        Ok(check)
    }

    /// Trust the document's current recipients
    pub fn accept_trust(&self, doc: &Document) -> Result<TrustRecord> {
        let recipients = header::recipients(doc);
        if recipients.is_empty() {
            bail!(VaultError::NotInitialized(format!(
                "no recipients found in {} (expected {:?} lines)",
                self.target.display(),
                header::RECIPIENT_PREFIX.trim()
            )));
        }
        let mut store = self.trust_store()?;
        let record = store
            .accept(&self.target.trust_key(), &recipients, Utc::now())
            .clone();
        store.save()?;
        Ok(record)
    }

    /// Drop the trust record; returns whether one existed
    pub fn forget_trust(&self) -> Result<bool> {
        let mut store = self.trust_store()?;
        let removed = store.forget(&self.target.trust_key());
        if removed {
            store.save()?;
        }
        Ok(removed)
    }
}
