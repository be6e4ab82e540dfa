//! Identity, trust, recipient and sync management

use crate::cipher;
use crate::commands::{audited, lines, Done, Report, Selector};
use crate::context::Context;
use crate::error::VaultError;
use crate::header;
use crate::identity::{self, HydrateOutcome, KeygenOutcome, ENV_IDENTITY};
use crate::safe_file;
use crate::sync::{self, BackupReceipt, SyncMode};
use crate::trust::TrustRecord;
use crate::vault::Vault;
use anyhow::{bail, Result};
use serde::Serialize;
use si_core::format::{relative_time, short_recipient};
use tracing::{info, warn};

const REENCRYPT_NOTE: &str =
    "note: run `si vault encrypt --reencrypt` so existing values follow the new recipients";

// ---------------------------------------------------------------------------
// keygen / hydrate
// ---------------------------------------------------------------------------

impl Report for KeygenOutcome {
    fn render(&self) -> String {
        let state = if self.rotated {
            "rotated"
        } else if self.created {
            "created"
        } else {
            "existing"
        };
        let mut out = vec![
            format!("recipient: {}", self.recipient),
            format!("key: {} ({})", state, self.source),
        ];
        if let Some(previous) = &self.previous {
            out.push(format!("previous: {}", previous));
        }
        if !self.retired.is_empty() {
            out.push(format!("retired keys: {}", self.retired.len()));
        }
        if self.rotated {
            out.push(REENCRYPT_NOTE.to_string());
        }
        lines(out)
    }
}

/// Create the identity, or rotate it with `rotate`
pub fn keygen(ctx: &Context, rotate: bool) -> Result<Done<KeygenOutcome>> {
    let op = if rotate { "keygen.rotate" } else { "keygen" };
    let scope = Selector::default().audit_scope(ctx);
    audited(ctx, op, &scope, |entry| {
        let outcome = identity::keygen(ctx, rotate)?;
        entry.identity_fingerprint = Some(cipher::identity_fingerprint(&outcome.recipient));
        entry.source = Some(outcome.source.clone());
        entry.record("created", outcome.created);
        entry.record("rotated", outcome.rotated);
        Ok(Done::untargeted(outcome))
    })
}

impl Report for HydrateOutcome {
    fn render(&self) -> String {
        let mut out = vec![match &self.recipient {
            Some(r) => format!("identity: {} ({})", r, self.source),
            None => format!("identity: (none) ({})", self.source),
        }];
        if self.exported {
            out.push(format!("exported: {}", ENV_IDENTITY));
        }
        lines(out)
    }
}

/// Load the sun identity into this process; never touches vault files
pub fn hydrate(ctx: &Context) -> Result<Done<HydrateOutcome>> {
    let scope = Selector::default().audit_scope(ctx);
    audited(ctx, "hydrate", &scope, |entry| {
        let outcome = identity::hydrate(ctx)?;
        entry.identity_fingerprint = outcome
            .recipient
            .as_deref()
            .map(cipher::identity_fingerprint);
        entry.source = Some(outcome.source.clone());
        entry.record("exported", outcome.exported);
        Ok(Done::untargeted(outcome))
    })
}

// ---------------------------------------------------------------------------
// trust
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TrustStatusReport {
    pub path: String,
    pub exists: bool,
    pub recipients: Vec<String>,
    pub current_fingerprint: Option<String>,
    pub stored: Option<TrustRecord>,
    pub trust: &'static str,
    /// Recipients in the file but not in the trusted set
    pub added: Vec<String>,
    /// Trusted recipients no longer in the file
    pub removed: Vec<String>,
}

impl Report for TrustStatusReport {
    fn render(&self) -> String {
        let mut out = vec![format!(
            "env file: {}{}",
            self.path,
            if self.exists { "" } else { " (missing)" }
        )];
        out.push(format!(
            "current fp: {}",
            self.current_fingerprint.as_deref().unwrap_or("(none)")
        ));
        match &self.stored {
            Some(record) => {
                out.push(format!("stored fp: {}", record.fingerprint));
                out.push(format!(
                    "trusted: first seen {}, last seen {}",
                    relative_time(record.first_seen),
                    relative_time(record.last_seen)
                ));
            }
            None => out.push("stored fp: (none)".to_string()),
        }
        out.push(format!("trust: {}", self.trust));
        for r in &self.added {
            out.push(format!("  + {}", short_recipient(r)));
        }
        for r in &self.removed {
            out.push(format!("  - {}", short_recipient(r)));
        }
        lines(out)
    }
}

/// Show the trust record and how the file's recipients differ from it
pub fn trust_status(ctx: &Context, sel: &Selector) -> Result<Done<TrustStatusReport>> {
    audited(ctx, "trust.status", &sel.audit_scope(ctx), |_| {
        let vault = Vault::new(ctx, sel.resolve(ctx, true)?);
        let snap = vault.read()?;
        let recipients = header::recipients(&snap.doc);
        let (check, stored) = vault.trust_check(&snap.doc)?;

        let trust = if recipients.is_empty() {
            "untrusted"
        } else {
            check.label()
        };
        let (added, removed) = match &stored {
            Some(record) => (
                recipients
                    .iter()
                    .filter(|r| !record.recipients.contains(r))
                    .cloned()
                    .collect(),
                record
                    .recipients
                    .iter()
                    .filter(|r| !recipients.contains(r))
                    .cloned()
                    .collect(),
            ),
            None => (Vec::new(), Vec::new()),
        };

        Ok(Done::new(
            vault.target(),
            TrustStatusReport {
                path: vault.target().display(),
                exists: snap.exists(),
                current_fingerprint: (!recipients.is_empty())
                    .then(|| cipher::recipients_fingerprint(&recipients)),
                recipients,
                stored,
                trust,
                added,
                removed,
            },
        ))
    })
}

#[derive(Debug, Serialize)]
pub struct TrustAcceptReport {
    pub path: String,
    pub fingerprint: String,
    pub recipients: Vec<String>,
    pub accepted: bool,
}

impl Report for TrustAcceptReport {
    fn render(&self) -> String {
        if !self.accepted {
            return lines(["trust: unchanged (not confirmed)"]);
        }
        lines([
            format!("env file: {}", self.path),
            format!("trust fp: {}", self.fingerprint),
            "trust: ok".to_string(),
        ])
    }
}

/// Trust the file's current recipients
///
/// Interactive callers are asked unless `yes`; everyone else must pass it.
pub fn trust_accept(ctx: &Context, sel: &Selector, yes: bool) -> Result<Done<TrustAcceptReport>> {
    audited(ctx, "trust.accept", &sel.audit_scope(ctx), |entry| {
        let vault = Vault::new(ctx, sel.resolve(ctx, false)?);
        let snap = vault.read_existing()?;
        let recipients = header::recipients(&snap.doc);
        let fingerprint = cipher::recipients_fingerprint(&recipients);

        if !yes {
            if !ctx.interactive {
                bail!(VaultError::BadInput(
                    "trust accept needs --yes when not running interactively".to_string()
                ));
            }
            let question = format!(
                "Trust recipients of {} (fingerprint {})?",
                vault.target().display(),
                fingerprint
            );
            if !ctx.prompter().confirm(&question)? {
                entry.record("accepted", false);
                return Ok(Done::new(
                    vault.target(),
                    TrustAcceptReport {
                        path: vault.target().display(),
                        fingerprint,
                        recipients,
                        accepted: false,
                    },
                ));
            }
        }

        let record = vault.accept_trust(&snap.doc)?;
        entry.record("accepted", true);
        info!(vault = %vault.target().display(), fingerprint = %record.fingerprint, "trust accepted");
        Ok(Done::new(
            vault.target(),
            TrustAcceptReport {
                path: vault.target().display(),
                fingerprint: record.fingerprint,
                recipients: record.recipients,
                accepted: true,
            },
        ))
    })
}

#[derive(Debug, Serialize)]
pub struct TrustForgetReport {
    pub path: String,
    pub removed: bool,
}

impl Report for TrustForgetReport {
    fn render(&self) -> String {
        let state = if self.removed { "forgotten" } else { "no record" };
        lines([format!("env file: {}", self.path), format!("trust: {}", state)])
    }
}

/// Drop the trust record for a file
pub fn trust_forget(ctx: &Context, sel: &Selector) -> Result<Done<TrustForgetReport>> {
    audited(ctx, "trust.forget", &sel.audit_scope(ctx), |entry| {
        let vault = Vault::new(ctx, sel.resolve(ctx, true)?);
        let removed = vault.forget_trust()?;
        entry.record("removed", removed);
        Ok(Done::new(
            vault.target(),
            TrustForgetReport {
                path: vault.target().display(),
                removed,
            },
        ))
    })
}

// ---------------------------------------------------------------------------
// recipients
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RecipientsReport {
    pub path: String,
    pub recipients: Vec<String>,
    pub fingerprint: String,
}

impl Report for RecipientsReport {
    fn render(&self) -> String {
        let mut out = vec![
            format!("file: {}", self.path),
            format!("trust fp: {}", self.fingerprint),
        ];
        out.extend(self.recipients.iter().map(|r| format!("recipient: {}", r)));
        lines(out)
    }
}

/// List header recipients
pub fn recipients_list(ctx: &Context, sel: &Selector) -> Result<Done<RecipientsReport>> {
    audited(ctx, "recipients.list", &sel.audit_scope(ctx), |_| {
        let vault = Vault::new(ctx, sel.resolve(ctx, false)?);
        let snap = vault.read_existing()?;
        let recipients = header::recipients(&snap.doc);
        Ok(Done::new(
            vault.target(),
            RecipientsReport {
                path: vault.target().display(),
                fingerprint: cipher::recipients_fingerprint(&recipients),
                recipients,
            },
        ))
    })
}

#[derive(Debug, Serialize)]
pub struct RecipientChangeReport {
    pub path: String,
    pub recipient: String,
    pub changed: bool,
    pub fingerprint: String,
}

fn render_change(report: &RecipientChangeReport, done: &str, noop: &str) -> String {
    let mut out = vec![
        format!("file: {}", report.path),
        format!("trust fp: {}", report.fingerprint),
        format!(
            "recipient: {}",
            if report.changed { done } else { noop }
        ),
    ];
    if report.changed {
        out.push(REENCRYPT_NOTE.to_string());
    }
    lines(out)
}

/// Result of `recipients add`
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct RecipientAdded(pub RecipientChangeReport);

/// Result of `recipients remove`
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct RecipientRemoved(pub RecipientChangeReport);

impl Report for RecipientAdded {
    fn render(&self) -> String {
        render_change(&self.0, "added", "already present")
    }
}

impl Report for RecipientRemoved {
    fn render(&self) -> String {
        render_change(&self.0, "removed", "not present")
    }
}

/// Add a recipient to the header and re-trust the file
pub fn recipients_add(
    ctx: &Context,
    sel: &Selector,
    recipient: &str,
    force: bool,
) -> Result<Done<RecipientAdded>> {
    audited(ctx, "recipients.add", &sel.audit_scope(ctx), |entry| {
        let recipient = cipher::parse_recipient(recipient)?.to_string();
        entry.record("recipient", cipher::identity_fingerprint(&recipient));

        let vault = Vault::new(ctx, sel.resolve(ctx, false)?);
        let ((added, doc), _) = vault.mutate(|doc, _| {
            vault.require_trust(doc, force)?;
            if header::recipients(doc).contains(&recipient) {
                return Ok((false, doc.clone()));
            }
            header::ensure_header(doc, std::slice::from_ref(&recipient));
            Ok((true, doc.clone()))
        })?;

        let fingerprint = if added {
            vault.accept_trust(&doc)?.fingerprint
        } else {
            cipher::recipients_fingerprint(&header::recipients(&doc))
        };
        entry.record("changed", added);
        Ok(Done::new(
            vault.target(),
            RecipientAdded(RecipientChangeReport {
                path: vault.target().display(),
                recipient,
                changed: added,
                fingerprint,
            }),
        ))
    })
}

/// Remove a recipient from the header; the last one cannot be removed
///
/// Values stay readable by the removed recipient until re-encrypted.
pub fn recipients_remove(
    ctx: &Context,
    sel: &Selector,
    recipient: &str,
    force: bool,
) -> Result<Done<RecipientRemoved>> {
    audited(ctx, "recipients.remove", &sel.audit_scope(ctx), |entry| {
        let recipient = recipient.trim().to_string();
        entry.record("recipient", cipher::identity_fingerprint(&recipient));

        let vault = Vault::new(ctx, sel.resolve(ctx, false)?);
        let ((removed, doc), _) = vault.mutate(|doc, _| {
            vault.require_trust(doc, force)?;
            let current = header::recipients(doc);
            if !current.contains(&recipient) {
                return Ok((false, doc.clone()));
            }
            if current.len() == 1 {
                bail!(VaultError::BadInput(
                    "no recipients remaining after removal".to_string()
                ));
            }
            header::remove_recipient(doc, &recipient);
            Ok((true, doc.clone()))
        })?;

        let fingerprint = if removed {
            vault.accept_trust(&doc)?.fingerprint
        } else {
            cipher::recipients_fingerprint(&header::recipients(&doc))
        };
        entry.record("changed", removed);
        Ok(Done::new(
            vault.target(),
            RecipientRemoved(RecipientChangeReport {
                path: vault.target().display(),
                recipient,
                changed: removed,
                fingerprint,
            }),
        ))
    })
}

// ---------------------------------------------------------------------------
// sync
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct SyncStatusReport {
    pub mode: SyncMode,
    pub object: String,
    pub sun_url: Option<String>,
    pub sun_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sun_error: Option<String>,
    pub local_path: Option<String>,
    pub local_sha256: Option<String>,
    /// `None` when no remote lookup was made
    pub remote_exists: Option<bool>,
    pub remote_sha256: Option<String>,
    pub in_sync: Option<bool>,
}

impl Report for SyncStatusReport {
    fn render(&self) -> String {
        let mut out = vec![
            format!("mode: {}", self.mode.as_str()),
            format!("object: {}", self.object),
        ];
        if self.mode.uses_sun() {
            out.push(format!(
                "sun: {}",
                match (&self.sun_url, &self.sun_error) {
                    (_, Some(e)) => format!("unavailable ({})", e),
                    (Some(url), None) => url.clone(),
                    (None, None) => "configured".to_string(),
                }
            ));
        }
        if let Some(path) = &self.local_path {
            let state = if self.local_sha256.is_some() { "" } else { " (missing)" };
            out.push(format!("local: {}{}", path, state));
        }
        if let Some(exists) = self.remote_exists {
            out.push(format!(
                "remote: {}",
                if exists { "present" } else { "absent" }
            ));
        }
        if let Some(in_sync) = self.in_sync {
            out.push(format!("in sync: {}", if in_sync { "yes" } else { "no" }));
        }
        lines(out)
    }
}

/// Report sync mode and whether local and remote copies agree
pub fn sync_status(ctx: &Context, sel: &Selector) -> Result<Done<SyncStatusReport>> {
    audited(ctx, "sync.status", &sel.audit_scope(ctx), |_| {
        let target = sel.resolve(ctx, true)?;
        let mode = SyncMode::from_context(ctx);
        let object = target.object_name();

        let (local_path, local_sha256) = if target.is_local() {
            (
                Some(target.display()),
                safe_file::read_optional(&target.path)?.map(|b| safe_file::digest(&b)),
            )
        } else {
            (None, None)
        };

        let sun_error = ctx.sun().err().map(|e| e.to_string());
        let (remote_exists, remote_sha256) = if mode.uses_sun() && sun_error.is_none() {
            match sync::get_backup(ctx, &object) {
                Ok(Some(doc)) => (Some(true), Some(safe_file::digest(&doc.to_bytes()))),
                Ok(None) => (Some(false), None),
                Err(e) => {
                    warn!(object = %object, error = %e, "backup lookup failed");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };
        let in_sync = match (&local_sha256, &remote_sha256, remote_exists) {
            (Some(local), Some(remote), _) => Some(local == remote),
            (_, _, Some(_)) if target.is_local() => Some(false),
            _ => None,
        };

        Ok(Done::new(
            &target,
            SyncStatusReport {
                mode,
                object,
                sun_url: ctx.settings.sun.base_url.clone(),
                sun_available: mode.uses_sun() && sun_error.is_none(),
                sun_error: sun_error.filter(|_| mode.uses_sun()),
                local_path,
                local_sha256,
                remote_exists,
                remote_sha256,
                in_sync,
            },
        ))
    })
}

#[derive(Debug, Serialize)]
pub struct PushReport {
    pub path: String,
    #[serde(flatten)]
    pub receipt: BackupReceipt,
}

impl Report for PushReport {
    fn render(&self) -> String {
        let state = if self.receipt.uploaded {
            format!("uploaded {} bytes", self.receipt.bytes)
        } else {
            "not uploaded (git backend: commit the file to share it)".to_string()
        };
        lines([
            format!("file: {}", self.path),
            format!("object: {}", self.receipt.object),
            format!("backup: {}", state),
            format!("sha256: {}", self.receipt.sha256),
        ])
    }
}

/// Back up a local vault file
pub fn sync_push(ctx: &Context, sel: &Selector) -> Result<Done<PushReport>> {
    audited(ctx, "sync.push", &sel.audit_scope(ctx), |entry| {
        if ctx.strict_sun() {
            bail!(VaultError::BadInput(
                "strict sun mode already stores the vault in sun; nothing to push".to_string()
            ));
        }
        let vault = Vault::new(ctx, sel.resolve(ctx, false)?);
        let snap = vault.read_existing()?;
        let receipt = sync::put_backup(ctx, &vault.target().object_name(), &snap.doc)?;
        entry.record("bytes", receipt.bytes);
        entry.record("uploaded", receipt.uploaded);
        Ok(Done::new(
            vault.target(),
            PushReport {
                path: vault.target().display(),
                receipt,
            },
        ))
    })
}

#[derive(Debug, Serialize)]
pub struct PullReport {
    pub path: String,
    pub object: String,
    pub bytes: usize,
    pub written: bool,
}

impl Report for PullReport {
    fn render(&self) -> String {
        let state = if self.written { "restored" } else { "already up to date" };
        lines([
            format!("file: {}", self.path),
            format!("object: {}", self.object),
            format!("pull: {}", state),
        ])
    }
}

/// Restore a local vault file from its sun backup
///
/// An existing local file that differs from the backup needs `force`.
pub fn sync_pull(ctx: &Context, sel: &Selector, force: bool) -> Result<Done<PullReport>> {
    audited(ctx, "sync.pull", &sel.audit_scope(ctx), |entry| {
        match SyncMode::from_context(ctx) {
            SyncMode::SunStrict => bail!(VaultError::BadInput(
                "sync pull is disabled in strict sun mode; vault files are never written locally"
                    .to_string()
            )),
            SyncMode::Off | SyncMode::Git => bail!(VaultError::BadInput(
                "sync pull needs vault.sync_backend = \"sun\"".to_string()
            )),
            SyncMode::Sun => {}
        }

        let vault = Vault::new(ctx, sel.resolve(ctx, true)?);
        let object = vault.target().object_name();
        let remote = sync::get_backup(ctx, &object)?
            .ok_or_else(|| VaultError::NotFound(format!("vault backup {}", object)))?;
        vault.require_trust(&remote, force)?;

        let ((), written) = vault.mutate(|doc, snap| {
            if snap.exists() && *doc != remote && !force {
                bail!(VaultError::BadInput(format!(
                    "{} differs from the backup; pass --force to overwrite it",
                    vault.target().display()
                )));
            }
            *doc = remote.clone();
            Ok(())
        })?;

        let bytes = remote.to_bytes().len();
        entry.record("bytes", bytes);
        entry.record("written", written);
        Ok(Done::new(
            vault.target(),
            PullReport {
                path: vault.target().display(),
                object,
                bytes,
                written,
            },
        ))
    })
}
