//! Vault file commands
//!
//! Every verb resolves its target, applies the trust policy, works through a
//! [`Vault`] and leaves exactly one audit entry behind, successful or not.

use crate::audit::{AuditEntry, AuditLog};
use crate::cipher;
use crate::context::Context;
use crate::dotenv::{self, Document, Entry};
use crate::error::{self, VaultError};
use crate::formatter::{self, FormatOptions};
use crate::header;
use crate::identity::{self, LoadedIdentities};
use crate::sync;
use crate::target::{self, Target};
use crate::vault::Vault;
use anyhow::{bail, Context as _, Result};
use serde::Serialize;
use si_core::format::truncate;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// `--scope` / `--file` as given on the command line
#[derive(Debug, Clone, Default)]
pub struct Selector {
    pub scope: Option<String>,
    pub file: Option<String>,
}

impl Selector {
    pub fn scope(name: &str) -> Self {
        Self {
            scope: Some(name.to_string()),
            file: None,
        }
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            scope: None,
            file: Some(path.as_ref().display().to_string()),
        }
    }

    pub fn resolve(&self, ctx: &Context, allow_missing: bool) -> Result<Target> {
        target::resolve(
            ctx,
            self.scope.as_deref(),
            self.file.as_deref(),
            allow_missing,
        )
    }

    /// Scope name recorded in the audit log, known before resolution
    pub(crate) fn audit_scope(&self, ctx: &Context) -> String {
        let raw = self
            .scope
            .as_deref()
            .or(self.file.as_deref())
            .unwrap_or(&ctx.settings.vault.default_scope);
        target::normalize_scope(raw)
    }
}

/// Where a command operated
#[derive(Debug, Clone, Serialize)]
pub struct TargetInfo {
    pub scope: String,
    pub path: String,
    pub backend: &'static str,
}

impl From<&Target> for TargetInfo {
    fn from(target: &Target) -> Self {
        Self {
            scope: target.scope.clone(),
            path: target.display(),
            backend: target.backend.as_str(),
        }
    }
}

/// Human rendering of a command result
///
/// `render` returns the complete, newline-terminated stdout text.
pub trait Report: Serialize {
    fn render(&self) -> String;
}

/// A finished command
#[derive(Debug)]
pub struct Done<R> {
    pub target: Option<TargetInfo>,
    pub report: R,
    /// Nonzero for findings that are not failures (`fmt --check`, `check`)
    pub exit_code: u8,
}

impl<R> Done<R> {
    pub fn new(target: &Target, report: R) -> Self {
        Self {
            target: Some(target.into()),
            report,
            exit_code: 0,
        }
    }

    pub fn untargeted(report: R) -> Self {
        Self {
            target: None,
            report,
            exit_code: 0,
        }
    }

    pub fn with_exit_code(mut self, code: u8) -> Self {
        self.exit_code = code;
        self
    }
}

/// Run `f` and append its audit entry, tagged with the error category on
/// failure
pub(crate) fn audited<T, F>(ctx: &Context, op: &str, scope: &str, f: F) -> Result<T>
where
    F: FnOnce(&mut AuditEntry) -> Result<T>,
{
    let mut entry = AuditEntry::new(op, scope);
    let result = f(&mut entry);
    if let Err(e) = &result {
        entry = entry.result(error::category_of(e));
    }
    if let Err(e) = AuditLog::with_path(ctx.audit_log_path()).log(&entry) {
        warn!(error = %e, "audit log write failed");
    }
    result
}

pub(crate) fn lines<I, S>(lines: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for line in lines {
        out.push_str(line.as_ref());
        out.push('\n');
    }
    out
}

fn is_wrapped(entry: &Entry) -> bool {
    cipher::is_encrypted(entry.value_raw().trim())
}

/// Identities needed to open `entries`; empty when nothing is wrapped
fn identities_for(ctx: &Context, entries: &[Entry]) -> Result<LoadedIdentities> {
    if !entries.iter().any(is_wrapped) {
        return Ok(LoadedIdentities::default());
    }
    load_identities(ctx)
}

fn load_identities(ctx: &Context) -> Result<LoadedIdentities> {
    let ids = identity::load(ctx)?;
    if ids.is_empty() {
        ids.require_recipient()?;
    }
    Ok(ids)
}

/// Logical value of an entry, decrypting wrapped values
fn open_value(entry: &Entry, ids: &LoadedIdentities) -> Result<String> {
    let raw = entry.value_raw().trim();
    if cipher::is_encrypted(raw) {
        cipher::decrypt(entry.key(), raw, ids.identities())
    } else {
        entry.assignment.value()
    }
}

/// Recipients to encrypt to; strict sun stamps its identity into a bare doc
fn recipients_for(vault: &Vault, doc: &mut Document, strict: Option<&String>) -> Result<Vec<String>> {
    if let Some(recipient) = strict {
        if header::recipients(doc).is_empty() {
            header::ensure_header(doc, std::slice::from_ref(recipient));
        }
    }
    let recipients = header::recipients(doc);
    if recipients.is_empty() {
        bail!(VaultError::NotInitialized(format!(
            "{} has no recipients; run `si vault init`",
            vault.target().display()
        )));
    }
    Ok(recipients)
}

fn strict_recipient(ctx: &Context) -> Result<Option<String>> {
    if ctx.strict_sun() {
        Ok(Some(identity::ensure_strict_identity(ctx)?))
    } else {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct InitReport {
    pub path: String,
    pub recipient: String,
    pub trust_fingerprint: String,
    pub key_created: bool,
    pub key_backend: &'static str,
    pub file_created: bool,
    pub header_updated: bool,
}

impl Report for InitReport {
    fn render(&self) -> String {
        let key = if self.key_created { "created" } else { "existing" };
        lines([
            format!("env file: {}", self.path),
            format!("recipient: {}", self.recipient),
            format!("trust fp: {}", self.trust_fingerprint),
            format!("key: {} (backend={})", key, self.key_backend),
        ])
    }
}

/// Create the vault if absent, stamp the header and trust it
pub fn init(ctx: &Context, sel: &Selector) -> Result<Done<InitReport>> {
    audited(ctx, "init", &sel.audit_scope(ctx), |entry| {
        let target = sel.resolve(ctx, true)?;
        let (ids, key_created) = identity::ensure(ctx)?;
        let recipient = ids.require_recipient()?;
        entry.identity_fingerprint = ids.fingerprint();

        let vault = Vault::new(ctx, target);
        let ((file_created, doc), header_updated) = vault.mutate(|doc, snap| {
            if snap.exists() {
                vault.require_trust(&snap.doc, false)?;
            }
            header::ensure_header(doc, std::slice::from_ref(&recipient));
            Ok((!snap.exists(), doc.clone()))
        })?;
        let record = vault.accept_trust(&doc)?;

        entry.record("file_created", file_created);
        entry.record("key_created", key_created);
        info!(vault = %vault.target().display(), file_created, "vault initialized");

        Ok(Done::new(
            vault.target(),
            InitReport {
                path: vault.target().display(),
                recipient,
                trust_fingerprint: record.fingerprint,
                key_created,
                key_backend: ctx.settings.effective_key_backend().as_str(),
                file_created,
                header_updated,
            },
        ))
    })
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub path: String,
    pub exists: bool,
    pub backend: &'static str,
    pub recipients: Vec<String>,
    pub identity: Option<String>,
    pub identity_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_error: Option<String>,
    /// The loaded identity is one of the header recipients
    pub identity_in_header: bool,
    pub trust: &'static str,
    pub trust_fingerprint: Option<String>,
    pub plaintext: usize,
    pub encrypted: usize,
    pub malformed: usize,
    pub plaintext_keys: Vec<String>,
}

impl Report for StatusReport {
    fn render(&self) -> String {
        let mut out = vec![format!(
            "file: {}{}",
            self.path,
            if self.exists { "" } else { " (missing)" }
        )];
        out.push(format!("backend: {}", self.backend));
        if self.recipients.is_empty() {
            out.push("recipient: (none)".to_string());
        }
        for r in &self.recipients {
            out.push(format!("recipient: {}", r));
        }
        out.push(match (&self.identity, &self.identity_error) {
            (Some(r), _) => format!(
                "identity: {} ({})",
                si_core::format::short_recipient(r),
                self.identity_source.as_deref().unwrap_or("unknown")
            ),
            (None, Some(e)) => format!("identity: unavailable ({})", truncate(e, 96)),
            (None, None) => "identity: (none)".to_string(),
        });
        if self.identity.is_some() && !self.recipients.is_empty() && !self.identity_in_header {
            out.push("identity: not a recipient of this file".to_string());
        }
        out.push(format!("trust: {}", self.trust));
        out.push(format!(
            "values: {} encrypted, {} plaintext, {} malformed",
            self.encrypted, self.plaintext, self.malformed
        ));
        if !self.plaintext_keys.is_empty() {
            out.push(format!("plaintext keys: {}", self.plaintext_keys.join(", ")));
        }
        lines(out)
    }
}

/// Summarize a vault without decrypting anything
pub fn status(ctx: &Context, sel: &Selector) -> Result<Done<StatusReport>> {
    audited(ctx, "status", &sel.audit_scope(ctx), |entry| {
        let target = sel.resolve(ctx, true)?;
        let vault = Vault::new(ctx, target);
        let snap = vault.read()?;

        let (identity, identity_source, identity_error) = match identity::load(ctx) {
            Ok(ids) => {
                entry.identity_fingerprint = ids.fingerprint();
                let current = ids.current();
                (
                    current.map(|o| o.recipient.clone()),
                    current.map(|o| o.source.to_string()),
                    None,
                )
            }
            Err(e) => (None, None, Some(format!("{:#}", e))),
        };

        let recipients = header::recipients(&snap.doc);
        let (trust, record) = if snap.exists() && !recipients.is_empty() {
            let (check, record) = vault.trust_check(&snap.doc)?;
            (check.label(), record)
        } else {
            ("untrusted", None)
        };

        let plaintext_keys = sync::plaintext_keys(&snap.doc);
        let effective = snap.doc.effective_entries().len();
        Ok(Done::new(
            vault.target(),
            StatusReport {
                path: vault.target().display(),
                exists: snap.exists(),
                backend: ctx.mode(),
                identity_in_header: identity
                    .as_ref()
                    .map(|r| recipients.contains(r))
                    .unwrap_or(false),
                recipients,
                identity,
                identity_source,
                identity_error,
                trust,
                trust_fingerprint: record.map(|r| r.fingerprint),
                plaintext: plaintext_keys.len(),
                encrypted: effective - plaintext_keys.len(),
                malformed: snap.doc.malformed().len(),
                plaintext_keys,
            },
        ))
    })
}

// ---------------------------------------------------------------------------
// set / get / unset / dump
// ---------------------------------------------------------------------------

/// Where `set` takes its value from
#[derive(Debug, Clone)]
pub enum ValueSource {
    Literal(String),
    Stdin,
    /// Hidden terminal prompt
    Prompt,
}

#[derive(Debug, Clone)]
pub struct SetArgs {
    pub key: String,
    pub value: ValueSource,
    pub section: Option<String>,
    /// Reformat the file after writing
    pub format: bool,
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct SetReport {
    pub path: String,
    pub key: String,
    pub updated: bool,
    pub section: Option<String>,
    pub written: bool,
}

impl Report for SetReport {
    fn render(&self) -> String {
        let verb = if self.updated { "updated" } else { "added" };
        lines([format!("{}: {} (encrypted) in {}", self.key, verb, self.path)])
    }
}

fn read_value(ctx: &Context, key: &str, source: &ValueSource) -> Result<String> {
    match source {
        ValueSource::Literal(value) => Ok(value.clone()),
        ValueSource::Stdin => {
            let mut value = String::new();
            std::io::stdin()
                .read_to_string(&mut value)
                .context("Failed to read value from stdin")?;
            if let Some(stripped) = value.strip_suffix('\n') {
                value = stripped.strip_suffix('\r').unwrap_or(stripped).to_string();
            }
            Ok(value)
        }
        ValueSource::Prompt => {
            if !ctx.interactive {
                bail!(VaultError::BadInput(format!(
                    "no value given for {} (pass VALUE or --stdin)",
                    key
                )));
            }
            ctx.prompter().secret(&format!("{}: ", key))
        }
    }
}

/// Encrypt and store one value
pub fn set(ctx: &Context, sel: &Selector, args: &SetArgs) -> Result<Done<SetReport>> {
    audited(ctx, "set", &sel.audit_scope(ctx), |entry| {
        dotenv::validate_key_name(&args.key)?;
        entry.key = Some(args.key.clone());
        entry.encrypted = Some(true);

        let target = sel.resolve(ctx, false)?;
        let value = read_value(ctx, &args.key, &args.value)?;
        let strict = strict_recipient(ctx)?;

        let vault = Vault::new(ctx, target);
        let (updated, written) = vault.mutate(|doc, _| {
            vault.require_trust(doc, args.force)?;
            let recipients = recipients_for(&vault, doc, strict.as_ref())?;
            let wrapped = cipher::encrypt(&value, &recipients)?;
            let updated = doc.lookup(&args.key).is_some();
            match &args.section {
                Some(section) => doc.upsert_in_section(section, &args.key, &wrapped, None),
                None => doc.upsert(&args.key, &wrapped, None),
            };
            if args.format {
                *doc = formatter::format_document(doc, FormatOptions::default()).0;
            }
            Ok(updated)
        })?;

        if let Some(section) = &args.section {
            entry.record("section", section.as_str());
        }
        debug!(key = %args.key, updated, "value stored");
        Ok(Done::new(
            vault.target(),
            SetReport {
                path: vault.target().display(),
                key: args.key.clone(),
                updated,
                section: args.section.clone(),
                written,
            },
        ))
    })
}

#[derive(Debug, Serialize)]
pub struct GetReport {
    pub key: String,
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Report for GetReport {
    fn render(&self) -> String {
        match (&self.value, self.encrypted) {
            (Some(value), _) => format!("{}\n", value),
            (None, true) => lines([format!("{}: encrypted (use --reveal)", self.key)]),
            (None, false) => lines([format!(
                "{}: plaintext (run `si vault encrypt` to encrypt)",
                self.key
            )]),
        }
    }
}

/// Report whether a key is encrypted, or reveal its value
pub fn get(ctx: &Context, sel: &Selector, key: &str, reveal: bool) -> Result<Done<GetReport>> {
    let op = if reveal { "reveal" } else { "get" };
    audited(ctx, op, &sel.audit_scope(ctx), |audit| {
        dotenv::validate_key_name(key)?;
        audit.key = Some(key.to_string());

        let target = sel.resolve(ctx, false)?;
        let vault = Vault::new(ctx, target);
        let snap = vault.read_existing()?;
        vault.observe_trust(&snap.doc);

        let entry = snap
            .doc
            .lookup(key)
            .ok_or_else(|| VaultError::NotFound(key.to_string()))?;
        let encrypted = is_wrapped(&entry);
        audit.encrypted = Some(encrypted);

        let value = if reveal {
            let ids = identities_for(ctx, std::slice::from_ref(&entry))?;
            audit.identity_fingerprint = ids.fingerprint();
            audit.source = ids.current().map(|o| o.source.to_string());
            Some(open_value(&entry, &ids)?)
        } else {
            None
        };

        Ok(Done::new(
            vault.target(),
            GetReport {
                key: key.to_string(),
                encrypted,
                value,
            },
        ))
    })
}

#[derive(Debug, Serialize)]
pub struct UnsetReport {
    pub path: String,
    pub key: String,
    pub removed: usize,
}

impl Report for UnsetReport {
    fn render(&self) -> String {
        lines([format!("{}: removed from {}", self.key, self.path)])
    }
}

/// Remove every assignment of a key
pub fn unset(ctx: &Context, sel: &Selector, key: &str, force: bool) -> Result<Done<UnsetReport>> {
    audited(ctx, "unset", &sel.audit_scope(ctx), |entry| {
        dotenv::validate_key_name(key)?;
        entry.key = Some(key.to_string());

        let target = sel.resolve(ctx, false)?;
        let vault = Vault::new(ctx, target);
        let (removed, _) = vault.mutate(|doc, _| {
            vault.require_trust(doc, force)?;
            match doc.remove(key) {
                0 => bail!(VaultError::NotFound(key.to_string())),
                n => Ok(n),
            }
        })?;

        Ok(Done::new(
            vault.target(),
            UnsetReport {
                path: vault.target().display(),
                key: key.to_string(),
                removed,
            },
        ))
    })
}

#[derive(Debug, Serialize)]
pub struct DumpItem {
    pub key: String,
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DumpReport {
    pub keys: Vec<DumpItem>,
    pub decrypted_count: usize,
}

impl Report for DumpReport {
    fn render(&self) -> String {
        lines(self.keys.iter().map(|item| match (&item.value, item.encrypted) {
            (Some(value), _) => format!("{}={}", item.key, dotenv::render_value(value)),
            (None, true) => format!("{}\t(encrypted; use --reveal)", item.key),
            (None, false) => format!("{}\t(plaintext)", item.key),
        }))
    }
}

/// List keys, optionally with their values
pub fn dump(ctx: &Context, sel: &Selector, reveal: bool) -> Result<Done<DumpReport>> {
    audited(ctx, "dump", &sel.audit_scope(ctx), |audit| {
        let target = sel.resolve(ctx, false)?;
        let vault = Vault::new(ctx, target);
        let snap = vault.read_existing()?;
        vault.observe_trust(&snap.doc);

        let entries = snap.doc.effective_entries();
        let ids = if reveal {
            identities_for(ctx, &entries)?
        } else {
            LoadedIdentities::default()
        };
        audit.identity_fingerprint = ids.fingerprint();

        let mut decrypted_count = 0;
        let mut keys = Vec::with_capacity(entries.len());
        for entry in &entries {
            let encrypted = is_wrapped(entry);
            let value = if reveal {
                if encrypted {
                    decrypted_count += 1;
                }
                Some(open_value(entry, &ids)?)
            } else {
                None
            };
            keys.push(DumpItem {
                key: entry.key().to_string(),
                encrypted,
                value,
            });
        }

        audit.record("reveal", reveal);
        audit.record("keys_count", keys.len());
        audit.record("decrypted_count", decrypted_count);
        Ok(Done::new(
            vault.target(),
            DumpReport {
                keys,
                decrypted_count,
            },
        ))
    })
}

// ---------------------------------------------------------------------------
// encrypt / decrypt
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize)]
pub struct EncryptReport {
    pub path: String,
    pub encrypted: usize,
    pub reencrypted: usize,
    pub skipped: usize,
    pub written: bool,
}

impl Report for EncryptReport {
    fn render(&self) -> String {
        let mut out = vec![format!("env file: {}", self.path)];
        out.push(format!("encrypted: {}", self.encrypted));
        if self.reencrypted > 0 {
            out.push(format!("reencrypted: {}", self.reencrypted));
        }
        out.push(format!("already encrypted: {}", self.skipped));
        lines(out)
    }
}

/// Wrap every plaintext value; `reencrypt` also re-wraps existing ones
pub fn encrypt(
    ctx: &Context,
    sel: &Selector,
    reencrypt: bool,
    force: bool,
) -> Result<Done<EncryptReport>> {
    audited(ctx, "encrypt", &sel.audit_scope(ctx), |audit| {
        let target = sel.resolve(ctx, false)?;
        let strict = strict_recipient(ctx)?;
        let ids = if reencrypt {
            load_identities(ctx)?
        } else {
            LoadedIdentities::default()
        };
        audit.identity_fingerprint = ids.fingerprint();

        let vault = Vault::new(ctx, target);
        let (mut report, written) = vault.mutate(|doc, _| {
            vault.require_trust(doc, force)?;
            let recipients = recipients_for(&vault, doc, strict.as_ref())?;

            let mut report = EncryptReport::default();
            for entry in doc.entries() {
                let raw = entry.value_raw().trim().to_string();
                if cipher::is_encrypted(&raw) {
                    if !reencrypt {
                        report.skipped += 1;
                        continue;
                    }
                    let wrapped =
                        cipher::reencrypt(entry.key(), &raw, ids.identities(), &recipients)?;
                    doc.replace_value(entry.index, &wrapped);
                    report.reencrypted += 1;
                } else {
                    let plain = entry.assignment.value()?;
                    doc.replace_value(entry.index, &cipher::encrypt(&plain, &recipients)?);
                    report.encrypted += 1;
                }
            }
            Ok(report)
        })?;
        report.path = vault.target().display();
        report.written = written;

        audit.record("encrypted_count", report.encrypted);
        audit.record("reencrypted_count", report.reencrypted);
        info!(
            vault = %report.path,
            encrypted = report.encrypted,
            reencrypted = report.reencrypted,
            "vault encrypted"
        );
        Ok(Done::new(vault.target(), report))
    })
}

/// What `decrypt` does with the plaintext
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptMode {
    Stdout,
    InPlace,
}

#[derive(Debug, Serialize)]
pub struct DecryptReport {
    pub path: String,
    pub decrypted: usize,
    pub written: bool,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Report for DecryptReport {
    fn render(&self) -> String {
        match &self.text {
            Some(text) => text.clone(),
            None if self.cancelled => lines(["decrypt: cancelled"]),
            None => lines([
                format!("env file: {}", self.path),
                format!("decrypted: {} (plaintext written to disk)", self.decrypted),
            ]),
        }
    }
}

/// Replace wrapped values with rendered plaintext; returns how many
fn decrypt_document(doc: &mut Document, ids: &LoadedIdentities) -> Result<usize> {
    let mut count = 0;
    for entry in doc.entries() {
        if !is_wrapped(&entry) {
            continue;
        }
        let plain = open_value(&entry, ids)?;
        doc.replace_value(entry.index, &dotenv::render_value(&plain));
        count += 1;
    }
    Ok(count)
}

/// Print the decrypted document, or write it back with `--yes`
pub fn decrypt(
    ctx: &Context,
    sel: &Selector,
    mode: Option<DecryptMode>,
    force: bool,
) -> Result<Done<DecryptReport>> {
    audited(ctx, "decrypt", &sel.audit_scope(ctx), |audit| {
        let Some(mode) = mode else {
            bail!(VaultError::BadInput(
                "refusing to decrypt without a destination (pass --stdout, or --yes to write plaintext to disk)".to_string()
            ));
        };
        let target = sel.resolve(ctx, false)?;
        let vault = Vault::new(ctx, target);
        audit.record("in_place", mode == DecryptMode::InPlace);

        match mode {
            DecryptMode::Stdout => {
                let snap = vault.read_existing()?;
                vault.observe_trust(&snap.doc);
                let ids = identities_for(ctx, &snap.doc.entries())?;
                audit.identity_fingerprint = ids.fingerprint();

                let mut doc = snap.doc;
                let decrypted = decrypt_document(&mut doc, &ids)?;
                audit.record("decrypted_count", decrypted);
                Ok(Done::new(
                    vault.target(),
                    DecryptReport {
                        path: vault.target().display(),
                        decrypted,
                        written: false,
                        cancelled: false,
                        text: Some(doc.emit()),
                    },
                ))
            }
            DecryptMode::InPlace => {
                let question = format!(
                    "Write decrypted plaintext to {}?",
                    vault.target().display()
                );
                if ctx.interactive && !ctx.prompter().confirm(&question)? {
                    audit.record("cancelled", true);
                    return Ok(Done::new(
                        vault.target(),
                        DecryptReport {
                            path: vault.target().display(),
                            decrypted: 0,
                            written: false,
                            cancelled: true,
                            text: None,
                        },
                    ));
                }

                let snap = vault.read_existing()?;
                let ids = identities_for(ctx, &snap.doc.entries())?;
                audit.identity_fingerprint = ids.fingerprint();
                let (decrypted, written) = vault.mutate(|doc, _| {
                    vault.require_trust(doc, force)?;
                    decrypt_document(doc, &ids)
                })?;
                audit.record("decrypted_count", decrypted);
                warn!(vault = %vault.target().display(), decrypted, "plaintext written to disk");
                Ok(Done::new(
                    vault.target(),
                    DecryptReport {
                        path: vault.target().display(),
                        decrypted,
                        written,
                        cancelled: false,
                        text: None,
                    },
                ))
            }
        }
    })
}

// ---------------------------------------------------------------------------
// fmt / check
// ---------------------------------------------------------------------------

const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", ".venv", "vendor"];

/// `.env`, `.env.<name>` or `<name>.env`, never lock or temp files
pub fn is_dotenv_name(name: &str, include_examples: bool) -> bool {
    if name.ends_with(".lock") || name.ends_with(".tmp") || name.ends_with('~') {
        return false;
    }
    let candidate = name == ".env" || name.starts_with(".env.") || name.ends_with(".env");
    if !candidate {
        return false;
    }
    include_examples
        || !["example", "sample", "template"]
            .iter()
            .any(|marker| name.contains(marker))
}

/// Dotenv files below `root`, sorted
pub fn discover_dotenv_files(root: &Path, max_depth: usize, include_examples: bool) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(root)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !SKIP_DIRS.iter().any(|skip| e.file_name() == *skip)
        })
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_file()
                && is_dotenv_name(&e.file_name().to_string_lossy(), include_examples)
        })
        .map(|e| e.into_path())
        .collect();
    found.sort();
    found
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FmtArgs {
    pub all: bool,
    pub check: bool,
    pub sort: bool,
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct FmtFile {
    pub path: String,
    pub changed: bool,
}

#[derive(Debug, Serialize)]
pub struct FmtReport {
    pub check: bool,
    pub files: Vec<FmtFile>,
}

impl Report for FmtReport {
    fn render(&self) -> String {
        lines(self.files.iter().map(|f| {
            let label = match (self.check, f.changed) {
                (true, true) => "would reformat",
                (false, true) => "formatted",
                (_, false) => "ok",
            };
            format!("{}: {}", label, f.path)
        }))
    }
}

/// Canonicalize layout and quoting of one file, or every sibling `.env*`
pub fn fmt(ctx: &Context, sel: &Selector, args: FmtArgs) -> Result<Done<FmtReport>> {
    audited(ctx, "fmt", &sel.audit_scope(ctx), |audit| {
        let target = sel.resolve(ctx, false)?;
        let targets = if args.all {
            if !target.is_local() {
                bail!(VaultError::BadInput(
                    "fmt --all needs local vault files; strict sun mode has none".to_string()
                ));
            }
            let dir = target.path.parent().unwrap_or(Path::new("."));
            let mut paths = discover_dotenv_files(dir, 1, true);
            if !paths.contains(&target.path) {
                paths.push(target.path.clone());
                paths.sort();
            }
            paths
                .into_iter()
                .map(|p| Target::local(&target::normalize_scope(&p.display().to_string()), p))
                .collect()
        } else {
            vec![target.clone()]
        };

        let options = FormatOptions { sort: args.sort };
        let mut files = Vec::with_capacity(targets.len());
        for t in targets {
            let vault = Vault::new(ctx, t);
            let changed = if args.check {
                let snap = vault.read_existing()?;
                formatter::format_document(&snap.doc, options).1
            } else {
                vault
                    .mutate(|doc, _| {
                        let (formatted, changed) = formatter::format_document(doc, options);
                        if changed {
                            vault.require_trust(doc, args.force)?;
                            *doc = formatted;
                        }
                        Ok(changed)
                    })?
                    .0
            };
            files.push(FmtFile {
                path: vault.target().display(),
                changed,
            });
        }

        let pending = files.iter().filter(|f| f.changed).count();
        audit.record("files", files.len());
        audit.record("changed", pending);
        let done = Done::new(
            &target,
            FmtReport {
                check: args.check,
                files,
            },
        );
        Ok(if args.check && pending > 0 {
            done.with_exit_code(1)
        } else {
            done
        })
    })
}

#[derive(Debug, Clone, Default)]
pub struct CheckArgs {
    pub files: Vec<String>,
    pub all: bool,
    pub include_examples: bool,
}

#[derive(Debug, Serialize)]
pub struct CheckFinding {
    pub path: String,
    pub plaintext_keys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub scanned: usize,
    pub findings: Vec<CheckFinding>,
}

impl Report for CheckReport {
    fn render(&self) -> String {
        if self.findings.is_empty() {
            return lines([format!(
                "[si vault] no plaintext values in {} file(s)",
                self.scanned
            )]);
        }
        let mut out = vec!["[si vault] plaintext values detected:".to_string()];
        for f in &self.findings {
            out.push(format!("  - {}: {}", f.path, f.plaintext_keys.join(", ")));
        }
        out.push(String::new());
        out.push("Fix:".to_string());
        for f in &self.findings {
            out.push(format!("  si vault encrypt --file {}", f.path));
        }
        lines(out)
    }
}

/// Scan dotenv files for plaintext values; exit code 2 on findings
pub fn check(ctx: &Context, sel: &Selector, args: &CheckArgs) -> Result<Done<CheckReport>> {
    audited(ctx, "check", &sel.audit_scope(ctx), |audit| {
        let mut docs: Vec<(String, Document)> = Vec::new();

        if args.files.is_empty() && !args.all {
            let vault = Vault::new(ctx, sel.resolve(ctx, false)?);
            let snap = vault.read_existing()?;
            docs.push((vault.target().display(), snap.doc));
        } else {
            let mut paths: Vec<PathBuf> = args
                .files
                .iter()
                .map(|f| {
                    let p = ctx.paths.expand_home(f);
                    if p.is_absolute() {
                        p
                    } else {
                        ctx.cwd.join(p)
                    }
                })
                .collect();
            if args.all {
                paths.extend(discover_dotenv_files(&ctx.cwd, 8, args.include_examples));
            }
            paths.dedup();
            for path in paths {
                let Some(bytes) = crate::safe_file::read_optional(&path)? else {
                    warn!(path = %path.display(), "skipping missing file");
                    continue;
                };
                let doc = Document::from_bytes(&bytes)
                    .with_context(|| format!("read {}", path.display()))?;
                docs.push((path.display().to_string(), doc));
            }
        }

        let scanned = docs.len();
        let findings: Vec<CheckFinding> = docs
            .into_iter()
            .filter_map(|(path, doc)| {
                let keys = sync::plaintext_keys(&doc);
                (!keys.is_empty()).then_some(CheckFinding {
                    path,
                    plaintext_keys: keys,
                })
            })
            .collect();

        audit.record("scanned", scanned);
        audit.record("findings", findings.len());
        let code = if findings.is_empty() { 0 } else { 2 };
        Ok(Done::untargeted(CheckReport { scanned, findings }).with_exit_code(code))
    })
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub command: Vec<String>,
    pub allow_plaintext: bool,
    /// Run through `$SHELL -lc`
    pub shell: bool,
    /// Use `-ic` instead of `-lc`
    pub shell_interactive: bool,
    /// Shell binary; defaults to `$SHELL`, then `/bin/bash`
    pub shell_path: Option<String>,
}

/// A process to exec with the vault merged into its environment
#[derive(Debug)]
pub struct RunPlan {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Variables this process exported that the child must not inherit
    pub scrub: Vec<String>,
}

/// Decrypt the vault into an environment for `args.command`
pub fn run(ctx: &Context, sel: &Selector, args: &RunArgs) -> Result<RunPlan> {
    audited(ctx, "run", &sel.audit_scope(ctx), |audit| {
        let Some((first, rest)) = args.command.split_first() else {
            bail!(VaultError::BadInput(
                "missing command (usage: si vault run -- CMD [ARGS...])".to_string()
            ));
        };
        let (program, argv) = if args.shell {
            let shell = args
                .shell_path
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .or_else(|| ctx.env.get("SHELL"))
                .unwrap_or_else(|| "/bin/bash".to_string());
            let mode = if args.shell_interactive { "-ic" } else { "-lc" };
            (shell, vec![mode.to_string(), args.command.join(" ")])
        } else {
            (first.clone(), rest.to_vec())
        };
        audit.record(
            "cmd0",
            Path::new(first)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| first.clone()),
        );

        let target = sel.resolve(ctx, false)?;
        let vault = Vault::new(ctx, target);
        let snap = vault.read_existing()?;
        vault.observe_trust(&snap.doc);

        let entries = snap.doc.effective_entries();
        let plaintext: Vec<&str> = entries
            .iter()
            .filter(|e| !is_wrapped(e))
            .map(|e| e.key())
            .collect();
        if !plaintext.is_empty() && !args.allow_plaintext {
            bail!(VaultError::BadInput(format!(
                "vault file contains plaintext keys: {} (run `si vault encrypt` or pass --allow-plaintext)",
                plaintext.join(", ")
            )));
        }

        let ids = identities_for(ctx, &entries)?;
        audit.identity_fingerprint = ids.fingerprint();
        let mut env = Vec::with_capacity(entries.len());
        for entry in &entries {
            env.push((entry.key().to_string(), open_value(entry, &ids)?));
        }
        let scrub = ctx
            .env
            .exported()
            .into_iter()
            .filter(|k| !env.iter().any(|(key, _)| key == k))
            .collect();

        audit.record("keys_count", env.len());
        audit.record("decrypt_count", entries.len() - plaintext.len());
        debug!(program = %program, keys = env.len(), "exec with vault environment");
        Ok(RunPlan {
            program,
            args: argv,
            env,
            scrub,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use crate::context::Env;
    use crate::sun::memory::MemoryStore;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use si_core::{Paths, Settings, SyncBackend};
    use std::fs;
    use std::rc::Rc;
    use tempfile::{tempdir, TempDir};

    fn ctx(dir: &TempDir) -> Context {
        Context::new(
            Paths::with_home(dir.path()),
            Settings::default(),
            Env::from_pairs(Vec::<(String, String)>::new()),
        )
        .with_cwd(dir.path().to_path_buf())
    }

    fn vault_file(dir: &TempDir) -> PathBuf {
        dir.path().join("v").join(".env")
    }

    fn initialized(dir: &TempDir) -> (Context, Selector) {
        let ctx = ctx(dir);
        let sel = Selector::file(vault_file(dir));
        init(&ctx, &sel).unwrap();
        (ctx, sel)
    }

    fn append(path: &Path, text: &str) {
        let mut current = fs::read_to_string(path).unwrap();
        current.push_str(text);
        fs::write(path, current).unwrap();
    }

    fn set_value(ctx: &Context, sel: &Selector, key: &str, value: &str) {
        let args = SetArgs {
            key: key.to_string(),
            value: ValueSource::Literal(value.to_string()),
            section: None,
            format: false,
            force: false,
        };
        set(ctx, sel, &args).unwrap();
    }

    fn decrypted(ctx: &Context, sel: &Selector) -> Document {
        let done = decrypt(ctx, sel, Some(DecryptMode::Stdout), false).unwrap();
        Document::parse(&done.report.text.unwrap())
    }

    fn value_of(doc: &Document, key: &str) -> String {
        doc.lookup(key).unwrap().assignment.value().unwrap()
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempdir().unwrap();
        let ctx = ctx(&dir);
        let sel = Selector::file(vault_file(&dir));

        let first = init(&ctx, &sel).unwrap().report;
        assert!(first.key_created);
        assert!(first.file_created);
        assert!(first.header_updated);

        let before = fs::read(vault_file(&dir)).unwrap();
        let second = init(&ctx, &sel).unwrap().report;
        assert!(!second.key_created);
        assert!(!second.file_created);
        assert!(!second.header_updated);
        assert_eq!(second.recipient, first.recipient);
        assert_eq!(fs::read(vault_file(&dir)).unwrap(), before);

        let text = String::from_utf8(before).unwrap();
        assert_eq!(
            text,
            format!("# si-vault:v2\n# si-vault:recipient {}\n\n", first.recipient)
        );

        let st = status(&ctx, &sel).unwrap().report;
        assert_eq!(st.trust, "ok");
        assert!(st.identity_in_header);
        assert_eq!(st.trust_fingerprint.as_deref(), Some(first.trust_fingerprint.as_str()));
    }

    #[test]
    fn test_tricky_values_survive_encrypt_and_decrypt() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);

        append(
            &vault_file(&dir),
            "PLAIN_SIMPLE=abc\nPLAIN_HASH=\"a # b\"\nPLAIN_LEAD='#starts-with-hash'\nPLAIN_EQ=a=b\nPLAIN_EMPTY=\n",
        );
        set_value(&ctx, &sel, "PLAIN_WS", "  padded\t");

        let report = encrypt(&ctx, &sel, false, false).unwrap().report;
        assert_eq!(report.encrypted, 5);
        assert_eq!(report.skipped, 1);
        assert!(status(&ctx, &sel).unwrap().report.plaintext_keys.is_empty());

        let doc = decrypted(&ctx, &sel);
        assert_eq!(value_of(&doc, "PLAIN_SIMPLE"), "abc");
        assert_eq!(value_of(&doc, "PLAIN_HASH"), "a # b");
        assert_eq!(value_of(&doc, "PLAIN_LEAD"), "#starts-with-hash");
        assert_eq!(value_of(&doc, "PLAIN_WS"), "  padded\t");
        assert_eq!(value_of(&doc, "PLAIN_EQ"), "a=b");
        assert_eq!(value_of(&doc, "PLAIN_EMPTY"), "");
    }

    #[test]
    fn test_set_and_reveal_on_fresh_vault() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);

        let values = ["a\\b'c", "x # y", "\"quoted\"", "$HOME", "multi\nline", ""];
        for (i, value) in values.iter().enumerate() {
            set_value(&ctx, &sel, &format!("K{}", i), value);
        }
        for (i, value) in values.iter().enumerate() {
            let got = get(&ctx, &sel, &format!("K{}", i), true).unwrap().report;
            assert!(got.encrypted);
            assert_eq!(got.value.as_deref(), Some(*value));
        }
    }

    #[test]
    fn test_encrypt_is_idempotent() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);
        append(&vault_file(&dir), "A=1\nB=2 # note\n");

        assert!(encrypt(&ctx, &sel, false, false).unwrap().report.written);
        let once = fs::read(vault_file(&dir)).unwrap();
        let again = encrypt(&ctx, &sel, false, false).unwrap().report;
        assert!(!again.written);
        assert_eq!(again.skipped, 2);
        assert_eq!(fs::read(vault_file(&dir)).unwrap(), once);
        assert!(String::from_utf8(once).unwrap().contains(" # note"));
    }

    #[test]
    fn test_reencrypt_changes_bytes_not_values() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);
        set_value(&ctx, &sel, "TOKEN", "s3cret");

        let before = fs::read(vault_file(&dir)).unwrap();
        let report = encrypt(&ctx, &sel, true, false).unwrap().report;
        assert_eq!(report.reencrypted, 1);
        assert_ne!(fs::read(vault_file(&dir)).unwrap(), before);
        assert_eq!(value_of(&decrypted(&ctx, &sel), "TOKEN"), "s3cret");
    }

    #[test]
    fn test_legacy_v1_value_reveals() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);
        let recipient = identity::load(&ctx).unwrap().recipient().unwrap();

        let current = cipher::encrypt("legacy-secret", &[recipient]).unwrap();
        let message = cipher::decode_payload(&current).unwrap();
        let legacy = format!("{}{}", cipher::PREFIX_V1, STANDARD.encode(message));
        append(&vault_file(&dir), &format!("OLD={}\n", legacy));

        let done = get(&ctx, &sel, "OLD", true).unwrap();
        assert_eq!(done.report.value.as_deref(), Some("legacy-secret"));
        assert_eq!(done.report.render(), "legacy-secret\n");

        let hidden = get(&ctx, &sel, "OLD", false).unwrap().report;
        assert_eq!(hidden.render(), "OLD: encrypted (use --reveal)\n");
    }

    #[test]
    fn test_last_assignment_wins() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);
        append(&vault_file(&dir), "A=one\nB=x\nA=two\n");

        let got = get(&ctx, &sel, "A", true).unwrap().report;
        assert_eq!(got.value.as_deref(), Some("two"));
        assert!(!got.encrypted);

        let listed = dump(&ctx, &sel, false).unwrap().report;
        let keys: Vec<&str> = listed.keys.iter().map(|k| k.key.as_str()).collect();
        assert_eq!(keys, vec!["A", "B"]);
    }

    #[test]
    fn test_crlf_file_keeps_line_endings() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);
        let path = vault_file(&dir);
        let crlf = fs::read_to_string(&path).unwrap().replace('\n', "\r\n");
        fs::write(&path, format!("{}A=1\r\nB=2\r\n", crlf)).unwrap();

        encrypt(&ctx, &sel, false, false).unwrap();
        set_value(&ctx, &sel, "C", "3");
        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.replace("\r\n", "").contains('\n'));
        assert_eq!(value_of(&decrypted(&ctx, &sel), "C"), "3");
    }

    #[test]
    fn test_set_requires_init() {
        let dir = tempdir().unwrap();
        let ctx = ctx(&dir);
        let path = vault_file(&dir);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "A=1\n").unwrap();

        let args = SetArgs {
            key: "B".to_string(),
            value: ValueSource::Literal("2".to_string()),
            section: None,
            format: false,
            force: false,
        };
        let err = set(&ctx, &Selector::file(&path), &args).unwrap_err();
        assert!(matches!(
            error::classify(&err),
            Some(VaultError::NotInitialized(_))
        ));

        let bad = SetArgs {
            key: "1BAD".to_string(),
            ..args
        };
        let err = set(&ctx, &Selector::file(&path), &bad).unwrap_err();
        assert_eq!(error::exit_code_of(&err), 2);
    }

    #[test]
    fn test_set_into_section() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);
        let args = SetArgs {
            key: "DB_URL".to_string(),
            value: ValueSource::Literal("postgres://x".to_string()),
            section: Some("Database".to_string()),
            format: false,
            force: false,
        };
        set(&ctx, &sel, &args).unwrap();

        let text = fs::read_to_string(vault_file(&dir)).unwrap();
        let header_at = text.find("# [database]").unwrap();
        assert!(text[header_at..].contains("DB_URL=encrypted:si:"));
    }

    #[test]
    fn test_prompted_value_needs_terminal() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);
        let args = SetArgs {
            key: "A".to_string(),
            value: ValueSource::Prompt,
            section: None,
            format: false,
            force: false,
        };
        let err = set(&ctx, &sel, &args).unwrap_err();
        assert!(matches!(error::classify(&err), Some(VaultError::BadInput(_))));
    }

    #[test]
    fn test_trust_mismatch_blocks_writes() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);
        let path = vault_file(&dir);
        let intruder = age::x25519::Identity::generate().to_public().to_string();
        let text = fs::read_to_string(&path).unwrap().replacen(
            "# si-vault:v2\n",
            &format!("# si-vault:v2\n# si-vault:recipient {}\n", intruder),
            1,
        );
        fs::write(&path, text).unwrap();

        let args = SetArgs {
            key: "A".to_string(),
            value: ValueSource::Literal("1".to_string()),
            section: None,
            format: false,
            force: false,
        };
        let err = set(&ctx, &sel, &args).unwrap_err();
        assert!(matches!(
            error::classify(&err),
            Some(VaultError::TrustMismatch { .. })
        ));
        assert_eq!(status(&ctx, &sel).unwrap().report.trust, "mismatch");

        let failures = AuditLog::with_path(ctx.audit_log_path())
            .query(AuditQuery::default().failures())
            .unwrap();
        assert_eq!(failures[0].result, "trust_mismatch");

        let forced = SetArgs { force: true, ..args };
        set(&ctx, &sel, &forced).unwrap();
    }

    #[test]
    fn test_unset_and_missing_key() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);
        append(&vault_file(&dir), "# keep me\nA=1\nB=2\n");

        assert_eq!(unset(&ctx, &sel, "A", false).unwrap().report.removed, 1);
        let text = fs::read_to_string(vault_file(&dir)).unwrap();
        assert!(text.ends_with("# keep me\nB=2\n"));

        let err = get(&ctx, &sel, "A", false).unwrap_err();
        assert!(matches!(error::classify(&err), Some(VaultError::NotFound(_))));
        assert!(unset(&ctx, &sel, "A", false).is_err());
    }

    #[test]
    fn test_dump_reveal_counts_decrypts() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);
        set_value(&ctx, &sel, "A", "has space");
        append(&vault_file(&dir), "B=plain\n");

        let report = dump(&ctx, &sel, true).unwrap().report;
        assert_eq!(report.decrypted_count, 1);
        assert_eq!(report.render(), "A=has space\nB=plain\n");

        let entries = AuditLog::with_path(ctx.audit_log_path())
            .query(AuditQuery::default().op("dump"))
            .unwrap();
        assert_eq!(entries[0].fields["decrypted_count"], 1);
        let raw = fs::read_to_string(ctx.audit_log_path()).unwrap();
        assert!(!raw.contains("has space"));
    }

    #[test]
    fn test_decrypt_needs_destination() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);
        let err = decrypt(&ctx, &sel, None, false).unwrap_err();
        assert_eq!(error::exit_code_of(&err), 2);
    }

    #[test]
    fn test_decrypt_in_place_keeps_header() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);
        set_value(&ctx, &sel, "A", "x # y");

        let report = decrypt(&ctx, &sel, Some(DecryptMode::InPlace), false)
            .unwrap()
            .report;
        assert_eq!(report.decrypted, 1);
        let text = fs::read_to_string(vault_file(&dir)).unwrap();
        assert!(text.contains("# si-vault:recipient "));
        assert!(text.ends_with("A=\"x # y\"\n"));
    }

    #[test]
    fn test_fmt_check_then_write() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);
        append(&vault_file(&dir), "\n\n\nA = 1\n");

        let checked = fmt(&ctx, &sel, FmtArgs { check: true, ..Default::default() }).unwrap();
        assert_eq!(checked.exit_code, 1);

        let written = fmt(&ctx, &sel, FmtArgs::default()).unwrap();
        assert_eq!(written.exit_code, 0);
        assert!(written.report.files[0].changed);

        let clean = fmt(&ctx, &sel, FmtArgs { check: true, ..Default::default() }).unwrap();
        assert_eq!(clean.exit_code, 0);
    }

    #[test]
    fn test_fmt_all_covers_siblings() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);
        let sibling = dir.path().join("v").join(".env.dev");
        fs::write(&sibling, "B  =  2\n").unwrap();

        let done = fmt(&ctx, &sel, FmtArgs { all: true, ..Default::default() }).unwrap();
        let paths: Vec<&str> = done.report.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| !p.ends_with(".lock")));
        assert_eq!(fs::read_to_string(&sibling).unwrap(), "B=2\n");
    }

    #[test]
    fn test_check_reports_plaintext() {
        let dir = tempdir().unwrap();
        let ctx = ctx(&dir);
        fs::write(dir.path().join(".env"), "A=1\nB=es2:abc\n").unwrap();
        fs::write(dir.path().join(".env.example"), "A=changeme\n").unwrap();
        fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules").join(".env"), "X=1\n").unwrap();

        let args = CheckArgs {
            all: true,
            ..Default::default()
        };
        let done = check(&ctx, &Selector::default(), &args).unwrap();
        assert_eq!(done.exit_code, 2);
        assert_eq!(done.report.scanned, 1);
        assert_eq!(done.report.findings[0].plaintext_keys, vec!["A"]);
        assert!(done.report.render().starts_with("[si vault] plaintext values detected:\n"));

        let files = CheckArgs {
            files: vec![".env.example".to_string()],
            ..Default::default()
        };
        assert_eq!(check(&ctx, &Selector::default(), &files).unwrap().exit_code, 2);
    }

    #[test]
    fn test_dotenv_names() {
        assert!(is_dotenv_name(".env", false));
        assert!(is_dotenv_name(".env.prod", false));
        assert!(is_dotenv_name("default.env", false));
        assert!(!is_dotenv_name(".env.lock", true));
        assert!(!is_dotenv_name(".env.example", false));
        assert!(is_dotenv_name(".env.example", true));
        assert!(!is_dotenv_name("env.txt", true));
    }

    #[test]
    fn test_run_plan() {
        let dir = tempdir().unwrap();
        let (ctx, sel) = initialized(&dir);
        set_value(&ctx, &sel, "TOKEN", "tok-value-xyz");
        append(&vault_file(&dir), "PLAIN=1\n");

        let args = RunArgs {
            command: vec!["/usr/bin/env".to_string(), "-0".to_string()],
            ..Default::default()
        };
        let err = run(&ctx, &sel, &args).unwrap_err();
        assert!(err.to_string().contains("--allow-plaintext"));

        let allowed = RunArgs {
            allow_plaintext: true,
            ..args
        };
        let plan = run(&ctx, &sel, &allowed).unwrap();
        assert_eq!(plan.program, "/usr/bin/env");
        assert_eq!(plan.args, vec!["-0"]);
        assert!(plan.env.contains(&("TOKEN".to_string(), "tok-value-xyz".to_string())));
        assert!(plan.env.contains(&("PLAIN".to_string(), "1".to_string())));

        let entries = AuditLog::with_path(ctx.audit_log_path())
            .query(AuditQuery::default().op("run"))
            .unwrap();
        assert_eq!(entries[0].fields["cmd0"], "env");
        assert!(!fs::read_to_string(ctx.audit_log_path()).unwrap().contains("tok-value-xyz"));

        assert!(run(&ctx, &sel, &RunArgs::default()).is_err());
    }

    #[test]
    fn test_run_shell_resolution() {
        let dir = tempdir().unwrap();
        let ctx = Context::new(
            Paths::with_home(dir.path()),
            Settings::default(),
            Env::from_pairs([("SHELL", "/bin/zsh")]),
        );
        let sel = Selector::file(vault_file(&dir));
        init(&ctx, &sel).unwrap();
        set_value(&ctx, &sel, "TOKEN", "tok-value-xyz");

        let args = RunArgs {
            command: vec!["echo".to_string(), "$TOKEN".to_string(), "|".to_string(), "wc".to_string()],
            shell: true,
            ..Default::default()
        };
        let plan = run(&ctx, &sel, &args).unwrap();
        assert_eq!(plan.program, "/bin/zsh");
        assert_eq!(plan.args, vec!["-lc", "echo $TOKEN | wc"]);

        let pinned = RunArgs {
            shell_path: Some(" /bin/dash ".to_string()),
            shell_interactive: true,
            ..args.clone()
        };
        let plan = run(&ctx, &sel, &pinned).unwrap();
        assert_eq!(plan.program, "/bin/dash");
        assert_eq!(plan.args[0], "-ic");

        let bare = tempdir().unwrap();
        let (ctx, sel) = initialized(&bare);
        let plan = run(&ctx, &sel, &args).unwrap();
        assert_eq!(plan.program, "/bin/bash");
    }

    #[test]
    fn test_strict_sun_set_never_writes_files() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.vault.sync_backend = SyncBackend::Sun;
        let store = Rc::new(MemoryStore::default());
        let ctx = Context::new(
            Paths::with_home(dir.path()),
            settings,
            Env::from_pairs(Vec::<(String, String)>::new()),
        )
        .with_sun(store.clone());
        let sel = Selector::default();

        set_value(&ctx, &sel, "API_KEY", "k");
        let object = store.object(crate::sun::KIND_BACKUP, "default").unwrap();
        let doc = Document::from_bytes(&object).unwrap();
        assert_eq!(header::recipients(&doc).len(), 1);
        assert!(sync::plaintext_keys(&doc).is_empty());

        let got = get(&ctx, &sel, "API_KEY", true).unwrap().report;
        assert_eq!(got.value.as_deref(), Some("k"));
        assert!(!ctx.paths.vault_dir().join("default.env").exists());
        assert!(!ctx.key_file().exists());
    }
}
