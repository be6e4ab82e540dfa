//! Sync backends
//!
//! `off` keeps everything local, `git` leaves distribution to the operator's
//! commits, and `sun` stores vault bytes as `vault-backup` objects. Every
//! backup is scanned for plaintext values before any backend is contacted.

use crate::cipher;
use crate::context::Context;
use crate::dotenv::Document;
use crate::error::VaultError;
use crate::header;
use crate::safe_file;
use crate::sun::KIND_BACKUP;
use anyhow::{bail, Context as _, Result};
use serde::Serialize;
use si_core::SyncBackend;
use tracing::{debug, info, warn};

/// Effective sync mode for this invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    Off,
    Git,
    Sun,
    SunStrict,
}

impl SyncMode {
    pub fn from_context(ctx: &Context) -> Self {
        match ctx.settings.vault.sync_backend {
            SyncBackend::Off => SyncMode::Off,
            SyncBackend::Git => SyncMode::Git,
            SyncBackend::Sun if ctx.settings.vault.strict => SyncMode::SunStrict,
            SyncBackend::Sun => SyncMode::Sun,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Off => "off",
            SyncMode::Git => "git",
            SyncMode::Sun => "sun",
            SyncMode::SunStrict => "sun-strict",
        }
    }

    pub fn uses_sun(&self) -> bool {
        matches!(self, SyncMode::Sun | SyncMode::SunStrict)
    }
}

/// Keys whose effective value is not wrapped ciphertext
pub fn plaintext_keys(doc: &Document) -> Vec<String> {
    doc.effective_entries()
        .into_iter()
        .filter(|e| !cipher::is_encrypted(e.value_raw().trim()))
        .map(|e| e.key().to_string())
        .collect()
}

/// Refuse documents that still carry plaintext values
pub fn guard_plaintext(doc: &Document) -> Result<()> {
    let keys = plaintext_keys(doc);
    if keys.is_empty() {
        Ok(())
    } else {
        bail!(VaultError::PlaintextLeakGuard { keys })
    }
}

/// Result of a backup push
#[derive(Debug, Clone, Serialize)]
pub struct BackupReceipt {
    pub object: String,
    pub bytes: usize,
    pub sha256: String,
    pub uploaded: bool,
}

/// Back up a document under `object`
///
/// The plaintext guard runs first in every mode; only sun modes upload.
pub fn put_backup(ctx: &Context, object: &str, doc: &Document) -> Result<BackupReceipt> {
    guard_plaintext(doc)?;

    let bytes = doc.to_bytes();
    let mut receipt = BackupReceipt {
        object: object.to_string(),
        bytes: bytes.len(),
        sha256: safe_file::digest(&bytes),
        uploaded: false,
    };

    match SyncMode::from_context(ctx) {
        SyncMode::Off => bail!(VaultError::BadInput(
            "vault sync backend is off; set vault.sync_backend = \"sun\" to back up".to_string()
        )),
        SyncMode::Git => {
            debug!(object, "git backend: nothing to upload");
        }
        SyncMode::Sun | SyncMode::SunStrict => {
            let recipients = header::recipients(doc);
            ctx.sun()?
                .put(
                    KIND_BACKUP,
                    object,
                    &bytes,
                    "text/plain",
                    serde_json::json!({
                        "source": "si vault",
                        "scope": object,
                        "sha256": receipt.sha256,
                        "recipients_fingerprint": cipher::recipients_fingerprint(&recipients),
                    }),
                )
                .with_context(|| format!("upload vault backup {}", object))?;
            receipt.uploaded = true;
            info!(object, bytes = receipt.bytes, "vault backup uploaded");
        }
    }
    Ok(receipt)
}

/// Fetch a backup; `None` when the object does not exist
pub fn get_backup(ctx: &Context, object: &str) -> Result<Option<Document>> {
    match ctx
        .sun()?
        .get(KIND_BACKUP, object)
        .with_context(|| format!("fetch vault backup {}", object))?
    {
        None => Ok(None),
        Some(bytes) => Ok(Some(Document::from_bytes(&bytes)?)),
    }
}

/// Mirror a locally written document to sun in non-strict mode
///
/// Failures degrade to a warning; the local write already succeeded.
pub fn mirror_after_write(ctx: &Context, object: &str, doc: &Document) {
    if SyncMode::from_context(ctx) != SyncMode::Sun {
        return;
    }
    if let Err(e) = put_backup(ctx, object, doc) {
        warn!(object, error = %e, "vault backup to sun skipped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Env;
    use crate::sun::memory::MemoryStore;
    use si_core::{Paths, Settings};
    use std::rc::Rc;
    use tempfile::{tempdir, TempDir};

    fn ctx(dir: &TempDir, backend: SyncBackend, strict: bool, store: Rc<MemoryStore>) -> Context {
        let mut settings = Settings::default();
        settings.vault.sync_backend = backend;
        settings.vault.strict = strict;
        Context::new(
            Paths::with_home(dir.path()),
            settings,
            Env::from_pairs(Vec::<(String, String)>::new()),
        )
        .with_sun(store)
    }

    fn sealed_doc() -> Document {
        let id = age::x25519::Identity::generate();
        let wrapped = cipher::encrypt("v", &[id.to_public().to_string()]).unwrap();
        Document::parse(&format!("# si-vault:v2\nA={}\n", wrapped))
    }

    #[test]
    fn test_plaintext_keys_last_wins() {
        let doc = Document::parse("A=plain\nB=es2:abc\nA=encrypted:si:v2:xyz\nC=\n");
        assert_eq!(plaintext_keys(&doc), vec!["C".to_string()]);
    }

    #[test]
    fn test_plaintext_guard_never_contacts_backend() {
        let dir = tempdir().unwrap();
        let store = Rc::new(MemoryStore::default());
        let ctx = ctx(&dir, SyncBackend::Sun, true, store.clone());

        let doc = Document::parse("# si-vault:v2\nTOKEN=hunter2\n");
        let err = put_backup(&ctx, "default", &doc).unwrap_err();
        match crate::error::classify(&err) {
            Some(VaultError::PlaintextLeakGuard { keys }) => assert_eq!(keys, &["TOKEN"]),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(store.calls(), 0);
    }

    #[test]
    fn test_backup_roundtrip() {
        let dir = tempdir().unwrap();
        let store = Rc::new(MemoryStore::default());
        let ctx = ctx(&dir, SyncBackend::Sun, false, store.clone());

        let doc = sealed_doc();
        let receipt = put_backup(&ctx, "prod", &doc).unwrap();
        assert!(receipt.uploaded);
        assert_eq!(store.puts.get(), 1);

        let fetched = get_backup(&ctx, "prod").unwrap().unwrap();
        assert_eq!(fetched.emit(), doc.emit());
        assert!(get_backup(&ctx, "missing").unwrap().is_none());
    }

    #[test]
    fn test_git_mode_guards_but_does_not_upload() {
        let dir = tempdir().unwrap();
        let store = Rc::new(MemoryStore::default());
        let ctx = ctx(&dir, SyncBackend::Git, true, store.clone());

        assert!(put_backup(&ctx, "default", &Document::parse("A=1\n")).is_err());
        let receipt = put_backup(&ctx, "default", &sealed_doc()).unwrap();
        assert!(!receipt.uploaded);
        assert_eq!(store.calls(), 0);
    }

    #[test]
    fn test_mirror_degrades_when_offline() {
        let dir = tempdir().unwrap();
        let store = Rc::new(MemoryStore::default());
        store.offline.set(true);
        let lenient = ctx(&dir, SyncBackend::Sun, false, store.clone());

        mirror_after_write(&lenient, "default", &sealed_doc());
        assert_eq!(store.puts.get(), 1);

        let strict = ctx(&dir, SyncBackend::Sun, true, store.clone());
        mirror_after_write(&strict, "default", &sealed_doc());
        assert_eq!(store.puts.get(), 1);
    }
}
