//! Vault identity store
//!
//! An identity is an age X25519 keypair. The key file (or sun object) holds
//! a small keyring: the current secret first, followed by retired secrets
//! kept around so values encrypted before a rotation stay readable.
//!
//! Candidates for decryption are gathered in precedence order:
//! `SI_VAULT_IDENTITY`, `SI_VAULT_PRIVATE_KEY`, `SI_VAULT_IDENTITY_FILE`,
//! then the configured key backend.

use crate::cipher;
use crate::context::Context;
use crate::error::VaultError;
use crate::safe_file::{self, FileLock};
use crate::sun::{IDENTITY_OBJECT, KIND_IDENTITY};
use age::secrecy::ExposeSecret;
use age::x25519;
use anyhow::{anyhow, bail, Context as _, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use si_core::{KeyBackend, SyncBackend};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const ENV_IDENTITY: &str = "SI_VAULT_IDENTITY";
pub const ENV_PRIVATE_KEY: &str = "SI_VAULT_PRIVATE_KEY";
pub const ENV_IDENTITY_FILE: &str = "SI_VAULT_IDENTITY_FILE";
const ENV_ALLOW_INSECURE_KEY_FILE: &str = "SI_VAULT_ALLOW_INSECURE_KEY_FILE";

/// Current identity plus retired ones
pub struct Keyring {
    current: x25519::Identity,
    retired: Vec<x25519::Identity>,
}

impl Keyring {
    pub fn generate() -> Self {
        Self {
            current: x25519::Identity::generate(),
            retired: Vec::new(),
        }
    }

    /// Parse every `AGE-SECRET-KEY-` line; the first one is current
    pub fn parse(text: &str) -> Result<Self> {
        let mut keys = Vec::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let identity = line
                .parse::<x25519::Identity>()
                .map_err(|e| anyhow!("invalid age identity: {}", e))?;
            keys.push(identity);
        }

        let mut keys = keys.into_iter();
        let current = keys
            .next()
            .ok_or_else(|| anyhow!("no age identity found"))?;
        Ok(Self {
            current,
            retired: keys.collect(),
        })
    }

    /// Key file text in `age-keygen` layout
    pub fn render(&self) -> String {
        let mut out = format!(
            "# created: {}\n# public key: {}\n{}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            self.recipient(),
            self.current.to_string().expose_secret()
        );
        for old in &self.retired {
            out.push_str(&format!(
                "# retired: {}\n{}\n",
                old.to_public(),
                old.to_string().expose_secret()
            ));
        }
        out
    }

    pub fn recipient(&self) -> String {
        self.current.to_public().to_string()
    }

    pub fn retired_recipients(&self) -> Vec<String> {
        self.retired
            .iter()
            .map(|k| k.to_public().to_string())
            .collect()
    }

    /// Make a fresh identity current, retiring the old ones
    pub fn rotate(self) -> Self {
        let mut retired = Vec::with_capacity(self.retired.len() + 1);
        retired.push(self.current);
        retired.extend(self.retired);
        Self {
            current: x25519::Identity::generate(),
            retired,
        }
    }

    fn into_identities(self) -> impl Iterator<Item = (x25519::Identity, bool)> {
        std::iter::once((self.current, false)).chain(self.retired.into_iter().map(|k| (k, true)))
    }
}

/// Where an identity came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    Env(&'static str),
    File(PathBuf),
    Sun,
}

impl fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentitySource::Env(var) => write!(f, "env:{}", var),
            IdentitySource::File(path) => write!(f, "file:{}", path.display()),
            IdentitySource::Sun => write!(f, "sun"),
        }
    }
}

/// Bookkeeping for one loaded identity
#[derive(Debug, Clone)]
pub struct Origin {
    pub source: IdentitySource,
    pub recipient: String,
    pub retired: bool,
}

/// Every identity available for decryption, in precedence order
#[derive(Default)]
pub struct LoadedIdentities {
    identities: Vec<x25519::Identity>,
    origins: Vec<Origin>,
}

impl LoadedIdentities {
    fn push(&mut self, identity: x25519::Identity, source: IdentitySource, retired: bool) {
        let recipient = identity.to_public().to_string();
        if self.origins.iter().any(|o| o.recipient == recipient) {
            return;
        }
        self.origins.push(Origin {
            source,
            recipient,
            retired,
        });
        self.identities.push(identity);
    }

    fn push_keyring(&mut self, keyring: Keyring, source: IdentitySource) {
        for (identity, retired) in keyring.into_identities() {
            self.push(identity, source.clone(), retired);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn identities(&self) -> &[x25519::Identity] {
        &self.identities
    }

    pub fn origins(&self) -> &[Origin] {
        &self.origins
    }

    /// Highest-precedence non-retired identity
    pub fn current(&self) -> Option<&Origin> {
        self.origins.iter().find(|o| !o.retired)
    }

    pub fn recipient(&self) -> Option<String> {
        self.current().map(|o| o.recipient.clone())
    }

    /// Recipient of the current identity, or why there is none
    pub fn require_recipient(&self) -> Result<String> {
        self.recipient().ok_or_else(|| {
            anyhow!(VaultError::IdentityUnavailable(
                "no identity found in SI_VAULT_IDENTITY, SI_VAULT_PRIVATE_KEY, SI_VAULT_IDENTITY_FILE or the key backend".to_string()
            ))
        })
    }

    /// Audit fingerprint of the current identity
    pub fn fingerprint(&self) -> Option<String> {
        self.current()
            .map(|o| cipher::identity_fingerprint(&o.recipient))
    }

    pub fn retired_recipients(&self) -> Vec<String> {
        self.origins
            .iter()
            .filter(|o| o.retired)
            .map(|o| o.recipient.clone())
            .collect()
    }
}

/// Gather all identities available to this process
pub fn load(ctx: &Context) -> Result<LoadedIdentities> {
    let mut loaded = LoadedIdentities::default();

    for var in [ENV_IDENTITY, ENV_PRIVATE_KEY] {
        if let Some(text) = ctx.env.get(var) {
            let keyring = Keyring::parse(&text).map_err(|e| {
                anyhow!(VaultError::IdentityUnavailable(format!("{}: {}", var, e)))
            })?;
            loaded.push_keyring(keyring, IdentitySource::Env(var));
        }
    }

    if let Some(raw) = ctx.env.get(ENV_IDENTITY_FILE) {
        if ctx.strict_sun() {
            debug!("strict sun mode ignores {}", ENV_IDENTITY_FILE);
        } else {
            let path = ctx.paths.expand_home(&raw);
            match read_key_file(&path, allow_insecure(ctx))? {
                Some(keyring) => loaded.push_keyring(keyring, IdentitySource::File(path)),
                None => bail!(VaultError::IdentityUnavailable(format!(
                    "{} points to a missing file: {}",
                    ENV_IDENTITY_FILE,
                    path.display()
                ))),
            }
        }
    }

    match load_backend(ctx) {
        Ok(Some((keyring, source))) => loaded.push_keyring(keyring, source),
        Ok(None) => {}
        Err(e) if !loaded.is_empty() => {
            warn!(error = %e, "key backend unavailable, using identities from the environment");
        }
        Err(e) if ctx.settings.effective_key_backend() == KeyBackend::Sun && !ctx.strict_sun() => {
            warn!(error = %e, "sun identity unavailable");
        }
        Err(e) => return Err(e),
    }

    debug!(count = loaded.identities.len(), "identities loaded");
    Ok(loaded)
}

/// Load identities, creating and persisting one when none exists
///
/// Returns the identities and whether a new key was created.
pub fn ensure(ctx: &Context) -> Result<(LoadedIdentities, bool)> {
    let loaded = load(ctx)?;
    if loaded.current().is_some() {
        return Ok((loaded, false));
    }

    let outcome = keygen(ctx, false)?;
    let loaded = load(ctx)?;
    if loaded.current().is_none() {
        bail!(VaultError::IdentityUnavailable(format!(
            "created identity {} could not be loaded back from {}",
            outcome.recipient, outcome.source
        )));
    }
    Ok((loaded, outcome.created))
}

/// Result of `keygen`
#[derive(Debug, Serialize)]
pub struct KeygenOutcome {
    pub created: bool,
    pub rotated: bool,
    pub previous: Option<String>,
    pub recipient: String,
    pub source: String,
    pub retired: Vec<String>,
}

/// Create the backend identity if missing, or rotate it when asked
pub fn keygen(ctx: &Context, rotate: bool) -> Result<KeygenOutcome> {
    let backend = ctx.settings.effective_key_backend();
    let _lock = match backend {
        KeyBackend::File => {
            let key_file = ctx.key_file();
            ensure_key_dir(&key_file)?;
            Some(FileLock::acquire(&key_file)?)
        }
        KeyBackend::Sun => None,
    };

    let existing = load_backend(ctx)?.map(|(keyring, _)| keyring);
    let (keyring, created, previous) = match existing {
        Some(keyring) if !rotate => {
            let recipient = keyring.recipient();
            debug!(recipient = %recipient, "identity already exists");
            return Ok(KeygenOutcome {
                created: false,
                rotated: false,
                previous: None,
                retired: keyring.retired_recipients(),
                recipient,
                source: backend_source(ctx).to_string(),
            });
        }
        Some(keyring) => {
            let previous = keyring.recipient();
            (keyring.rotate(), false, Some(previous))
        }
        None => (Keyring::generate(), true, None),
    };

    let source = persist(ctx, &keyring)?;
    let recipient = keyring.recipient();
    if previous.is_some() {
        warn!(
            recipient = %recipient,
            "identity rotated; values encrypted to the previous recipient need 'si vault encrypt --reencrypt'"
        );
    } else {
        info!(recipient = %recipient, source = %source, "identity created");
    }

    Ok(KeygenOutcome {
        created,
        rotated: previous.is_some(),
        previous,
        retired: keyring.retired_recipients(),
        recipient,
        source: source.to_string(),
    })
}

/// Store a keyring in the configured key backend
pub fn persist(ctx: &Context, keyring: &Keyring) -> Result<IdentitySource> {
    let text = keyring.render();
    match ctx.settings.effective_key_backend() {
        KeyBackend::File => {
            let path = ctx.key_file();
            ensure_key_dir(&path)?;
            safe_file::atomic_write(&path, text.as_bytes(), 0o600)
                .with_context(|| format!("write identity {}", path.display()))?;

            if ctx.settings.vault.sync_backend == SyncBackend::Sun {
                if let Err(e) = put_sun_identity(ctx, keyring, &text) {
                    warn!(error = %e, "could not mirror identity to sun");
                }
            }
            Ok(IdentitySource::File(path))
        }
        KeyBackend::Sun => {
            put_sun_identity(ctx, keyring, &text)?;
            if ctx.strict_sun() {
                ctx.env.set(ENV_IDENTITY, text.trim());
            }
            Ok(IdentitySource::Sun)
        }
    }
}

/// Strict sun bootstrap: fetch the remote identity or create it
pub fn ensure_strict_identity(ctx: &Context) -> Result<String> {
    let keyring = match get_sun_identity(ctx)? {
        Some(keyring) => keyring,
        None => {
            let keyring = Keyring::generate();
            put_sun_identity(ctx, &keyring, &keyring.render())?;
            info!(recipient = %keyring.recipient(), "bootstrapped sun identity");
            keyring
        }
    };
    ctx.env.set(ENV_IDENTITY, keyring.render().trim());
    Ok(keyring.recipient())
}

/// Result of `hydrate`
#[derive(Debug, Serialize)]
pub struct HydrateOutcome {
    pub source: String,
    pub recipient: Option<String>,
    pub exported: bool,
}

/// Populate `SI_VAULT_IDENTITY` from sun; never touches vault files
pub fn hydrate(ctx: &Context) -> Result<HydrateOutcome> {
    if ctx.settings.effective_key_backend() != KeyBackend::Sun {
        let loaded = load(ctx)?;
        return Ok(HydrateOutcome {
            source: backend_source(ctx).to_string(),
            recipient: loaded.recipient(),
            exported: false,
        });
    }

    let recipient = if ctx.strict_sun() {
        Some(ensure_strict_identity(ctx)?)
    } else {
        match get_sun_identity(ctx)? {
            Some(keyring) => {
                ctx.env.set(ENV_IDENTITY, keyring.render().trim());
                Some(keyring.recipient())
            }
            None => None,
        }
    };

    Ok(HydrateOutcome {
        source: IdentitySource::Sun.to_string(),
        exported: recipient.is_some(),
        recipient,
    })
}

fn backend_source(ctx: &Context) -> IdentitySource {
    match ctx.settings.effective_key_backend() {
        KeyBackend::File => IdentitySource::File(ctx.key_file()),
        KeyBackend::Sun => IdentitySource::Sun,
    }
}

fn load_backend(ctx: &Context) -> Result<Option<(Keyring, IdentitySource)>> {
    match ctx.settings.effective_key_backend() {
        KeyBackend::File => {
            let path = ctx.key_file();
            Ok(read_key_file(&path, allow_insecure(ctx))?
                .map(|keyring| (keyring, IdentitySource::File(path))))
        }
        KeyBackend::Sun => {
            let keyring = get_sun_identity(ctx)?;
            if let Some(keyring) = &keyring {
                ctx.env.set(ENV_IDENTITY, keyring.render().trim());
            }
            Ok(keyring.map(|k| (k, IdentitySource::Sun)))
        }
    }
}

fn get_sun_identity(ctx: &Context) -> Result<Option<Keyring>> {
    let payload = ctx
        .sun()?
        .get(KIND_IDENTITY, IDENTITY_OBJECT)
        .context("fetch sun identity")?;
    match payload {
        None => Ok(None),
        Some(bytes) => {
            let text = String::from_utf8(bytes).context("sun identity is not UTF-8")?;
            let keyring = Keyring::parse(&text).map_err(|e| {
                anyhow!(VaultError::IdentityUnavailable(format!("sun identity: {}", e)))
            })?;
            Ok(Some(keyring))
        }
    }
}

fn put_sun_identity(ctx: &Context, keyring: &Keyring, text: &str) -> Result<()> {
    ctx.sun()?
        .put(
            KIND_IDENTITY,
            IDENTITY_OBJECT,
            text.as_bytes(),
            "text/plain",
            serde_json::json!({
                "source": "si vault",
                "recipient": keyring.recipient(),
            }),
        )
        .context("upload sun identity")
}

fn allow_insecure(ctx: &Context) -> bool {
    ctx.env.flag(ENV_ALLOW_INSECURE_KEY_FILE)
}

fn ensure_key_dir(key_file: &Path) -> Result<()> {
    match key_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => safe_file::ensure_private_dir(dir),
        _ => Ok(()),
    }
}

/// Read a key file, refusing symlinks and group/other-readable files
pub fn read_key_file(path: &Path, allow_insecure: bool) -> Result<Option<Keyring>> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("stat key file {}", path.display())),
    };

    if !allow_insecure {
        if meta.file_type().is_symlink() {
            bail!(VaultError::IdentityUnavailable(format!(
                "refusing symlinked key file {} (set {}=1 to allow)",
                path.display(),
                ENV_ALLOW_INSECURE_KEY_FILE
            )));
        }
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            bail!(VaultError::IdentityUnavailable(format!(
                "key file {} is accessible by group or others (mode {:o}); run chmod 600 or set {}=1",
                path.display(),
                mode,
                ENV_ALLOW_INSECURE_KEY_FILE
            )));
        }
    }

    let text = fs::read_to_string(path)
        .with_context(|| format!("read key file {}", path.display()))?;
    let keyring = Keyring::parse(&text).map_err(|e| {
        anyhow!(VaultError::IdentityUnavailable(format!(
            "{}: {}",
            path.display(),
            e
        )))
    })?;
    Ok(Some(keyring))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Env;
    use crate::sun::memory::MemoryStore;
    use si_core::{Paths, Settings};
    use std::rc::Rc;
    use tempfile::{tempdir, TempDir};

    fn ctx_with(dir: &TempDir, settings: Settings, env: &[(&str, &str)]) -> Context {
        Context::new(
            Paths::with_home(dir.path()),
            settings,
            Env::from_pairs(env.iter().map(|(k, v)| (k.to_string(), v.to_string()))),
        )
    }

    fn secret(identity: &x25519::Identity) -> String {
        identity.to_string().expose_secret().to_string()
    }

    fn strict_sun() -> Settings {
        let mut settings = Settings::default();
        settings.vault.sync_backend = SyncBackend::Sun;
        settings
    }

    #[test]
    fn test_keyring_render_parse() {
        let ring = Keyring::generate().rotate();
        let text = ring.render();
        assert!(text.contains("# public key: age1"));
        assert!(text.contains("# retired: age1"));

        let parsed = Keyring::parse(&text).unwrap();
        assert_eq!(parsed.recipient(), ring.recipient());
        assert_eq!(parsed.retired_recipients(), ring.retired_recipients());
        assert!(Keyring::parse("# nothing here\n").is_err());
        assert!(Keyring::parse("AGE-SECRET-KEY-garbage").is_err());
    }

    #[test]
    fn test_keygen_creates_private_file_once() {
        let dir = tempdir().unwrap();
        let ctx = ctx_with(&dir, Settings::default(), &[]);

        let first = keygen(&ctx, false).unwrap();
        assert!(first.created);
        let key_file = ctx.key_file();
        assert_eq!(safe_file::existing_mode(&key_file), Some(0o600));
        assert_eq!(
            safe_file::existing_mode(key_file.parent().unwrap()),
            Some(0o700)
        );

        let second = keygen(&ctx, false).unwrap();
        assert!(!second.created);
        assert_eq!(second.recipient, first.recipient);
    }

    #[test]
    fn test_rotate_retains_previous_identity() {
        let dir = tempdir().unwrap();
        let ctx = ctx_with(&dir, Settings::default(), &[]);
        let first = keygen(&ctx, false).unwrap();
        let wrapped = cipher::encrypt("old secret", &[first.recipient.clone()]).unwrap();

        let rotated = keygen(&ctx, true).unwrap();
        assert!(rotated.rotated);
        assert_eq!(rotated.previous.as_deref(), Some(first.recipient.as_str()));
        assert_ne!(rotated.recipient, first.recipient);

        let loaded = load(&ctx).unwrap();
        assert_eq!(loaded.recipient(), Some(rotated.recipient));
        assert_eq!(loaded.retired_recipients(), vec![first.recipient]);
        assert_eq!(
            cipher::decrypt("K", &wrapped, loaded.identities()).unwrap(),
            "old secret"
        );
    }

    #[test]
    fn test_env_precedence_and_dedup() {
        let dir = tempdir().unwrap();
        let a = x25519::Identity::generate();
        let b = x25519::Identity::generate();
        let ctx = ctx_with(
            &dir,
            Settings::default(),
            &[
                (ENV_PRIVATE_KEY, &secret(&b)),
                (ENV_IDENTITY, &secret(&a)),
            ],
        );
        keygen(&ctx, false).unwrap();

        let loaded = load(&ctx).unwrap();
        assert_eq!(loaded.identities().len(), 3);
        assert_eq!(loaded.recipient(), Some(a.to_public().to_string()));
        assert_eq!(loaded.origins()[0].source, IdentitySource::Env(ENV_IDENTITY));
        assert_eq!(loaded.origins()[1].source, IdentitySource::Env(ENV_PRIVATE_KEY));

        let dup = ctx_with(
            &dir,
            Settings::default(),
            &[(ENV_IDENTITY, &secret(&a)), (ENV_PRIVATE_KEY, &secret(&a))],
        );
        assert_eq!(load(&dup).unwrap().identities().len(), 2);
    }

    #[test]
    fn test_invalid_env_identity_is_unavailable() {
        let dir = tempdir().unwrap();
        let ctx = ctx_with(&dir, Settings::default(), &[(ENV_IDENTITY, "not-a-key")]);
        let err = load(&ctx).err().unwrap();
        assert!(matches!(
            crate::error::classify(&err),
            Some(VaultError::IdentityUnavailable(_))
        ));
    }

    #[test]
    fn test_insecure_key_file_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loose.key");
        fs::write(&path, Keyring::generate().render()).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let err = read_key_file(&path, false).err().unwrap();
        assert!(err.to_string().contains("chmod 600"));
        assert!(read_key_file(&path, true).unwrap().is_some());

        let link = dir.path().join("link.key");
        std::os::unix::fs::symlink(&path, &link).unwrap();
        assert!(read_key_file(&link, false).is_err());
        assert!(read_key_file(&dir.path().join("missing.key"), false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_identity_file_env() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ci.key");
        let ring = Keyring::generate();
        safe_file::atomic_write(&path, ring.render().as_bytes(), 0o600).unwrap();

        let ctx = ctx_with(
            &dir,
            Settings::default(),
            &[(ENV_IDENTITY_FILE, path.to_str().unwrap())],
        );
        let loaded = load(&ctx).unwrap();
        assert_eq!(loaded.recipient(), Some(ring.recipient()));
        assert_eq!(loaded.origins()[0].source, IdentitySource::File(path));
    }

    #[test]
    fn test_strict_sun_bootstrap_exports_env() {
        let dir = tempdir().unwrap();
        let store = Rc::new(MemoryStore::default());
        let ctx = ctx_with(&dir, strict_sun(), &[]).with_sun(store.clone());

        let (loaded, created) = ensure(&ctx).unwrap();
        assert!(created);
        let recipient = loaded.recipient().unwrap();
        assert!(store.object(KIND_IDENTITY, IDENTITY_OBJECT).is_some());
        assert!(ctx.env.get(ENV_IDENTITY).is_some());
        assert!(!ctx.key_file().exists());

        let again = ensure_strict_identity(&ctx).unwrap();
        assert_eq!(again, recipient);
    }

    #[test]
    fn test_strict_sun_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let store = Rc::new(MemoryStore::default());
        store.offline.set(true);
        let ctx = ctx_with(&dir, strict_sun(), &[]).with_sun(store);

        let err = load(&ctx).err().unwrap();
        assert!(matches!(
            crate::error::classify(&err),
            Some(VaultError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn test_non_strict_sun_failure_degrades() {
        let dir = tempdir().unwrap();
        let mut settings = strict_sun();
        settings.vault.strict = false;
        settings.vault.key_backend = KeyBackend::Sun;
        let store = Rc::new(MemoryStore::default());
        store.offline.set(true);
        let ctx = ctx_with(&dir, settings, &[]).with_sun(store);

        let loaded = load(&ctx).unwrap();
        assert!(loaded.is_empty());
        assert!(loaded.require_recipient().is_err());
    }

    #[test]
    fn test_hydrate_file_backend_is_noop() {
        let dir = tempdir().unwrap();
        let ctx = ctx_with(&dir, Settings::default(), &[]);
        let outcome = hydrate(&ctx).unwrap();
        assert!(!outcome.exported);
        assert!(outcome.recipient.is_none());
        assert!(!ctx.key_file().exists());
    }
}
