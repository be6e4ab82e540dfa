//! Module-based settings
//!
//! Each si module owns `~/.si/<module>/settings.toml`. A missing file means
//! defaults; a file that exists but fails to parse is a hard error naming the
//! module and path so the operator can fix it.

use crate::paths::Paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Settings loading errors
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("read settings module {module} ({}): {source}", path.display())]
    Read {
        module: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse settings module {module} ({}): {source}", path.display())]
    Parse {
        module: String,
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {name}")]
    Invalid { name: String, value: String },
}

/// Where vault backups live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncBackend {
    /// Local file only
    #[default]
    Off,
    /// Operator commits the file; no remote calls
    Git,
    /// Remote sun object store
    Sun,
}

impl SyncBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncBackend::Off => "off",
            SyncBackend::Git => "git",
            SyncBackend::Sun => "sun",
        }
    }
}

impl fmt::Display for SyncBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncBackend {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "off" | "none" | "local" => Ok(SyncBackend::Off),
            "git" => Ok(SyncBackend::Git),
            "sun" => Ok(SyncBackend::Sun),
            _ => Err(SettingsError::Invalid {
                name: "vault.sync_backend".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Where the vault identity is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyBackend {
    #[default]
    File,
    Sun,
}

impl KeyBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyBackend::File => "file",
            KeyBackend::Sun => "sun",
        }
    }
}

impl fmt::Display for KeyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyBackend {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "file" => Ok(KeyBackend::File),
            "sun" => Ok(KeyBackend::Sun),
            _ => Err(SettingsError::Invalid {
                name: "vault.key_backend".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// `[vault]` table of `~/.si/vault/settings.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSettings {
    #[serde(default = "default_scope")]
    pub default_scope: String,

    #[serde(default)]
    pub sync_backend: SyncBackend,

    /// Only meaningful with `sync_backend = "sun"`
    #[serde(default = "default_strict")]
    pub strict: bool,

    #[serde(default)]
    pub key_backend: KeyBackend,

    #[serde(default)]
    pub key_file: Option<String>,

    #[serde(default)]
    pub trust_store: Option<String>,

    #[serde(default)]
    pub audit_log: Option<String>,

    /// Scope name to vault file path
    #[serde(default)]
    pub scopes: BTreeMap<String, String>,
}

fn default_scope() -> String {
    "default".to_string()
}

fn default_strict() -> bool {
    true
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            default_scope: default_scope(),
            sync_backend: SyncBackend::default(),
            strict: default_strict(),
            key_backend: KeyBackend::default(),
            key_file: None,
            trust_store: None,
            audit_log: None,
            scopes: BTreeMap::new(),
        }
    }
}

/// `[sun]` table of `~/.si/sun/settings.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SunSettings {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub account: Option<String>,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    15
}

impl Default for SunSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            account: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct VaultModule {
    #[serde(default)]
    vault: VaultSettings,
}

#[derive(Debug, Default, Deserialize)]
struct SunModule {
    #[serde(default)]
    sun: SunSettings,
}

/// Combined settings for the vault and its sun backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub vault: VaultSettings,

    #[serde(default)]
    pub sun: SunSettings,
}

impl Settings {
    /// Load the vault and sun modules
    pub fn load(paths: &Paths) -> Result<Self, SettingsError> {
        let vault: VaultModule = load_module("vault", &paths.module_settings("vault"))?;
        let sun: SunModule = load_module("sun", &paths.module_settings("sun"))?;
        Ok(Self {
            vault: vault.vault,
            sun: sun.sun,
        })
    }

    /// Apply `SI_*` overrides from an environment lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("SI_VAULT_KEY_BACKEND") {
            self.vault.key_backend = v.parse()?;
        }
        if let Some(v) = get("SI_VAULT_SYNC_BACKEND") {
            self.vault.sync_backend = v.parse()?;
        }
        if let Some(v) = get("SI_VAULT_KEY_FILE") {
            self.vault.key_file = Some(v);
        }
        if let Some(v) = get("SI_VAULT_TRUST_STORE") {
            self.vault.trust_store = Some(v);
        }
        if let Some(v) = get("SI_VAULT_AUDIT_LOG") {
            self.vault.audit_log = Some(v);
        }
        if let Some(v) = get("SI_VAULT_SCOPE") {
            self.vault.default_scope = v;
        }
        if let Some(v) = get("SI_SUN_BASE_URL") {
            self.sun.base_url = Some(v);
        }
        if let Some(v) = get("SI_SUN_TOKEN") {
            self.sun.token = Some(v);
        }
        Ok(())
    }

    /// Whether vault bytes and identity live only in sun
    pub fn strict_sun(&self) -> bool {
        self.vault.sync_backend == SyncBackend::Sun && self.vault.strict
    }

    /// Effective key backend; strict sun forces the remote identity
    pub fn effective_key_backend(&self) -> KeyBackend {
        if self.strict_sun() {
            KeyBackend::Sun
        } else {
            self.vault.key_backend
        }
    }

    pub fn key_file(&self, paths: &Paths) -> PathBuf {
        resolve_or(paths, self.vault.key_file.as_deref(), paths.default_key_file())
    }

    pub fn trust_store(&self, paths: &Paths) -> PathBuf {
        resolve_or(
            paths,
            self.vault.trust_store.as_deref(),
            paths.default_trust_store(),
        )
    }

    pub fn audit_log(&self, paths: &Paths) -> PathBuf {
        resolve_or(
            paths,
            self.vault.audit_log.as_deref(),
            paths.default_audit_log(),
        )
    }

    /// Path mapped to a scope name, if configured
    pub fn scope_path(&self, paths: &Paths, scope: &str) -> Option<PathBuf> {
        self.vault
            .scopes
            .get(scope)
            .map(|raw| paths.expand_home(raw))
    }
}

fn resolve_or(paths: &Paths, raw: Option<&str>, fallback: PathBuf) -> PathBuf {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => paths.expand_home(v),
        None => fallback,
    }
}

fn load_module<T>(module: &str, path: &Path) -> Result<T, SettingsError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if !path.exists() {
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        module: module.to_string(),
        path: path.to_path_buf(),
        source,
    })?;

    toml::from_str(&content).map_err(|source| SettingsError::Parse {
        module: module.to_string(),
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn write_module(paths: &Paths, module: &str, body: &str) {
        let path = paths.module_settings(module);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn test_defaults_when_missing() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_home(dir.path());
        let settings = Settings::load(&paths).unwrap();

        assert_eq!(settings.vault.default_scope, "default");
        assert_eq!(settings.vault.sync_backend, SyncBackend::Off);
        assert_eq!(settings.vault.key_backend, KeyBackend::File);
        assert_eq!(settings.sun.timeout_seconds, 15);
        assert!(!settings.strict_sun());
        assert_eq!(settings.key_file(&paths), paths.default_key_file());
    }

    #[test]
    fn test_load_modules() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_home(dir.path());
        write_module(
            &paths,
            "vault",
            r#"
[vault]
default_scope = "paas-prod"
sync_backend = "sun"
strict = false
key_file = "~/keys/age.key"

[vault.scopes]
paas-prod = "/srv/paas/.env.prod"
"#,
        );
        write_module(
            &paths,
            "sun",
            "[sun]\nbase_url = \"https://sun.example\"\ntoken = \"t0k\"\n",
        );

        let settings = Settings::load(&paths).unwrap();
        assert_eq!(settings.vault.sync_backend, SyncBackend::Sun);
        assert!(!settings.strict_sun());
        assert_eq!(settings.effective_key_backend(), KeyBackend::File);
        assert_eq!(settings.key_file(&paths), dir.path().join("keys/age.key"));
        assert_eq!(
            settings.scope_path(&paths, "paas-prod"),
            Some(PathBuf::from("/srv/paas/.env.prod"))
        );
        assert_eq!(settings.sun.base_url.as_deref(), Some("https://sun.example"));
        assert_eq!(settings.sun.timeout_seconds, 15);
    }

    #[test]
    fn test_parse_error_names_module() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_home(dir.path());
        write_module(&paths, "sun", "[sun\nbase_url = ");

        let err = Settings::load(&paths).unwrap_err();
        assert!(matches!(err, SettingsError::Parse { .. }));
        assert!(err.to_string().starts_with("parse settings module sun ("));
    }

    #[test]
    fn test_env_overrides() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_home(dir.path());
        let mut settings = Settings::load(&paths).unwrap();

        let env: HashMap<&str, &str> = [
            ("SI_VAULT_SYNC_BACKEND", "sun"),
            ("SI_VAULT_TRUST_STORE", "/tmp/trust.json"),
            ("SI_SUN_TOKEN", " secret "),
            ("SI_VAULT_SCOPE", ""),
        ]
        .into_iter()
        .collect();
        settings
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert!(settings.strict_sun());
        assert_eq!(settings.effective_key_backend(), KeyBackend::Sun);
        assert_eq!(
            settings.trust_store(&paths),
            PathBuf::from("/tmp/trust.json")
        );
        assert_eq!(settings.sun.token.as_deref(), Some("secret"));
        assert_eq!(settings.vault.default_scope, "default");
    }

    #[test]
    fn test_invalid_backend_override() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(|k| (k == "SI_VAULT_KEY_BACKEND").then(|| "vault".to_string()))
            .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { .. }));
    }
}
