//! Standard paths used by si tools

use std::path::PathBuf;

/// Directory name of the settings root under the home directory
const ROOT_DIR: &str = ".si";

/// Standard si paths
#[derive(Debug, Clone)]
pub struct Paths {
    /// Home directory that owns the settings tree
    pub home: PathBuf,
    /// Settings root (~/.si)
    pub root: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    /// Resolve paths from `SI_SETTINGS_HOME`, falling back to `$HOME`
    pub fn new() -> Self {
        let home = std::env::var("SI_SETTINGS_HOME")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("~"));

        Self::with_home(home)
    }

    /// Build paths rooted at an explicit home directory
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let root = home.join(ROOT_DIR);
        Self { home, root }
    }

    /// Directory owned by a settings module (~/.si/<module>)
    pub fn module_dir(&self, module: &str) -> PathBuf {
        self.root.join(module)
    }

    /// Settings file of a module (~/.si/<module>/settings.toml)
    pub fn module_settings(&self, module: &str) -> PathBuf {
        self.module_dir(module).join("settings.toml")
    }

    /// Vault state directory (~/.si/vault)
    pub fn vault_dir(&self) -> PathBuf {
        self.module_dir("vault")
    }

    /// Default identity file (~/.si/vault/keys/age.key)
    pub fn default_key_file(&self) -> PathBuf {
        self.vault_dir().join("keys").join("age.key")
    }

    /// Default trust store (~/.si/vault/trust.json)
    pub fn default_trust_store(&self) -> PathBuf {
        self.vault_dir().join("trust.json")
    }

    /// Default audit log (~/.si/vault/audit.log)
    pub fn default_audit_log(&self) -> PathBuf {
        self.vault_dir().join("audit.log")
    }

    /// Expand a leading `~` against the configured home
    pub fn expand_home(&self, raw: &str) -> PathBuf {
        let raw = raw.trim();
        if raw == "~" {
            return self.home.clone();
        }
        match raw.strip_prefix("~/") {
            Some(rest) => self.home.join(rest),
            None => PathBuf::from(raw),
        }
    }
}
