//! Per-invocation context
//!
//! Built once in `main` and passed by reference into every operation:
//! resolved paths, settings (files plus `SI_*` overrides), a snapshot of the
//! environment, terminal detection, the prompter and the sun client.

use crate::error::VaultError;
use crate::sun::{ObjectStore, SunClient};
use anyhow::{anyhow, Context as _, Result};
use si_core::{KeyBackend, Paths, Settings, SyncBackend};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::rc::Rc;
use tracing::debug;

/// Snapshot of `SI_*` environment variables (plus `SHELL`)
///
/// Values set during the run (identity hydration) are visible to later
/// lookups and, for a process environment, exported for child processes.
pub struct Env {
    vars: RefCell<BTreeMap<String, String>>,
    exported: RefCell<Vec<String>>,
    export: bool,
}

impl Env {
    /// Capture the process environment
    pub fn from_process() -> Self {
        Self {
            vars: RefCell::new(
                std::env::vars()
                    .filter(|(k, _)| k.starts_with("SI_") || k == "SHELL")
                    .collect(),
            ),
            exported: RefCell::new(Vec::new()),
            export: true,
        }
    }

    /// An isolated environment that never touches the process
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: RefCell::new(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
            exported: RefCell::new(Vec::new()),
            export: false,
        }
    }

    /// Trimmed, non-empty value
    pub fn get(&self, key: &str) -> Option<String> {
        self.vars
            .borrow()
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Truthy flag (`1`, `true`, `yes`, `on`)
    pub fn flag(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }

    /// Set a variable for the rest of this run
    pub fn set(&self, key: &str, value: &str) {
        self.vars
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        if self.export {
            std::env::set_var(key, value);
        }
        let mut exported = self.exported.borrow_mut();
        if !exported.iter().any(|k| k == key) {
            exported.push(key.to_string());
        }
        debug!(key, "environment variable set");
    }

    /// Variables set during this run
    pub fn exported(&self) -> Vec<String> {
        self.exported.borrow().clone()
    }
}

/// Confirmation and secret input on the controlling terminal
pub trait Prompter {
    fn confirm(&self, question: &str) -> Result<bool>;
    fn secret(&self, prompt: &str) -> Result<String>;
}

/// Prompts on stderr, reads stdin
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn confirm(&self, question: &str) -> Result<bool> {
        eprint!("{} [y/N]: ", question);
        std::io::stderr().flush()?;
        let mut answer = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("Failed to read confirmation")?;
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    }

    fn secret(&self, prompt: &str) -> Result<String> {
        rpassword::prompt_password(prompt).context("Failed to read secret value")
    }
}

/// Everything a vault operation needs from the outside world
pub struct Context {
    pub paths: Paths,
    pub settings: Settings,
    pub env: Env,
    /// stdin and stdout are terminals
    pub interactive: bool,
    pub cwd: PathBuf,
    prompter: Box<dyn Prompter>,
    sun: Option<Rc<dyn ObjectStore>>,
    sun_error: Option<String>,
}

impl Context {
    /// Build from the process: settings files, environment and terminal
    pub fn load() -> Result<Self> {
        let interactive = std::io::stdin().is_terminal() && std::io::stdout().is_terminal();
        let cwd = std::env::current_dir().context("Failed to resolve working directory")?;

        let mut ctx = Self::with_settings_from(Paths::new(), Env::from_process())?
            .with_interactive(interactive)
            .with_cwd(cwd);
        ctx.connect_sun();
        Ok(ctx)
    }

    /// Read the module settings under `paths` and apply `env` overrides
    pub fn with_settings_from(paths: Paths, env: Env) -> Result<Self> {
        let mut settings = Settings::load(&paths).map_err(VaultError::Settings)?;
        settings
            .apply_env(|k| env.get(k))
            .map_err(VaultError::Settings)?;
        Ok(Self::new(paths, settings, env))
    }

    /// Non-interactive context without a sun client
    pub fn new(paths: Paths, settings: Settings, env: Env) -> Self {
        let cwd = paths.home.clone();
        Self {
            paths,
            settings,
            env,
            interactive: false,
            cwd,
            prompter: Box::new(TerminalPrompter),
            sun: None,
            sun_error: None,
        }
    }

    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn with_prompter(mut self, prompter: Box<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn with_sun(mut self, store: Rc<dyn ObjectStore>) -> Self {
        self.sun = Some(store);
        self.sun_error = None;
        self
    }

    /// Create the sun client when settings call for one
    fn connect_sun(&mut self) {
        if !self.uses_sun() {
            return;
        }
        let allow_http = self.env.flag("SI_SUN_ALLOW_INSECURE_HTTP");
        match SunClient::from_settings(&self.settings.sun, allow_http) {
            Ok(client) => self.sun = Some(Rc::new(client)),
            Err(e) => {
                debug!(error = %e, "sun client unavailable");
                self.sun_error = Some(e.to_string());
            }
        }
    }

    /// Sync or key backend is sun
    pub fn uses_sun(&self) -> bool {
        self.settings.vault.sync_backend == SyncBackend::Sun
            || self.settings.effective_key_backend() == KeyBackend::Sun
    }

    pub fn strict_sun(&self) -> bool {
        self.settings.strict_sun()
    }

    /// The sun object store, or why there is none
    pub fn sun(&self) -> Result<&dyn ObjectStore> {
        match &self.sun {
            Some(store) => Ok(store.as_ref()),
            None => Err(anyhow!(VaultError::BackendUnavailable(
                self.sun_error
                    .clone()
                    .unwrap_or_else(|| "sun backend is not configured".to_string())
            ))),
        }
    }

    pub fn prompter(&self) -> &dyn Prompter {
        self.prompter.as_ref()
    }

    /// Ask for confirmation; non-interactive callers are never asked
    pub fn confirm(&self, question: &str) -> Result<bool> {
        if !self.interactive {
            return Ok(false);
        }
        self.prompter.confirm(question)
    }

    pub fn key_file(&self) -> PathBuf {
        self.settings.key_file(&self.paths)
    }

    pub fn trust_store_path(&self) -> PathBuf {
        self.settings.trust_store(&self.paths)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.settings.audit_log(&self.paths)
    }

    pub fn backend_name(&self) -> &'static str {
        self.settings.vault.sync_backend.as_str()
    }

    /// `off`, `git`, `sun` or `sun-strict`
    pub fn mode(&self) -> &'static str {
        match self.settings.vault.sync_backend {
            SyncBackend::Sun if self.settings.vault.strict => "sun-strict",
            other => other.as_str(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_env_snapshot() {
        let env = Env::from_pairs([("SI_A", " value "), ("SI_EMPTY", "  "), ("SI_FLAG", "Yes")]);
        assert_eq!(env.get("SI_A").as_deref(), Some("value"));
        assert_eq!(env.get("SI_EMPTY"), None);
        assert!(env.flag("SI_FLAG"));
        assert!(!env.flag("SI_A"));

        env.set("SI_VAULT_IDENTITY", "AGE-SECRET-KEY-1");
        assert_eq!(env.get("SI_VAULT_IDENTITY").as_deref(), Some("AGE-SECRET-KEY-1"));
        assert_eq!(env.exported(), vec!["SI_VAULT_IDENTITY".to_string()]);
        assert!(std::env::var("SI_VAULT_IDENTITY").is_err());
    }

    #[test]
    fn test_missing_sun_is_backend_unavailable() {
        let dir = tempdir().unwrap();
        let ctx = Context::new(
            Paths::with_home(dir.path()),
            Settings::default(),
            Env::from_pairs(Vec::<(String, String)>::new()),
        );
        let err = ctx.sun().err().unwrap();
        assert!(matches!(
            crate::error::classify(&err),
            Some(VaultError::BackendUnavailable(_))
        ));
        assert_eq!(ctx.mode(), "off");
        assert!(!ctx.confirm("continue?").unwrap());
    }

    #[test]
    fn test_malformed_sun_settings_fail_load() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_home(dir.path());
        let sun = paths.module_settings("sun");
        std::fs::create_dir_all(sun.parent().unwrap()).unwrap();
        std::fs::write(&sun, "[sun\nbase_url = ").unwrap();

        let err = Context::with_settings_from(paths, Env::from_pairs(Vec::<(String, String)>::new()))
            .err()
            .unwrap();
        let message = format!("{:#}", err);
        assert!(message.contains("vault settings load failed"));
        assert!(message.contains("parse settings module sun"));
        assert!(message.contains(&sun.display().to_string()));
        assert_eq!(crate::error::category_of(&err), "settings");
        assert_eq!(crate::error::exit_code_of(&err), 1);
    }

    #[test]
    fn test_settings_env_overrides_apply() {
        let dir = tempdir().unwrap();
        let ctx = Context::with_settings_from(
            Paths::with_home(dir.path()),
            Env::from_pairs([("SI_VAULT_SYNC_BACKEND", "git")]),
        )
        .unwrap();
        assert_eq!(ctx.mode(), "git");

        let err = Context::with_settings_from(
            Paths::with_home(dir.path()),
            Env::from_pairs([("SI_VAULT_SYNC_BACKEND", "ftp")]),
        )
        .err()
        .unwrap();
        assert!(format!("{:#}", err).contains("vault settings load failed"));
        assert_ne!(crate::error::exit_code_of(&err), 0);
    }

    #[test]
    fn test_mode_names() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.vault.sync_backend = SyncBackend::Sun;
        let ctx = Context::new(
            Paths::with_home(dir.path()),
            settings,
            Env::from_pairs(Vec::<(String, String)>::new()),
        );
        assert_eq!(ctx.mode(), "sun-strict");
        assert!(ctx.uses_sun());
        assert!(ctx.strict_sun());
    }
}
