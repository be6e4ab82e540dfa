//! Scope and target resolution
//!
//! Translates `--scope`/`--file` into a concrete storage location. Local
//! targets are dotenv files; in strict sun mode the target is a
//! `vault-backup` object named after the normalized scope.

use crate::context::Context;
use crate::error::VaultError;
use anyhow::{bail, Result};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const DEFAULT_SCOPE: &str = "default";
const MAX_SCOPE_LEN: usize = 119;

/// Where vault bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetBackend {
    Local,
    Sun,
}

impl TargetBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetBackend::Local => "local",
            TargetBackend::Sun => "sun",
        }
    }
}

/// A resolved vault location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scope: String,
    pub backend: TargetBackend,
    /// Dotenv path for local targets; object name for sun targets
    pub path: PathBuf,
}

impl Target {
    pub fn local(scope: &str, path: PathBuf) -> Self {
        Self {
            scope: scope.to_string(),
            backend: TargetBackend::Local,
            path,
        }
    }

    pub fn sun(scope: &str) -> Self {
        let scope = normalize_scope(scope);
        Self {
            path: PathBuf::from(&scope),
            scope,
            backend: TargetBackend::Sun,
        }
    }

    pub fn is_local(&self) -> bool {
        self.backend == TargetBackend::Local
    }

    /// Object name used for backups of this target
    pub fn object_name(&self) -> String {
        normalize_scope(&self.scope)
    }

    /// Path or object shown to operators
    pub fn display(&self) -> String {
        match self.backend {
            TargetBackend::Local => self.path.display().to_string(),
            TargetBackend::Sun => format!("sun:{}", self.object_name()),
        }
    }

    /// Trust store key: canonical path, or `sun:<scope>`
    pub fn trust_key(&self) -> String {
        match self.backend {
            TargetBackend::Local => std::fs::canonicalize(&self.path)
                .unwrap_or_else(|_| self.path.clone())
                .display()
                .to_string(),
            TargetBackend::Sun => format!("sun:{}", self.object_name()),
        }
    }
}

/// Resolve `--scope`/`--file` into a target
///
/// `allow_missing` permits local files that do not exist yet.
pub fn resolve(
    ctx: &Context,
    scope: Option<&str>,
    file: Option<&str>,
    allow_missing: bool,
) -> Result<Target> {
    let scope = scope.map(str::trim).filter(|s| !s.is_empty());
    let file = file.map(str::trim).filter(|f| !f.is_empty());

    if scope.is_some() && file.is_some() {
        bail!(VaultError::BadInput(
            "--scope and --file are mutually exclusive".to_string()
        ));
    }

    if ctx.strict_sun() {
        let name = file.or(scope).unwrap_or(&ctx.settings.vault.default_scope);
        return Ok(Target::sun(name));
    }

    let target = match file {
        Some(raw) => {
            let path = absolutize(&ctx.cwd, &ctx.paths.expand_home(raw));
            let scope = scope_from_path(&path);
            Target::local(&scope, path)
        }
        None => {
            let name = scope.unwrap_or(&ctx.settings.vault.default_scope);
            Target::local(name, scope_path(ctx, name)?)
        }
    };

    if !allow_missing && !target.path.exists() {
        bail!(VaultError::NotInitialized(format!(
            "{} does not exist",
            target.path.display()
        )));
    }
    Ok(target)
}

fn scope_path(ctx: &Context, name: &str) -> Result<PathBuf> {
    let normalized = normalize_scope(name);
    if let Some(path) = ctx
        .settings
        .scope_path(&ctx.paths, name)
        .or_else(|| ctx.settings.scope_path(&ctx.paths, &normalized))
    {
        return Ok(absolutize(&ctx.cwd, &path));
    }
    if normalized == DEFAULT_SCOPE {
        return Ok(ctx.paths.vault_dir().join("default.env"));
    }
    bail!(VaultError::BadInput(format!(
        "unknown vault scope {:?} (configure it under [vault.scopes] in ~/.si/vault/settings.toml)",
        name
    )))
}

fn absolutize(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

fn scope_from_path(path: &Path) -> String {
    normalize_scope(&path.display().to_string())
}

fn looks_like_path(lower: &str) -> bool {
    if lower.starts_with('/') || lower.starts_with('~') {
        return true;
    }
    let base = lower.rsplit('/').next().unwrap_or(lower);
    base == ".env" || base.starts_with(".env.") || base.ends_with(".env")
}

fn part_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9._:-]+").expect("valid scope regex"))
}

fn normalize_part(part: &str) -> String {
    let lower = part.trim().to_lowercase();
    part_regex()
        .replace_all(&lower, "-")
        .trim_matches(|c| matches!(c, '-' | '_' | '.' | ':'))
        .to_string()
}

/// Canonical scope name, usable as a sun object name
///
/// Path-like inputs reduce to their env suffix (`/srv/.env.prod` → `prod`).
pub fn normalize_scope(raw: &str) -> String {
    let raw = raw.trim().replace('\\', "/");
    if raw.is_empty() {
        return DEFAULT_SCOPE.to_string();
    }

    let mut lower = raw.to_lowercase();
    if looks_like_path(&lower) {
        let base = lower
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        lower = match base.as_str() {
            "" | "." | ".." | "~" | ".env" | "default.env" => return DEFAULT_SCOPE.to_string(),
            b if b.starts_with(".env.") => b[".env.".len()..].to_string(),
            b if b.ends_with(".env") => b[..b.len() - ".env".len()].to_string(),
            b => b.trim_start_matches('.').to_string(),
        };
    }

    let parts: Vec<String> = lower
        .split('/')
        .map(normalize_part)
        .filter(|p| !p.is_empty())
        .collect();
    let mut scope = parts.join("/");
    if scope.len() > MAX_SCOPE_LEN {
        scope.truncate(MAX_SCOPE_LEN);
    }
    let scope = scope.trim_matches(|c| matches!(c, '-' | '_' | '/' | '.' | ':'));
    if scope.is_empty() {
        DEFAULT_SCOPE.to_string()
    } else {
        scope.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Env;
    use si_core::{Paths, Settings, SyncBackend};
    use tempfile::{tempdir, TempDir};

    fn ctx(dir: &TempDir, settings: Settings) -> Context {
        Context::new(
            Paths::with_home(dir.path()),
            settings,
            Env::from_pairs(Vec::<(String, String)>::new()),
        )
        .with_cwd(dir.path().join("work"))
    }

    #[test]
    fn test_normalize_scope() {
        assert_eq!(normalize_scope(""), "default");
        assert_eq!(normalize_scope("Paas-Prod"), "paas-prod");
        assert_eq!(normalize_scope("/srv/app/.env.prod"), "prod");
        assert_eq!(normalize_scope("~/.env"), "default");
        assert_eq!(normalize_scope("staging.env"), "staging");
        assert_eq!(normalize_scope("team one/app!!"), "team-one/app");
        assert_eq!(normalize_scope("--"), "default");
        assert_eq!(normalize_scope(&"x".repeat(300)).len(), MAX_SCOPE_LEN);
    }

    #[test]
    fn test_default_scope_path() {
        let dir = tempdir().unwrap();
        let ctx = ctx(&dir, Settings::default());
        let target = resolve(&ctx, None, None, true).unwrap();
        assert_eq!(target.scope, "default");
        assert_eq!(target.path, dir.path().join(".si/vault/default.env"));
        assert!(target.is_local());
    }

    #[test]
    fn test_configured_scope_and_unknown_scope() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings
            .vault
            .scopes
            .insert("paas-prod".to_string(), "~/srv/.env.prod".to_string());
        let ctx = ctx(&dir, settings);

        let target = resolve(&ctx, Some("paas-prod"), None, true).unwrap();
        assert_eq!(target.path, dir.path().join("srv/.env.prod"));

        let err = resolve(&ctx, Some("nope"), None, true).unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(VaultError::BadInput(_))
        ));
    }

    #[test]
    fn test_file_flag() {
        let dir = tempdir().unwrap();
        let ctx = ctx(&dir, Settings::default());
        let abs = dir.path().join("v/.env");
        let target = resolve(&ctx, None, Some(abs.to_str().unwrap()), true).unwrap();
        assert_eq!(target.path, abs);
        assert_eq!(target.scope, "default");

        let rel = resolve(&ctx, None, Some(".env.dev"), true).unwrap();
        assert_eq!(rel.path, dir.path().join("work/.env.dev"));
        assert_eq!(rel.scope, "dev");

        let err = resolve(&ctx, None, Some(abs.to_str().unwrap()), false).unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(VaultError::NotInitialized(_))
        ));
        assert!(resolve(&ctx, Some("default"), Some(".env"), true).is_err());
    }

    #[test]
    fn test_strict_sun_targets_objects() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.vault.sync_backend = SyncBackend::Sun;
        let ctx = ctx(&dir, settings);

        let target = resolve(&ctx, None, Some("/srv/.env.prod"), false).unwrap();
        assert_eq!(target.backend, TargetBackend::Sun);
        assert_eq!(target.scope, "prod");
        assert_eq!(target.trust_key(), "sun:prod");
        assert_eq!(target.display(), "sun:prod");
    }
}
