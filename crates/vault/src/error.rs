//! Vault error taxonomy
//!
//! Lower layers return `anyhow::Result` and wrap failures with context. Any
//! failure the operator can act on is raised as a [`VaultError`] somewhere in
//! that chain; [`classify`] digs it back out for the command layer.

use si_core::SettingsError;
use thiserror::Error;

/// Vault-specific errors
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("{0}")]
    BadInput(String),

    #[error("vault not initialized: {0}")]
    NotInitialized(String),

    #[error("no vault identity available: {0}")]
    IdentityUnavailable(String),

    #[error("decrypt failed for {key}: no identity could open it (tried {})", tried.join(", "))]
    DecryptFailed { key: String, tried: Vec<String> },

    #[error("vault recipients changed for {target}: trusted {trusted}, found {found}")]
    TrustMismatch {
        target: String,
        trusted: String,
        found: String,
    },

    #[error("refusing to back up plaintext keys: {}", keys.join(", "))]
    PlaintextLeakGuard { keys: Vec<String> },

    #[error("sun backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("vault file changed while writing: {0}")]
    Conflict(String),

    #[error("vault settings load failed: {0}")]
    Settings(#[from] SettingsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key not found: {0}")]
    NotFound(String),
}

impl VaultError {
    /// Stable category name recorded in the audit log
    pub fn category(&self) -> &'static str {
        match self {
            VaultError::BadInput(_) => "bad_input",
            VaultError::NotInitialized(_) => "not_initialized",
            VaultError::IdentityUnavailable(_) => "identity_unavailable",
            VaultError::DecryptFailed { .. } => "decrypt_failed",
            VaultError::TrustMismatch { .. } => "trust_mismatch",
            VaultError::PlaintextLeakGuard { .. } => "plaintext_leak_guard",
            VaultError::BackendUnavailable(_) => "backend_unavailable",
            VaultError::Conflict(_) => "conflict",
            VaultError::Settings(_) => "settings",
            VaultError::Io(_) => "io",
            VaultError::NotFound(_) => "not_found",
        }
    }

    /// Remediation hint shown under the error message
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            VaultError::BadInput(_) => Some("see 'si vault --help' for usage"),
            VaultError::NotInitialized(_) => Some("run 'si vault init' first"),
            VaultError::IdentityUnavailable(_) => {
                Some("run 'si vault keygen' or set SI_VAULT_IDENTITY")
            }
            VaultError::DecryptFailed { .. } => {
                Some("check that the identity matching the file's recipients is available")
            }
            VaultError::TrustMismatch { .. } => Some(
                "inspect with 'si vault trust status'; accept with 'si vault trust accept' or pass --force",
            ),
            VaultError::PlaintextLeakGuard { .. } => Some("run 'si vault encrypt' first"),
            VaultError::BackendUnavailable(_) => {
                Some("check ~/.si/sun/settings.toml and that the sun service is reachable")
            }
            VaultError::Conflict(_) => Some("another process modified the file; retry"),
            VaultError::Settings(_) => Some("fix or remove the settings file named above"),
            VaultError::Io(_) => None,
            VaultError::NotFound(_) => Some("list keys with 'si vault dump'"),
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            VaultError::BadInput(_) => 2,
            _ => 1,
        }
    }
}

/// Find the vault error in an error chain, if any
pub fn classify(err: &anyhow::Error) -> Option<&VaultError> {
    err.chain().find_map(|e| e.downcast_ref::<VaultError>())
}

/// Audit category for any error
pub fn category_of(err: &anyhow::Error) -> &'static str {
    classify(err).map(VaultError::category).unwrap_or("error")
}

/// Exit code for any error
pub fn exit_code_of(err: &anyhow::Error) -> u8 {
    classify(err).map(VaultError::exit_code).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classify_through_context() {
        let err = Err::<(), _>(VaultError::NotFound("API_KEY".to_string()))
            .context("get API_KEY")
            .unwrap_err();

        let found = classify(&err).unwrap();
        assert!(matches!(found, VaultError::NotFound(_)));
        assert_eq!(category_of(&err), "not_found");
        assert_eq!(exit_code_of(&err), 1);
    }

    #[test]
    fn test_bad_input_exit_code() {
        let err = anyhow::Error::new(VaultError::BadInput("invalid key name".to_string()));
        assert_eq!(exit_code_of(&err), 2);
        assert!(classify(&err).unwrap().hint().is_some());
    }

    #[test]
    fn test_unclassified_error() {
        let err = anyhow::anyhow!("something else");
        assert!(classify(&err).is_none());
        assert_eq!(category_of(&err), "error");
        assert_eq!(exit_code_of(&err), 1);
    }

    #[test]
    fn test_messages_hide_values() {
        let err = VaultError::DecryptFailed {
            key: "DB_PASSWORD".to_string(),
            tried: vec!["0123456789abcdef".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "decrypt failed for DB_PASSWORD: no identity could open it (tried 0123456789abcdef)"
        );

        let err = VaultError::PlaintextLeakGuard {
            keys: vec!["A".to_string(), "B".to_string()],
        };
        assert_eq!(err.to_string(), "refusing to back up plaintext keys: A, B");
    }
}
