//! si vault - age-encrypted dotenv files
//!
//! Values live in ordinary `.env` files, each one wrapped for the recipients
//! named in the file header. Everything else in the file (comments, blank
//! lines, ordering, line endings) survives edits byte for byte.
//!
//! Around that core:
//! - identities come from the environment, a local key file or sun
//! - a trust store notices when a file's recipients change under you
//! - every command appends a value-free line to the audit log
//! - backups go to sun as `vault-backup` objects, never in plaintext
//!
//! In strict sun mode the vault and the identity live only in sun and no
//! vault bytes are written to disk.

pub mod audit;
pub mod cipher;
pub mod commands;
pub mod context;
pub mod dotenv;
pub mod error;
pub mod formatter;
pub mod header;
pub mod identity;
pub mod manage;
pub mod safe_file;
pub mod sun;
pub mod sync;
pub mod target;
pub mod trust;
pub mod vault;

pub use audit::{AuditEntry, AuditLog};
pub use commands::{Done, Report, Selector};
pub use context::Context;
pub use dotenv::Document;
pub use error::VaultError;
pub use target::Target;
pub use trust::TrustStore;
pub use vault::Vault;
