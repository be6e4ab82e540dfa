//! si Core - Shared functionality for si tools
//!
//! Every si command resolves the same `~/.si` tree and reads the same
//! module-based settings files. This crate owns both.

pub mod format;
pub mod paths;
pub mod settings;

pub use paths::Paths;
pub use settings::{KeyBackend, Settings, SettingsError, SunSettings, SyncBackend, VaultSettings};
