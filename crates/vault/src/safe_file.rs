//! Crash-safe file writes and advisory locks
//!
//! Writes go to a temp file in the target directory, are fsynced, renamed
//! over the target, and the directory is fsynced. A crash before the rename
//! leaves the original untouched; the temp file is unlinked on drop.

use crate::error::VaultError;
use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Atomically replace `path` with `data`, leaving it with `mode`
pub fn atomic_write(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let parent = parent_dir(path)?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed creating parent directory {}", parent.display()))?;

    if path.is_dir() {
        bail!("cannot atomically write to directory {}", path.display());
    }

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed creating temp file in {}", parent.display()))?;
    tmp.write_all(data)
        .with_context(|| format!("failed writing temp file for {}", path.display()))?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(mode))
        .context("failed setting temp file permissions")?;
    tmp.as_file()
        .sync_all()
        .context("failed syncing temp file")?;

    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed replacing {}", path.display()))?;

    File::open(parent)
        .and_then(|dir| dir.sync_all())
        .with_context(|| format!("failed syncing directory {}", parent.display()))?;
    Ok(())
}

/// Permission bits of an existing file
pub fn existing_mode(path: &Path) -> Option<u32> {
    fs::metadata(path)
        .ok()
        .map(|m| m.permissions().mode() & 0o777)
}

/// Read a file, `None` when it does not exist
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed reading {}", path.display())),
    }
}

/// Create a directory (and parents) and restrict it to the owner
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed creating directory {}", dir.display()))?;
    fs::set_permissions(dir, Permissions::from_mode(0o700))
        .with_context(|| format!("failed securing directory {}", dir.display()))?;
    Ok(())
}

/// Refuse to write through a symlink unless explicitly allowed
pub fn refuse_symlink(path: &Path, allow: bool) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() && !allow => {
            bail!(VaultError::BadInput(format!(
                "refusing to write through symlink {} (set SI_VAULT_ALLOW_SYMLINK_ENV_FILE=1 to allow)",
                path.display()
            )))
        }
        _ => Ok(()),
    }
}

/// Content hash used to detect concurrent modification
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn parent_dir(path: &Path) -> Result<&Path> {
    match path.parent() {
        Some(p) if p.as_os_str().is_empty() => Ok(Path::new(".")),
        Some(p) => Ok(p),
        None => Err(anyhow!("path has no parent: {}", path.display())),
    }
}

/// Sibling lock file for `path` (`<name>.lock`)
pub fn lock_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "vault".to_string());
    path.with_file_name(format!("{}.lock", name))
}

/// Exclusive advisory lock held until dropped
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock next to `target` is held
    pub fn acquire(target: &Path) -> Result<Self> {
        let path = lock_path(target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .mode(0o600)
            .open(&path)
            .with_context(|| format!("failed opening lock {}", path.display()))?;

        // SAFETY: the descriptor is owned by `file` and stays open while locked
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed locking {}", path.display()));
        }
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: see `acquire`
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
