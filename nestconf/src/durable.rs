//! Crash-safe file replacement.
//!
//! A write lands in a temporary sibling file, is fsynced, renamed over the
//! target, and then the parent directory is fsynced so the rename itself
//! survives power loss. Until the rename the previous file stays
//! authoritative.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// Atomically replace `path` with `bytes`. Blocking.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Config(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent)?;

    let tmp = temp_path(path);
    if let Err(e) = write_synced(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    sync_dir(parent)?;

    debug!(path = %path.display(), bytes = bytes.len(), "Durably replaced file");
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(dir: &Path) -> Result<()> {
    static UNSUPPORTED: std::sync::Once = std::sync::Once::new();
    UNSUPPORTED.call_once(|| {
        warn!(dir = %dir.display(), "Directory fsync unsupported on this platform, skipping");
    });
    debug!(dir = %dir.display(), "Skipped directory fsync");
    Ok(())
}

/// Remove temp files left behind by an interrupted write.
pub(crate) fn sweep_temp_files(dir: &Path) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') && name.ends_with(".tmp") {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %name, error = %e, "Could not remove stale temp file"),
            }
        }
    }
    Ok(removed)
}
