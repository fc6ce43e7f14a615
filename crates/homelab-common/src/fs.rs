//! File-backed resource writes.
//!
//! Every file the engine owns (network config, cluster config, kubeconfig,
//! authority material) goes through [`write_with_backup`]:
//! - identical content is never rewritten (no inode churn, no backup noise)
//! - a differing previous version is copied to `<file>.bak.<timestamp>` first
//! - the new content lands via write-to-temp then rename
//!
//! Backups are append-only; nothing here ever deletes one.
//!
//! Files that only take effect once something reloads them (netplan, the
//! cluster service) are written through [`stage_change`], which leaves a
//! `<file>.pending` marker until the caller calls [`clear_pending`]. A run that
//! dies between the write and the reload still sees the marker next time.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::{Error, Result};

/// Separator between the original file name and the backup timestamp
pub const BACKUP_INFIX: &str = ".bak.";

/// Suffix of the marker for a written but not yet applied file
pub const PENDING_SUFFIX: &str = ".pending";

const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

/// What [`write_with_backup`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Existing content already matched; file untouched
    Unchanged,
    /// File did not exist and was created
    Created,
    /// File existed with different content; previous version backed up
    Replaced {
        /// Where the previous version was copied
        backup: PathBuf,
    },
}

impl WriteOutcome {
    /// Whether the file on disk changed
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Read a file, mapping "not found" to `None`
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Write `contents` to `path` unless it already holds exactly that content.
///
/// `mode` sets unix permissions on the new file (e.g. `0o600` for keys and
/// netplan files).
pub fn write_with_backup(path: &Path, contents: &str, mode: Option<u32>) -> Result<WriteOutcome> {
    write_with_backup_at(path, contents, mode, Utc::now())
}

/// [`write_with_backup`] with an explicit clock, for deterministic backup names
pub fn write_with_backup_at(
    path: &Path,
    contents: &str,
    mode: Option<u32>,
    now: DateTime<Utc>,
) -> Result<WriteOutcome> {
    let outcome = match read_optional(path)? {
        Some(existing) if existing == contents => {
            debug!(path = %path.display(), "File content unchanged");
            return Ok(WriteOutcome::Unchanged);
        }
        Some(_) => {
            let backup = unused_backup_path(path, now);
            std::fs::copy(path, &backup).map_err(|e| Error::io(&backup, e))?;
            info!(path = %path.display(), backup = %backup.display(), "Backed up previous version");
            WriteOutcome::Replaced { backup }
        }
        None => WriteOutcome::Created,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
    }

    atomic_write(path, contents.as_bytes(), mode)?;
    Ok(outcome)
}

/// Marker path recording that `path` changed and hasn't been applied
pub fn pending_marker(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PENDING_SUFFIX);
    path.with_file_name(name)
}

/// Whether `path` has a change waiting to be applied
pub fn is_pending(path: &Path) -> Result<bool> {
    let marker = pending_marker(path);
    marker.try_exists().map_err(|e| Error::io(&marker, e))
}

/// Write `contents` like [`write_with_backup`], marking the file pending first
/// when the content changes. Returns whether an apply is due, which includes a
/// change left pending by an earlier run.
pub fn stage_change(path: &Path, contents: &str, mode: Option<u32>) -> Result<bool> {
    if read_optional(path)?.as_deref() != Some(contents) {
        let marker = pending_marker(path);
        if let Some(parent) = marker.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
        }
        std::fs::write(&marker, b"").map_err(|e| Error::io(&marker, e))?;
    }
    write_with_backup(path, contents, mode)?;
    is_pending(path)
}

/// Drop the pending marker once the change took effect
pub fn clear_pending(path: &Path) -> Result<()> {
    let marker = pending_marker(path);
    match std::fs::remove_file(&marker) {
        Ok(()) => {
            debug!(path = %path.display(), "Change applied");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(&marker, e)),
    }
}

/// Backup file name for `path` taken at `now`
pub fn backup_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(BACKUP_INFIX);
    name.push(now.format(BACKUP_TIMESTAMP_FORMAT).to_string());
    path.with_file_name(name)
}

/// All backups of `path`, oldest first
pub fn list_backups(path: &Path) -> Result<Vec<PathBuf>> {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
        return Ok(Vec::new());
    };
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    let mut prefix = name.to_os_string();
    prefix.push(BACKUP_INFIX);
    let prefix = prefix.to_string_lossy().into_owned();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(dir, e)),
    };

    let mut backups: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
        .map(|entry| entry.path())
        .collect();
    backups.sort();
    Ok(backups)
}

fn unused_backup_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let base = backup_path(path, now);
    if !base.exists() {
        return base;
    }
    // Two writes inside the same millisecond
    let mut n = 1u32;
    loop {
        let mut name = base.as_os_str().to_os_string();
        name.push(format!("-{}", n));
        let candidate = PathBuf::from(name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn atomic_write(path: &Path, bytes: &[u8], mode: Option<u32>) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::internal_with_context("atomic_write", "path has no file name"))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(".homelab-tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = std::fs::File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
    if let Some(mode) = mode {
        set_mode(&file, mode).map_err(|e| Error::io(&tmp, e))?;
    }
    file.write_all(bytes).map_err(|e| Error::io(&tmp, e))?;
    file.sync_all().map_err(|e| Error::io(&tmp, e))?;
    drop(file);

    std::fs::rename(&tmp, path).map_err(|e| Error::io(path, e))
}

#[cfg(unix)]
fn set_mode(file: &std::fs::File, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &std::fs::File, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
