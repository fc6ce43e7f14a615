//! Single-writer run lock.
//!
//! A convergence run assumes it is the only writer against the host and
//! cluster. [`RunLock`] makes that hold between processes sharing a state
//! directory: the lock file is created exclusively, holds the owner's pid, and
//! is removed when the guard drops. A lock left behind by a dead process is
//! taken over. A lock without a readable pid may be mid-write by its creator,
//! so it counts as held until it is [`UNREADABLE_GRACE`] old.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::{Error, Result};

/// File name of the lock inside the state directory
pub const LOCK_FILE_NAME: &str = "homelab.lock";

/// Age after which a lock file without a readable pid is considered abandoned
pub const UNREADABLE_GRACE: Duration = Duration::from_secs(30);

/// Guard for an acquired run lock; releases on drop
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock at `path`, failing if a live process holds it
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        match Self::try_create(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok());
                match holder {
                    Some(pid) if pid != std::process::id() && process_alive(pid) => Err(
                        Error::lock(&path, format!("held by running process {}", pid)),
                    ),
                    None if within_grace(&path) => Err(Error::lock(
                        &path,
                        "held by a process that has not recorded its pid yet",
                    )),
                    _ => {
                        warn!(path = %path.display(), holder = ?holder, "Taking over stale run lock");
                        std::fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
                        Self::try_create(&path).map_err(|e| Error::io(&path, e))
                    }
                }
            }
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    /// Lock path under a state directory
    pub fn path_in(state_dir: &Path) -> PathBuf {
        state_dir.join(LOCK_FILE_NAME)
    }

    /// Path of the held lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_create(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "Acquired run lock");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release run lock");
        }
    }
}

fn within_grace(path: &Path) -> bool {
    let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        // vanished or unstatable; let the takeover path report it
        Err(_) => return false,
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age < UNREADABLE_GRACE)
        // modified in the future counts as fresh
        .unwrap_or(true)
}

fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = RunLock::path_in(dir.path());
        {
            let lock = RunLock::acquire(&path).unwrap();
            assert!(lock.path().exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn lock_records_owner_pid() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RunLock::acquire(RunLock::path_in(dir.path())).unwrap();
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = RunLock::path_in(dir.path());
        // pid far above pid_max on any Linux box
        std::fs::write(&path, "4294967\n").unwrap();

        let lock = RunLock::acquire(&path).unwrap();
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    fn age(path: &Path, by: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn fresh_empty_lock_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = RunLock::path_in(dir.path());
        // creator has opened the file but not written its pid
        std::fs::write(&path, "").unwrap();

        let err = RunLock::acquire(&path).unwrap_err();
        assert!(matches!(err, Error::Lock { .. }));
        assert!(path.exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn fresh_garbage_lock_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = RunLock::path_in(dir.path());
        std::fs::write(&path, "not a pid").unwrap();
        assert!(RunLock::acquire(&path).is_err());
    }

    #[test]
    fn abandoned_unreadable_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = RunLock::path_in(dir.path());
        std::fs::write(&path, "not a pid").unwrap();
        age(&path, UNREADABLE_GRACE + Duration::from_secs(5));

        let lock = RunLock::acquire(&path).unwrap();
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn live_holder_blocks_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let path = RunLock::path_in(dir.path());
        // pid 1 is always alive
        std::fs::write(&path, "1\n").unwrap();

        let err = RunLock::acquire(&path).unwrap_err();
        assert!(matches!(err, Error::Lock { .. }));
        assert!(err.to_string().contains("held by running process 1"));
        // the foreign lock is left in place
        assert!(path.exists());
    }
}
