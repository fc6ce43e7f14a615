//! Host operations on the local machine.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use homelab_common::command::run_command;
use homelab_common::fs::{read_optional, write_with_backup};
use tracing::info;

use super::{HostOps, SwapState};
use crate::error::{ApplyError, ProbeError};

/// Where the k3s installer puts the binary
pub const K3S_BINARY: &str = "/usr/local/bin/k3s";
const K3S_INSTALL_SCRIPT: &str = "curl -sfL https://get.k3s.io | sh -";
const K3S_SERVICE: &str = "k3s";
const FSTAB: &str = "/etc/fstab";
const PROC_SWAPS: &str = "/proc/swaps";
const MIB: u64 = 1024 * 1024;

/// [`HostOps`] using systemd tools, util-linux and the k3s installer
#[derive(Debug, Clone)]
pub struct LocalHost {
    k3s_binary: PathBuf,
    fstab: PathBuf,
}

impl LocalHost {
    /// Host operations against the standard system paths
    pub fn new() -> Self {
        Self {
            k3s_binary: PathBuf::from(K3S_BINARY),
            fstab: PathBuf::from(FSTAB),
        }
    }
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new()
    }
}

fn fstab_line(path: &Path) -> String {
    format!("{} none swap sw 0 0", path.display())
}

/// Whether `fstab` has an entry whose device field is `path`
fn fstab_has_swap(fstab: &str, path: &Path) -> bool {
    let wanted = path.display().to_string();
    fstab
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .any(|l| l.split_whitespace().next() == Some(wanted.as_str()))
}

/// Whether `/proc/swaps` lists `path`
fn swap_active(proc_swaps: &str, path: &Path) -> bool {
    let wanted = path.display().to_string();
    proc_swaps
        .lines()
        .skip(1)
        .any(|l| l.split_whitespace().next() == Some(wanted.as_str()))
}

/// Version token of `k3s --version` output
fn parse_k3s_version(output: &str) -> Option<String> {
    output
        .lines()
        .next()?
        .split_whitespace()
        .find(|token| token.starts_with('v'))
        .map(str::to_string)
}

#[async_trait]
impl HostOps for LocalHost {
    async fn hostname(&self) -> Result<String, ProbeError> {
        let out = run_command("hostnamectl", &["--static"], &[]).await?;
        Ok(out.trim().to_string())
    }

    async fn set_hostname(&self, hostname: &str) -> Result<(), ApplyError> {
        run_command("hostnamectl", &["set-hostname", hostname], &[]).await?;
        Ok(())
    }

    async fn swap_state(&self, path: &Path) -> Result<Option<SwapState>, ProbeError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProbeError::Unreadable {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })
            }
        };
        let proc_swaps = read_optional(Path::new(PROC_SWAPS))?.unwrap_or_default();
        let fstab = read_optional(&self.fstab)?.unwrap_or_default();
        Ok(Some(SwapState {
            size_mib: metadata.len() / MIB,
            active: swap_active(&proc_swaps, path),
            persistent: fstab_has_swap(&fstab, path),
        }))
    }

    async fn ensure_swap(&self, path: &Path, size_mib: u64) -> Result<(), ApplyError> {
        let file = path.display().to_string();
        let current = self.swap_state(path).await.map_err(|e| ApplyError::Other(e.to_string()))?;

        let size_ok = current.as_ref().is_some_and(|s| s.size_mib == size_mib);
        if !size_ok {
            if current.as_ref().is_some_and(|s| s.active) {
                run_command("swapoff", &[&file], &[]).await?;
            }
            if current.is_some() {
                tokio::fs::remove_file(path)
                    .await
                    .map_err(|e| homelab_common::Error::io(path, e))?;
            }
            let size = format!("{}M", size_mib);
            run_command("fallocate", &["-l", &size, &file], &[]).await?;
            run_command("chmod", &["600", &file], &[]).await?;
            run_command("mkswap", &[&file], &[]).await?;
            info!(path = %file, size_mib, "Created swap file");
        }

        let active = size_ok && current.as_ref().is_some_and(|s| s.active);
        if !active {
            run_command("swapon", &[&file], &[]).await?;
        }

        let fstab = read_optional(&self.fstab)?.unwrap_or_default();
        if !fstab_has_swap(&fstab, path) {
            let mut updated = fstab;
            if !updated.is_empty() && !updated.ends_with('\n') {
                updated.push('\n');
            }
            updated.push_str(&fstab_line(path));
            updated.push('\n');
            write_with_backup(&self.fstab, &updated, None)?;
        }
        Ok(())
    }

    async fn cluster_version(&self) -> Result<Option<String>, ProbeError> {
        if !self.k3s_binary.exists() {
            return Ok(None);
        }
        let binary = self.k3s_binary.display().to_string();
        let out = run_command(&binary, &["--version"], &[]).await?;
        Ok(parse_k3s_version(&out))
    }

    async fn install_cluster(&self, version: Option<String>) -> Result<(), ApplyError> {
        let env: Vec<(&str, &str)> = version
            .as_deref()
            .map(|v| vec![("INSTALL_K3S_VERSION", v)])
            .unwrap_or_default();
        info!(version = version.as_deref().unwrap_or("stable"), "Running k3s installer");
        run_command("sh", &["-c", K3S_INSTALL_SCRIPT], &env).await?;
        Ok(())
    }

    async fn restart_cluster(&self) -> Result<(), ApplyError> {
        run_command("systemctl", &["restart", K3S_SERVICE], &[]).await?;
        Ok(())
    }
}
