//! On-disk authority material under `<state>/pki`.
//!
//! Layout:
//! - `root-ca.key`, `root-ca.crt`: the root, created once
//! - `leaf.key`, `leaf.crt`: the ingress leaf, reissued on SAN change
//!
//! Keys are written with mode 0600. Every write goes through
//! [`homelab_common::fs::write_with_backup`], so a superseded leaf is kept as
//! a timestamped backup.

use std::path::{Path, PathBuf};

use homelab_common::fs::{read_optional, write_with_backup, WriteOutcome};
use tracing::{info, warn};

use crate::{is_signed_by, CertificateAuthority, CertificateInfo, PkiError, Result, SanSet};

/// Directory name under the state directory
pub const PKI_DIR: &str = "pki";
const ROOT_KEY: &str = "root-ca.key";
const ROOT_CERT: &str = "root-ca.crt";
const LEAF_KEY: &str = "leaf.key";
const LEAF_CERT: &str = "leaf.crt";

const KEY_MODE: u32 = 0o600;
const CERT_MODE: u32 = 0o644;

/// Common name of a freshly created root
pub const ROOT_COMMON_NAME: &str = "homelab root authority";

/// Root material as found on disk
#[derive(Debug)]
pub enum RootState {
    /// Neither file exists
    Absent,
    /// Both files exist and parse
    Present(CertificateAuthority),
    /// Material exists but is partial or unreadable; never replaced automatically
    Corrupt(String),
}

/// Leaf material as found on disk, judged against a requested SAN set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafState {
    /// No leaf on disk
    Absent,
    /// Leaf covers exactly the requested SANs and is valid under the root
    Current,
    /// Leaf exists but must be reissued
    Stale {
        /// Human-readable description of what differs
        reason: String,
    },
}

/// Certificate and private key of an issued leaf
#[derive(Clone)]
pub struct LeafMaterial {
    /// PEM-encoded leaf certificate
    pub cert_pem: String,
    /// PEM-encoded leaf private key
    pub key_pem: String,
}

impl std::fmt::Debug for LeafMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafMaterial")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

/// Result of [`AuthorityStore::ensure_leaf`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafIssue {
    /// Existing leaf kept
    Reused,
    /// New leaf written
    Issued,
}

/// Filesystem home of the authority and its leaf
#[derive(Debug, Clone)]
pub struct AuthorityStore {
    dir: PathBuf,
}

impl AuthorityStore {
    /// Store rooted at `<state_dir>/pki`
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(PKI_DIR))
    }

    /// Store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the material
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the root certificate
    pub fn root_cert_path(&self) -> PathBuf {
        self.dir.join(ROOT_CERT)
    }

    /// Path of the root private key
    pub fn root_key_path(&self) -> PathBuf {
        self.dir.join(ROOT_KEY)
    }

    /// Path of the leaf certificate
    pub fn leaf_cert_path(&self) -> PathBuf {
        self.dir.join(LEAF_CERT)
    }

    /// Path of the leaf private key
    pub fn leaf_key_path(&self) -> PathBuf {
        self.dir.join(LEAF_KEY)
    }

    /// Inspect root material without changing anything
    pub fn root_state(&self) -> Result<RootState> {
        let cert = read_optional(&self.root_cert_path())?;
        let key = read_optional(&self.root_key_path())?;
        Ok(match (cert, key) {
            (None, None) => RootState::Absent,
            (Some(cert), Some(key)) => match CertificateAuthority::from_pem(&cert, &key) {
                Ok(ca) => RootState::Present(ca),
                Err(e) => RootState::Corrupt(e.to_string()),
            },
            (Some(_), None) => RootState::Corrupt(format!(
                "{} exists without {}",
                ROOT_CERT, ROOT_KEY
            )),
            (None, Some(_)) => RootState::Corrupt(format!(
                "{} exists without {}",
                ROOT_KEY, ROOT_CERT
            )),
        })
    }

    /// Load the root, creating it only when no material exists.
    ///
    /// Returns the authority and whether it was created by this call.
    pub fn ensure_root(&self) -> Result<(CertificateAuthority, bool)> {
        match self.root_state()? {
            RootState::Present(ca) => Ok((ca, false)),
            RootState::Corrupt(reason) => Err(PkiError::Corrupt(reason)),
            RootState::Absent => {
                let ca = CertificateAuthority::new(ROOT_COMMON_NAME)?;
                write_with_backup(&self.root_key_path(), ca.ca_key_pem(), Some(KEY_MODE))?;
                write_with_backup(&self.root_cert_path(), ca.ca_cert_pem(), Some(CERT_MODE))?;
                info!(dir = %self.dir.display(), "Created root authority");
                Ok((ca, true))
            }
        }
    }

    /// Load the leaf from disk, if both halves exist
    pub fn load_leaf(&self) -> Result<Option<LeafMaterial>> {
        let cert = read_optional(&self.leaf_cert_path())?;
        let key = read_optional(&self.leaf_key_path())?;
        Ok(match (cert, key) {
            (Some(cert_pem), Some(key_pem)) => Some(LeafMaterial { cert_pem, key_pem }),
            _ => None,
        })
    }

    /// Judge the leaf on disk against `sans` and the root
    pub fn leaf_state(&self, ca: &CertificateAuthority, sans: &SanSet) -> Result<LeafState> {
        let Some(leaf) = self.load_leaf()? else {
            return Ok(LeafState::Absent);
        };

        let info = match CertificateInfo::from_pem(&leaf.cert_pem) {
            Ok(info) => info,
            Err(e) => {
                return Ok(LeafState::Stale {
                    reason: format!("unreadable leaf: {}", e),
                })
            }
        };

        if &info.sans != sans {
            return Ok(LeafState::Stale {
                reason: format!("SANs {} (want {})", info.sans, sans),
            });
        }
        if !is_signed_by(&leaf.cert_pem, ca.ca_cert_pem())? {
            return Ok(LeafState::Stale {
                reason: "not issued by current root".to_string(),
            });
        }
        if info.needs_rotation() {
            return Ok(LeafState::Stale {
                reason: "past rotation threshold".to_string(),
            });
        }
        Ok(LeafState::Current)
    }

    /// Reuse the leaf when it is current, otherwise issue and write a new one
    pub fn ensure_leaf(&self, ca: &CertificateAuthority, sans: &SanSet) -> Result<LeafIssue> {
        match self.leaf_state(ca, sans)? {
            LeafState::Current => Ok(LeafIssue::Reused),
            state => {
                if let LeafState::Stale { reason } = &state {
                    warn!(reason = %reason, "Reissuing leaf certificate");
                }
                let leaf = ca.issue_leaf(sans)?;
                let key = write_with_backup(&self.leaf_key_path(), &leaf.key_pem, Some(KEY_MODE))?;
                let cert =
                    write_with_backup(&self.leaf_cert_path(), &leaf.cert_pem, Some(CERT_MODE))?;
                if let WriteOutcome::Replaced { backup } = &cert {
                    info!(backup = %backup.display(), "Superseded leaf backed up");
                }
                info!(sans = %sans, key_changed = key.changed(), "Issued leaf certificate");
                Ok(LeafIssue::Issued)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homelab_common::fs::list_backups;

    fn sans(names: &[&str]) -> SanSet {
        SanSet::new(names.iter().copied())
    }

    #[test]
    fn root_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthorityStore::in_state_dir(dir.path());

        let (first, created) = store.ensure_root().unwrap();
        assert!(created);
        let (second, created_again) = store.ensure_root().unwrap();
        assert!(!created_again);
        assert_eq!(first.ca_key_pem(), second.ca_key_pem());
        assert!(list_backups(&store.root_key_path()).unwrap().is_empty());
    }

    #[test]
    fn partial_root_is_an_error_and_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthorityStore::in_state_dir(dir.path());
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.root_cert_path(), "orphan").unwrap();

        assert!(matches!(store.ensure_root(), Err(PkiError::Corrupt(_))));
        assert!(!store.root_key_path().exists());
        assert_eq!(
            std::fs::read_to_string(store.root_cert_path()).unwrap(),
            "orphan"
        );
    }

    #[test]
    fn garbage_root_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthorityStore::in_state_dir(dir.path());
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.root_cert_path(), "garbage").unwrap();
        std::fs::write(store.root_key_path(), "garbage").unwrap();

        assert!(matches!(store.root_state().unwrap(), RootState::Corrupt(_)));
    }

    #[test]
    fn leaf_reordering_does_not_reissue() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthorityStore::in_state_dir(dir.path());
        let (ca, _) = store.ensure_root().unwrap();

        let issued = store
            .ensure_leaf(&ca, &sans(&["argocd.pizza", "grafana.pizza"]))
            .unwrap();
        assert_eq!(issued, LeafIssue::Issued);

        let again = store
            .ensure_leaf(&ca, &sans(&["Grafana.pizza", "argocd.pizza"]))
            .unwrap();
        assert_eq!(again, LeafIssue::Reused);
        assert!(list_backups(&store.leaf_cert_path()).unwrap().is_empty());
    }

    #[test]
    fn san_change_reissues_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthorityStore::in_state_dir(dir.path());
        let (ca, _) = store.ensure_root().unwrap();
        store.ensure_leaf(&ca, &sans(&["a.pizza"])).unwrap();

        let wider = sans(&["a.pizza", "b.pizza"]);
        assert!(matches!(
            store.leaf_state(&ca, &wider).unwrap(),
            LeafState::Stale { .. }
        ));
        assert_eq!(store.ensure_leaf(&ca, &wider).unwrap(), LeafIssue::Issued);
        assert_eq!(store.ensure_leaf(&ca, &wider).unwrap(), LeafIssue::Reused);

        let leaf = store.load_leaf().unwrap().unwrap();
        assert_eq!(CertificateInfo::from_pem(&leaf.cert_pem).unwrap().sans, wider);
        assert_eq!(list_backups(&store.leaf_cert_path()).unwrap().len(), 1);
    }

    #[test]
    fn leaf_from_foreign_root_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthorityStore::in_state_dir(dir.path());
        let (ca, _) = store.ensure_root().unwrap();
        let foreign = CertificateAuthority::new("foreign").unwrap();
        let wanted = sans(&["a.pizza"]);

        let leaf = foreign.issue_leaf(&wanted).unwrap();
        std::fs::write(store.leaf_cert_path(), &leaf.cert_pem).unwrap();
        std::fs::write(store.leaf_key_path(), &leaf.key_pem).unwrap();

        assert_eq!(
            store.leaf_state(&ca, &wanted).unwrap(),
            LeafState::Stale {
                reason: "not issued by current root".to_string()
            }
        );
    }

    #[cfg(unix)]
    #[test]
    fn keys_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = AuthorityStore::in_state_dir(dir.path());
        let (ca, _) = store.ensure_root().unwrap();
        store.ensure_leaf(&ca, &sans(&["a.pizza"])).unwrap();

        for key in [store.root_key_path(), store.leaf_key_path()] {
            let mode = std::fs::metadata(&key).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{}", key.display());
        }
    }
}
