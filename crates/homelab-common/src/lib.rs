//! Common utilities for homelab: errors, retry, external commands, file-backed
//! writes, run lock and Kubernetes client helpers.

#![deny(missing_docs)]

pub mod command;
pub mod error;
pub mod fs;
pub mod kube_utils;
pub mod lock;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply issued by homelab
pub const FIELD_MANAGER: &str = "homelab";

/// Label key marking objects owned by homelab
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value for [`LABEL_MANAGED_BY`]
pub const LABEL_MANAGED_BY_HOMELAB: &str = "homelab";

/// Label key carrying the workload name on deployments, pods and services
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Default directory for persisted engine state (authority material, run lock)
pub const DEFAULT_STATE_DIR: &str = "/var/lib/homelab";
