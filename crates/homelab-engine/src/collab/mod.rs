//! External collaborators.
//!
//! Each system the engine drives sits behind a narrow async trait with one
//! real implementation. Steps only ever see the traits, which keeps the
//! executor and planner testable with mocks and in-memory fakes.

pub mod cluster;
pub mod dns;
pub mod health;
pub mod helm;
pub mod host;
pub mod netplan;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use homelab_pki::LeafMaterial;
#[cfg(test)]
use mockall::automock;

use crate::desired::{ChartRelease, IngressRoute, ResourceSpec, Workload};
use crate::error::{ApplyError, ProbeError};

/// Observed spec and rollout state of a workload's deployment and service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadState {
    /// Image of the first container
    pub image: String,
    /// Desired replica count on the deployment
    pub replicas: i32,
    /// First container port
    pub container_port: Option<u16>,
    /// Container resources
    pub resources: ResourceSpec,
    /// Port exposed by the service, if the service exists
    pub service_port: Option<u16>,
    /// Deployment has the Available condition
    pub available: bool,
}

/// TLS section of an ingress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressTls {
    /// Hosts covered
    pub hosts: Vec<String>,
    /// Secret holding the certificate
    pub secret_name: String,
}

/// Observed single-rule ingress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressState {
    /// Host of the first rule
    pub host: String,
    /// Backend service of the first path
    pub service: String,
    /// Backend service port
    pub port: u16,
    /// First TLS entry
    pub tls: Option<IngressTls>,
}

/// Observed chart release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseState {
    /// Chart name without version
    pub chart: String,
    /// Chart version
    pub version: String,
    /// Release status (e.g. `deployed`)
    pub status: String,
    /// User-supplied values, flattened to dotted keys
    pub values: BTreeMap<String, String>,
}

/// Observed swap file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapState {
    /// File size in MiB
    pub size_mib: u64,
    /// Listed in /proc/swaps
    pub active: bool,
    /// Listed in /etc/fstab
    pub persistent: bool,
}

/// Observed pod of a bundled component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodHealth {
    /// Pod name
    pub name: String,
    /// Pod phase (e.g. `Running`)
    pub phase: String,
    /// Every container reports ready
    pub ready: bool,
}

impl PodHealth {
    /// Running with all containers ready
    pub fn is_healthy(&self) -> bool {
        self.phase == "Running" && self.ready
    }
}

/// Control-plane API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Node Ready condition; `None` when the node is not registered
    async fn node_ready(&self, node: &str) -> Result<Option<bool>, ProbeError>;

    /// Deployment Available condition; `None` when the deployment is missing
    async fn deployment_available(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<bool>, ProbeError>;

    /// Whether a namespace exists
    async fn namespace_exists(&self, name: &str) -> Result<bool, ProbeError>;

    /// Create or update a namespace
    async fn apply_namespace(&self, name: &str) -> Result<(), ApplyError>;

    /// Deployment and service of a workload
    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadState>, ProbeError>;

    /// Create or update a workload's deployment and service
    async fn apply_workload(&self, workload: &Workload) -> Result<(), ApplyError>;

    /// Ingress by name
    async fn get_ingress(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<IngressState>, ProbeError>;

    /// Create or replace the rule part of a route's ingress
    async fn apply_ingress_route(&self, route: &IngressRoute) -> Result<(), ApplyError>;

    /// Set the TLS section of a route's ingress
    async fn apply_ingress_tls(
        &self,
        route: &IngressRoute,
        secret_name: &str,
    ) -> Result<(), ApplyError>;

    /// `kubernetes.io/tls` secret contents
    async fn get_tls_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<LeafMaterial>, ProbeError>;

    /// Create or replace a `kubernetes.io/tls` secret
    async fn apply_tls_secret(
        &self,
        namespace: &str,
        name: &str,
        leaf: &LeafMaterial,
    ) -> Result<(), ApplyError>;
}

/// Chart installer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChartInstaller: Send + Sync {
    /// Installed release, if any
    async fn get_release(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReleaseState>, ProbeError>;

    /// Install or upgrade a release with its parameter set
    async fn install_or_upgrade(&self, release: &ChartRelease) -> Result<(), ApplyError>;
}

/// Host-level operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostOps: Send + Sync {
    /// Current static hostname
    async fn hostname(&self) -> Result<String, ProbeError>;

    /// Set the static hostname
    async fn set_hostname(&self, hostname: &str) -> Result<(), ApplyError>;

    /// Swap file state, `None` when the file doesn't exist
    async fn swap_state(&self, path: &Path) -> Result<Option<SwapState>, ProbeError>;

    /// Create, size, enable and persist a swap file
    async fn ensure_swap(&self, path: &Path, size_mib: u64) -> Result<(), ApplyError>;

    /// Installed cluster version, `None` when not installed
    async fn cluster_version(&self) -> Result<Option<String>, ProbeError>;

    /// Run the cluster installer, optionally pinned to a version
    async fn install_cluster(&self, version: Option<String>) -> Result<(), ApplyError>;

    /// Restart the cluster service
    async fn restart_cluster(&self) -> Result<(), ApplyError>;
}

/// OS network configuration subsystem
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Apply the configuration written to disk
    async fn apply(&self) -> Result<(), ApplyError>;
}

/// Read-only endpoints checked after convergence
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthChecks: Send + Sync {
    /// Body of the API server's `/readyz`
    async fn api_readyz(&self) -> Result<String, ProbeError>;

    /// Pods in `namespace` whose names start with `prefix`
    async fn pods(&self, namespace: &str, prefix: &str) -> Result<Vec<PodHealth>, ProbeError>;

    /// Status code the ingress at `address` answers for `host`
    async fn route_status(
        &self,
        address: IpAddr,
        host: &str,
        https: bool,
    ) -> Result<u16, ProbeError>;
}

/// DNS resolver used for sanity reporting only
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Addresses `host` resolves to; empty when it doesn't resolve
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ProbeError>;
}

/// Everything steps talk to
#[derive(Clone)]
pub struct Collaborators {
    /// Control-plane API
    pub cluster: Arc<dyn ClusterApi>,
    /// Chart installer
    pub charts: Arc<dyn ChartInstaller>,
    /// Host operations
    pub host: Arc<dyn HostOps>,
    /// Network configuration
    pub network: Arc<dyn NetworkBackend>,
    /// DNS resolver
    pub resolver: Arc<dyn NameResolver>,
    /// Post-convergence health endpoints
    pub health: Arc<dyn HealthChecks>,
}

impl Collaborators {
    /// Real implementations against this host and the cluster behind `kubeconfig`
    pub fn system(kubeconfig: PathBuf) -> Self {
        let kube = Arc::new(cluster::KubeClusterApi::new(kubeconfig.clone()));
        Self {
            cluster: kube.clone(),
            charts: Arc::new(helm::HelmCli::new(kubeconfig)),
            host: Arc::new(host::LocalHost::new()),
            network: Arc::new(netplan::Netplan::new()),
            resolver: Arc::new(dns::SystemResolver),
            health: Arc::new(health::StackHealth::new(kube)),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
