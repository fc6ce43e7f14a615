//! Desired-state description of the node.
//!
//! Loaded once from YAML, validated, then shared by reference with every
//! step. Nothing downstream mutates it.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use homelab_common::{Error, Result};
use homelab_pki::SanSet;
use serde::{Deserialize, Serialize};

use crate::quantity::{parse_quantity, same_quantities};

/// Default k3s kubeconfig location
pub const DEFAULT_KUBECONFIG: &str = "/etc/rancher/k3s/k3s.yaml";
/// Default k3s server config location
pub const DEFAULT_CLUSTER_CONFIG: &str = "/etc/rancher/k3s/config.yaml";
/// Default netplan file owned by homelab
pub const DEFAULT_NETPLAN_FILE: &str = "/etc/netplan/60-homelab.yaml";
/// Default swap file
pub const DEFAULT_SWAP_PATH: &str = "/swapfile";
/// API server port written into the kubeconfig
pub const API_SERVER_PORT: u16 = 6443;

/// Complete target description for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DesiredState {
    /// Static hostname
    pub hostname: String,
    /// Interface addressing
    pub network: NetworkSpec,
    /// Swap file
    pub swap: SwapSpec,
    /// Cluster identity and install options
    pub cluster: ClusterSpec,
    /// Ingress controller deployment to wait for
    #[serde(default)]
    pub ingress_controller: IngressControllerSpec,
    /// Chart releases (GitOps controller, observability stack)
    #[serde(default)]
    pub releases: Vec<ChartRelease>,
    /// Plain deployments with a service
    #[serde(default)]
    pub workloads: Vec<Workload>,
    /// Host-based ingress routes
    #[serde(default)]
    pub ingress_routes: Vec<IngressRoute>,
    /// Ingress TLS
    #[serde(default)]
    pub tls: TlsSpec,
    /// What to do with an ingress that exists but differs
    #[serde(default)]
    pub ingress_policy: IngressPolicy,
    /// Checks run once everything else converged
    #[serde(default)]
    pub health: HealthSpec,
}

/// Static addressing for the node's primary interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkSpec {
    /// Interface name (e.g. `eth0`)
    pub interface: String,
    /// Node address
    pub address: IpAddr,
    /// Prefix length for `address`
    pub prefix_length: u8,
    /// Default gateway
    pub gateway: IpAddr,
    /// DNS servers
    pub nameservers: Vec<IpAddr>,
    /// DNS search domains
    #[serde(default)]
    pub search_domains: Vec<String>,
    /// Netplan file to own
    #[serde(default = "default_netplan_file")]
    pub config_path: PathBuf,
}

/// Swap file target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SwapSpec {
    /// Swap file path
    #[serde(default = "default_swap_path")]
    pub path: PathBuf,
    /// Size in MiB
    pub size_mib: u64,
}

/// Cluster identity and install options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterSpec {
    /// Kubernetes node name
    pub node_name: String,
    /// Address the API server binds to; defaults to the node address
    #[serde(default)]
    pub bind_address: Option<IpAddr>,
    /// Interface for the pod network; defaults to the network interface
    #[serde(default)]
    pub interface: Option<String>,
    /// Extra API server certificate SANs
    #[serde(default)]
    pub tls_sans: Vec<String>,
    /// Pinned k3s version (e.g. `v1.30.4+k3s1`); latest stable when unset
    #[serde(default)]
    pub version: Option<String>,
    /// Kubeconfig written by the installer
    #[serde(default = "default_kubeconfig")]
    pub kubeconfig: PathBuf,
    /// Server config file
    #[serde(default = "default_cluster_config")]
    pub config_path: PathBuf,
    /// Extra `key: value` entries for the server config
    #[serde(default)]
    pub extra_args: BTreeMap<String, String>,
}

/// Ingress controller deployment that must be available before workloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IngressControllerSpec {
    /// Namespace of the controller deployment
    pub namespace: String,
    /// Controller deployment name
    pub deployment: String,
}

impl Default for IngressControllerSpec {
    fn default() -> Self {
        Self {
            namespace: "kube-system".to_string(),
            deployment: "traefik".to_string(),
        }
    }
}

/// Post-convergence health checks. They only report; nothing is changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthSpec {
    /// Namespace of the components bundled with the cluster
    #[serde(default = "default_system_namespace")]
    pub namespace: String,
    /// Pod name prefixes that must have a running, ready pod
    #[serde(default = "default_core_pods")]
    pub core_pods: Vec<String>,
    /// Also request TLS routes over HTTPS, accepting the self-signed leaf
    #[serde(default)]
    pub https: bool,
}

impl Default for HealthSpec {
    fn default() -> Self {
        Self {
            namespace: default_system_namespace(),
            core_pods: default_core_pods(),
            https: false,
        }
    }
}

/// Named chart release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChartRelease {
    /// Release name
    pub name: String,
    /// Target namespace
    pub namespace: String,
    /// Chart name in the repository
    pub chart: String,
    /// Chart repository URL
    pub repo: String,
    /// Pinned chart version
    #[serde(default)]
    pub version: Option<String>,
    /// Flat `--set` values
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

/// Deployment plus service. Identity = (name, namespace)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Workload {
    /// Deployment and service name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Container image reference
    pub image: String,
    /// Container and service port
    pub port: u16,
    /// Replica count
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    /// Resource requests and limits
    #[serde(default)]
    pub resources: ResourceSpec,
}

/// Container resource requests and limits as quantity strings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceSpec {
    /// e.g. `cpu: 50m`
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    /// e.g. `memory: 128Mi`
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

impl ResourceSpec {
    /// Same requests and limits by value, ignoring how quantities are written
    pub fn matches(&self, observed: &ResourceSpec) -> bool {
        same_quantities(&self.requests, &observed.requests)
            && same_quantities(&self.limits, &observed.limits)
    }

    fn validate(&self, field: &str) -> Result<()> {
        for (section, map) in [("requests", &self.requests), ("limits", &self.limits)] {
            for (name, value) in map {
                if parse_quantity(value).is_none() {
                    return Err(Error::validation(
                        format!("{}.{}.{}", field, section, name),
                        format!("{:?} is not a resource quantity", value),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Host-based route to a service. Identity = hostname
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IngressRoute {
    /// Host the route answers for
    pub hostname: String,
    /// Namespace of the ingress and service
    pub namespace: String,
    /// Target service name
    pub service: String,
    /// Target service port
    pub port: u16,
    /// Serve over TLS with the issued leaf
    #[serde(default)]
    pub tls: bool,
}

impl IngressRoute {
    /// Name of the Ingress object derived from the hostname
    pub fn ingress_name(&self) -> String {
        self.hostname.replace('.', "-")
    }
}

/// TLS policy for ingress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsPolicy {
    /// No certificates issued
    #[default]
    Disabled,
    /// Local root authority issues one leaf
    SelfSigned,
}

/// Ingress TLS configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TlsSpec {
    /// Issuance policy
    #[serde(default)]
    pub policy: TlsPolicy,
    /// Names the leaf must cover
    #[serde(default)]
    pub fqdns: Vec<String>,
    /// Name of the TLS secret in each namespace
    #[serde(default = "default_secret_name")]
    pub secret_name: String,
    /// Namespaces receiving a copy of the secret; defaults to the TLS routes' namespaces
    #[serde(default)]
    pub secret_namespaces: Vec<String>,
}

impl Default for TlsSpec {
    fn default() -> Self {
        Self {
            policy: TlsPolicy::Disabled,
            fqdns: Vec::new(),
            secret_name: default_secret_name(),
            secret_namespaces: Vec::new(),
        }
    }
}

/// Handling of an ingress that exists with different content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngressPolicy {
    /// Replace it with the declared route
    #[default]
    Overwrite,
    /// Leave it alone and report the divergence as a warning
    Preserve,
}

fn default_netplan_file() -> PathBuf {
    PathBuf::from(DEFAULT_NETPLAN_FILE)
}

fn default_swap_path() -> PathBuf {
    PathBuf::from(DEFAULT_SWAP_PATH)
}

fn default_kubeconfig() -> PathBuf {
    PathBuf::from(DEFAULT_KUBECONFIG)
}

fn default_cluster_config() -> PathBuf {
    PathBuf::from(DEFAULT_CLUSTER_CONFIG)
}

fn default_system_namespace() -> String {
    "kube-system".to_string()
}

fn default_core_pods() -> Vec<String> {
    ["coredns", "traefik", "metrics-server", "local-path-provisioner"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_replicas() -> i32 {
    1
}

fn default_secret_name() -> String {
    "homelab-tls".to_string()
}

impl DesiredState {
    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let desired: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::serialization(format!("invalid desired state: {}", e)))?;
        desired.validate()?;
        Ok(desired)
    }

    /// Read, parse and validate a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_yaml(&yaml)
    }

    /// Address the cluster binds to and advertises
    pub fn node_address(&self) -> IpAddr {
        self.cluster.bind_address.unwrap_or(self.network.address)
    }

    /// Interface for the pod network
    pub fn cluster_interface(&self) -> &str {
        self.cluster
            .interface
            .as_deref()
            .unwrap_or(&self.network.interface)
    }

    /// SAN set the ingress leaf must carry
    pub fn leaf_sans(&self) -> SanSet {
        SanSet::new(&self.tls.fqdns)
    }

    /// Whether the local authority is in play
    pub fn tls_enabled(&self) -> bool {
        self.tls.policy == TlsPolicy::SelfSigned
    }

    /// Namespaces that receive the TLS secret, in first-seen order
    pub fn secret_namespaces(&self) -> Vec<String> {
        let declared = if self.tls.secret_namespaces.is_empty() {
            self.ingress_routes
                .iter()
                .filter(|r| r.tls)
                .map(|r| r.namespace.clone())
                .collect()
        } else {
            self.tls.secret_namespaces.clone()
        };
        dedup_in_order(declared)
    }

    /// Namespaces homelab creates, in first-seen order
    pub fn namespaces(&self) -> Vec<String> {
        let all = self
            .releases
            .iter()
            .map(|r| r.namespace.clone())
            .chain(self.workloads.iter().map(|w| w.namespace.clone()))
            .chain(self.ingress_routes.iter().map(|r| r.namespace.clone()))
            .chain(self.secret_namespaces());
        dedup_in_order(all)
    }

    /// Check everything that can be checked before touching the system
    pub fn validate(&self) -> Result<()> {
        require_dns_label("hostname", &self.hostname)?;
        require_non_empty("network.interface", &self.network.interface)?;

        let max_prefix = match self.network.address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if self.network.prefix_length == 0 || self.network.prefix_length > max_prefix {
            return Err(Error::validation(
                "network.prefixLength",
                format!(
                    "{} is outside 1..={} for {}",
                    self.network.prefix_length, max_prefix, self.network.address
                ),
            ));
        }
        if self.network.gateway.is_ipv4() != self.network.address.is_ipv4() {
            return Err(Error::validation(
                "network.gateway",
                "gateway and address must be the same address family",
            ));
        }
        if self.network.nameservers.is_empty() {
            return Err(Error::validation(
                "network.nameservers",
                "at least one nameserver is required",
            ));
        }

        if self.swap.size_mib == 0 {
            return Err(Error::validation("swap.sizeMib", "must be greater than 0"));
        }
        if !self.swap.path.is_absolute() {
            return Err(Error::validation("swap.path", "must be an absolute path"));
        }

        require_dns_label("cluster.nodeName", &self.cluster.node_name)?;
        require_dns_subdomain(
            "ingressController.namespace",
            &self.ingress_controller.namespace,
        )?;
        require_dns_subdomain(
            "ingressController.deployment",
            &self.ingress_controller.deployment,
        )?;

        let mut releases = BTreeSet::new();
        for (i, release) in self.releases.iter().enumerate() {
            require_dns_label(&format!("releases[{}].name", i), &release.name)?;
            require_dns_label(&format!("releases[{}].namespace", i), &release.namespace)?;
            require_non_empty(&format!("releases[{}].chart", i), &release.chart)?;
            require_non_empty(&format!("releases[{}].repo", i), &release.repo)?;
            if !releases.insert((&release.namespace, &release.name)) {
                return Err(Error::validation(
                    format!("releases[{}]", i),
                    format!("duplicate release {}/{}", release.namespace, release.name),
                ));
            }
        }

        let mut workloads = BTreeSet::new();
        for (i, workload) in self.workloads.iter().enumerate() {
            require_dns_label(&format!("workloads[{}].name", i), &workload.name)?;
            require_dns_label(&format!("workloads[{}].namespace", i), &workload.namespace)?;
            require_non_empty(&format!("workloads[{}].image", i), &workload.image)?;
            if workload.port == 0 {
                return Err(Error::validation(
                    format!("workloads[{}].port", i),
                    "must be greater than 0",
                ));
            }
            if workload.replicas < 1 {
                return Err(Error::validation(
                    format!("workloads[{}].replicas", i),
                    "must be at least 1",
                ));
            }
            workload
                .resources
                .validate(&format!("workloads[{}].resources", i))?;
            if !workloads.insert((workload.namespace.as_str(), workload.name.as_str())) {
                return Err(Error::validation(
                    format!("workloads[{}]", i),
                    format!(
                        "duplicate workload {}/{}",
                        workload.namespace, workload.name
                    ),
                ));
            }
        }

        require_dns_label("health.namespace", &self.health.namespace)?;
        for (i, prefix) in self.health.core_pods.iter().enumerate() {
            require_dns_label(&format!("health.corePods[{}]", i), prefix)?;
        }

        let release_namespaces: BTreeSet<&str> =
            self.releases.iter().map(|r| r.namespace.as_str()).collect();
        let mut hostnames = BTreeSet::new();
        for (i, route) in self.ingress_routes.iter().enumerate() {
            require_dns_subdomain(&format!("ingressRoutes[{}].hostname", i), &route.hostname)?;
            require_dns_label(&format!("ingressRoutes[{}].namespace", i), &route.namespace)?;
            require_dns_label(&format!("ingressRoutes[{}].service", i), &route.service)?;
            if !hostnames.insert(route.hostname.to_ascii_lowercase()) {
                return Err(Error::validation(
                    format!("ingressRoutes[{}].hostname", i),
                    format!("duplicate route for {}", route.hostname),
                ));
            }
            let targets_workload =
                workloads.contains(&(route.namespace.as_str(), route.service.as_str()));
            let targets_release = release_namespaces.contains(route.namespace.as_str());
            if !targets_workload && !targets_release {
                return Err(Error::validation(
                    format!("ingressRoutes[{}].service", i),
                    format!(
                        "{}/{} is neither a declared workload nor in a release namespace",
                        route.namespace, route.service
                    ),
                ));
            }
        }

        if self.tls_enabled() {
            if self.leaf_sans().is_empty() {
                return Err(Error::validation(
                    "tls.fqdns",
                    "self-signed policy needs at least one FQDN",
                ));
            }
            require_dns_subdomain("tls.secretName", &self.tls.secret_name)?;
            for (i, ns) in self.tls.secret_namespaces.iter().enumerate() {
                require_dns_label(&format!("tls.secretNamespaces[{}]", i), ns)?;
            }
            let sans = self.leaf_sans();
            if let Some(route) = self
                .ingress_routes
                .iter()
                .find(|r| r.tls && !sans.contains(&r.hostname))
            {
                return Err(Error::validation(
                    "tls.fqdns",
                    format!("TLS route {} is not covered by tls.fqdns", route.hostname),
                ));
            }
        } else if let Some(route) = self.ingress_routes.iter().find(|r| r.tls) {
            return Err(Error::validation(
                "tls.policy",
                format!("route {} wants TLS but policy is disabled", route.hostname),
            ));
        }

        Ok(())
    }
}

fn dedup_in_order(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(field, "must not be empty"));
    }
    Ok(())
}

/// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric at both ends, max 63
fn require_dns_label(field: &str, value: &str) -> Result<()> {
    require_non_empty(field, value)?;
    if !is_dns_label(value) {
        return Err(Error::validation(
            field,
            format!("'{}' is not a valid DNS-1123 label", value),
        ));
    }
    Ok(())
}

/// RFC 1123 subdomain: dot-separated labels, max 253
fn require_dns_subdomain(field: &str, value: &str) -> Result<()> {
    require_non_empty(field, value)?;
    if value.len() > 253 || !value.split('.').all(is_dns_label) {
        return Err(Error::validation(
            field,
            format!("'{}' is not a valid DNS-1123 subdomain", value),
        ));
    }
    Ok(())
}

fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}
