//! Typed references to the things steps converge.

use std::fmt;

/// Closed set of resource kinds the engine manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// Static hostname
    Hostname,
    /// OS network configuration file
    NetworkConfig,
    /// Swap file
    SwapFile,
    /// Cluster server config file
    ClusterConfig,
    /// Cluster binary and service
    ClusterBinary,
    /// Control-plane node readiness
    ClusterNode,
    /// Kubeconfig file
    Kubeconfig,
    /// Namespace
    Namespace,
    /// Chart release
    ChartRelease,
    /// Deployment plus service
    Deployment,
    /// Ingress object
    Ingress,
    /// Root authority material
    RootAuthority,
    /// Leaf certificate material
    LeafCertificate,
    /// TLS secret
    Secret,
    /// DNS record
    DnsRecord,
    /// API server health endpoint
    ApiEndpoint,
    /// Pods of a bundled component
    CorePod,
    /// Host route answered through the ingress
    Route,
}

impl ResourceKind {
    /// Lowercase kind name used in step ids and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hostname => "hostname",
            Self::NetworkConfig => "network-config",
            Self::SwapFile => "swap-file",
            Self::ClusterConfig => "cluster-config",
            Self::ClusterBinary => "cluster-binary",
            Self::ClusterNode => "cluster-node",
            Self::Kubeconfig => "kubeconfig",
            Self::Namespace => "namespace",
            Self::ChartRelease => "chart-release",
            Self::Deployment => "deployment",
            Self::Ingress => "ingress",
            Self::RootAuthority => "root-authority",
            Self::LeafCertificate => "leaf-certificate",
            Self::Secret => "secret",
            Self::DnsRecord => "dns-record",
            Self::ApiEndpoint => "api-endpoint",
            Self::CorePod => "core-pod",
            Self::Route => "route",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(kind, namespace?, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    /// Resource kind
    pub kind: ResourceKind,
    /// Namespace for namespaced cluster objects
    pub namespace: Option<String>,
    /// Name, path or hostname
    pub name: String,
}

impl ResourceRef {
    /// Reference to a host-level or cluster-scoped resource
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.into(),
        }
    }

    /// Reference to a namespaced cluster object
    pub fn namespaced(
        kind: ResourceKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}
