//! Test doubles: a scripted step and in-memory collaborators.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use homelab_common::retry::RetryConfig;
use homelab_pki::LeafMaterial;

use crate::collab::{
    ChartInstaller, ClusterApi, Collaborators, HealthChecks, HostOps, IngressState, IngressTls,
    NameResolver, NetworkBackend, PodHealth, ReleaseState, SwapState, WorkloadState,
};
use crate::desired::{ChartRelease, DesiredState, IngressRoute, Workload};
use crate::error::{ApplyError, ProbeError};
use crate::planner::StepCategory;
use crate::probe::ProbeResult;
use crate::resource::{ResourceKind, ResourceRef};
use crate::run::RunOptions;
use crate::step::{Criticality, Step, StepMode};

/// Step whose probe answers are scripted. The last answer repeats.
pub(crate) struct ScriptedStep {
    name: String,
    category: StepCategory,
    answers: Mutex<VecDeque<Result<ProbeResult, ProbeError>>>,
    mutate_error: Option<ApplyError>,
    mode: StepMode,
    criticality: Criticality,
    settle: Option<RetryConfig>,
    replaces_diverging: bool,
    mutations: AtomicUsize,
    probed: AtomicUsize,
}

impl ScriptedStep {
    pub(crate) fn new(name: &str, category: StepCategory) -> Self {
        Self {
            name: name.to_string(),
            category,
            answers: Mutex::new(VecDeque::from([Ok(ProbeResult::PresentMatching)])),
            mutate_error: None,
            mode: StepMode::Converge,
            criticality: Criticality::Required,
            settle: None,
            replaces_diverging: true,
            mutations: AtomicUsize::new(0),
            probed: AtomicUsize::new(0),
        }
    }

    pub(crate) fn boxed(name: &str, category: StepCategory) -> Box<dyn Step> {
        Self::new(name, category).into_boxed()
    }

    pub(crate) fn into_boxed(self) -> Box<dyn Step> {
        Box::new(self)
    }

    pub(crate) fn probes(self, answers: impl IntoIterator<Item = ProbeResult>) -> Self {
        self.probe_sequence(answers.into_iter().map(Ok).collect())
    }

    pub(crate) fn probe_sequence(self, answers: Vec<Result<ProbeResult, ProbeError>>) -> Self {
        *self.answers.lock().unwrap() = answers.into();
        self
    }

    pub(crate) fn probe_error(self, error: ProbeError) -> Self {
        self.probe_sequence(vec![Err(error)])
    }

    pub(crate) fn failing_mutate(mut self, error: ApplyError) -> Self {
        self.mutate_error = Some(error);
        self
    }

    pub(crate) fn preserving(mut self) -> Self {
        self.replaces_diverging = false;
        self
    }

    pub(crate) fn settling(mut self, policy: RetryConfig) -> Self {
        self.settle = Some(policy);
        self
    }

    pub(crate) fn awaiting(mut self, policy: RetryConfig) -> Self {
        self.mode = StepMode::AwaitReady(policy);
        self
    }

    pub(crate) fn observing(mut self) -> Self {
        self.mode = StepMode::Observe;
        self
    }

    pub(crate) fn advisory(mut self) -> Self {
        self.criticality = Criticality::Advisory;
        self
    }

    pub(crate) fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub(crate) fn probe_count(&self) -> usize {
        self.probed.load(Ordering::SeqCst)
    }

    fn kind(&self) -> ResourceKind {
        match self.category {
            StepCategory::Network => ResourceKind::NetworkConfig,
            StepCategory::Swap => ResourceKind::SwapFile,
            StepCategory::ClusterInstall => ResourceKind::ClusterNode,
            StepCategory::CoreServices => ResourceKind::Namespace,
            StepCategory::IngressControllerReady | StepCategory::ApplicationWorkloads => {
                ResourceKind::Deployment
            }
            StepCategory::CertificateIssuance => ResourceKind::LeafCertificate,
            StepCategory::IngressTlsPatch => ResourceKind::Ingress,
            StepCategory::DnsSanity => ResourceKind::DnsRecord,
            StepCategory::StackHealth => ResourceKind::Route,
        }
    }
}

#[async_trait]
impl Step for ScriptedStep {
    fn category(&self) -> StepCategory {
        self.category
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::new(self.kind(), &self.name)
    }

    fn mode(&self) -> StepMode {
        self.mode.clone()
    }

    fn criticality(&self) -> Criticality {
        self.criticality
    }

    fn settle(&self) -> Option<RetryConfig> {
        self.settle.clone()
    }

    fn replaces_diverging(&self) -> bool {
        self.replaces_diverging
    }

    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        self.probed.fetch_add(1, Ordering::SeqCst);
        let mut answers = self.answers.lock().unwrap();
        if answers.len() > 1 {
            answers.pop_front().unwrap()
        } else {
            answers.front().cloned().unwrap()
        }
    }

    async fn mutate(&self) -> Result<(), ApplyError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        match &self.mutate_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Retry policy that gives up after `attempts` near-instant probes
pub(crate) fn quick(attempts: u32) -> RetryConfig {
    RetryConfig::fixed(attempts, Duration::from_millis(1))
}

/// Run options rooted in `dir` with near-instant waits
pub(crate) fn quick_options(dir: &Path) -> RunOptions {
    let mut options = RunOptions::new(dir.join("state"));
    options.cluster_ready = quick(3);
    options.controller_ready = quick(3);
    options.rollout = quick(3);
    options
}

/// Sample desired state with every file it names moved under `dir`.
///
/// The kubeconfig is seeded the way the installer leaves it.
pub(crate) fn desired_in(dir: &Path) -> DesiredState {
    let mut desired = crate::desired::tests::sample();
    desired.network.config_path = dir.join("netplan.yaml");
    desired.swap.path = dir.join("swapfile");
    desired.cluster.config_path = dir.join("k3s-config.yaml");
    desired.cluster.kubeconfig = dir.join("k3s.yaml");
    std::fs::write(
        &desired.cluster.kubeconfig,
        "apiVersion: v1\nclusters:\n- cluster:\n    server: https://127.0.0.1:6443\n  name: default\n",
    )
    .unwrap();
    desired
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// In-memory cluster. Writes take effect immediately.
#[derive(Default)]
pub(crate) struct FakeCluster {
    pub(crate) node_ready: Mutex<Option<bool>>,
    pub(crate) controller_available: Mutex<bool>,
    pub(crate) rollouts_stall: Mutex<bool>,
    pub(crate) namespaces: Mutex<BTreeSet<String>>,
    pub(crate) workloads: Mutex<BTreeMap<Key, WorkloadState>>,
    pub(crate) ingresses: Mutex<BTreeMap<Key, IngressState>>,
    pub(crate) secrets: Mutex<BTreeMap<Key, LeafMaterial>>,
    pub(crate) secret_writes: AtomicUsize,
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn node_ready(&self, _node: &str) -> Result<Option<bool>, ProbeError> {
        Ok(*self.node_ready.lock().unwrap())
    }

    async fn deployment_available(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<bool>, ProbeError> {
        if let Some(w) = self.workloads.lock().unwrap().get(&key(namespace, name)) {
            return Ok(Some(w.available));
        }
        Ok(Some(*self.controller_available.lock().unwrap()))
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, ProbeError> {
        Ok(self.namespaces.lock().unwrap().contains(name))
    }

    async fn apply_namespace(&self, name: &str) -> Result<(), ApplyError> {
        self.namespaces.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadState>, ProbeError> {
        Ok(self
            .workloads
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned())
    }

    async fn apply_workload(&self, workload: &Workload) -> Result<(), ApplyError> {
        let state = WorkloadState {
            image: workload.image.clone(),
            replicas: workload.replicas,
            container_port: Some(workload.port),
            resources: workload.resources.clone(),
            service_port: Some(workload.port),
            available: !*self.rollouts_stall.lock().unwrap(),
        };
        self.workloads
            .lock()
            .unwrap()
            .insert(key(&workload.namespace, &workload.name), state);
        Ok(())
    }

    async fn get_ingress(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<IngressState>, ProbeError> {
        Ok(self
            .ingresses
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned())
    }

    async fn apply_ingress_route(&self, route: &IngressRoute) -> Result<(), ApplyError> {
        let mut ingresses = self.ingresses.lock().unwrap();
        let k = key(&route.namespace, &route.ingress_name());
        let tls = ingresses.get(&k).and_then(|i| i.tls.clone());
        ingresses.insert(
            k,
            IngressState {
                host: route.hostname.clone(),
                service: route.service.clone(),
                port: route.port,
                tls,
            },
        );
        Ok(())
    }

    async fn apply_ingress_tls(
        &self,
        route: &IngressRoute,
        secret_name: &str,
    ) -> Result<(), ApplyError> {
        let mut ingresses = self.ingresses.lock().unwrap();
        let ingress = ingresses
            .get_mut(&key(&route.namespace, &route.ingress_name()))
            .ok_or_else(|| ApplyError::ControlPlane("ingress not found".to_string()))?;
        ingress.tls = Some(IngressTls {
            hosts: vec![route.hostname.clone()],
            secret_name: secret_name.to_string(),
        });
        Ok(())
    }

    async fn get_tls_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<LeafMaterial>, ProbeError> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned())
    }

    async fn apply_tls_secret(
        &self,
        namespace: &str,
        name: &str,
        leaf: &LeafMaterial,
    ) -> Result<(), ApplyError> {
        self.secret_writes.fetch_add(1, Ordering::SeqCst);
        self.secrets
            .lock()
            .unwrap()
            .insert(key(namespace, name), leaf.clone());
        Ok(())
    }
}

/// In-memory chart installer
#[derive(Default)]
pub(crate) struct FakeCharts {
    pub(crate) releases: Mutex<BTreeMap<Key, ReleaseState>>,
    pub(crate) installs: AtomicUsize,
}

#[async_trait]
impl ChartInstaller for FakeCharts {
    async fn get_release(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReleaseState>, ProbeError> {
        Ok(self
            .releases
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned())
    }

    async fn install_or_upgrade(&self, release: &ChartRelease) -> Result<(), ApplyError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        let state = ReleaseState {
            chart: release.chart.clone(),
            version: release.version.clone().unwrap_or_else(|| "1.0.0".to_string()),
            status: "deployed".to_string(),
            values: release.values.clone(),
        };
        self.releases
            .lock()
            .unwrap()
            .insert(key(&release.namespace, &release.name), state);
        Ok(())
    }
}

/// In-memory host
#[derive(Default)]
pub(crate) struct FakeHost {
    pub(crate) hostname: Mutex<String>,
    pub(crate) swap: Mutex<Option<SwapState>>,
    pub(crate) cluster_version: Mutex<Option<String>>,
    pub(crate) installs: AtomicUsize,
    pub(crate) restarts: AtomicUsize,
}

#[async_trait]
impl HostOps for FakeHost {
    async fn hostname(&self) -> Result<String, ProbeError> {
        Ok(self.hostname.lock().unwrap().clone())
    }

    async fn set_hostname(&self, hostname: &str) -> Result<(), ApplyError> {
        *self.hostname.lock().unwrap() = hostname.to_string();
        Ok(())
    }

    async fn swap_state(&self, _path: &Path) -> Result<Option<SwapState>, ProbeError> {
        Ok(self.swap.lock().unwrap().clone())
    }

    async fn ensure_swap(&self, _path: &Path, size_mib: u64) -> Result<(), ApplyError> {
        *self.swap.lock().unwrap() = Some(SwapState {
            size_mib,
            active: true,
            persistent: true,
        });
        Ok(())
    }

    async fn cluster_version(&self) -> Result<Option<String>, ProbeError> {
        Ok(self.cluster_version.lock().unwrap().clone())
    }

    async fn install_cluster(&self, version: Option<String>) -> Result<(), ApplyError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        *self.cluster_version.lock().unwrap() =
            Some(version.unwrap_or_else(|| "v1.30.4+k3s1".to_string()));
        Ok(())
    }

    async fn restart_cluster(&self) -> Result<(), ApplyError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts applies
#[derive(Default)]
pub(crate) struct FakeNetwork {
    pub(crate) applies: AtomicUsize,
}

#[async_trait]
impl NetworkBackend for FakeNetwork {
    async fn apply(&self) -> Result<(), ApplyError> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fixed answers; unknown names don't resolve
#[derive(Default)]
pub(crate) struct FakeResolver {
    pub(crate) answers: Mutex<BTreeMap<String, Vec<IpAddr>>>,
}

impl FakeResolver {
    pub(crate) fn point(&self, host: &str, address: IpAddr) {
        self.answers
            .lock()
            .unwrap()
            .insert(host.to_string(), vec![address]);
    }
}

#[async_trait]
impl NameResolver for FakeResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ProbeError> {
        Ok(self
            .answers
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .unwrap_or_default())
    }
}

/// Healthy stack unless a route status is overridden
#[derive(Default)]
pub(crate) struct FakeHealth {
    pub(crate) route_statuses: Mutex<BTreeMap<String, u16>>,
}

#[async_trait]
impl HealthChecks for FakeHealth {
    async fn api_readyz(&self) -> Result<String, ProbeError> {
        Ok("ok".to_string())
    }

    async fn pods(&self, _namespace: &str, prefix: &str) -> Result<Vec<PodHealth>, ProbeError> {
        Ok(vec![PodHealth {
            name: format!("{}-0", prefix),
            phase: "Running".to_string(),
            ready: true,
        }])
    }

    async fn route_status(
        &self,
        _address: IpAddr,
        host: &str,
        _https: bool,
    ) -> Result<u16, ProbeError> {
        Ok(self
            .route_statuses
            .lock()
            .unwrap()
            .get(host)
            .copied()
            .unwrap_or(200))
    }
}

/// One fake per collaborator, shared with the steps through [`Fakes::collaborators`]
#[derive(Clone)]
pub(crate) struct Fakes {
    pub(crate) cluster: Arc<FakeCluster>,
    pub(crate) charts: Arc<FakeCharts>,
    pub(crate) host: Arc<FakeHost>,
    pub(crate) network: Arc<FakeNetwork>,
    pub(crate) resolver: Arc<FakeResolver>,
    pub(crate) health: Arc<FakeHealth>,
}

impl Fakes {
    pub(crate) fn collaborators(&self) -> Collaborators {
        Collaborators {
            cluster: self.cluster.clone(),
            charts: self.charts.clone(),
            host: self.host.clone(),
            network: self.network.clone(),
            resolver: self.resolver.clone(),
            health: self.health.clone(),
        }
    }

    /// Point every route hostname of `desired` at its node address
    pub(crate) fn with_dns_for(self, desired: &DesiredState) -> Self {
        for route in &desired.ingress_routes {
            self.resolver.point(&route.hostname, desired.node_address());
        }
        self
    }
}

/// Fresh machine: nothing configured, node and controller ready once asked
pub(crate) fn fakes() -> Fakes {
    let fakes = Fakes {
        cluster: Arc::new(FakeCluster::default()),
        charts: Arc::new(FakeCharts::default()),
        host: Arc::new(FakeHost::default()),
        network: Arc::new(FakeNetwork::default()),
        resolver: Arc::new(FakeResolver::default()),
        health: Arc::new(FakeHealth::default()),
    };
    *fakes.cluster.node_ready.lock().unwrap() = Some(true);
    *fakes.cluster.controller_available.lock().unwrap() = true;
    fakes
}
