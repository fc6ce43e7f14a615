//! Concrete steps and the catalogue that builds them from a desired state.

pub mod cluster;
pub mod dns;
pub mod health;
pub mod network;
pub mod services;
pub mod swap;
pub mod tls;
pub mod workloads;

use homelab_common::Result;
use homelab_pki::AuthorityStore;

use crate::collab::Collaborators;
use crate::desired::DesiredState;
use crate::planner::Plan;
use crate::run::RunOptions;
use crate::step::Step;

/// Every step the desired state calls for, in declared order.
///
/// Within a category the order here is the execution order, so a step that
/// needs a sibling's result comes after it (config before binary, root
/// before leaf before secrets).
pub fn catalogue(
    desired: &DesiredState,
    collab: &Collaborators,
    options: &RunOptions,
) -> Result<Vec<Box<dyn Step>>> {
    let mut steps: Vec<Box<dyn Step>> = Vec::new();

    steps.push(Box::new(network::HostnameStep {
        host: collab.host.clone(),
        hostname: desired.hostname.clone(),
    }));
    steps.push(Box::new(network::NetworkConfigStep::new(
        collab.network.clone(),
        &desired.network,
    )?));

    steps.push(Box::new(swap::SwapStep {
        host: collab.host.clone(),
        path: desired.swap.path.clone(),
        size_mib: desired.swap.size_mib,
    }));

    steps.push(Box::new(cluster::ClusterConfigStep {
        host: collab.host.clone(),
        path: desired.cluster.config_path.clone(),
        contents: cluster::render_cluster_config(desired)?,
    }));
    steps.push(Box::new(cluster::ClusterBinaryStep {
        host: collab.host.clone(),
        version: desired.cluster.version.clone(),
    }));
    steps.push(Box::new(cluster::ClusterReadyStep {
        cluster: collab.cluster.clone(),
        node_name: desired.cluster.node_name.clone(),
        policy: options.cluster_ready.clone(),
    }));
    steps.push(Box::new(cluster::KubeconfigStep {
        path: desired.cluster.kubeconfig.clone(),
        server: cluster::node_server(desired.node_address()),
    }));

    for namespace in desired.namespaces() {
        steps.push(Box::new(services::NamespaceStep {
            cluster: collab.cluster.clone(),
            name: namespace,
        }));
    }
    for release in &desired.releases {
        steps.push(Box::new(services::ReleaseStep {
            charts: collab.charts.clone(),
            release: release.clone(),
        }));
    }

    steps.push(Box::new(services::IngressControllerStep {
        cluster: collab.cluster.clone(),
        namespace: desired.ingress_controller.namespace.clone(),
        deployment: desired.ingress_controller.deployment.clone(),
        policy: options.controller_ready.clone(),
    }));

    for workload in &desired.workloads {
        steps.push(Box::new(workloads::WorkloadStep {
            cluster: collab.cluster.clone(),
            workload: workload.clone(),
            rollout: options.rollout.clone(),
        }));
    }
    for route in &desired.ingress_routes {
        steps.push(Box::new(workloads::IngressRouteStep {
            cluster: collab.cluster.clone(),
            route: route.clone(),
            policy: desired.ingress_policy,
        }));
    }

    if desired.tls_enabled() {
        let store = AuthorityStore::in_state_dir(&options.state_dir);
        steps.push(Box::new(tls::RootAuthorityStep {
            store: store.clone(),
        }));
        steps.push(Box::new(tls::LeafCertificateStep {
            store: store.clone(),
            sans: desired.leaf_sans(),
        }));
        for namespace in desired.secret_namespaces() {
            steps.push(Box::new(tls::TlsSecretStep {
                cluster: collab.cluster.clone(),
                store: store.clone(),
                namespace,
                secret_name: desired.tls.secret_name.clone(),
            }));
        }
        for route in desired.ingress_routes.iter().filter(|r| r.tls) {
            steps.push(Box::new(tls::IngressTlsStep {
                cluster: collab.cluster.clone(),
                route: route.clone(),
                secret_name: desired.tls.secret_name.clone(),
                policy: desired.ingress_policy,
            }));
        }
    }

    for route in &desired.ingress_routes {
        steps.push(Box::new(dns::DnsRecordStep {
            resolver: collab.resolver.clone(),
            hostname: route.hostname.clone(),
            expected: desired.node_address(),
        }));
    }

    steps.push(Box::new(health::ApiReadyStep {
        health: collab.health.clone(),
    }));
    for component in &desired.health.core_pods {
        steps.push(Box::new(health::CorePodStep {
            health: collab.health.clone(),
            namespace: desired.health.namespace.clone(),
            component: component.clone(),
        }));
    }
    for route in &desired.ingress_routes {
        steps.push(Box::new(health::RouteReachableStep {
            health: collab.health.clone(),
            address: desired.node_address(),
            hostname: route.hostname.clone(),
            https: false,
        }));
        if desired.health.https && route.tls && desired.tls_enabled() {
            steps.push(Box::new(health::RouteReachableStep {
                health: collab.health.clone(),
                address: desired.node_address(),
                hostname: route.hostname.clone(),
                https: true,
            }));
        }
    }

    Ok(steps)
}

/// [`catalogue`] ordered into a [`Plan`]
pub fn plan(desired: &DesiredState, collab: &Collaborators, options: &RunOptions) -> Result<Plan> {
    Ok(Plan::new(catalogue(desired, collab, options)?))
}
