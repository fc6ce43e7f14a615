//! Control-plane API over kube-rs.
//!
//! Every write is a server-side apply of the whole object under homelab's
//! field manager, so re-applying an unchanged object is a no-op on the server.
//! The TLS section of ingresses is owned by a second field manager so that
//! re-applying a route's rules never drops it.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tokio::sync::OnceCell;
use tracing::debug;

use homelab_common::kube_utils::{
    apply_params, create_client, has_condition, managed_labels, CONDITION_AVAILABLE,
    CONDITION_READY,
};
use homelab_common::LABEL_NAME;
use homelab_pki::LeafMaterial;

use super::{ClusterApi, IngressState, IngressTls, WorkloadState};
use crate::desired::{IngressRoute, ResourceSpec, Workload};
use crate::error::{ApplyError, ProbeError};

/// Field manager owning `spec.tls` on route ingresses
pub const TLS_FIELD_MANAGER: &str = "homelab-tls";

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";

/// [`ClusterApi`] backed by a kube client built on first use.
///
/// The kubeconfig usually doesn't exist until the cluster is installed, so the
/// client can't be created up front.
pub struct KubeClusterApi {
    kubeconfig: PathBuf,
    client: OnceCell<Client>,
}

impl KubeClusterApi {
    /// API client for the cluster behind `kubeconfig`
    pub fn new(kubeconfig: PathBuf) -> Self {
        Self {
            kubeconfig,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<Client, homelab_common::Error> {
        self.client
            .get_or_try_init(|| async {
                debug!(kubeconfig = %self.kubeconfig.display(), "Creating kube client");
                create_client(Some(self.kubeconfig.as_path())).await
            })
            .await
            .cloned()
    }

    pub(crate) async fn probe_client(&self) -> Result<Client, ProbeError> {
        self.client()
            .await
            .map_err(|e| ProbeError::ControlPlane(e.to_string()))
    }

    async fn apply_client(&self) -> Result<Client, ApplyError> {
        self.client()
            .await
            .map_err(|e| ApplyError::ControlPlane(e.to_string()))
    }
}

pub(crate) fn probe_err(e: kube::Error) -> ProbeError {
    ProbeError::ControlPlane(e.to_string())
}

fn apply_err(e: kube::Error) -> ApplyError {
    ApplyError::ControlPlane(e.to_string())
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn node_ready(&self, node: &str) -> Result<Option<bool>, ProbeError> {
        let api: Api<Node> = Api::all(self.probe_client().await?);
        let node = api.get_opt(node).await.map_err(probe_err)?;
        Ok(node.map(|n| {
            let conditions = n.status.as_ref().and_then(|s| s.conditions.as_ref());
            has_condition(conditions.map(|c| c.as_slice()), CONDITION_READY)
        }))
    }

    async fn deployment_available(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<bool>, ProbeError> {
        let api: Api<Deployment> = Api::namespaced(self.probe_client().await?, namespace);
        let deployment = api.get_opt(name).await.map_err(probe_err)?;
        Ok(deployment.as_ref().map(deployment_is_available))
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, ProbeError> {
        let api: Api<Namespace> = Api::all(self.probe_client().await?);
        Ok(api.get_opt(name).await.map_err(probe_err)?.is_some())
    }

    async fn apply_namespace(&self, name: &str) -> Result<(), ApplyError> {
        let api: Api<Namespace> = Api::all(self.apply_client().await?);
        let ns = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": name,
                "labels": managed_labels(name)
            }
        });
        api.patch(name, &apply_params(), &Patch::Apply(&ns))
            .await
            .map_err(apply_err)?;
        Ok(())
    }

    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadState>, ProbeError> {
        let client = self.probe_client().await?;
        let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
        let Some(deployment) = deployments.get_opt(name).await.map_err(probe_err)? else {
            return Ok(None);
        };
        let services: Api<Service> = Api::namespaced(client, namespace);
        let service = services.get_opt(name).await.map_err(probe_err)?;
        Ok(Some(workload_state(&deployment, service.as_ref())))
    }

    async fn apply_workload(&self, workload: &Workload) -> Result<(), ApplyError> {
        let client = self.apply_client().await?;
        let deployments: Api<Deployment> = Api::namespaced(client.clone(), &workload.namespace);
        deployments
            .patch(
                &workload.name,
                &apply_params(),
                &Patch::Apply(&deployment_manifest(workload)),
            )
            .await
            .map_err(apply_err)?;

        let services: Api<Service> = Api::namespaced(client, &workload.namespace);
        services
            .patch(
                &workload.name,
                &apply_params(),
                &Patch::Apply(&service_manifest(workload)),
            )
            .await
            .map_err(apply_err)?;
        Ok(())
    }

    async fn get_ingress(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<IngressState>, ProbeError> {
        let api: Api<Ingress> = Api::namespaced(self.probe_client().await?, namespace);
        let ingress = api.get_opt(name).await.map_err(probe_err)?;
        Ok(ingress.as_ref().map(ingress_state))
    }

    async fn apply_ingress_route(&self, route: &IngressRoute) -> Result<(), ApplyError> {
        let api: Api<Ingress> = Api::namespaced(self.apply_client().await?, &route.namespace);
        api.patch(
            &route.ingress_name(),
            &apply_params(),
            &Patch::Apply(&ingress_manifest(route)),
        )
        .await
        .map_err(apply_err)?;
        Ok(())
    }

    async fn apply_ingress_tls(
        &self,
        route: &IngressRoute,
        secret_name: &str,
    ) -> Result<(), ApplyError> {
        let api: Api<Ingress> = Api::namespaced(self.apply_client().await?, &route.namespace);
        api.patch(
            &route.ingress_name(),
            &PatchParams::apply(TLS_FIELD_MANAGER).force(),
            &Patch::Apply(&ingress_tls_manifest(route, secret_name)),
        )
        .await
        .map_err(apply_err)?;
        Ok(())
    }

    async fn get_tls_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<LeafMaterial>, ProbeError> {
        let api: Api<Secret> = Api::namespaced(self.probe_client().await?, namespace);
        let secret = api.get_opt(name).await.map_err(probe_err)?;
        Ok(secret.as_ref().and_then(tls_secret_material))
    }

    async fn apply_tls_secret(
        &self,
        namespace: &str,
        name: &str,
        leaf: &LeafMaterial,
    ) -> Result<(), ApplyError> {
        let api: Api<Secret> = Api::namespaced(self.apply_client().await?, namespace);
        api.patch(
            name,
            &apply_params(),
            &Patch::Apply(&tls_secret(namespace, name, leaf)),
        )
        .await
        .map_err(apply_err)?;
        Ok(())
    }
}

fn deployment_is_available(deployment: &Deployment) -> bool {
    let conditions = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref());
    has_condition(conditions.map(|c| c.as_slice()), CONDITION_AVAILABLE)
}

fn quantities(
    map: Option<&BTreeMap<String, k8s_openapi::apimachinery::pkg::api::resource::Quantity>>,
) -> BTreeMap<String, String> {
    map.map(|m| m.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
        .unwrap_or_default()
}

fn workload_state(deployment: &Deployment, service: Option<&Service>) -> WorkloadState {
    let spec = deployment.spec.as_ref();
    let container = spec
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first());
    let resources = container.and_then(|c| c.resources.as_ref());

    WorkloadState {
        image: container
            .and_then(|c| c.image.clone())
            .unwrap_or_default(),
        replicas: spec.and_then(|s| s.replicas).unwrap_or(1),
        container_port: container
            .and_then(|c| c.ports.as_ref())
            .and_then(|p| p.first())
            .and_then(|p| u16::try_from(p.container_port).ok()),
        resources: ResourceSpec {
            requests: quantities(resources.and_then(|r| r.requests.as_ref())),
            limits: quantities(resources.and_then(|r| r.limits.as_ref())),
        },
        service_port: service
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.ports.as_ref())
            .and_then(|p| p.first())
            .and_then(|p| u16::try_from(p.port).ok()),
        available: deployment_is_available(deployment),
    }
}

fn ingress_state(ingress: &Ingress) -> IngressState {
    let spec = ingress.spec.as_ref();
    let rule = spec
        .and_then(|s| s.rules.as_ref())
        .and_then(|r| r.first());
    let backend = rule
        .and_then(|r| r.http.as_ref())
        .and_then(|h| h.paths.first())
        .and_then(|p| p.backend.service.as_ref());

    IngressState {
        host: rule.and_then(|r| r.host.clone()).unwrap_or_default(),
        service: backend.map(|b| b.name.clone()).unwrap_or_default(),
        port: backend
            .and_then(|b| b.port.as_ref())
            .and_then(|p| p.number)
            .and_then(|n| u16::try_from(n).ok())
            .unwrap_or(0),
        tls: spec
            .and_then(|s| s.tls.as_ref())
            .and_then(|t| t.first())
            .map(|t| IngressTls {
                hosts: t.hosts.clone().unwrap_or_default(),
                secret_name: t.secret_name.clone().unwrap_or_default(),
            }),
    }
}

fn tls_secret_material(secret: &Secret) -> Option<LeafMaterial> {
    let data = secret.data.as_ref()?;
    let cert = data.get(TLS_CERT_KEY)?;
    let key = data.get(TLS_KEY_KEY)?;
    Some(LeafMaterial {
        cert_pem: String::from_utf8_lossy(&cert.0).into_owned(),
        key_pem: String::from_utf8_lossy(&key.0).into_owned(),
    })
}

fn deployment_manifest(workload: &Workload) -> serde_json::Value {
    let labels = managed_labels(&workload.name);
    let selector = BTreeMap::from([(LABEL_NAME.to_string(), workload.name.clone())]);
    serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": workload.name,
            "namespace": workload.namespace,
            "labels": labels
        },
        "spec": {
            "replicas": workload.replicas,
            "selector": { "matchLabels": selector },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "containers": [{
                        "name": workload.name,
                        "image": workload.image,
                        "ports": [{ "containerPort": workload.port }],
                        "resources": {
                            "requests": workload.resources.requests,
                            "limits": workload.resources.limits
                        }
                    }]
                }
            }
        }
    })
}

fn service_manifest(workload: &Workload) -> serde_json::Value {
    let selector = BTreeMap::from([(LABEL_NAME.to_string(), workload.name.clone())]);
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": workload.name,
            "namespace": workload.namespace,
            "labels": managed_labels(&workload.name)
        },
        "spec": {
            "selector": selector,
            "ports": [{
                "port": workload.port,
                "targetPort": workload.port
            }]
        }
    })
}

fn ingress_manifest(route: &IngressRoute) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": route.ingress_name(),
            "namespace": route.namespace,
            "labels": managed_labels(&route.service)
        },
        "spec": {
            "rules": [{
                "host": route.hostname,
                "http": {
                    "paths": [{
                        "path": "/",
                        "pathType": "Prefix",
                        "backend": {
                            "service": {
                                "name": route.service,
                                "port": { "number": route.port }
                            }
                        }
                    }]
                }
            }]
        }
    })
}

fn ingress_tls_manifest(route: &IngressRoute, secret_name: &str) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": route.ingress_name(),
            "namespace": route.namespace
        },
        "spec": {
            "tls": [{
                "hosts": [route.hostname],
                "secretName": secret_name
            }]
        }
    })
}

fn tls_secret(namespace: &str, name: &str, leaf: &LeafMaterial) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels(name)),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(BTreeMap::from([
            (
                TLS_CERT_KEY.to_string(),
                ByteString(leaf.cert_pem.as_bytes().to_vec()),
            ),
            (
                TLS_KEY_KEY.to_string(),
                ByteString(leaf.key_pem.as_bytes().to_vec()),
            ),
        ])),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};

    fn whoami() -> Workload {
        Workload {
            name: "whoami".to_string(),
            namespace: "default".to_string(),
            image: "traefik/whoami:v1.10".to_string(),
            port: 80,
            replicas: 1,
            resources: ResourceSpec {
                requests: BTreeMap::from([("cpu".to_string(), "10m".to_string())]),
                limits: BTreeMap::new(),
            },
        }
    }

    fn route() -> IngressRoute {
        IngressRoute {
            hostname: "whoami.pizza".to_string(),
            namespace: "default".to_string(),
            service: "whoami".to_string(),
            port: 80,
            tls: true,
        }
    }

    #[test]
    fn manifests_round_trip_through_observed_state() {
        let workload = whoami();
        let mut deployment: Deployment =
            serde_json::from_value(deployment_manifest(&workload)).unwrap();
        let service: Service = serde_json::from_value(service_manifest(&workload)).unwrap();

        let state = workload_state(&deployment, Some(&service));
        assert_eq!(state.image, workload.image);
        assert_eq!(state.container_port, Some(80));
        assert_eq!(state.service_port, Some(80));
        assert_eq!(state.resources, workload.resources);
        assert!(!state.available);

        deployment.status = Some(DeploymentStatus {
            conditions: Some(vec![DeploymentCondition {
                type_: "Available".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(workload_state(&deployment, Some(&service)).available);
    }

    #[test]
    fn ingress_manifest_has_no_tls_section() {
        let ingress: Ingress = serde_json::from_value(ingress_manifest(&route())).unwrap();
        let state = ingress_state(&ingress);
        assert_eq!(state.host, "whoami.pizza");
        assert_eq!(state.service, "whoami");
        assert_eq!(state.port, 80);
        assert_eq!(state.tls, None);
        assert_eq!(ingress.metadata.name.as_deref(), Some("whoami-pizza"));
    }

    #[test]
    fn tls_patch_names_host_and_secret() {
        let ingress: Ingress =
            serde_json::from_value(ingress_tls_manifest(&route(), "homelab-tls")).unwrap();
        assert_eq!(
            ingress_state(&ingress).tls,
            Some(IngressTls {
                hosts: vec!["whoami.pizza".to_string()],
                secret_name: "homelab-tls".to_string(),
            })
        );
    }

    #[test]
    fn tls_secret_round_trips() {
        let leaf = LeafMaterial {
            cert_pem: "CERT".to_string(),
            key_pem: "KEY".to_string(),
        };
        let secret = tls_secret("default", "homelab-tls", &leaf);
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
        let material = tls_secret_material(&secret).unwrap();
        assert_eq!(material.cert_pem, "CERT");
        assert_eq!(material.key_pem, "KEY");
    }
}
