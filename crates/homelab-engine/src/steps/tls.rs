//! Local certificate authority, leaf issuance and TLS distribution.
//!
//! Root material is never replaced once written. A corrupt root stops the
//! TLS branch of the plan instead of being regenerated, since every client
//! that trusted the old root would silently stop trusting the ingress.

use std::sync::Arc;

use async_trait::async_trait;
use homelab_pki::{AuthorityStore, LeafState, RootState, SanSet};
use tracing::info;

use crate::collab::{ClusterApi, IngressTls};
use crate::desired::{IngressPolicy, IngressRoute};
use crate::error::{ApplyError, ProbeError};
use crate::planner::StepCategory;
use crate::probe::ProbeResult;
use crate::resource::{ResourceKind, ResourceRef};
use crate::step::{Criticality, Step};

/// Root authority material in the state directory
pub struct RootAuthorityStep {
    pub(crate) store: AuthorityStore,
}

#[async_trait]
impl Step for RootAuthorityStep {
    fn category(&self) -> StepCategory {
        StepCategory::CertificateIssuance
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::new(
            ResourceKind::RootAuthority,
            self.store.root_cert_path().display().to_string(),
        )
    }

    fn replaces_diverging(&self) -> bool {
        false
    }

    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        Ok(match self.store.root_state()? {
            RootState::Absent => ProbeResult::Absent,
            RootState::Present(_) => ProbeResult::PresentMatching,
            RootState::Corrupt(reason) => ProbeResult::diverging(reason),
        })
    }

    async fn mutate(&self) -> Result<(), ApplyError> {
        let (_, created) = self.store.ensure_root()?;
        if created {
            info!(dir = %self.store.dir().display(), "Root authority ready; distribute root-ca.crt to clients");
        }
        Ok(())
    }
}

/// Leaf certificate covering exactly the configured FQDNs
pub struct LeafCertificateStep {
    pub(crate) store: AuthorityStore,
    pub(crate) sans: SanSet,
}

#[async_trait]
impl Step for LeafCertificateStep {
    fn category(&self) -> StepCategory {
        StepCategory::CertificateIssuance
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::new(
            ResourceKind::LeafCertificate,
            self.store.leaf_cert_path().display().to_string(),
        )
    }

    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        let RootState::Present(ca) = self.store.root_state()? else {
            return Ok(match self.store.load_leaf()? {
                Some(_) => ProbeResult::diverging("root authority unavailable"),
                None => ProbeResult::Absent,
            });
        };
        Ok(match self.store.leaf_state(&ca, &self.sans)? {
            LeafState::Absent => ProbeResult::Absent,
            LeafState::Current => ProbeResult::PresentMatching,
            LeafState::Stale { reason } => ProbeResult::diverging(reason),
        })
    }

    async fn mutate(&self) -> Result<(), ApplyError> {
        let RootState::Present(ca) = self.store.root_state()? else {
            return Err(ApplyError::Authority(
                "root authority unavailable".to_string(),
            ));
        };
        self.store.ensure_leaf(&ca, &self.sans)?;
        Ok(())
    }
}

/// Copy of the current leaf as a TLS secret in one namespace
pub struct TlsSecretStep {
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) store: AuthorityStore,
    pub(crate) namespace: String,
    pub(crate) secret_name: String,
}

#[async_trait]
impl Step for TlsSecretStep {
    fn category(&self) -> StepCategory {
        StepCategory::CertificateIssuance
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::namespaced(ResourceKind::Secret, &self.namespace, &self.secret_name)
    }

    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        let Some(secret) = self
            .cluster
            .get_tls_secret(&self.namespace, &self.secret_name)
            .await?
        else {
            return Ok(ProbeResult::Absent);
        };
        let Some(leaf) = self.store.load_leaf()? else {
            return Ok(ProbeResult::diverging("no leaf on disk"));
        };
        Ok(
            if secret.cert_pem == leaf.cert_pem && secret.key_pem == leaf.key_pem {
                ProbeResult::PresentMatching
            } else {
                ProbeResult::diverging("holds a different certificate")
            },
        )
    }

    async fn mutate(&self) -> Result<(), ApplyError> {
        let leaf = self
            .store
            .load_leaf()?
            .ok_or_else(|| ApplyError::Authority("no leaf certificate issued".to_string()))?;
        self.cluster
            .apply_tls_secret(&self.namespace, &self.secret_name, &leaf)
            .await
    }
}

/// TLS section of one route's ingress
pub struct IngressTlsStep {
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) route: IngressRoute,
    pub(crate) secret_name: String,
    pub(crate) policy: IngressPolicy,
}

impl IngressTlsStep {
    fn desired(&self) -> IngressTls {
        IngressTls {
            hosts: vec![self.route.hostname.clone()],
            secret_name: self.secret_name.clone(),
        }
    }
}

#[async_trait]
impl Step for IngressTlsStep {
    fn category(&self) -> StepCategory {
        StepCategory::IngressTlsPatch
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::namespaced(
            ResourceKind::Ingress,
            &self.route.namespace,
            self.route.ingress_name(),
        )
    }

    fn criticality(&self) -> Criticality {
        match self.policy {
            IngressPolicy::Overwrite => Criticality::Required,
            IngressPolicy::Preserve => Criticality::Advisory,
        }
    }

    fn replaces_diverging(&self) -> bool {
        self.policy == IngressPolicy::Overwrite
    }

    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        let Some(ingress) = self
            .cluster
            .get_ingress(&self.route.namespace, &self.route.ingress_name())
            .await?
        else {
            return Ok(ProbeResult::Absent);
        };
        Ok(match ingress.tls {
            None => ProbeResult::Absent,
            Some(tls) if tls == self.desired() => ProbeResult::PresentMatching,
            Some(tls) => ProbeResult::diverging(format!(
                "secret {} for [{}]",
                tls.secret_name,
                tls.hosts.join(", ")
            )),
        })
    }

    async fn mutate(&self) -> Result<(), ApplyError> {
        let exists = self
            .cluster
            .get_ingress(&self.route.namespace, &self.route.ingress_name())
            .await
            .map_err(|e| ApplyError::ControlPlane(e.to_string()))?
            .is_some();
        if !exists {
            return Err(ApplyError::Other(format!(
                "ingress {} does not exist",
                self.route.ingress_name()
            )));
        }
        self.cluster
            .apply_ingress_tls(&self.route, &self.secret_name)
            .await
    }
}
