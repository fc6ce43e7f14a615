//! Step ordering and failure propagation.
//!
//! The category graph is fixed:
//!
//! ```text
//! network -> swap -> cluster-install -> core-services -> ingress-controller-ready
//!   -> application-workloads -> certificate-issuance -> ingress-tls-patch
//!   -> stack-health
//! application-workloads -> dns-sanity
//! ```
//!
//! Steps run in a topological order of that graph (ties broken by category
//! rank) and keep their declared order within a category.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::StepError;
use crate::step::{Criticality, Step, StepMode};

/// Named phase in the dependency graph. Declaration order is the tie-break rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepCategory {
    /// Hostname and interface addressing
    Network,
    /// Swap file
    Swap,
    /// Cluster config, binary, readiness, kubeconfig
    ClusterInstall,
    /// Namespaces and chart releases
    CoreServices,
    /// Ingress controller deployment available
    IngressControllerReady,
    /// Deployments, services, ingress routes
    ApplicationWorkloads,
    /// Root authority and leaf issuance, secret distribution
    CertificateIssuance,
    /// TLS sections on ingress routes
    IngressTlsPatch,
    /// Route hostnames resolve to the node
    DnsSanity,
    /// API, core pods and routes answer after convergence
    StackHealth,
}

impl StepCategory {
    /// Every category in rank order
    pub const ALL: [StepCategory; 10] = [
        Self::Network,
        Self::Swap,
        Self::ClusterInstall,
        Self::CoreServices,
        Self::IngressControllerReady,
        Self::ApplicationWorkloads,
        Self::CertificateIssuance,
        Self::IngressTlsPatch,
        Self::DnsSanity,
        Self::StackHealth,
    ];

    /// Kebab-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Swap => "swap",
            Self::ClusterInstall => "cluster-install",
            Self::CoreServices => "core-services",
            Self::IngressControllerReady => "ingress-controller-ready",
            Self::ApplicationWorkloads => "application-workloads",
            Self::CertificateIssuance => "certificate-issuance",
            Self::IngressTlsPatch => "ingress-tls-patch",
            Self::DnsSanity => "dns-sanity",
            Self::StackHealth => "stack-health",
        }
    }

    /// Direct prerequisites
    pub fn prerequisites(&self) -> &'static [StepCategory] {
        match self {
            Self::Network => &[],
            Self::Swap => &[Self::Network],
            Self::ClusterInstall => &[Self::Swap],
            Self::CoreServices => &[Self::ClusterInstall],
            Self::IngressControllerReady => &[Self::CoreServices],
            Self::ApplicationWorkloads => &[Self::IngressControllerReady],
            Self::CertificateIssuance => &[Self::ApplicationWorkloads],
            Self::IngressTlsPatch => &[Self::CertificateIssuance],
            Self::DnsSanity => &[Self::ApplicationWorkloads],
            Self::StackHealth => &[Self::IngressTlsPatch],
        }
    }

    /// Every category that transitively depends on this one
    pub fn dependents(&self) -> BTreeSet<StepCategory> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![*self];
        while let Some(current) = frontier.pop() {
            for candidate in Self::ALL {
                if candidate.prerequisites().contains(&current) && found.insert(candidate) {
                    frontier.push(candidate);
                }
            }
        }
        found
    }

    /// Topological order of the graph, lowest rank first among ready categories
    pub fn execution_order() -> Vec<StepCategory> {
        let mut done: BTreeSet<StepCategory> = BTreeSet::new();
        let mut order = Vec::with_capacity(Self::ALL.len());
        while order.len() < Self::ALL.len() {
            let next = Self::ALL.into_iter().find(|c| {
                !done.contains(c) && c.prerequisites().iter().all(|p| done.contains(p))
            });
            match next {
                Some(category) => {
                    done.insert(category);
                    order.push(category);
                }
                // the graph is a fixed DAG; unreachable unless it gains a cycle
                None => break,
            }
        }
        order
    }

    fn position(&self) -> usize {
        Self::execution_order()
            .iter()
            .position(|c| c == self)
            .unwrap_or(usize::MAX)
    }
}

impl fmt::Display for StepCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a recorded outcome affects the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Satisfied or applied
    Ok,
    /// Failed, but nothing depends on it
    Warning,
    /// Failed; dependent categories are blocked
    Fatal,
    /// Not executed because a prerequisite failed
    Blocked,
}

/// Ordered list of steps for one run
pub struct Plan {
    steps: Vec<Box<dyn Step>>,
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|s| s.id()))
            .finish()
    }
}

impl Plan {
    /// Order `steps` by category; declared order is kept within a category
    pub fn new(mut steps: Vec<Box<dyn Step>>) -> Self {
        // sort_by_key is stable
        steps.sort_by_key(|s| s.category().position());
        Self { steps }
    }

    /// Steps in execution order
    pub fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// One line per step: position, id and mode
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, step) in self.steps.iter().enumerate() {
            let mode = match step.mode() {
                StepMode::Converge => "converge",
                StepMode::AwaitReady(_) => "await",
                StepMode::Observe => "observe",
            };
            out.push_str(&format!("{:>3}. [{:<8}] {}\n", i + 1, mode, step.id()));
        }
        out
    }
}

/// Decide the disposition of a failed step.
///
/// `remaining` holds the steps planned after the failed one.
pub fn failure_disposition(
    step: &dyn Step,
    error: &StepError,
    remaining: &[Box<dyn Step>],
) -> Disposition {
    if step.criticality() == Criticality::Advisory {
        return Disposition::Warning;
    }
    if let StepError::TimedOut { .. } = error {
        let dependents = step.category().dependents();
        if !remaining
            .iter()
            .any(|s| dependents.contains(&s.category()))
        {
            return Disposition::Warning;
        }
    }
    Disposition::Fatal
}
