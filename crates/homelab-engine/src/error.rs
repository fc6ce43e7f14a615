//! Step failure taxonomy
//!
//! Probe and apply errors carry rendered messages rather than source errors so
//! a recorded outcome can be cloned into the report and compared in tests.

use homelab_pki::PkiError;
use thiserror::Error;

use crate::planner::StepCategory;

/// The inspection mechanism itself failed (not "resource absent")
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    /// Control-plane API unreachable or answered with an error other than 404
    #[error("control plane unreachable: {0}")]
    ControlPlane(String),

    /// External tool could not be run or failed
    #[error("`{tool}` failed: {message}")]
    Tool {
        /// Command that failed
        tool: String,
        /// stderr or spawn error
        message: String,
    },

    /// File exists but could not be read
    #[error("cannot read {path}: {message}")]
    Unreadable {
        /// File path
        path: String,
        /// Underlying error
        message: String,
    },

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl From<homelab_common::Error> for ProbeError {
    fn from(err: homelab_common::Error) -> Self {
        match err {
            homelab_common::Error::Kube { source } => Self::ControlPlane(source.to_string()),
            homelab_common::Error::Io { path, source } => Self::Unreadable {
                path: path.display().to_string(),
                message: source.to_string(),
            },
            homelab_common::Error::Command { command, message } => Self::Tool {
                tool: command,
                message,
            },
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<PkiError> for ProbeError {
    fn from(err: PkiError) -> Self {
        match err {
            PkiError::Storage(inner) => inner.into(),
            other => Self::Other(other.to_string()),
        }
    }
}

/// A mutation was attempted and failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    /// Control-plane write rejected or unreachable
    #[error("control plane write failed: {0}")]
    ControlPlane(String),

    /// External tool failed
    #[error("`{command}` failed: {message}")]
    Command {
        /// Command that failed
        command: String,
        /// stderr or spawn error
        message: String,
    },

    /// File could not be written
    #[error("cannot write {path}: {message}")]
    Write {
        /// File path
        path: String,
        /// Underlying error
        message: String,
    },

    /// Authority material could not be produced
    #[error("certificate authority: {0}")]
    Authority(String),

    /// Step has nothing to mutate (observation or readiness gate)
    #[error("step {0} does not mutate")]
    Unsupported(String),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl From<homelab_common::Error> for ApplyError {
    fn from(err: homelab_common::Error) -> Self {
        match err {
            homelab_common::Error::Kube { source } => Self::ControlPlane(source.to_string()),
            homelab_common::Error::Io { path, source } => Self::Write {
                path: path.display().to_string(),
                message: source.to_string(),
            },
            homelab_common::Error::Command { command, message } => {
                Self::Command { command, message }
            }
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<PkiError> for ApplyError {
    fn from(err: PkiError) -> Self {
        match err {
            PkiError::Storage(inner) => inner.into(),
            other => Self::Authority(other.to_string()),
        }
    }
}

impl From<ProbeError> for ApplyError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::ControlPlane(message) => Self::ControlPlane(message),
            ProbeError::Tool { tool, message } => Self::Command {
                command: tool,
                message,
            },
            other => Self::Other(other.to_string()),
        }
    }
}

/// Why a step did not reach its postcondition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    /// Current state could not be inspected
    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),

    /// Mutation failed
    #[error("apply failed: {0}")]
    Apply(#[from] ApplyError),

    /// Readiness never arrived within the retry budget
    #[error("timed out after {attempts} attempts (last seen: {last})")]
    TimedOut {
        /// Attempts made
        attempts: u32,
        /// Last observation
        last: String,
    },

    /// An earlier category failed fatally
    #[error("dependency unmet: {category} did not converge")]
    DependencyUnmet {
        /// The failed prerequisite category
        category: StepCategory,
    },

    /// Post-mutation probe (or an observation) did not match
    #[error("verification failed: {actual}")]
    VerificationFailed {
        /// What was observed instead
        actual: String,
    },
}
