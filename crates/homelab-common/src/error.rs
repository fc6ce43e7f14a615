//! Error types shared by the homelab crates
//!
//! Errors carry enough context (file paths, commands, resource names) to be
//! actionable when they surface in a convergence report.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for homelab operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Filesystem error with the path that was being touched
    #[error("io error on {}: {source}", path.display())]
    Io {
        /// Path being read or written
        path: PathBuf,
        /// The underlying I/O error
        source: std::io::Error,
    },

    /// Invalid desired-state configuration
    #[error("validation error at {field}: {message}")]
    Validation {
        /// Field path (e.g. "workloads[2].namespace")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// External command failed or could not be spawned
    #[error("command `{command}` failed: {message}")]
    Command {
        /// Command line that was run
        command: String,
        /// stderr or spawn error
        message: String,
    },

    /// Run lock could not be acquired
    #[error("run lock {} unavailable: {message}", path.display())]
    Lock {
        /// Lock file path
        path: PathBuf,
        /// Why the lock is unavailable
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

impl Error {
    /// Create an I/O error for a path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a validation error for a field path
    pub fn validation(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a command error
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create a lock error
    pub fn lock(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Lock {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }
}
