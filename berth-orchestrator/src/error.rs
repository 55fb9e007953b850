//! Error types for the orchestrator

use std::time::Duration;

use berth_core::DescriptorError;
use berth_runner::{PullError, RunnerError, RuntimeError};
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Fatal orchestrator errors
///
/// Problems while stopping services are not errors; they are collected in a
/// `StopReport`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The service is not in the catalog
    #[error("there's no service named {name:?}")]
    UnknownService { name: String },

    /// The service was already started by this orchestrator
    #[error("service {name:?} was already started")]
    AlreadyStarted { name: String },

    #[error("invalid configuration: {0}")]
    Config(#[source] anyhow::Error),

    #[error(transparent)]
    Descriptors(#[from] DescriptorError),

    #[error("can't pull image for service {service:?}: {source}")]
    Pull {
        service: String,
        #[source]
        source: PullError,
    },

    #[error(transparent)]
    Start(#[from] RunnerError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl OrchestratorError {
    /// Whether this is a usage error (unknown or duplicate service)
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownService { .. } | Self::AlreadyStarted { .. }
        )
    }
}

/// Errors from readiness probes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("condition not met within {0:?}")]
    TimedOut(Duration),

    #[error("wait cancelled")]
    Cancelled,
}
