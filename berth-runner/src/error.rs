//! Error types for the runner

use berth_core::{EnvFileError, PortSpecError, ReferenceError};
use thiserror::Error;

use crate::runtime::RuntimeError;

/// Errors from pulling an image
///
/// Cloneable because every concurrent waiter on the same image receives the
/// same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PullError {
    #[error(transparent)]
    InvalidReference(#[from] ReferenceError),

    #[error("can't pull image {image}: {source}")]
    Runtime {
        image: String,
        #[source]
        source: RuntimeError,
    },

    /// The caller stopped waiting; the pull itself may still be running
    #[error("pull of image {image} cancelled")]
    Cancelled { image: String },
}

impl PullError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Fatal errors from starting a service container
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("service {service} was already started")]
    AlreadyStarted { service: String },

    #[error("service {service}: {source}")]
    Pull {
        service: String,
        #[source]
        source: PullError,
    },

    #[error("service {service}: can't remove existing container {container_id}: {source}")]
    RemoveExisting {
        service: String,
        container_id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("service {service}: {source}")]
    EnvFile {
        service: String,
        #[source]
        source: EnvFileError,
    },

    #[error("service {service}: {source}")]
    Ports {
        service: String,
        #[source]
        source: PortSpecError,
    },

    #[error("service {service}: can't {action}: {source}")]
    Runtime {
        service: String,
        action: &'static str,
        #[source]
        source: RuntimeError,
    },

    #[error("service {service}: start cancelled")]
    Cancelled { service: String },
}

impl RunnerError {
    /// Name of the service that failed to start
    pub fn service(&self) -> &str {
        match self {
            Self::AlreadyStarted { service }
            | Self::Pull { service, .. }
            | Self::RemoveExisting { service, .. }
            | Self::EnvFile { service, .. }
            | Self::Ports { service, .. }
            | Self::Runtime { service, .. }
            | Self::Cancelled { service } => service,
        }
    }
}

/// Non-fatal errors from stopping a service container
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StopError {
    #[error("service {service}: can't stop container {container_id}: {source}")]
    Container {
        service: String,
        container_id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("service {service}: log relay for container {container_id} failed: {source}")]
    LogRelay {
        service: String,
        container_id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("service {service}: stop of container {container_id} cancelled while waiting for logs")]
    Cancelled {
        service: String,
        container_id: String,
    },
}

impl StopError {
    pub fn service(&self) -> &str {
        match self {
            Self::Container { service, .. }
            | Self::LogRelay { service, .. }
            | Self::Cancelled { service, .. } => service,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_service() {
        let err = RunnerError::Runtime {
            service: "redis".to_string(),
            action: "create container",
            source: RuntimeError::Api("no space left".to_string()),
        };
        assert_eq!(err.service(), "redis");
        assert_eq!(
            err.to_string(),
            "service redis: can't create container: container runtime error: no space left"
        );

        let stop = StopError::Cancelled {
            service: "proxy".to_string(),
            container_id: "abc".to_string(),
        };
        assert_eq!(stop.service(), "proxy");
        assert!(stop.to_string().contains("cancelled"));
    }

    #[test]
    fn test_pull_error_is_cloneable() {
        let err = PullError::Runtime {
            image: "redis:6".to_string(),
            source: RuntimeError::Unavailable("socket".to_string()),
        };
        assert_eq!(err.clone(), err);
        assert!(!err.is_cancelled());
        assert!(
            PullError::Cancelled {
                image: "redis:6".to_string()
            }
            .is_cancelled()
        );
    }
}
