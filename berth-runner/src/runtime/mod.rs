//! Container runtime abstraction
//!
//! The runner talks to the container engine only through the
//! `ContainerRuntime` trait. `DockerRuntime` is the real implementation;
//! tests use the in-memory runtime from the `testing` module.

mod docker;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use berth_core::{ImageReference, PortMap};
use futures::stream::BoxStream;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by the container runtime
///
/// Cloneable so a single failure can be handed to every waiter of a shared
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The referenced object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The object already exists or is in a conflicting state
    #[error("conflict: {0}")]
    Conflict(String),

    /// The runtime could not be reached
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    /// Any other failure reported by the runtime
    #[error("container runtime error: {0}")]
    Api(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// A container found by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
}

/// Everything the runtime needs to create a service container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    /// `KEY=value` entries
    pub env: Vec<String>,
    pub command: Option<Vec<String>>,
    pub ports: PortMap,
    pub binds: Vec<String>,
}

/// One demultiplexed chunk of container output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFrame {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Combined stdout/stderr stream of an attached container
///
/// Dropping the stream closes the underlying connection.
pub type OutputStream = BoxStream<'static, Result<OutputFrame, RuntimeError>>;

/// One progress message of an image pull
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullProgress {
    pub id: Option<String>,
    pub status: Option<String>,
    pub progress: Option<String>,
}

impl fmt::Display for PullProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [&self.id, &self.status, &self.progress];
        let mut first = true;
        for part in parts.into_iter().flatten() {
            if !first {
                f.write_str(" ")?;
            }
            if first && self.id.is_some() {
                write!(f, "{part}:")?;
            } else {
                f.write_str(part)?;
            }
            first = false;
        }
        Ok(())
    }
}

pub type PullStream = BoxStream<'static, Result<PullProgress, RuntimeError>>;

/// Registry credentials
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RegistryAuth {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub server_address: Option<String>,
    #[serde(default)]
    pub identity_token: Option<String>,
    #[serde(default)]
    pub registry_token: Option<String>,
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("email", &self.email)
            .field("server_address", &self.server_address)
            .field("identity_token", &redact(&self.identity_token))
            .field("registry_token", &redact(&self.registry_token))
            .finish()
    }
}

/// Operations the runner needs from a container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Lists containers (running or not) whose name is exactly `name`
    async fn list_containers(&self, name: &str) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Force-removes a container together with its anonymous volumes
    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Creates a named container, returning its id
    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, RuntimeError>;

    async fn network_exists(&self, network: &str) -> Result<bool, RuntimeError>;

    /// Creates a network; `RuntimeError::Conflict` if it already exists
    async fn create_network(&self, network: &str) -> Result<(), RuntimeError>;

    async fn connect_network(&self, network: &str, container_id: &str)
    -> Result<(), RuntimeError>;

    /// Attaches to the container's combined output, including what it
    /// already logged
    async fn attach_output(&self, container_id: &str) -> Result<OutputStream, RuntimeError>;

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Stops a container
    ///
    /// `None` leaves the grace period to the runtime; `Some(Duration::ZERO)`
    /// kills immediately.
    async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), RuntimeError>;

    /// Pulls an image, streaming progress until it is present
    fn pull_image(&self, image: &ImageReference, auth: Option<RegistryAuth>) -> PullStream;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_progress_display() {
        let progress = PullProgress {
            id: Some("a1b2".to_string()),
            status: Some("Downloading".to_string()),
            progress: Some("[==>  ] 1MB/5MB".to_string()),
        };
        assert_eq!(progress.to_string(), "a1b2: Downloading [==>  ] 1MB/5MB");

        let status_only = PullProgress {
            status: Some("Pulling from library/redis".to_string()),
            ..Default::default()
        };
        assert_eq!(status_only.to_string(), "Pulling from library/redis");
        assert_eq!(PullProgress::default().to_string(), "");
    }

    #[test]
    fn test_registry_auth_debug_redacts_secrets() {
        let auth = RegistryAuth {
            username: Some("ci".to_string()),
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let debug = format!("{auth:?}");
        assert!(debug.contains("ci"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_runtime_error_predicates() {
        assert!(RuntimeError::NotFound("x".into()).is_not_found());
        assert!(RuntimeError::Conflict("x".into()).is_conflict());
        assert!(!RuntimeError::Api("x".into()).is_conflict());
    }
}
