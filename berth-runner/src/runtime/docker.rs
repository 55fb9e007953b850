//! Docker container runtime
//!
//! Implements `ContainerRuntime` on top of the Docker Engine API via bollard.
//! Connection settings follow the usual local defaults (`DOCKER_HOST` or the
//! local socket).

use async_trait::async_trait;
use berth_core::ImageReference;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, InspectNetworkOptions};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    ContainerRuntime, ContainerSpec, ContainerSummary, OutputFrame, OutputStream, PullProgress,
    PullStream, RegistryAuth, RuntimeError,
};

impl From<DockerError> for RuntimeError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::NotFound(message),
            DockerError::DockerResponseServerError {
                status_code: 409,
                message,
            } => Self::Conflict(message),
            DockerError::IOError { .. } => Self::Unavailable(err.to_string()),
            other => Self::Api(other.to_string()),
        }
    }
}

impl From<RegistryAuth> for DockerCredentials {
    fn from(auth: RegistryAuth) -> Self {
        Self {
            username: auth.username,
            password: auth.password,
            email: auth.email,
            serveraddress: auth.server_address,
            identitytoken: auth.identity_token,
            registrytoken: auth.registry_token,
            ..Default::default()
        }
    }
}

/// Whole seconds for a stop grace period, rounded up
fn grace_secs(timeout: Duration) -> i64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Container runtime backed by a Docker daemon
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using the local defaults
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        info!("Connected to Docker daemon");
        Ok(Self { docker })
    }

    /// Wraps an already configured client
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, name: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        // The name filter is a regex over names, which carry a leading '/'
        let filters: HashMap<String, Vec<String>> =
            [("name".to_string(), vec![format!("^/{name}$")])]
                .into_iter()
                .collect();

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    names: c.names.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await?;
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, RuntimeError> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .exposed
            .iter()
            .map(|port| (port.clone(), HashMap::new()))
            .collect();

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .ports
            .bindings
            .iter()
            .map(|(port, bindings)| {
                let bindings = bindings
                    .iter()
                    .map(|b| PortBinding {
                        host_ip: b.host_ip.clone(),
                        host_port: b.host_port.clone(),
                    })
                    .collect();
                (port.clone(), Some(bindings))
            })
            .collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            cmd: spec.command.clone(),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            debug!("Docker warning creating {}: {}", name, warning);
        }
        Ok(response.id)
    }

    async fn network_exists(&self, network: &str) -> Result<bool, RuntimeError> {
        match self
            .docker
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => match RuntimeError::from(err) {
                RuntimeError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn create_network(&self, network: &str) -> Result<(), RuntimeError> {
        let options = CreateNetworkOptions {
            name: network.to_string(),
            check_duplicate: true,
            ..Default::default()
        };
        self.docker.create_network(options).await?;
        Ok(())
    }

    async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
    ) -> Result<(), RuntimeError> {
        let options = ConnectNetworkOptions {
            container: container_id.to_string(),
            ..Default::default()
        };
        self.docker.connect_network(network, options).await?;
        Ok(())
    }

    async fn attach_output(&self, container_id: &str) -> Result<OutputStream, RuntimeError> {
        let options = AttachContainerOptions::<String> {
            stream: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            logs: Some(true),
            ..Default::default()
        };
        let attached = self
            .docker
            .attach_container(container_id, Some(options))
            .await?;

        let output = attached.output.filter_map(|item| async move {
            match item {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(OutputFrame::Stdout(message.to_vec())))
                }
                Ok(LogOutput::StdErr { message }) => Some(Ok(OutputFrame::Stderr(message.to_vec()))),
                Ok(LogOutput::StdIn { .. }) => None,
                Err(err) => Some(Err(RuntimeError::from(err))),
            }
        });
        Ok(output.boxed())
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), RuntimeError> {
        let options = timeout.map(|t| StopContainerOptions {
            t: grace_secs(t),
        });
        self.docker.stop_container(container_id, options).await?;
        Ok(())
    }

    fn pull_image(&self, image: &ImageReference, auth: Option<RegistryAuth>) -> PullStream {
        let options = CreateImageOptions {
            from_image: image.name(),
            tag: image.pull_tag().to_string(),
            ..Default::default()
        };

        self.docker
            .create_image(Some(options), None, auth.map(DockerCredentials::from))
            .map(|item| {
                item.map(|info| PullProgress {
                    id: info.id,
                    status: info.status,
                    progress: info.progress,
                })
                .map_err(RuntimeError::from)
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grace_secs_rounds_up() {
        assert_eq!(grace_secs(Duration::ZERO), 0);
        assert_eq!(grace_secs(Duration::from_millis(500)), 1);
        assert_eq!(grace_secs(Duration::from_secs(10)), 10);
        assert_eq!(grace_secs(Duration::from_millis(10_001)), 11);
    }

    #[test]
    fn test_error_mapping() {
        let not_found = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        };
        let conflict = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "name in use".to_string(),
        };
        let other = DockerError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };

        assert!(matches!(RuntimeError::from(not_found), RuntimeError::NotFound(m) if m == "no such container"));
        assert!(matches!(RuntimeError::from(conflict), RuntimeError::Conflict(_)));
        assert!(matches!(RuntimeError::from(other), RuntimeError::Api(_)));
    }
}
