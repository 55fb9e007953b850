//! Container runner
//!
//! Drives one service container through its lifecycle:
//!
//! `Unstarted -> Pulled -> ExistingRemoved -> Created -> NetworkAttached
//! -> LogRelaying -> Running -> Stopping -> Stopped`
//!
//! `LogRelaying` is skipped for services whose logs are ignored. Every step of
//! `start` is fatal on failure; `stop` reports problems without giving up.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use berth_core::env::merge_env_files;
use berth_core::{ServiceDescriptor, parse_port_specs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::RunnerContext;
use crate::error::{RunnerError, StopError};
use crate::relay::{LogRelay, RelayOutcome};
use crate::runtime::{ContainerSpec, RuntimeError};

/// Lifecycle state of a `ContainerRunner`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Unstarted,
    Pulled,
    ExistingRemoved,
    Created,
    NetworkAttached,
    LogRelaying,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unstarted => "unstarted",
            Self::Pulled => "pulled",
            Self::ExistingRemoved => "existing removed",
            Self::Created => "created",
            Self::NetworkAttached => "network attached",
            Self::LogRelaying => "log relaying",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Runs a single service container
pub struct ContainerRunner {
    name: String,
    descriptor: ServiceDescriptor,
    context: RunnerContext,
    state: RunnerState,
    container_id: Option<String>,
    relay: Option<LogRelay>,
}

impl ContainerRunner {
    /// Creates a runner for the service `name`; nothing happens until `start`
    pub fn new(name: impl Into<String>, descriptor: ServiceDescriptor, context: RunnerContext) -> Self {
        Self {
            name: name.into(),
            descriptor,
            context,
            state: RunnerState::Unstarted,
            container_id: None,
            relay: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Id of the container, once created
    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    /// Network the container joins
    pub fn network(&self) -> &str {
        self.descriptor
            .network
            .as_deref()
            .unwrap_or(&self.context.default_network)
    }

    pub fn is_running(&self) -> bool {
        self.state == RunnerState::Running
    }

    /// Starts the service container
    ///
    /// Pulls the image, replaces any leftover container with the same name,
    /// creates the container, joins it to its network, relays its output
    /// unless logs are ignored, and starts it. Any failure aborts the start.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<(), RunnerError> {
        if self.state != RunnerState::Unstarted {
            return Err(RunnerError::AlreadyStarted {
                service: self.name.clone(),
            });
        }

        info!("Starting service {} ({})", self.name, self.descriptor.image);

        if let Err(source) = self
            .context
            .puller
            .pull(cancel, &self.descriptor.image)
            .await
        {
            error!("Service {}: can't pull image: {}", self.name, source);
            return Err(RunnerError::Pull {
                service: self.name.clone(),
                source,
            });
        }
        self.state = RunnerState::Pulled;

        self.remove_existing(cancel).await?;
        self.state = RunnerState::ExistingRemoved;

        let spec = self.container_spec()?;
        let runtime = self.context.runtime.clone();
        let container_id = self
            .step(cancel, "create container", runtime.create_container(&self.name, &spec))
            .await?;
        debug!("Service {}: created container {}", self.name, container_id);
        self.container_id = Some(container_id.clone());
        self.state = RunnerState::Created;

        self.attach_network(cancel, &container_id).await?;
        self.state = RunnerState::NetworkAttached;

        if self.descriptor.ignore_logs {
            debug!("Service {}: not relaying logs", self.name);
        } else {
            let output = self
                .step(cancel, "attach to container output", runtime.attach_output(&container_id))
                .await?;
            self.relay = Some(LogRelay::spawn(&self.name, output, self.context.sink.clone()));
            self.state = RunnerState::LogRelaying;
        }

        self.step(cancel, "start container", runtime.start_container(&container_id))
            .await?;
        self.state = RunnerState::Running;

        info!("Service {} is running (container {})", self.name, container_id);
        Ok(())
    }

    /// Stops the service container
    ///
    /// Does nothing for a runner that was never started or is already
    /// stopped. Otherwise asks the runtime to stop the container, then waits
    /// for the log relay to drain or for `cancel`. The relay's connection is
    /// closed either way. Problems are returned, not raised.
    ///
    /// # Arguments
    /// * `cancel` - Cuts the wait short; reported as `StopError::Cancelled`
    /// * `timeout` - Grace period before the container is killed; `None` uses
    ///   the runtime's default and `Some(Duration::ZERO)` kills immediately
    pub async fn stop(
        &mut self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Vec<StopError> {
        let container_id = match (&self.container_id, self.state) {
            (_, RunnerState::Unstarted | RunnerState::Stopped) | (None, _) => return Vec::new(),
            (Some(id), _) => id.clone(),
        };

        info!("Stopping service {} (container {})", self.name, container_id);
        self.state = RunnerState::Stopping;
        let mut errors = Vec::new();

        let stopped = tokio::select! {
            result = self.context.runtime.stop_container(&container_id, timeout) => Some(result),
            _ = cancel.cancelled() => None,
        };
        let stop_cancelled = stopped.is_none();
        match stopped {
            Some(Ok(())) => {}
            Some(Err(source)) => errors.push(StopError::Container {
                service: self.name.clone(),
                container_id: container_id.clone(),
                source,
            }),
            None => errors.push(StopError::Cancelled {
                service: self.name.clone(),
                container_id: container_id.clone(),
            }),
        }

        if let Some(relay) = self.relay.take() {
            match relay.finish(cancel).await {
                RelayOutcome::Completed => {}
                RelayOutcome::Failed(source) => errors.push(StopError::LogRelay {
                    service: self.name.clone(),
                    container_id: container_id.clone(),
                    source,
                }),
                RelayOutcome::Cancelled if stop_cancelled => {}
                RelayOutcome::Cancelled => errors.push(StopError::Cancelled {
                    service: self.name.clone(),
                    container_id: container_id.clone(),
                }),
            }
        }

        self.state = RunnerState::Stopped;
        for err in &errors {
            warn!("{}", err);
        }
        info!("Service {} stopped", self.name);
        errors
    }

    async fn remove_existing(&self, cancel: &CancellationToken) -> Result<(), RunnerError> {
        let runtime = self.context.runtime.clone();
        let existing = self
            .step(cancel, "list existing containers", runtime.list_containers(&self.name))
            .await?;

        for container in existing {
            info!(
                "Service {}: removing leftover container {}",
                self.name, container.id
            );
            let removed = tokio::select! {
                result = runtime.remove_container(&container.id) => result,
                _ = cancel.cancelled() => return Err(self.cancelled()),
            };
            if let Err(source) = removed {
                error!(
                    "Service {}: can't remove container {}: {}",
                    self.name, container.id, source
                );
                return Err(RunnerError::RemoveExisting {
                    service: self.name.clone(),
                    container_id: container.id,
                    source,
                });
            }
        }
        Ok(())
    }

    fn container_spec(&self) -> Result<ContainerSpec, RunnerError> {
        let env = merge_env_files(&self.descriptor.env_file, &self.context.variables)
            .map_err(|source| RunnerError::EnvFile {
                service: self.name.clone(),
                source,
            })?;
        let ports = parse_port_specs(&self.descriptor.ports).map_err(|source| RunnerError::Ports {
            service: self.name.clone(),
            source,
        })?;

        Ok(ContainerSpec {
            image: self.descriptor.image.clone(),
            env: env.into_iter().map(|(k, v)| format!("{k}={v}")).collect(),
            command: self.descriptor.command.clone(),
            ports,
            binds: self.descriptor.binds.clone(),
        })
    }

    async fn attach_network(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
    ) -> Result<(), RunnerError> {
        let runtime = self.context.runtime.clone();
        let network = self.network().to_string();

        let exists = self
            .step(cancel, "inspect network", runtime.network_exists(&network))
            .await?;
        if !exists {
            info!("Creating network {}", network);
            self.step(cancel, "create network", async {
                match runtime.create_network(&network).await {
                    Err(err) if err.is_conflict() => {
                        debug!("Network {} was created concurrently", network);
                        Ok(())
                    }
                    other => other,
                }
            })
            .await?;
        }

        self.step(cancel, "connect to network", runtime.connect_network(&network, container_id))
            .await
    }

    /// Runs one runtime call, giving up if `cancel` fires first
    async fn step<T>(
        &self,
        cancel: &CancellationToken,
        action: &'static str,
        call: impl Future<Output = Result<T, RuntimeError>>,
    ) -> Result<T, RunnerError> {
        let result = tokio::select! {
            result = call => result,
            _ = cancel.cancelled() => return Err(self.cancelled()),
        };
        result.map_err(|source| {
            error!("Service {}: can't {}: {}", self.name, action, source);
            RunnerError::Runtime {
                service: self.name.clone(),
                action,
                source,
            }
        })
    }

    fn cancelled(&self) -> RunnerError {
        warn!("Service {}: start cancelled in state {}", self.name, self.state);
        RunnerError::Cancelled {
            service: self.name.clone(),
        }
    }
}

impl Drop for ContainerRunner {
    fn drop(&mut self) {
        if self.state == RunnerState::Running {
            warn!(
                "Service {} dropped while running; container {} left behind",
                self.name,
                self.container_id.as_deref().unwrap_or("?")
            );
        }
    }
}
