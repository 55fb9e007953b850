//! Berth Runner
//!
//! Runs service containers for test suites.
//!
//! This crate contains:
//! - Runtime: the container engine seam and its Docker implementation
//! - Puller: deduplicated image pulls with per-registry settings
//! - Runner: the lifecycle of one service container, including log relay
//! - Testing: an in-memory runtime (tests and the `testing` feature)

pub mod config;
pub mod context;
pub mod error;
pub mod puller;
mod relay;
pub mod runner;
pub mod runtime;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{ImagePullerConfig, RepositoryConfig};
pub use context::{DEFAULT_NETWORK, RunnerContext};
pub use error::{PullError, RunnerError, StopError};
pub use puller::ImagePuller;
pub use runner::{ContainerRunner, RunnerState};
pub use runtime::{ContainerRuntime, DockerRuntime, RegistryAuth, RuntimeError};
