//! Runner context
//!
//! Everything a `ContainerRunner` needs besides its own descriptor:
//! - The container runtime
//! - The shared image puller
//! - The log sink for container output
//! - Variables used to expand env files
//! - The network services join when they don't name one

use std::sync::Arc;

use berth_core::{LogSink, Variables};

use crate::puller::ImagePuller;
use crate::runtime::ContainerRuntime;

/// Network services join when their descriptor doesn't name one
pub const DEFAULT_NETWORK: &str = "acceptance-testing";

/// Collaborators shared by all runners of one orchestrator
#[derive(Clone)]
pub struct RunnerContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub puller: Arc<ImagePuller>,
    pub sink: Arc<dyn LogSink>,
    pub variables: Variables,
    pub default_network: String,
}

impl RunnerContext {
    /// Creates a context using `DEFAULT_NETWORK` and no variables
    ///
    /// # Arguments
    /// * `runtime` - Container runtime all runners talk to
    /// * `puller` - Puller shared by every runner so images are pulled once
    /// * `sink` - Target for relayed container output
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        puller: Arc<ImagePuller>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            runtime,
            puller,
            sink,
            variables: Variables::new(),
            default_network: DEFAULT_NETWORK.to_string(),
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_default_network(mut self, network: impl Into<String>) -> Self {
        self.default_network = network.into();
        self
    }
}
