//! Orchestrator configuration
//!
//! Where to find the service descriptors, which network services share, how
//! long containers get to stop, and the variables used to expand descriptor
//! and env files. Built programmatically or from `BERTH_*` variables.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use berth_core::env::load_layered;
use berth_core::{EnvFileError, EnvSource, Variables};
use berth_runner::{DEFAULT_NETWORK, ImagePullerConfig, RepositoryConfig};
use tracing::{debug, warn};

/// Variable holding the address where the test process can be reached
pub const TESTER_ADDRESS_VAR: &str = "TESTER_ADDRESS";

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory containing the descriptor file
    pub yaml_dir: PathBuf,

    /// Descriptor file name within `yaml_dir`
    pub yaml_name: String,

    /// Network services join unless their descriptor names another
    pub network: String,

    /// Grace period given to containers on stop; zero (the default) kills
    /// immediately, `None` defers to the runtime's own default
    pub stop_timeout: Option<Duration>,

    /// Address of the test process, exposed as `TESTER_ADDRESS`; the host's
    /// first non-loopback IPv4 address when unset
    pub tester_address: Option<String>,

    pub puller: ImagePullerConfig,

    /// Variables for expanding descriptor and env files
    pub variables: Variables,
}

impl OrchestratorConfig {
    /// Creates a configuration with defaults and no variables
    pub fn new(yaml_dir: impl Into<PathBuf>) -> Self {
        Self {
            yaml_dir: yaml_dir.into(),
            yaml_name: "berth.yml".to_string(),
            network: DEFAULT_NETWORK.to_string(),
            stop_timeout: Some(Duration::ZERO),
            tester_address: None,
            puller: ImagePullerConfig::default(),
            variables: Variables::new(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - BERTH_YAML_DIR (optional, default: ./)
    /// - BERTH_YAML_NAME (optional, default: berth.yml)
    /// - BERTH_NETWORK (optional, default: acceptance-testing)
    /// - BERTH_STOP_TIMEOUT (optional, seconds, default: 0)
    /// - BERTH_TESTER_ADDRESS (optional, falls back to TESTER_ADDRESS)
    /// - BERTH_SKIP_PULL_DOMAINS (optional, comma separated registry domains)
    ///
    /// The whole process environment becomes the expansion variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_variables(Variables::from_process_env())
    }

    /// Same as `from_env`, reading from `vars` instead of the process
    pub fn from_variables(vars: Variables) -> anyhow::Result<Self> {
        let mut config = Self::new(vars.get("BERTH_YAML_DIR").unwrap_or("./"));

        if let Some(name) = vars.get("BERTH_YAML_NAME") {
            config.yaml_name = name.to_string();
        }
        if let Some(network) = vars.get("BERTH_NETWORK") {
            config.network = network.to_string();
        }

        if let Some(s) = vars.get("BERTH_STOP_TIMEOUT") {
            let secs = s.trim().parse::<u64>().map_err(|_| {
                anyhow::anyhow!("BERTH_STOP_TIMEOUT must be whole seconds, got {s:?}")
            })?;
            config.stop_timeout = Some(Duration::from_secs(secs));
        }

        config.tester_address = vars
            .get("BERTH_TESTER_ADDRESS")
            .or_else(|| vars.get(TESTER_ADDRESS_VAR))
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        for domain in vars
            .get("BERTH_SKIP_PULL_DOMAINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
        {
            config.puller.repositories.push(RepositoryConfig::new(domain).skip());
        }

        config.variables = vars;
        Ok(config)
    }

    pub fn with_yaml_name(mut self, name: impl Into<String>) -> Self {
        self.yaml_name = name.into();
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    pub fn with_tester_address(mut self, address: impl Into<String>) -> Self {
        self.tester_address = Some(address.into());
        self
    }

    pub fn with_puller(mut self, puller: ImagePullerConfig) -> Self {
        self.puller = puller;
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Layers env files on top of the current variables
    ///
    /// Each source contributes at most one file; later files override
    /// earlier ones.
    pub fn with_env_sources(mut self, sources: &[EnvSource]) -> Result<Self, EnvFileError> {
        self.variables = load_layered(sources, &self.variables)?;
        Ok(self)
    }

    /// Full path of the descriptor file
    pub fn yaml_path(&self) -> PathBuf {
        Path::new(&self.yaml_dir).join(&self.yaml_name)
    }

    /// Variables used for expansion, including `TESTER_ADDRESS`
    ///
    /// Without a configured tester address, the host's local IPv4 address is
    /// used. `variables` itself is left untouched.
    pub fn expansion_variables(&self) -> Variables {
        let mut vars = self.variables.clone();
        let address = self
            .tester_address
            .clone()
            .or_else(|| local_ipv4().map(|ip| ip.to_string()));
        match address {
            Some(address) => vars.set(TESTER_ADDRESS_VAR, address),
            None => warn!("No tester address configured or detected; TESTER_ADDRESS expands to nothing"),
        }
        vars
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.yaml_name.is_empty() {
            anyhow::bail!("yaml_name cannot be empty");
        }

        if self.network.is_empty() {
            anyhow::bail!("network cannot be empty");
        }

        if self.puller.repositories.iter().any(|r| r.domain.is_empty()) {
            anyhow::bail!("repository domains cannot be empty");
        }

        Ok(())
    }
}

/// First non-loopback IPv4 address of this host
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            debug!("Can't list network interfaces: {}", e);
            return None;
        }
    };
    let ip = first_non_loopback_ipv4(interfaces.iter().map(|iface| iface.ip()));
    debug!("Detected local address {:?}", ip);
    ip
}

fn first_non_loopback_ipv4(addrs: impl IntoIterator<Item = IpAddr>) -> Option<Ipv4Addr> {
    addrs.into_iter().find_map(|addr| match addr {
        IpAddr::V4(ip) if !ip.is_loopback() => Some(ip),
        _ => None,
    })
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::new("./")
    }
}
