//! Service descriptors
//!
//! A descriptor file lists the services a test suite can start:
//!
//! ```yaml
//! services:
//!   redis:
//!     image: redis:6
//!     ports: ["6379:6379"]
//!     ignore_logs: true
//!   proxy:
//!     image: ${REGISTRY}/proxy:latest
//!     env_file: ["${YAMLDIR}/proxy.env"]
//! ```
//!
//! Variable references are expanded before the YAML is parsed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::env::Variables;

/// Variable set to the directory containing the descriptor file
pub const YAML_DIR_VAR: &str = "YAMLDIR";

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("can't read service descriptors from {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("can't parse service descriptors from {}: {source}", .path.display())]
    YamlFile {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("can't parse service descriptors: {0}")]
    Yaml(#[source] serde_yaml::Error),
}

/// Everything needed to run one service container
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServiceDescriptor {
    pub image: String,

    /// Network to attach to; the orchestrator's default network when absent
    #[serde(default)]
    pub network: Option<String>,

    /// Bind mounts in `host:container[:mode]` form
    #[serde(default)]
    pub binds: Vec<String>,

    /// Overrides the image's default command
    #[serde(default)]
    pub command: Option<Vec<String>>,

    /// Env files merged in order, later files winning
    #[serde(default)]
    pub env_file: Vec<PathBuf>,

    /// Port specs in `[ip:][host:]container[/proto]` form
    #[serde(default)]
    pub ports: Vec<String>,

    /// Skip relaying container output into the test log
    #[serde(default)]
    pub ignore_logs: bool,
}

impl ServiceDescriptor {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct DescriptorFile {
    #[serde(default)]
    services: BTreeMap<String, ServiceDescriptor>,
}

/// The set of services known to one orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCatalog {
    services: BTreeMap<String, ServiceDescriptor>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a descriptor file
    ///
    /// `YAMLDIR` is set to the file's directory for expansion, on top of `vars`.
    pub fn load(path: impl AsRef<Path>, vars: &Variables) -> Result<Self, DescriptorError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let vars = vars
            .clone()
            .with(YAML_DIR_VAR, dir.to_string_lossy().into_owned());

        Self::parse(&content, &vars).map_err(|source| DescriptorError::YamlFile {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses descriptor YAML after expanding variable references
    pub fn from_yaml_str(text: &str, vars: &Variables) -> Result<Self, DescriptorError> {
        Self::parse(text, vars).map_err(DescriptorError::Yaml)
    }

    fn parse(text: &str, vars: &Variables) -> Result<Self, serde_yaml::Error> {
        let expanded = vars.expand(text);
        let file: DescriptorFile = serde_yaml::from_str(&expanded)?;
        Ok(Self {
            services: file.services,
        })
    }

    /// Adds or replaces a service
    pub fn insert(&mut self, name: impl Into<String>, descriptor: ServiceDescriptor) {
        self.services.insert(name.into(), descriptor);
    }

    /// Builder-style variant of `insert`
    pub fn with(mut self, name: impl Into<String>, descriptor: ServiceDescriptor) -> Self {
        self.insert(name, descriptor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServiceDescriptor)> {
        self.services.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
