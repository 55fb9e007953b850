//! Image puller configuration
//!
//! Per-registry settings keyed by the domain an image reference resolves to:
//! - `skip_pulling` for registries holding locally built images
//! - `auth` for private registries

use serde::Deserialize;

use crate::runtime::RegistryAuth;

/// Settings for one registry domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RepositoryConfig {
    /// Registry domain as resolved from image references, e.g. `docker.io`
    pub domain: String,

    /// Treat images from this domain as already present
    #[serde(default)]
    pub skip_pulling: bool,

    #[serde(default)]
    pub auth: Option<RegistryAuth>,
}

impl RepositoryConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Default::default()
        }
    }

    /// Marks the domain as never pulled
    pub fn skip(mut self) -> Self {
        self.skip_pulling = true;
        self
    }

    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = Some(auth);
        self
    }
}

/// Image puller configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImagePullerConfig {
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

impl ImagePullerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repository(mut self, repository: RepositoryConfig) -> Self {
        self.repositories.push(repository);
        self
    }

    /// Settings for `domain`; the last matching entry wins
    pub fn repository(&self, domain: &str) -> Option<&RepositoryConfig> {
        self.repositories.iter().rev().find(|r| r.domain == domain)
    }

    /// Whether images from `domain` are never pulled
    pub fn skips(&self, domain: &str) -> bool {
        self.repository(domain).is_some_and(|r| r.skip_pulling)
    }

    /// Credentials for `domain`, if any
    pub fn auth_for(&self, domain: &str) -> Option<&RegistryAuth> {
        self.repository(domain).and_then(|r| r.auth.as_ref())
    }
}
