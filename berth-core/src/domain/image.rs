//! Image references
//!
//! Parses Docker-style image references far enough to know which registry
//! domain an image lives on and which tag to pull.

use std::fmt;

use thiserror::Error;

/// Registry used for references without an explicit domain
pub const DEFAULT_DOMAIN: &str = "docker.io";

const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";
const MAX_TAG_LEN: usize = 128;
const MIN_DIGEST_HEX_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid image reference {input:?}: {reason}")]
pub struct ReferenceError {
    pub input: String,
    pub reason: String,
}

/// A normalised image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    domain: String,
    path: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parses and normalises an image reference
    ///
    /// `redis:6` becomes `docker.io/library/redis:6`; `localhost:5000/app`
    /// keeps `localhost:5000` as its domain.
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let fail = |reason: &str| ReferenceError {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        if input.is_empty() {
            return Err(fail("empty reference"));
        }

        let (remainder, digest) = match input.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest).map_err(|r| fail(r))?;
                (name, Some(digest.to_string()))
            }
            None => (input, None),
        };

        // A tag is whatever follows the last ':' that is not part of a domain port
        let (name, tag) = match remainder.rfind(':') {
            Some(idx) if !remainder[idx + 1..].contains('/') => {
                let tag = &remainder[idx + 1..];
                validate_tag(tag).map_err(|r| fail(r))?;
                (&remainder[..idx], Some(tag.to_string()))
            }
            _ => (remainder, None),
        };

        let (domain, path) = split_domain(name);
        if domain.is_empty() {
            return Err(fail("empty registry domain"));
        }
        validate_path(&path).map_err(|r| fail(r))?;

        Ok(Self {
            domain,
            path,
            tag,
            digest,
        })
    }

    /// Registry domain, e.g. `docker.io` or `localhost:5000`
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Repository path within the registry, e.g. `library/redis`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Fully qualified repository name without tag or digest
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The tag (or digest) to pull; untagged references pull `latest`
    pub fn pull_tag(&self) -> &str {
        self.tag
            .as_deref()
            .or(self.digest.as_deref())
            .unwrap_or("latest")
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.path)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn split_domain(name: &str) -> (String, String) {
    let (domain, path) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
    };

    let domain = if domain == LEGACY_DEFAULT_DOMAIN {
        DEFAULT_DOMAIN.to_string()
    } else {
        domain
    };

    let path = if domain == DEFAULT_DOMAIN && !path.contains('/') {
        format!("{OFFICIAL_REPO_PREFIX}{path}")
    } else {
        path
    };

    (domain, path)
}

fn validate_path(path: &str) -> Result<(), &'static str> {
    if path.chars().any(|c| c.is_ascii_uppercase()) {
        return Err("repository name must be lowercase");
    }
    for component in path.split('/') {
        validate_component(component)?;
    }
    Ok(())
}

/// `[a-z0-9]+` runs joined by `.`, `_`, `__` or any number of `-`
fn validate_component(component: &str) -> Result<(), &'static str> {
    let bytes = component.as_bytes();
    let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    if bytes.is_empty() {
        return Err("empty path component");
    }
    if !is_alnum(bytes[0]) || !is_alnum(bytes[bytes.len() - 1]) {
        return Err("path components must start and end with a lowercase letter or digit");
    }

    let mut i = 0;
    while i < bytes.len() {
        if is_alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !is_alnum(bytes[i]) {
            i += 1;
        }
        let sep = &component[start..i];
        let ok = matches!(sep, "." | "_" | "__") || sep.bytes().all(|b| b == b'-');
        if !ok {
            return Err("invalid separator in path component");
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<(), &'static str> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-';
    match tag.chars().next() {
        None => Err("empty tag"),
        Some(first) if !(first.is_ascii_alphanumeric() || first == '_') => {
            Err("tag must start with a letter, digit or underscore")
        }
        _ if tag.len() > MAX_TAG_LEN => Err("tag is too long"),
        _ if !tag.chars().all(valid_char) => Err("invalid character in tag"),
        _ => Ok(()),
    }
}

fn validate_digest(digest: &str) -> Result<(), &'static str> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err("digest must be algorithm:hex");
    };
    if algorithm.is_empty()
        || !algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
    {
        return Err("invalid digest algorithm");
    }
    if hex.len() < MIN_DIGEST_HEX_LEN || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("invalid digest hex");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_official_image_is_normalised() {
        let r = ImageReference::parse("redis").unwrap();
        assert_eq!(r.domain(), "docker.io");
        assert_eq!(r.path(), "library/redis");
        assert_eq!(r.tag(), None);
        assert_eq!(r.pull_tag(), "latest");
        assert_eq!(r.to_string(), "docker.io/library/redis");
    }

    #[test]
    fn test_user_image_on_docker_hub() {
        let r = ImageReference::parse("acme/proxy:1.2.3").unwrap();
        assert_eq!(r.domain(), "docker.io");
        assert_eq!(r.path(), "acme/proxy");
        assert_eq!(r.pull_tag(), "1.2.3");
    }

    #[test]
    fn test_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/team/app:dev").unwrap();
        assert_eq!(r.domain(), "localhost:5000");
        assert_eq!(r.path(), "team/app");
        assert_eq!(r.tag(), Some("dev"));
        assert_eq!(r.name(), "localhost:5000/team/app");
    }

    #[test]
    fn test_registry_port_without_tag() {
        let r = ImageReference::parse("registry.example.com:5000/app").unwrap();
        assert_eq!(r.domain(), "registry.example.com:5000");
        assert_eq!(r.tag(), None);
    }

    #[test]
    fn test_legacy_hub_domain() {
        let r = ImageReference::parse("index.docker.io/redis:6").unwrap();
        assert_eq!(r.domain(), "docker.io");
        assert_eq!(r.path(), "library/redis");
    }

    #[test]
    fn test_digest_reference() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let r = ImageReference::parse(&format!("quay.io/org/img@{digest}")).unwrap();
        assert_eq!(r.domain(), "quay.io");
        assert_eq!(r.digest(), Some(digest.as_str()));
        assert_eq!(r.pull_tag(), digest);
    }

    #[test]
    fn test_invalid_references() {
        for input in [
            "",
            "Redis",
            "redis:",
            "redis:-bad",
            "my//app",
            "-app",
            "app@sha256:zz",
            "app@nodigest",
            "a..b",
        ] {
            assert!(
                ImageReference::parse(input).is_err(),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_separators() {
        assert!(ImageReference::parse("my_app").is_ok());
        assert!(ImageReference::parse("my__app").is_ok());
        assert!(ImageReference::parse("my---app").is_ok());
        assert!(ImageReference::parse("my.app/x").is_ok());
        assert!(ImageReference::parse("my___app").is_err());
    }

    #[test]
    fn test_error_names_input() {
        let err = ImageReference::parse("Bad/Name").unwrap_err();
        assert_eq!(err.input, "Bad/Name");
        assert!(err.to_string().contains("Bad/Name"));
    }
}
