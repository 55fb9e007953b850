//! Per-environment config selection
//!
//! Test suites usually keep one env file per environment (a CI flavour, a
//! local default) plus a shared one. `EnvSource` describes which file applies
//! and `load_layered` stacks the chosen files on top of a base variable set,
//! returning the result instead of touching the process environment.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{EnvFileError, Variables, load_env_file};

/// A rule choosing an env file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvSource {
    /// Always use this file
    Always(PathBuf),
    /// Use this file when `var` is defined
    WhenVarPresent { path: PathBuf, var: String },
    /// Use the first alternative that matches
    OneOf(Vec<EnvSource>),
}

impl EnvSource {
    pub fn always(path: impl Into<PathBuf>) -> Self {
        Self::Always(path.into())
    }

    pub fn when_var_present(path: impl Into<PathBuf>, var: impl Into<String>) -> Self {
        Self::WhenVarPresent {
            path: path.into(),
            var: var.into(),
        }
    }

    pub fn one_of(alternatives: impl IntoIterator<Item = EnvSource>) -> Self {
        Self::OneOf(alternatives.into_iter().collect())
    }

    /// Returns the file this rule selects, if any
    pub fn resolve(&self, vars: &Variables) -> Option<&Path> {
        match self {
            Self::Always(path) => Some(path),
            Self::WhenVarPresent { path, var } => vars.contains(var).then_some(path.as_path()),
            Self::OneOf(alternatives) => alternatives.iter().find_map(|alt| alt.resolve(vars)),
        }
    }
}

/// Loads every matching source in order, layering each file over `base`
///
/// Each rule is evaluated, and each file expanded, against the variables
/// accumulated so far, so later files can reference values from earlier ones.
pub fn load_layered(sources: &[EnvSource], base: &Variables) -> Result<Variables, EnvFileError> {
    let mut vars = base.clone();
    for source in sources {
        if let Some(path) = source.resolve(&vars) {
            let loaded = load_env_file(path, &vars)?;
            debug!("Loaded {} variable(s) from {}", loaded.len(), path.display());
            vars.extend(loaded);
        }
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rules() {
        let vars = Variables::new().with("GITLAB_CI", "true");

        assert_eq!(
            EnvSource::always("a.env").resolve(&vars),
            Some(Path::new("a.env"))
        );
        assert_eq!(
            EnvSource::when_var_present("ci.env", "GITLAB_CI").resolve(&vars),
            Some(Path::new("ci.env"))
        );
        assert_eq!(
            EnvSource::when_var_present("gh.env", "GITHUB_ACTIONS").resolve(&vars),
            None
        );
    }

    #[test]
    fn test_one_of_picks_first_match() {
        let rule = EnvSource::one_of([
            EnvSource::when_var_present("gitlab.env", "GITLAB_CI"),
            EnvSource::always("default.env"),
        ]);

        let ci = Variables::new().with("GITLAB_CI", "1");
        assert_eq!(rule.resolve(&ci), Some(Path::new("gitlab.env")));
        assert_eq!(rule.resolve(&Variables::new()), Some(Path::new("default.env")));
        assert_eq!(EnvSource::one_of([]).resolve(&ci), None);
    }

    #[test]
    fn test_load_layered_sees_earlier_values() {
        let dir = tempfile::tempdir().unwrap();
        let default = dir.path().join("default.env");
        let acceptance = dir.path().join("acceptance.env");
        std::fs::write(&default, "SERVICES_ADDRESS=localhost\n").unwrap();
        std::fs::write(&acceptance, "REDIS_URL=redis://${SERVICES_ADDRESS}:6379\n").unwrap();

        let base = Variables::new().with("HOME", "/root");
        let vars = load_layered(
            &[
                EnvSource::one_of([
                    EnvSource::when_var_present(dir.path().join("gitlab.env"), "GITLAB_CI"),
                    EnvSource::always(&default),
                ]),
                EnvSource::always(&acceptance),
            ],
            &base,
        )
        .unwrap();

        assert_eq!(vars.get("SERVICES_ADDRESS"), Some("localhost"));
        assert_eq!(vars.get("REDIS_URL"), Some("redis://localhost:6379"));
        assert_eq!(vars.get("HOME"), Some("/root"));
        // base is left untouched
        assert!(!base.contains("REDIS_URL"));
    }
}
