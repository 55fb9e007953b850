//! Env file loading
//!
//! Env files are `KEY=value` lines. Lines are trimmed and expanded before
//! parsing; blank lines and `#` comments are skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::Variables;

/// Errors raised while reading env files
#[derive(Debug, Error)]
pub enum EnvFileError {
    #[error("can't read env file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: expected KEY=value, got {content:?}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        content: String,
    },
}

/// Loads a single env file, expanding variable references with `vars`
pub fn load_env_file(
    path: impl AsRef<Path>,
    vars: &Variables,
) -> Result<BTreeMap<String, String>, EnvFileError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| EnvFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_env(&content, vars).map_err(|(line, content)| EnvFileError::Parse {
        path: path.to_path_buf(),
        line,
        content,
    })
}

/// Loads the given env files in order and merges them
///
/// Keys from later files override keys from earlier ones.
pub fn merge_env_files<P: AsRef<Path>>(
    paths: &[P],
    vars: &Variables,
) -> Result<BTreeMap<String, String>, EnvFileError> {
    let mut merged = BTreeMap::new();
    for path in paths {
        merged.extend(load_env_file(path, vars)?);
    }
    Ok(merged)
}

fn parse_env(content: &str, vars: &Variables) -> Result<BTreeMap<String, String>, (usize, String)> {
    let mut env = BTreeMap::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = vars.expand(raw.trim());
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                env.insert(key.to_string(), value.to_string());
            }
            _ => return Err((idx + 1, line)),
        }
    }

    Ok(env)
}
