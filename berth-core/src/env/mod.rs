//! Environment handling
//!
//! Variable sets, env file loading and per-environment file selection.

mod file;
mod source;
mod variables;

pub use file::{EnvFileError, load_env_file, merge_env_files};
pub use source::{EnvSource, load_layered};
pub use variables::Variables;
