//! Berth Core
//!
//! Core types for provisioning throwaway service containers during test runs.
//!
//! This crate contains:
//! - Domain types: service descriptors, image references, port specs and log sinks
//! - Env: env files, variable expansion and per-environment config selection

pub mod domain;
pub mod env;

pub use domain::image::{ImageReference, ReferenceError};
pub use domain::log::{LineBuffer, LogSink, MemoryLogSink, TracingLogSink};
pub use domain::port::{PortBinding, PortMap, PortSpec, PortSpecError, parse_port_specs};
pub use domain::service::{DescriptorError, ServiceCatalog, ServiceDescriptor};
pub use env::{EnvFileError, EnvSource, Variables};
