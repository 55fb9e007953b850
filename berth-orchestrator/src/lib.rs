//! Berth Orchestrator
//!
//! Starts the containerized dependencies of a test suite and tears them down
//! in reverse order afterwards.
//!
//! This crate contains:
//! - Config: orchestrator settings, from code or `BERTH_*` variables
//! - Orchestrator: run, stop, restart and stop-all over a service catalog
//! - Probe: readiness polling helpers for suites
//!
//! ```no_run
//! use berth_orchestrator::{Orchestrator, OrchestratorConfig, init_tracing};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn suite() -> anyhow::Result<()> {
//! init_tracing();
//! let mut orchestrator = Orchestrator::connect(OrchestratorConfig::from_env()?)?;
//! let cancel = CancellationToken::new();
//!
//! orchestrator.pull_images(&cancel).await?;
//! orchestrator.run(&cancel, "redis").await?;
//! // ... tests ...
//! let report = orchestrator.stop_all(&cancel).await;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod probe;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, ProbeError, Result};
pub use orchestrator::{Orchestrator, StopReport};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a `tracing` subscriber for suites
///
/// Filters with `RUST_LOG`, defaulting to `berth=info`. Safe to call more
/// than once; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "berth=info".into()))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice() {
        init_tracing();
        init_tracing();
        tracing::info!("tracing initialised");
    }
}
