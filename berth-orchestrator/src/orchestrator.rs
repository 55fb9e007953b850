//! Orchestrator
//!
//! Owns the runners of one test suite:
//! - Each declared service can be run once
//! - Stop is idempotent and never fatal for declared services
//! - Stop-all walks services in reverse start order
//! - Images can be pulled up front, outside any per-test deadline

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use berth_core::{LogSink, ServiceCatalog, ServiceDescriptor, TracingLogSink};
use berth_runner::{
    ContainerRunner, ContainerRuntime, DockerRuntime, ImagePuller, RunnerContext, StopError,
};
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};

/// Outcome of stopping one or more services
///
/// Stopping never aborts halfway; whatever went wrong is collected here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    stopped: Vec<String>,
    errors: Vec<StopError>,
}

impl StopReport {
    /// Services that were stopped, in order
    pub fn stopped(&self) -> &[String] {
        &self.stopped
    }

    pub fn errors(&self) -> &[StopError] {
        &self.errors
    }

    /// True when every stop went through without problems
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn extend(&mut self, other: StopReport) {
        self.stopped.extend(other.stopped);
        self.errors.extend(other.errors);
    }
}

/// Starts and stops the services of one catalog
pub struct Orchestrator {
    catalog: ServiceCatalog,
    config: OrchestratorConfig,
    context: RunnerContext,
    /// `None` once stopped
    services: HashMap<String, Option<ContainerRunner>>,
    order: Vec<String>,
}

impl Orchestrator {
    /// Creates an orchestrator relaying container output to `tracing`
    pub fn new(
        catalog: ServiceCatalog,
        runtime: Arc<dyn ContainerRuntime>,
        config: OrchestratorConfig,
    ) -> Self {
        Self::with_sink(catalog, runtime, Arc::new(TracingLogSink), config)
    }

    /// Creates an orchestrator relaying container output to `sink`
    ///
    /// # Arguments
    /// * `catalog` - Services that may be run
    /// * `runtime` - Container runtime shared by all runners
    /// * `sink` - Target for image pull progress and container output
    /// * `config` - Network, stop timeout, puller settings and variables
    pub fn with_sink(
        catalog: ServiceCatalog,
        runtime: Arc<dyn ContainerRuntime>,
        sink: Arc<dyn LogSink>,
        config: OrchestratorConfig,
    ) -> Self {
        let puller = Arc::new(ImagePuller::new(
            runtime.clone(),
            sink.clone(),
            config.puller.clone(),
        ));
        Self::with_puller(catalog, runtime, puller, sink, config)
    }

    /// Creates an orchestrator around an existing puller
    ///
    /// Orchestrators sharing one puller pull every image at most once
    /// between them. The puller keeps its own repository settings;
    /// `config.puller` is not consulted.
    pub fn with_puller(
        catalog: ServiceCatalog,
        runtime: Arc<dyn ContainerRuntime>,
        puller: Arc<ImagePuller>,
        sink: Arc<dyn LogSink>,
        config: OrchestratorConfig,
    ) -> Self {
        let context = RunnerContext::new(runtime, puller, sink)
            .with_variables(config.expansion_variables())
            .with_default_network(config.network.clone());

        Self {
            catalog,
            config,
            context,
            services: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Loads the catalog from the configured descriptor file
    pub fn from_config(config: OrchestratorConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        config.validate().map_err(OrchestratorError::Config)?;

        let path = config.yaml_path();
        let catalog = ServiceCatalog::load(&path, &config.expansion_variables())?;
        info!(
            "Loaded {} service(s) from {}",
            catalog.len(),
            path.display()
        );

        Ok(Self::new(catalog, runtime, config))
    }

    /// Connects to the local Docker daemon and loads the configured catalog
    pub fn connect(config: OrchestratorConfig) -> Result<Self> {
        let runtime = DockerRuntime::connect()?;
        Self::from_config(config, Arc::new(runtime))
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Names of started services, in start order
    pub fn started(&self) -> &[String] {
        &self.order
    }

    pub fn is_running(&self, name: &str) -> bool {
        matches!(self.services.get(name), Some(Some(runner)) if runner.is_running())
    }

    /// Pulls the image of every declared service
    ///
    /// Pulls run concurrently; services sharing an image share the pull.
    pub async fn pull_images(&self, cancel: &CancellationToken) -> Result<()> {
        let started = Instant::now();

        let pulls = self.catalog.iter().map(|(name, descriptor)| async move {
            let t0 = Instant::now();
            self.context
                .puller
                .pull(cancel, &descriptor.image)
                .await
                .map_err(|source| {
                    error!("Can't pull image {} for {}: {}", descriptor.image, name, source);
                    OrchestratorError::Pull {
                        service: name.to_string(),
                        source,
                    }
                })?;
            info!(
                "Pulled image {:?} for {:?} in {:?}",
                descriptor.image,
                name,
                t0.elapsed()
            );
            Ok::<_, OrchestratorError>(())
        });
        try_join_all(pulls).await?;

        info!("Pulled all images in {:?}", started.elapsed());
        Ok(())
    }

    /// Starts a declared service
    ///
    /// A service can be run once per orchestrator; use `restart` to replace a
    /// running one. A service that fails to start is not registered.
    pub async fn run(&mut self, cancel: &CancellationToken, name: &str) -> Result<()> {
        let descriptor = self.descriptor(name)?;
        if self.services.contains_key(name) {
            error!("Trying to start service {} again", name);
            return Err(OrchestratorError::AlreadyStarted {
                name: name.to_string(),
            });
        }

        let mut runner = ContainerRunner::new(name, descriptor, self.context.clone());
        runner.start(cancel).await?;

        self.services.insert(name.to_string(), Some(runner));
        self.order.push(name.to_string());
        Ok(())
    }

    /// Stops a declared service
    ///
    /// Stopping a service that isn't running is a no-op. Only unknown names
    /// are an error; problems while stopping end up in the report.
    pub async fn stop(&mut self, cancel: &CancellationToken, name: &str) -> Result<StopReport> {
        if !self.catalog.contains(name) {
            error!("There's no service {} to stop", name);
            return Err(OrchestratorError::UnknownService {
                name: name.to_string(),
            });
        }
        Ok(self.stop_service(cancel, name).await)
    }

    /// Stops every started service in reverse start order
    pub async fn stop_all(&mut self, cancel: &CancellationToken) -> StopReport {
        let mut report = StopReport::default();
        for name in self.order.clone().iter().rev() {
            report.extend(self.stop_service(cancel, name).await);
        }

        if report.is_clean() {
            info!("Stopped {} service(s)", report.stopped.len());
        } else {
            warn!(
                "Stopped {} service(s) with {} problem(s)",
                report.stopped.len(),
                report.errors.len()
            );
        }
        report
    }

    /// Replaces a service's container with a fresh one
    ///
    /// Stops the service if it is running, then starts it again from the
    /// same descriptor. The service keeps its place in the start order; a
    /// service that was never run is simply run.
    pub async fn restart(&mut self, cancel: &CancellationToken, name: &str) -> Result<StopReport> {
        let descriptor = self.descriptor(name)?;
        info!("Restarting service {}", name);

        let report = self.stop_service(cancel, name).await;

        let mut runner = ContainerRunner::new(name, descriptor, self.context.clone());
        runner.start(cancel).await?;

        if !self.order.iter().any(|n| n == name) {
            self.order.push(name.to_string());
        }
        self.services.insert(name.to_string(), Some(runner));
        Ok(report)
    }

    fn descriptor(&self, name: &str) -> Result<ServiceDescriptor> {
        self.catalog.get(name).cloned().ok_or_else(|| {
            error!("There's no service with name {}", name);
            OrchestratorError::UnknownService {
                name: name.to_string(),
            }
        })
    }

    async fn stop_service(&mut self, cancel: &CancellationToken, name: &str) -> StopReport {
        let mut report = StopReport::default();

        let Some(slot) = self.services.get_mut(name) else {
            return report;
        };
        let Some(mut runner) = slot.take() else {
            return report;
        };

        report.errors = runner.stop(cancel, self.config.stop_timeout).await;
        report.stopped.push(name.to_string());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::wait_until;
    use berth_core::MemoryLogSink;
    use berth_runner::testing::FakeRuntime;
    use berth_runner::runtime::OutputFrame;
    use berth_runner::{ImagePullerConfig, RepositoryConfig, RunnerError, RuntimeError};
    use std::time::Duration;

    fn catalog(names: &[&str]) -> ServiceCatalog {
        names.iter().fold(ServiceCatalog::new(), |catalog, name| {
            catalog.with(
                *name,
                ServiceDescriptor {
                    ignore_logs: true,
                    ..ServiceDescriptor::new(format!("{name}:latest"))
                },
            )
        })
    }

    fn orchestrator(runtime: &Arc<FakeRuntime>, names: &[&str]) -> Orchestrator {
        Orchestrator::with_sink(
            catalog(names),
            runtime.clone(),
            Arc::new(MemoryLogSink::new()),
            OrchestratorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut orch = orchestrator(&runtime, &["svc"]);
        let cancel = CancellationToken::new();

        orch.run(&cancel, "svc").await.unwrap();
        let err = orch.run(&cancel, "svc").await.unwrap_err();

        assert!(matches!(err, OrchestratorError::AlreadyStarted { .. }));
        assert!(err.is_usage_error());
        assert_eq!(runtime.ops_of("create"), vec!["svc"]);
        assert_eq!(orch.started(), ["svc"]);

        orch.stop_all(&cancel).await;
    }

    #[tokio::test]
    async fn test_run_unknown_service() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut orch = orchestrator(&runtime, &["svc"]);

        let err = orch
            .run(&CancellationToken::new(), "nope")
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::UnknownService { .. }));
        assert!(runtime.ops().is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut orch = orchestrator(&runtime, &["svc"]);
        let cancel = CancellationToken::new();
        orch.run(&cancel, "svc").await.unwrap();

        let first = orch.stop(&cancel, "svc").await.unwrap();
        let second = orch.stop(&cancel, "svc").await.unwrap();

        assert_eq!(first.stopped(), ["svc"]);
        assert!(first.is_clean());
        assert_eq!(second, StopReport::default());
        assert_eq!(runtime.ops_of("stop"), vec!["svc"]);
        assert!(!orch.is_running("svc"));
    }

    #[tokio::test]
    async fn test_stop_unknown_and_unstarted() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut orch = orchestrator(&runtime, &["svc"]);
        let cancel = CancellationToken::new();

        let err = orch.stop(&cancel, "nope").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownService { .. }));

        let report = orch.stop(&cancel, "svc").await.unwrap();
        assert!(report.stopped().is_empty());
        assert!(runtime.ops().is_empty());
    }

    #[tokio::test]
    async fn test_stop_kills_immediately_by_default() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut orch = orchestrator(&runtime, &["svc"]);
        let cancel = CancellationToken::new();
        orch.run(&cancel, "svc").await.unwrap();
        orch.stop(&cancel, "svc").await.unwrap();

        let mut graceful = Orchestrator::with_sink(
            catalog(&["slow"]),
            runtime.clone(),
            Arc::new(MemoryLogSink::new()),
            OrchestratorConfig::default().with_stop_timeout(Duration::from_secs(3)),
        );
        graceful.run(&cancel, "slow").await.unwrap();
        graceful.stop_all(&cancel).await;

        assert_eq!(
            runtime.stop_timeouts(),
            vec![Some(Duration::ZERO), Some(Duration::from_secs(3))]
        );
    }

    #[tokio::test]
    async fn test_run_after_stop_is_rejected() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut orch = orchestrator(&runtime, &["svc"]);
        let cancel = CancellationToken::new();

        orch.run(&cancel, "svc").await.unwrap();
        orch.stop(&cancel, "svc").await.unwrap();
        let err = orch.run(&cancel, "svc").await.unwrap_err();

        assert!(matches!(err, OrchestratorError::AlreadyStarted { .. }));
    }

    #[tokio::test]
    async fn test_stop_all_reverses_start_order() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut orch = orchestrator(&runtime, &["a", "b", "c"]);
        let cancel = CancellationToken::new();

        for name in ["a", "b", "c"] {
            orch.run(&cancel, name).await.unwrap();
        }
        let report = orch.stop_all(&cancel).await;

        assert_eq!(report.stopped(), ["c", "b", "a"]);
        assert!(report.is_clean());
        assert_eq!(runtime.ops_of("stop"), vec!["c", "b", "a"]);

        // Nothing left to stop
        let again = orch.stop_all(&cancel).await;
        assert!(again.stopped().is_empty());
        assert_eq!(runtime.ops_of("stop").len(), 3);
    }

    #[tokio::test]
    async fn test_stop_all_skips_already_stopped() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut orch = orchestrator(&runtime, &["a", "b", "c"]);
        let cancel = CancellationToken::new();

        for name in ["a", "b", "c"] {
            orch.run(&cancel, name).await.unwrap();
        }
        orch.stop(&cancel, "a").await.unwrap();
        let report = orch.stop_all(&cancel).await;

        assert_eq!(report.stopped(), ["c", "b"]);
        assert_eq!(runtime.ops_of("stop"), vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn test_stop_problems_do_not_abort_teardown() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut orch = orchestrator(&runtime, &["a", "b"]);
        let cancel = CancellationToken::new();
        orch.run(&cancel, "a").await.unwrap();
        orch.run(&cancel, "b").await.unwrap();
        runtime.fail_on("stop", RuntimeError::Api("daemon busy".to_string()));

        let report = orch.stop_all(&cancel).await;

        assert_eq!(report.stopped(), ["b", "a"]);
        assert_eq!(report.errors().len(), 2);
        assert_eq!(report.errors()[0].service(), "b");
        assert_eq!(report.errors()[1].service(), "a");
        assert!(!orch.is_running("a"));
    }

    #[tokio::test]
    async fn test_network_is_created_once() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut orch = orchestrator(&runtime, &["a", "b"]);
        let cancel = CancellationToken::new();

        orch.run(&cancel, "a").await.unwrap();
        orch.run(&cancel, "b").await.unwrap();

        assert_eq!(runtime.ops_of("create_network"), vec!["acceptance-testing"]);
        assert_eq!(runtime.ops_of("network_exists").len(), 2);
        assert_eq!(
            runtime.ops_of("connect"),
            vec!["acceptance-testing a", "acceptance-testing b"]
        );
        orch.stop_all(&cancel).await;
    }

    #[tokio::test]
    async fn test_configured_network_is_used() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut orch = Orchestrator::with_sink(
            catalog(&["a"]),
            runtime.clone(),
            Arc::new(MemoryLogSink::new()),
            OrchestratorConfig::default().with_network("ci-net"),
        );
        let cancel = CancellationToken::new();

        orch.run(&cancel, "a").await.unwrap();

        assert_eq!(runtime.networks(), vec!["ci-net"]);
        orch.stop_all(&cancel).await;
    }

    #[tokio::test]
    async fn test_failed_start_is_not_registered() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut orch = orchestrator(&runtime, &["svc"]);
        let cancel = CancellationToken::new();
        runtime.fail_on("start", RuntimeError::Api("port is already allocated".to_string()));

        let err = orch.run(&cancel, "svc").await.unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Start(RunnerError::Runtime { .. })
        ));
        assert!(orch.started().is_empty());
        assert!(!orch.is_running("svc"));
    }

    #[tokio::test]
    async fn test_restart_keeps_start_order() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut orch = orchestrator(&runtime, &["cache", "proxy"]);
        let cancel = CancellationToken::new();
        orch.run(&cancel, "cache").await.unwrap();
        orch.run(&cancel, "proxy").await.unwrap();

        let report = orch.restart(&cancel, "cache").await.unwrap();

        assert_eq!(report.stopped(), ["cache"]);
        assert!(orch.is_running("cache"));
        assert_eq!(orch.started(), ["cache", "proxy"]);
        assert_eq!(runtime.ops_of("create"), vec!["cache", "proxy", "cache"]);
        // The stopped container is replaced, not reused
        assert_eq!(runtime.ops_of("remove"), vec!["cache"]);

        let report = orch.stop_all(&cancel).await;
        assert_eq!(report.stopped(), ["proxy", "cache"]);
    }

    #[tokio::test]
    async fn test_restart_unknown_service() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut orch = orchestrator(&runtime, &["svc"]);

        let err = orch
            .restart(&CancellationToken::new(), "nope")
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::UnknownService { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pull_images_shares_pulls() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_pull_delay(Duration::from_millis(20));
        let catalog = ServiceCatalog::new()
            .with("primary", ServiceDescriptor::new("redis:6"))
            .with("replica", ServiceDescriptor::new("redis:6"))
            .with("proxy", ServiceDescriptor::new("proxy:1"));
        let orch = Orchestrator::with_sink(
            catalog,
            runtime.clone(),
            Arc::new(MemoryLogSink::new()),
            OrchestratorConfig::default(),
        );

        orch.pull_images(&CancellationToken::new()).await.unwrap();

        assert_eq!(runtime.pull_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_orchestrators_share_puller() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_pull_delay(Duration::from_millis(20));
        let sink: Arc<dyn LogSink> = Arc::new(MemoryLogSink::new());
        let puller = Arc::new(ImagePuller::new(
            runtime.clone(),
            sink.clone(),
            ImagePullerConfig::default(),
        ));
        let suite = |name: &str| {
            Orchestrator::with_puller(
                ServiceCatalog::new().with(name, ServiceDescriptor::new("redis:6")),
                runtime.clone(),
                puller.clone(),
                sink.clone(),
                OrchestratorConfig::default(),
            )
        };
        let first = suite("cache");
        let second = suite("sessions");
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(first.pull_images(&cancel), second.pull_images(&cancel));
        a.unwrap();
        b.unwrap();
        second.pull_images(&cancel).await.unwrap();

        assert_eq!(runtime.pull_count(), 1);
    }

    #[tokio::test]
    async fn test_pull_images_failure_names_service() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_on("pull", RuntimeError::Api("manifest unknown".to_string()));
        let orch = orchestrator(&runtime, &["svc"]);

        let err = orch
            .pull_images(&CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            OrchestratorError::Pull { service, .. } => assert_eq!(service, "svc"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_from_config_loads_catalog() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("proxy.env"), "TARGET=http://${TESTER_ADDRESS}:8000\n").unwrap();
        std::fs::write(
            dir.path().join("berth.yml"),
            "services:\n  proxy:\n    image: proxy:1\n    ignore_logs: true\n    env_file: [\"${YAMLDIR}/proxy.env\"]\n",
        )
        .unwrap();

        let runtime = Arc::new(FakeRuntime::new());
        let config = OrchestratorConfig::new(dir.path()).with_tester_address("172.17.0.1");
        let mut orch = Orchestrator::from_config(config, runtime.clone()).unwrap();
        let cancel = CancellationToken::new();

        assert!(orch.catalog().contains("proxy"));
        orch.run(&cancel, "proxy").await.unwrap();

        let spec = runtime.spec_of("proxy").unwrap();
        assert_eq!(spec.env, vec!["TARGET=http://172.17.0.1:8000"]);
        orch.stop_all(&cancel).await;
    }

    #[tokio::test]
    async fn test_from_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Orchestrator::from_config(
            OrchestratorConfig::new(dir.path()),
            Arc::new(FakeRuntime::new()),
        );
        assert!(matches!(result, Err(OrchestratorError::Descriptors(_))));
    }

    #[tokio::test]
    async fn test_cache_then_proxy_end_to_end() {
        let runtime = Arc::new(FakeRuntime::new());
        let sink = MemoryLogSink::new();
        runtime.set_output(
            "cache",
            vec![OutputFrame::Stdout(b"Ready to accept connections\n".to_vec())],
        );
        let catalog = ServiceCatalog::new()
            .with(
                "cache",
                ServiceDescriptor {
                    ports: vec!["6379:6379".to_string()],
                    ..ServiceDescriptor::new("redis:6")
                },
            )
            .with(
                "proxy",
                ServiceDescriptor {
                    ports: vec!["8888:8888".to_string()],
                    ignore_logs: true,
                    ..ServiceDescriptor::new("registry.local/proxy:dev")
                },
            );
        let config = OrchestratorConfig::default().with_puller(
            ImagePullerConfig::new().with_repository(RepositoryConfig::new("registry.local").skip()),
        );
        let mut orch =
            Orchestrator::with_sink(catalog, runtime.clone(), Arc::new(sink.clone()), config);
        let cancel = CancellationToken::new();

        orch.pull_images(&cancel).await.unwrap();
        assert_eq!(runtime.ops_of("pull"), vec!["docker.io/library/redis:6"]);
        orch.run(&cancel, "cache").await.unwrap();

        let probe_runtime = runtime.clone();
        wait_until(
            &cancel,
            Duration::from_secs(5),
            Duration::from_millis(5),
            move || {
                let runtime = probe_runtime.clone();
                async move { runtime.running().contains(&"cache".to_string()) }
            },
        )
        .await
        .unwrap();

        orch.run(&cancel, "proxy").await.unwrap();
        assert_eq!(runtime.running(), vec!["cache", "proxy"]);

        let report = orch.stop_all(&cancel).await;

        assert!(report.is_clean(), "{:?}", report.errors());
        assert_eq!(runtime.ops_of("stop"), vec!["proxy", "cache"]);
        assert!(runtime.running().is_empty());
        assert_eq!(
            sink.lines_from("container \"cache\" STDOUT"),
            vec!["Ready to accept connections"]
        );
    }
}
