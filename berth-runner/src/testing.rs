//! In-memory container runtime for tests
//!
//! `FakeRuntime` keeps containers and networks in memory and records every
//! call as a short string (`"create redis"`, `"stop proxy"`, ...), so tests
//! can assert on the exact call sequence. Failures, pull latency and
//! container output can be scripted.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use berth_core::ImageReference;
use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc;

use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerSummary, OutputFrame, OutputStream, PullProgress,
    PullStream, RegistryAuth, RuntimeError,
};

type OutputSender = mpsc::UnboundedSender<Result<OutputFrame, RuntimeError>>;

#[derive(Debug, Clone)]
struct FakeContainer {
    name: String,
    spec: ContainerSpec,
    running: bool,
}

#[derive(Default)]
struct State {
    ops: Vec<String>,
    next_id: usize,
    containers: HashMap<String, FakeContainer>,
    networks: BTreeSet<String>,
    failures: HashMap<String, RuntimeError>,
    pull_delay: Duration,
    output: HashMap<String, Vec<OutputFrame>>,
    output_errors: HashMap<String, RuntimeError>,
    keep_output_open: BTreeSet<String>,
    senders: HashMap<String, OutputSender>,
    stop_timeouts: Vec<Option<Duration>>,
}

impl State {
    fn record(&mut self, op: String) {
        self.ops.push(op);
    }

    fn check(&self, op: &str) -> Result<(), RuntimeError> {
        match self.failures.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn container(&self, id: &str) -> Result<&FakeContainer, RuntimeError> {
        self.containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("no such container: {id}")))
    }

    fn insert_container(&mut self, name: &str, spec: ContainerSpec) -> String {
        self.next_id += 1;
        let id = format!("{}-{}", name, self.next_id);
        self.containers.insert(
            id.clone(),
            FakeContainer {
                name: name.to_string(),
                spec,
                running: false,
            },
        );
        id
    }
}

/// Container runtime that never leaves the process
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
    pulls: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every call of `op` fail with `err`
    ///
    /// `op` is the first word of the recorded call: `list`, `remove`,
    /// `create`, `network_exists`, `create_network`, `connect`, `attach`,
    /// `start`, `stop` or `pull`.
    pub fn fail_on(&self, op: &str, err: RuntimeError) {
        self.state().failures.insert(op.to_string(), err);
    }

    /// Removes a failure set with `fail_on`
    pub fn clear_failure(&self, op: &str) {
        self.state().failures.remove(op);
    }

    /// Delays every pull by `delay` before it reports progress
    pub fn set_pull_delay(&self, delay: Duration) {
        self.state().pull_delay = delay;
    }

    /// Adds a leftover container named `name`, as a crashed run would leave
    pub fn add_stale_container(&self, name: &str) -> String {
        self.state().insert_container(name, ContainerSpec::default())
    }

    /// Adds an existing network
    pub fn add_network(&self, network: &str) {
        self.state().networks.insert(network.to_string());
    }

    /// Frames the container named `name` writes once attached
    pub fn set_output(&self, name: &str, frames: Vec<OutputFrame>) {
        self.state().output.insert(name.to_string(), frames);
    }

    /// Makes the output stream of `name` fail instead of ending on stop
    pub fn set_output_error(&self, name: &str, err: RuntimeError) {
        self.state().output_errors.insert(name.to_string(), err);
    }

    /// Keeps the output stream of `name` open after the container stops
    pub fn keep_output_open(&self, name: &str) {
        self.state().keep_output_open.insert(name.to_string());
    }

    /// Every call made so far, in order
    pub fn ops(&self) -> Vec<String> {
        self.state().ops.clone()
    }

    /// Recorded calls of one kind, without the leading op word
    pub fn ops_of(&self, op: &str) -> Vec<String> {
        let prefix = format!("{op} ");
        self.state()
            .ops
            .iter()
            .filter_map(|o| o.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// Whether someone still reads the output stream of `name`
    pub fn output_open(&self, name: &str) -> bool {
        let state = self.state();
        state.senders.iter().any(|(id, sender)| {
            !sender.is_closed() && state.containers.get(id).is_some_and(|c| c.name == name)
        })
    }

    /// Grace periods passed to stop, in call order
    pub fn stop_timeouts(&self) -> Vec<Option<Duration>> {
        self.state().stop_timeouts.clone()
    }

    /// Number of pulls actually started
    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn networks(&self) -> Vec<String> {
        self.state().networks.iter().cloned().collect()
    }

    /// Names of all containers that exist, sorted
    pub fn containers(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .state()
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Names of running containers, sorted
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .state()
            .containers
            .values()
            .filter(|c| c.running)
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Spec of the most recently created container named `name`
    pub fn spec_of(&self, name: &str) -> Option<ContainerSpec> {
        let state = self.state();
        let mut matches: Vec<_> = state
            .containers
            .iter()
            .filter(|(_, c)| c.name == name)
            .collect();
        matches.sort_by_key(|(id, _)| {
            id.rsplit('-')
                .next()
                .and_then(|n| n.parse::<usize>().ok())
                .unwrap_or(0)
        });
        matches.last().map(|(_, c)| c.spec.clone())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self, name: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut state = self.state();
        state.record(format!("list {name}"));
        state.check("list")?;
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| c.name == name)
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                names: vec![format!("/{}", c.name)],
            })
            .collect())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        let name = state.container(container_id)?.name.clone();
        state.record(format!("remove {name}"));
        state.check("remove")?;
        state.containers.remove(container_id);
        state.senders.remove(container_id);
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, RuntimeError> {
        let mut state = self.state();
        state.record(format!("create {name}"));
        state.check("create")?;
        if state.containers.values().any(|c| c.name == name) {
            return Err(RuntimeError::Conflict(format!(
                "container name {name} is already in use"
            )));
        }
        Ok(state.insert_container(name, spec.clone()))
    }

    async fn network_exists(&self, network: &str) -> Result<bool, RuntimeError> {
        let mut state = self.state();
        state.record(format!("network_exists {network}"));
        state.check("network_exists")?;
        Ok(state.networks.contains(network))
    }

    async fn create_network(&self, network: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.record(format!("create_network {network}"));
        state.check("create_network")?;
        if !state.networks.insert(network.to_string()) {
            return Err(RuntimeError::Conflict(format!(
                "network {network} already exists"
            )));
        }
        Ok(())
    }

    async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state();
        let name = state.container(container_id)?.name.clone();
        state.record(format!("connect {network} {name}"));
        state.check("connect")?;
        if !state.networks.contains(network) {
            return Err(RuntimeError::NotFound(format!("network {network} not found")));
        }
        Ok(())
    }

    async fn attach_output(&self, container_id: &str) -> Result<OutputStream, RuntimeError> {
        let mut state = self.state();
        let name = state.container(container_id)?.name.clone();
        state.record(format!("attach {name}"));
        state.check("attach")?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        for frame in state.output.get(&name).cloned().unwrap_or_default() {
            let _ = tx.send(Ok(frame));
        }
        state.senders.insert(container_id.to_string(), tx);

        Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        let name = state.container(container_id)?.name.clone();
        state.record(format!("start {name}"));
        state.check("start")?;
        if let Some(container) = state.containers.get_mut(container_id) {
            container.running = true;
        }
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state();
        let name = state.container(container_id)?.name.clone();
        state.record(format!("stop {name}"));
        state.stop_timeouts.push(timeout);
        state.check("stop")?;
        if let Some(container) = state.containers.get_mut(container_id) {
            container.running = false;
        }

        if !state.keep_output_open.contains(&name) {
            if let Some(sender) = state.senders.remove(container_id) {
                if let Some(err) = state.output_errors.get(&name) {
                    let _ = sender.send(Err(err.clone()));
                }
            }
        }
        Ok(())
    }

    fn pull_image(&self, image: &ImageReference, auth: Option<RegistryAuth>) -> PullStream {
        self.pulls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state();
        let suffix = if auth.is_some() { " (authenticated)" } else { "" };
        state.record(format!("pull {image}{suffix}"));

        let mut items = vec![Ok(PullProgress {
            status: Some(format!("Pulling from {}", image.path())),
            id: image.tag().map(str::to_string),
            progress: None,
        })];
        match state.check("pull") {
            Ok(()) => items.push(Ok(PullProgress {
                status: Some(format!("Downloaded newer image for {image}")),
                ..Default::default()
            })),
            Err(err) => items.push(Err(err)),
        }

        let delay = state.pull_delay;
        stream::once(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            stream::iter(items)
        })
        .flatten()
        .boxed()
    }
}
