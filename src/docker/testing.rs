//! An in-memory `DockerClient` double, scriptable per container, standing in
//! for the real Docker daemon in tests (§10.4). Grounded on the teacher's
//! `ContainerNetwork::wait_healthy`/`total_teardown` call shapes, reproduced
//! here without any network I/O so scenario tests (§8) run deterministically
//! and without a live daemon.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stacked_errors::{Result, StackableErr};
use tokio::sync::{mpsc, Mutex};

use super::json::DockerContainerCreationRequest;
use super::{BuildProgressLine, DockerClient, HealthStatus, OutputChunk};

/// How a fake container behaves when scripted onto a `FakeDockerClient`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedContainer {
    /// `Err` to make `create_container` fail for this container.
    pub create_fails: Option<String>,
    /// `Err` to make `start_container` fail for this container.
    pub start_fails: Option<String>,
    /// Successive `inspect_health` results; the last one repeats once
    /// exhausted. Defaults to `[NoHealthCheck]`.
    pub health_sequence: Vec<HealthStatus>,
    /// Exit code `run_attached` reports, for the main container.
    pub exit_code: i64,
    /// Output chunks `run_attached` forwards before reporting the exit code.
    pub output: Vec<OutputChunk>,
}

impl ScriptedContainer {
    pub fn healthy_immediately() -> Self {
        Self {
            health_sequence: vec![HealthStatus::NoHealthCheck],
            ..Default::default()
        }
    }

    pub fn never_healthy() -> Self {
        Self {
            health_sequence: vec![HealthStatus::Starting],
            ..Default::default()
        }
    }

    pub fn exits_with(code: i64) -> Self {
        Self {
            health_sequence: vec![HealthStatus::NoHealthCheck],
            exit_code: code,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct HealthCursor {
    index: usize,
}

/// A `DockerClient` that never touches a real daemon. Container behaviour is
/// scripted up front via [`FakeDockerClient::script`]; unscripted containers
/// default to "build/pull succeeds, healthy immediately, exits 0".
#[derive(Debug, Clone, Default)]
pub struct FakeDockerClient {
    scripts: Arc<Mutex<BTreeMap<String, ScriptedContainer>>>,
    health_cursors: Arc<Mutex<BTreeMap<String, HealthCursor>>>,
    next_id: Arc<AtomicU64>,
    /// Every Docker-facing call made, in order, for assertions in tests.
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl FakeDockerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn script(&self, container: impl Into<String>, behaviour: ScriptedContainer) {
        self.scripts
            .lock()
            .await
            .insert(container.into(), behaviour);
    }

    async fn behaviour_for(&self, container_name: &str) -> ScriptedContainer {
        self.scripts
            .lock()
            .await
            .get(container_name)
            .cloned()
            .unwrap_or_else(ScriptedContainer::healthy_immediately)
    }

    async fn record(&self, call: impl Into<String>) {
        self.calls.lock().await.push(call.into());
    }

    fn next_docker_id(&self) -> String {
        format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl DockerClient for FakeDockerClient {
    async fn build_image(
        &self,
        _context_path: &str,
        _dockerfile: Option<&str>,
        _build_args: &[(String, String)],
        tag: &str,
        progress: mpsc::UnboundedSender<BuildProgressLine>,
    ) -> Result<String> {
        self.record(format!("build_image({tag})")).await;
        let _ = progress.send(BuildProgressLine {
            percent: Some(100.0),
            message: "Successfully built".to_owned(),
        });
        Ok(tag.to_owned())
    }

    async fn pull_image(&self, reference: &str) -> Result<String> {
        self.record(format!("pull_image({reference})")).await;
        Ok(reference.to_owned())
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        self.record(format!("create_network({name})")).await;
        Ok(self.next_docker_id())
    }

    async fn remove_network(&self, network: &str) -> Result<()> {
        self.record(format!("remove_network({network})")).await;
        Ok(())
    }

    async fn create_container(&self, request: &DockerContainerCreationRequest) -> Result<String> {
        let container_name = request.hostname.clone();
        self.record(format!("create_container({container_name})"))
            .await;
        let behaviour = self.behaviour_for(&container_name).await;
        if let Some(reason) = behaviour.create_fails {
            return Err(reason).stack_err("scripted create_container failure");
        }
        // The fake client uses the container's declared name as its "Docker
        // id" so later calls (start/inspect/stop/remove), which only see the
        // id, can still look the scripted behaviour back up by name.
        let _ = self.next_docker_id();
        Ok(container_name)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.record(format!("start_container({container_id})"))
            .await;
        let behaviour = self.behaviour_for(container_id).await;
        if let Some(reason) = behaviour.start_fails {
            return Err(reason).stack_err("scripted start_container failure");
        }
        Ok(())
    }

    async fn inspect_health(&self, container_id: &str) -> Result<HealthStatus> {
        self.record(format!("inspect_health({container_id})"))
            .await;
        let behaviour = self.behaviour_for(container_id).await;
        let sequence = if behaviour.health_sequence.is_empty() {
            vec![HealthStatus::NoHealthCheck]
        } else {
            behaviour.health_sequence
        };
        let mut cursors = self.health_cursors.lock().await;
        let cursor = cursors.entry(container_id.to_owned()).or_default();
        let status = sequence[cursor.index.min(sequence.len() - 1)];
        if cursor.index + 1 < sequence.len() {
            cursor.index += 1;
        }
        Ok(status)
    }

    async fn run_attached(
        &self,
        container_id: &str,
        output: mpsc::UnboundedSender<OutputChunk>,
    ) -> Result<i64> {
        self.record(format!("run_attached({container_id})")).await;
        let behaviour = self.behaviour_for(container_id).await;
        for chunk in behaviour.output {
            let _ = output.send(chunk);
        }
        Ok(behaviour.exit_code)
    }

    async fn stop_container(&self, container_id: &str, _grace_period: Duration) -> Result<()> {
        self.record(format!("stop_container({container_id})"))
            .await;
        Ok(())
    }

    async fn kill_container(&self, container_id: &str) -> Result<()> {
        self.record(format!("kill_container({container_id})"))
            .await;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.record(format!("remove_container({container_id})"))
            .await;
        Ok(())
    }
}
