//! The Docker client the engine consumes (§6). This module defines the
//! `DockerClient` trait the rest of the engine is written against, a
//! `bollard`-backed implementation of it, and the deterministic JSON shape
//! of the container-create request (§6, §8).

mod bollard_client;
pub mod json;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::time::Duration;

use async_trait::async_trait;
use stacked_errors::Result;
use tokio::sync::mpsc;

pub use bollard_client::BollardDockerClient;
pub use json::DockerContainerCreationRequest;

/// A line of image build progress output (§3 `ImageBuildProgress`).
#[derive(Debug, Clone, PartialEq)]
pub struct BuildProgressLine {
    pub percent: Option<f32>,
    pub message: String,
}

/// What `WaitForContainerToBecomeHealthy` polls for (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// The image declares no healthcheck; treated as healthy immediately.
    NoHealthCheck,
    Starting,
    Healthy,
    Unhealthy,
}

/// A line of stdout/stderr from an attached container, forwarded by
/// `RunContainer` (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Typed operations the engine issues against the Docker daemon (§6). Every
/// method is a thin, directly testable wrapper around one Docker Engine API
/// call (or a short, well-defined sequence of them); none of them contain
/// engine scheduling logic, matching §4.3: "Handlers are pure functions from
/// (step, docker client, task context read-view) to one or more events".
#[async_trait]
pub trait DockerClient: Send + Sync {
    /// Builds an image from a build context path, streaming progress lines
    /// to `progress` as they arrive. Returns the built image reference.
    async fn build_image(
        &self,
        context_path: &str,
        dockerfile: Option<&str>,
        build_args: &[(String, String)],
        tag: &str,
        progress: mpsc::UnboundedSender<BuildProgressLine>,
    ) -> Result<String>;

    /// Pulls `reference`, returning the resolved image reference.
    async fn pull_image(&self, reference: &str) -> Result<String>;

    /// Creates a bridge network named `name`, returning its Docker id.
    async fn create_network(&self, name: &str) -> Result<String>;

    /// Removes a network. Not-found is success (§4.3).
    async fn remove_network(&self, network: &str) -> Result<()>;

    /// Issues `/containers/create` with `request`, returning the new
    /// container's Docker id.
    async fn create_container(&self, request: &DockerContainerCreationRequest) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// A single health-status poll (§4.3); callers are responsible for the
    /// polling loop and its budget (`crate::step::health_wait_budget`).
    async fn inspect_health(&self, container_id: &str) -> Result<HealthStatus>;

    /// Attaches to `container_id`'s stdio, starts it, and blocks until it
    /// exits, forwarding output chunks to `output` as they arrive. Returns
    /// the container's exit code. Used only for the task's main container
    /// (§4.3 `RunContainer`).
    async fn run_attached(
        &self,
        container_id: &str,
        output: mpsc::UnboundedSender<OutputChunk>,
    ) -> Result<i64>;

    /// Requests a graceful stop with the given grace period, falling back to
    /// a hard kill once it elapses. Not-found is success.
    async fn stop_container(&self, container_id: &str, grace_period: Duration) -> Result<()>;

    /// Forcibly kills `container_id` (used for the second-interrupt
    /// escalation in §5).
    async fn kill_container(&self, container_id: &str) -> Result<()>;

    /// Removes a container. Not-found is success.
    async fn remove_container(&self, container_id: &str) -> Result<()>;
}
