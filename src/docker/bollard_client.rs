//! `bollard`-backed `DockerClient` (§6). Grounded on
//! `api_docker::container_runner::ContainerRunner::start_container`,
//! `api_docker::container_network::ContainerNetwork::{create,wait_healthy}`,
//! and `api_docker::container_runner::total_teardown` for exact call shapes.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::network::CreateNetworkOptions;
use bollard::secret::HealthStatusEnum;
use bollard::Docker;
use futures::StreamExt;
use stacked_errors::{Result, StackableErr};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use super::json::DockerContainerCreationRequest;
use super::{BuildProgressLine, DockerClient, HealthStatus, OutputChunk};

/// Process-wide unified `bollard::Docker` handle, acquired lazily behind a
/// `tokio::sync::Mutex` so concurrent engine invocations within the same
/// process never race to open the socket twice. Grounded on
/// `api_docker::docker_socket::get_or_init_default_docker_instance`.
async fn docker_handle() -> Result<Docker> {
    static DOCKER: OnceLock<Docker> = OnceLock::new();
    static LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

    if let Some(docker) = DOCKER.get() {
        return Ok(docker.clone());
    }
    let _guard = LOCK.lock().await;
    if let Some(docker) = DOCKER.get() {
        return Ok(docker.clone());
    }
    let docker = Docker::connect_with_local_defaults().stack_err(
        "failed to connect to the Docker daemon (check DOCKER_HOST/DOCKER_CERT_PATH/DOCKER_TLS_VERIFY)",
    )?;
    let _ = DOCKER.set(docker);
    Ok(DOCKER.get().unwrap().clone())
}

/// The concrete `DockerClient` used outside of tests.
#[derive(Debug, Clone, Default)]
pub struct BollardDockerClient;

impl BollardDockerClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DockerClient for BollardDockerClient {
    #[tracing::instrument(skip(self, build_args, progress))]
    async fn build_image(
        &self,
        context_path: &str,
        dockerfile: Option<&str>,
        build_args: &[(String, String)],
        tag: &str,
        progress: mpsc::UnboundedSender<BuildProgressLine>,
    ) -> Result<String> {
        let docker = docker_handle().await.stack()?;

        let context_tar = tokio::task::spawn_blocking({
            let context_path = context_path.to_owned();
            move || build_context_tar(&context_path)
        })
        .await
        .stack()??;

        let build_args: std::collections::HashMap<String, String> =
            build_args.iter().cloned().collect();

        let options = BuildImageOptions {
            dockerfile: dockerfile.unwrap_or("Dockerfile").to_owned(),
            t: tag.to_owned(),
            buildargs: build_args,
            rm: true,
            ..Default::default()
        };

        let mut stream = docker.build_image(options, None, Some(context_tar.into()));
        while let Some(chunk) = stream.next().await {
            let info = chunk.stack_err("error while streaming `docker build` progress")?;
            if let Some(error) = info.error {
                return Err(error).stack_err("image build failed");
            }
            if let Some(stream_text) = info.stream {
                let _ = progress.send(BuildProgressLine {
                    percent: None,
                    message: stream_text,
                });
            }
            if let Some(status) = info.status {
                let percent = info
                    .progress_detail
                    .as_ref()
                    .and_then(|d| match (d.current, d.total) {
                        (Some(current), Some(total)) if total > 0 => {
                            Some(current as f32 / total as f32 * 100.0)
                        }
                        _ => None,
                    });
                let _ = progress.send(BuildProgressLine {
                    percent,
                    message: status,
                });
            }
        }

        Ok(tag.to_owned())
    }

    #[tracing::instrument(skip(self))]
    async fn pull_image(&self, reference: &str) -> Result<String> {
        let docker = docker_handle().await.stack()?;
        let mut stream = docker.create_image(
            Some(CreateImageOptions {
                from_image: reference.to_owned(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(chunk) = stream.next().await {
            let info = chunk.stack_err_with(|| format!("failed to pull image {reference}"))?;
            if let Some(error) = info.error {
                return Err(error).stack_err_with(|| format!("failed to pull image {reference}"));
            }
        }
        Ok(reference.to_owned())
    }

    #[tracing::instrument(skip(self))]
    async fn create_network(&self, name: &str) -> Result<String> {
        let docker = docker_handle().await.stack()?;
        let response = docker
            .create_network(CreateNetworkOptions {
                name: name.to_owned(),
                driver: "bridge".to_owned(),
                ..Default::default()
            })
            .await
            .stack_err_with(|| format!("failed to create task network {name}"))?;
        Ok(response.id)
    }

    #[tracing::instrument(skip(self))]
    async fn remove_network(&self, network: &str) -> Result<()> {
        let docker = docker_handle().await.stack()?;
        match docker.remove_network(network).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e).stack_err_with(|| format!("failed to remove network {network}")),
        }
    }

    #[tracing::instrument(skip(self, request))]
    async fn create_container(&self, request: &DockerContainerCreationRequest) -> Result<String> {
        let docker = docker_handle().await.stack()?;
        let value: serde_json::Value = serde_json::from_str(&request.to_json())
            .stack_err("DockerContainerCreationRequest failed to round-trip through JSON")?;
        let config: Config<String> = serde_json::from_value(value)
            .stack_err("DockerContainerCreationRequest did not match bollard::container::Config")?;
        let response = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: request.hostname.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .stack_err("failed to create container")?;
        Ok(response.id)
    }

    #[tracing::instrument(skip(self))]
    async fn start_container(&self, container_id: &str) -> Result<()> {
        let docker = docker_handle().await.stack()?;
        docker
            .start_container::<String>(container_id, None)
            .await
            .stack_err_with(|| format!("failed to start container {container_id}"))
    }

    #[tracing::instrument(skip(self))]
    async fn inspect_health(&self, container_id: &str) -> Result<HealthStatus> {
        let docker = docker_handle().await.stack()?;
        let info = docker
            .inspect_container(container_id, None)
            .await
            .stack_err_with(|| format!("failed to inspect container {container_id}"))?;
        let Some(health) = info.state.and_then(|s| s.health) else {
            return Ok(HealthStatus::NoHealthCheck);
        };
        Ok(match health.status {
            Some(HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
            Some(HealthStatusEnum::STARTING) => HealthStatus::Starting,
            Some(HealthStatusEnum::EMPTY) | Some(HealthStatusEnum::NONE) | None => {
                HealthStatus::NoHealthCheck
            }
        })
    }

    #[tracing::instrument(skip(self, output))]
    async fn run_attached(
        &self,
        container_id: &str,
        output: mpsc::UnboundedSender<OutputChunk>,
    ) -> Result<i64> {
        let docker = docker_handle().await.stack()?;

        // The container is already running by the time `RunContainer` fires
        // (the Reactor's `StartContainer` step starts it before this; §4.3
        // only asks this to attach to stdio and block on exit, not start it
        // again — a second `start_container` on an already-running container
        // returns HTTP 304, not success).
        let attach = docker
            .attach_container(
                container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .stack_err_with(|| format!("failed to attach to container {container_id}"))?;

        let wait_stream = docker.wait_container::<String>(container_id, None);

        let mut log_stream = attach.output;
        let forward = tokio::spawn(async move {
            while let Some(chunk) = log_stream.next().await {
                let Ok(chunk) = chunk else { break };
                let forwarded = match chunk {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        Some(OutputChunk::Stdout(message.to_vec()))
                    }
                    LogOutput::StdErr { message } => Some(OutputChunk::Stderr(message.to_vec())),
                    LogOutput::StdIn { .. } => None,
                };
                if let Some(chunk) = forwarded {
                    let _ = output.send(chunk);
                }
            }
        });

        let mut wait_stream = Box::pin(wait_stream);
        let exit_code = match wait_stream.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e).stack_err("error waiting for container to exit"),
            None => 0,
        };

        let _ = forward.await;
        Ok(exit_code)
    }

    #[tracing::instrument(skip(self))]
    async fn stop_container(&self, container_id: &str, grace_period: Duration) -> Result<()> {
        let docker = docker_handle().await.stack()?;
        match docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: grace_period.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => {
                Err(e).stack_err_with(|| format!("failed to stop container {container_id}"))
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn kill_container(&self, container_id: &str) -> Result<()> {
        let docker = docker_handle().await.stack()?;
        match docker.kill_container::<String>(container_id, None).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => {
                Err(e).stack_err_with(|| format!("failed to kill container {container_id}"))
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let docker = docker_handle().await.stack()?;
        match docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => {
                Err(e).stack_err_with(|| format!("failed to remove container {container_id}"))
            }
        }
    }
}

/// Tars up a build context directory for `docker build`. Grounded on
/// `api_docker::super_tar`/`tarball` (the teacher streams a similar tarball
/// to the build endpoint), simplified to the plain `tar` crate since the
/// engine has no need for the teacher's incremental/checksum-diffing variant.
fn build_context_tar(context_path: &str) -> Result<bytes::Bytes> {
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", context_path)
        .stack_err_with(|| format!("failed to tar build context {context_path}"))?;
    let bytes = builder
        .into_inner()
        .stack_err("failed to finalize build context tarball")?;
    Ok(bytes::Bytes::from(bytes))
}
