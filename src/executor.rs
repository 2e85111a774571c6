//! The Step Executor: a worker pool that pops steps off the Step Queue,
//! invokes the `DockerClient` for each, and turns the outcome into the
//! events that drive the rest of the engine (§4.3).
//!
//! Grounded on the teacher's use of `tokio::task::spawn` per concurrent unit
//! of work and `futures::future::join_all`-style fan-out in
//! `container_runner.rs::total_teardown`; here each worker is a long-lived
//! task rather than one spawn per step, since steps arrive continuously for
//! the life of a run rather than as a single batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::command_line::split_command_line;
use crate::context::TaskContext;
use crate::docker::json::DockerContainerCreationRequest;
use crate::docker::{DockerClient, HealthStatus};
use crate::event::{TaskEvent, HEALTH_POLL_FLOOR};
use crate::run_loop::EngineConfig;
use crate::step::{health_wait_budget, TaskStep};
use crate::stream;

/// What a worker sends back to the Run Loop. Events and the "this step is
/// fully done" marker travel over the same ordered channel so the Run Loop
/// can detect quiescence without a race: by the time `StepCompleted` for a
/// step arrives, every event that step produced has already been delivered
/// ahead of it (§4.6).
pub enum RunLoopMessage {
    Event(TaskEvent),
    StepCompleted,
}

pub struct StepExecutor<D: DockerClient + 'static> {
    docker: Arc<D>,
    ctx: TaskContext,
    tx: mpsc::UnboundedSender<RunLoopMessage>,
    config: EngineConfig,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<D: DockerClient + 'static> StepExecutor<D> {
    pub fn new(
        docker: Arc<D>,
        ctx: TaskContext,
        tx: mpsc::UnboundedSender<RunLoopMessage>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            docker,
            ctx,
            tx,
            config,
            workers: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn spawn_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock().expect("executor worker list poisoned");
        for _ in 0..self.config.worker_count.max(1) {
            let executor = self.clone();
            workers.push(tokio::spawn(async move { executor.worker_loop().await }));
        }
    }

    /// Aborts every worker task. Steps mid-flight are simply dropped; any
    /// partial Docker-side effect they had is cleaned up on a subsequent run
    /// the same way a crashed engine process would be (§4.5's cleanup is
    /// idempotent by design). Only called once the Run Loop has already
    /// observed quiescence.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self
            .workers
            .lock()
            .expect("executor worker list poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            // `pop_wait` claims the step as in-flight atomically with
            // removing it from the queue (§4.6), so there is no window
            // where the queue is empty but this step isn't yet counted.
            let step = self.ctx.queue.pop_wait().await;
            let events = handle_step(&step, &*self.docker, &self.ctx, &self.config).await;
            for event in events {
                self.ctx.events.append(event.clone()).await;
                if self.tx.send(RunLoopMessage::Event(event)).is_err() {
                    return;
                }
            }
            // Release before sending `StepCompleted`: the Run Loop's
            // quiescence check runs right after receiving that message, and
            // the channel send establishes happens-before, so the release
            // must already be ordered ahead of it.
            self.ctx.queue.release();
            if self.tx.send(RunLoopMessage::StepCompleted).is_err() {
                return;
            }
        }
    }
}

fn now() -> SystemTime {
    SystemTime::now()
}

/// Dispatches one step to its handler (§4.3). Handlers are pure functions
/// from `(step, docker client, task context read-view)` to the event(s) the
/// step produced; none of them enqueue further steps themselves — that is
/// the Reactor's job once the Run Loop has appended the event.
async fn handle_step(
    step: &TaskStep,
    docker: &dyn DockerClient,
    ctx: &TaskContext,
    config: &EngineConfig,
) -> Vec<TaskEvent> {
    match step {
        TaskStep::BuildImage { container } => build_image(container, docker, ctx).await,
        TaskStep::PullImage { container } => pull_image(container, docker, ctx).await,
        TaskStep::CreateTaskNetwork => create_task_network(docker, ctx).await,
        TaskStep::CreateContainer { container } => {
            create_container(container, docker, ctx).await
        }
        TaskStep::StartContainer { container } => start_container(container, docker, ctx).await,
        TaskStep::WaitForContainerToBecomeHealthy { container } => {
            wait_for_healthy(container, docker, ctx, config).await
        }
        TaskStep::RunContainer { container } => run_container(container, docker, ctx).await,
        TaskStep::StopContainer { container } => {
            stop_container(container, docker, ctx, config).await
        }
        TaskStep::RemoveContainer { container } => {
            remove_container(container, docker, ctx).await
        }
        TaskStep::DeleteTaskNetwork => delete_task_network(docker, ctx).await,
        TaskStep::DeleteTemporaryFile { path } => delete_temp_file(path, ctx).await,
    }
}

async fn build_image(
    container_name: &str,
    docker: &dyn DockerClient,
    ctx: &TaskContext,
) -> Vec<TaskEvent> {
    let Some(container) = ctx.model.container(container_name) else {
        return vec![aborted(format!("unknown container {container_name}"))];
    };
    let crate::model::ImageSource::Build {
        context_path,
        dockerfile,
        build_args,
    } = &container.image_source
    else {
        return vec![aborted(format!(
            "container {container_name} has no build configuration"
        ))];
    };

    let tag = format!("batect-{container_name}:latest");
    let build_args: Vec<(String, String)> = build_args
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let forward_container = container_name.to_owned();
    let events = ctx.events.clone();
    let forward = tokio::spawn(async move {
        while let Some(line) = progress_rx.recv().await {
            events
                .append(TaskEvent::ImageBuildProgress {
                    container: forward_container.clone(),
                    percent: line.percent,
                    message: line.message,
                    at: now(),
                })
                .await;
        }
    });

    let context_path_str = context_path.to_string_lossy();
    let dockerfile_str = dockerfile.as_ref().map(|d| d.to_string_lossy());
    let result = docker
        .build_image(
            &context_path_str,
            dockerfile_str.as_deref(),
            &build_args,
            &tag,
            progress_tx,
        )
        .await;
    let _ = forward.await;

    match result {
        Ok(image) => vec![TaskEvent::ImageBuilt {
            container: container_name.to_owned(),
            image,
            at: now(),
        }],
        Err(e) => vec![TaskEvent::ImageBuildFailed {
            container: container_name.to_owned(),
            reason: e.to_string(),
            at: now(),
        }],
    }
}

async fn pull_image(
    container_name: &str,
    docker: &dyn DockerClient,
    ctx: &TaskContext,
) -> Vec<TaskEvent> {
    let Some(container) = ctx.model.container(container_name) else {
        return vec![aborted(format!("unknown container {container_name}"))];
    };
    let crate::model::ImageSource::Pull { reference } = &container.image_source else {
        return vec![aborted(format!(
            "container {container_name} has no pull configuration"
        ))];
    };

    match docker.pull_image(reference).await {
        Ok(image) => vec![TaskEvent::ImagePulled {
            container: container_name.to_owned(),
            image,
            at: now(),
        }],
        Err(e) => vec![aborted(format!(
            "failed to pull image for {container_name}: {e}"
        ))],
    }
}

async fn create_task_network(docker: &dyn DockerClient, ctx: &TaskContext) -> Vec<TaskEvent> {
    let name = format!("batect-task-{}", Uuid::new_v4());
    match docker.create_network(&name).await {
        Ok(_docker_id) => {
            ctx.set_network_name(&name).await;
            vec![TaskEvent::TaskNetworkCreated {
                network: name,
                at: now(),
            }]
        }
        Err(e) => vec![TaskEvent::TaskNetworkCreationFailed {
            reason: e.to_string(),
            at: now(),
        }],
    }
}

async fn create_container(
    container_name: &str,
    docker: &dyn DockerClient,
    ctx: &TaskContext,
) -> Vec<TaskEvent> {
    let Some(container) = ctx.model.container(container_name) else {
        return vec![aborted(format!("unknown container {container_name}"))];
    };
    let Some(network_name) = ctx.network_name().await else {
        return vec![TaskEvent::ContainerCreationFailed {
            container: container_name.to_owned(),
            reason: "task network has not been created yet".to_owned(),
            at: now(),
        }];
    };

    let image = image_reference_for(container);

    let command = if ctx.model.is_main_container(container_name) {
        match &ctx.model.task.command_override {
            Some(override_line) => match split_command_line(override_line) {
                Ok(words) => words,
                Err(e) => {
                    return vec![TaskEvent::ContainerCreationFailed {
                        container: container_name.to_owned(),
                        reason: e.to_string(),
                        at: now(),
                    }]
                }
            },
            None => container.command.clone().unwrap_or_default(),
        }
    } else {
        container.command.clone().unwrap_or_default()
    };

    let env_overrides = if ctx.model.is_main_container(container_name) {
        ctx.model.task.environment_overrides.clone()
    } else {
        BTreeMap::new()
    };

    let host_term = std::env::var("TERM").ok();
    let request = DockerContainerCreationRequest::build(
        container,
        &image,
        &network_name,
        command,
        &env_overrides,
        host_term.as_deref(),
    );

    match docker.create_container(&request).await {
        Ok(docker_id) => {
            ctx.record_docker_container_id(container_name, &docker_id)
                .await;
            vec![TaskEvent::ContainerCreated {
                container: container_name.to_owned(),
                docker_container: docker_id,
                at: now(),
            }]
        }
        Err(e) => vec![TaskEvent::ContainerCreationFailed {
            container: container_name.to_owned(),
            reason: e.to_string(),
            at: now(),
        }],
    }
}

fn image_reference_for(container: &crate::model::Container) -> String {
    match &container.image_source {
        crate::model::ImageSource::Pull { reference } => reference.clone(),
        crate::model::ImageSource::Build { .. } => format!("batect-{}:latest", container.name),
    }
}

async fn start_container(
    container_name: &str,
    docker: &dyn DockerClient,
    ctx: &TaskContext,
) -> Vec<TaskEvent> {
    let Some(docker_id) = ctx.docker_container_id(container_name).await else {
        return vec![TaskEvent::ContainerStartFailed {
            container: container_name.to_owned(),
            reason: "container has not been created yet".to_owned(),
            at: now(),
        }];
    };
    match docker.start_container(&docker_id).await {
        Ok(()) => vec![TaskEvent::ContainerStarted {
            container: container_name.to_owned(),
            at: now(),
        }],
        Err(e) => vec![TaskEvent::ContainerStartFailed {
            container: container_name.to_owned(),
            reason: e.to_string(),
            at: now(),
        }],
    }
}

/// Polls health at `max(HEALTH_POLL_FLOOR, declared interval)` until the
/// container reports healthy, unhealthy, or the computed budget elapses
/// (§4.3, §9's health-poll-floor decision).
async fn wait_for_healthy(
    container_name: &str,
    docker: &dyn DockerClient,
    ctx: &TaskContext,
    config: &EngineConfig,
) -> Vec<TaskEvent> {
    let Some(container) = ctx.model.container(container_name) else {
        return vec![aborted(format!("unknown container {container_name}"))];
    };
    let Some(docker_id) = ctx.docker_container_id(container_name).await else {
        return vec![TaskEvent::ContainerDidNotBecomeHealthy {
            container: container_name.to_owned(),
            reason: "container has not been created yet".to_owned(),
            at: now(),
        }];
    };

    let interval = container
        .health_check
        .interval
        .unwrap_or(config.default_health_interval)
        .max(config.health_poll_floor.max(HEALTH_POLL_FLOOR));
    let retries = container.health_check.retries.unwrap_or(3);
    let start_period = container.health_check.start_period.unwrap_or(Duration::ZERO);
    let budget = health_wait_budget(start_period, retries, interval, Duration::from_secs(5));

    let deadline = Instant::now() + budget;
    loop {
        match docker.inspect_health(&docker_id).await {
            Ok(HealthStatus::NoHealthCheck | HealthStatus::Healthy) => {
                return vec![TaskEvent::ContainerBecameHealthy {
                    container: container_name.to_owned(),
                    at: now(),
                }]
            }
            Ok(HealthStatus::Unhealthy) => {
                return vec![TaskEvent::ContainerDidNotBecomeHealthy {
                    container: container_name.to_owned(),
                    reason: "container reported unhealthy".to_owned(),
                    at: now(),
                }]
            }
            Ok(HealthStatus::Starting) => {}
            Err(e) => {
                return vec![TaskEvent::ContainerDidNotBecomeHealthy {
                    container: container_name.to_owned(),
                    reason: format!("failed to inspect container health: {e}"),
                    at: now(),
                }]
            }
        }

        if Instant::now() >= deadline {
            return vec![TaskEvent::ContainerDidNotBecomeHealthy {
                container: container_name.to_owned(),
                reason: "timed out waiting to become healthy".to_owned(),
                at: now(),
            }];
        }
        tokio::time::sleep(interval).await;
    }
}

async fn run_container(
    container_name: &str,
    docker: &dyn DockerClient,
    ctx: &TaskContext,
) -> Vec<TaskEvent> {
    let Some(docker_id) = ctx.docker_container_id(container_name).await else {
        return vec![aborted(format!(
            "main container {container_name} has not been created yet"
        ))];
    };
    match stream::run_attached(docker, container_name, &docker_id).await {
        Ok(exit_code) => vec![TaskEvent::RunningContainerExited {
            container: container_name.to_owned(),
            exit_code,
            at: now(),
        }],
        Err(e) => vec![aborted(format!(
            "failed to run container {container_name}: {e}"
        ))],
    }
}

async fn stop_container(
    container_name: &str,
    docker: &dyn DockerClient,
    ctx: &TaskContext,
    config: &EngineConfig,
) -> Vec<TaskEvent> {
    let Some(docker_id) = ctx.docker_container_id(container_name).await else {
        // Never created (e.g. its image never finished building before
        // abort) — nothing to stop, treat as already done (§4.3 idempotent).
        return vec![TaskEvent::ContainerStopped {
            container: container_name.to_owned(),
            at: now(),
        }];
    };
    if let Err(e) = docker
        .stop_container(&docker_id, config.interrupt_grace_period)
        .await
    {
        ctx.record_cleanup_failure(format!("failed to stop {container_name}: {e}"))
            .await;
    }
    vec![TaskEvent::ContainerStopped {
        container: container_name.to_owned(),
        at: now(),
    }]
}

async fn remove_container(
    container_name: &str,
    docker: &dyn DockerClient,
    ctx: &TaskContext,
) -> Vec<TaskEvent> {
    if let Some(docker_id) = ctx.docker_container_id(container_name).await {
        if let Err(e) = docker.remove_container(&docker_id).await {
            ctx.record_cleanup_failure(format!("failed to remove {container_name}: {e}"))
                .await;
        }
    }
    vec![TaskEvent::ContainerRemoved {
        container: container_name.to_owned(),
        at: now(),
    }]
}

async fn delete_task_network(docker: &dyn DockerClient, ctx: &TaskContext) -> Vec<TaskEvent> {
    if let Some(name) = ctx.network_name().await {
        if let Err(e) = docker.remove_network(&name).await {
            ctx.record_cleanup_failure(format!("failed to remove task network: {e}"))
                .await;
        }
    }
    vec![TaskEvent::TaskNetworkDeleted { at: now() }]
}

async fn delete_temp_file(path: &str, ctx: &TaskContext) -> Vec<TaskEvent> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            ctx.record_cleanup_failure(format!("failed to delete temporary file {path}: {e}"))
                .await;
        }
    }
    vec![TaskEvent::TemporaryFileDeleted {
        path: path.to_owned(),
        at: now(),
    }]
}

fn aborted(reason: String) -> TaskEvent {
    TaskEvent::ExecutionAborted { reason, at: now() }
}
