//! The Run Loop: wires the Event Store, Step Queue, Reactor, Step Executor,
//! and Cleanup Planner together and drives one task run to completion
//! (§4.6).
//!
//! Grounded on the teacher's `CommandRunner::wait_with_timeout`-style
//! "loop until quiescent" shape, adapted from polling to push-based: event
//! delivery here is driven by the Step Executor's `mpsc` channel rather than
//! by re-checking a condition on a timer, since steps complete at unknown
//! times determined by the Docker daemon.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stacked_errors::Result;
use tokio::sync::mpsc;

use crate::context::TaskContext;
use crate::docker::DockerClient;
use crate::event::{TaskEvent, HEALTH_POLL_FLOOR};
use crate::executor::{RunLoopMessage, StepExecutor};
use crate::model::TaskModel;
use crate::reactor::EventReactor;
use crate::stream::{install_ctrlc_handler, watch_for_interrupts, InterruptSignal};

/// Tunables with defaults per §10.3.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent Step Executor workers. Defaults to the host's
    /// available parallelism, floored at 2 so a single-core host can still
    /// overlap Docker I/O with event processing.
    pub worker_count: usize,
    /// Grace period given to a container's own process on `StopContainer`
    /// before Docker escalates to `SIGKILL` (default 10s).
    pub interrupt_grace_period: Duration,
    /// Window after a first interrupt within which a second interrupt
    /// escalates to an immediate force-kill of every live container
    /// (default 5s).
    pub second_interrupt_grace_period: Duration,
    /// Lower bound on the health-check poll interval, regardless of what a
    /// container's own healthcheck declares (default 100ms, §9).
    pub health_poll_floor: Duration,
    /// Poll interval used for a container whose healthcheck declares no
    /// interval of its own (default 30s, Docker's own default).
    pub default_health_interval: Duration,
    /// `DOCKER_HOST`, consumed by the Docker client wrapper rather than by
    /// the engine itself; kept here so callers can observe what was used.
    pub docker_host: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
                .max(2),
            interrupt_grace_period: Duration::from_secs(10),
            second_interrupt_grace_period: Duration::from_secs(5),
            health_poll_floor: HEALTH_POLL_FLOOR,
            default_health_interval: Duration::from_secs(30),
            docker_host: std::env::var("DOCKER_HOST").ok(),
        }
    }
}

/// The result of a completed task run (§4.6).
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// The main container's own exit code if it ran to completion; `1` if
    /// the run aborted before that; `0` otherwise.
    pub exit_code: i32,
    /// The full event log, for callers that want to render a timeline.
    pub events: Vec<TaskEvent>,
    /// Cleanup-stage failures that have no dedicated `TaskEvent` variant
    /// (§7) — surfaced here instead of abandoned.
    pub cleanup_failures: Vec<String>,
}

/// Owns one task run end-to-end: seeds the Reactor, drives steps through the
/// Step Executor until the Step Queue and in-flight work are both quiescent,
/// and reports the outcome.
pub struct Engine<D: DockerClient + 'static> {
    docker: Arc<D>,
    config: EngineConfig,
}

impl<D: DockerClient + 'static> Engine<D> {
    pub fn new(docker: D, config: EngineConfig) -> Self {
        Self {
            docker: Arc::new(docker),
            config,
        }
    }

    #[tracing::instrument(skip(self, model), fields(task = %model.task.name))]
    pub async fn run(&self, model: Arc<TaskModel>) -> Result<TaskOutcome> {
        let ctx = TaskContext::new(model);
        let (tx, mut rx) = mpsc::unbounded_channel::<RunLoopMessage>();

        let signal = InterruptSignal::new();
        if let Err(e) = install_ctrlc_handler(signal.clone()) {
            tracing::warn!(error = %e, "failed to install Ctrl-C handler; SIGINT will terminate the process directly");
        }
        let docker_for_signals: Arc<dyn DockerClient> = self.docker.clone();
        tokio::spawn(watch_for_interrupts(
            signal,
            ctx.clone(),
            docker_for_signals,
            tx.clone(),
            self.config.clone(),
        ));

        let executor = StepExecutor::new(self.docker.clone(), ctx.clone(), tx, self.config.clone());
        executor.spawn_workers();

        ctx.queue.enqueue_all(EventReactor::seed(&ctx)).await;

        let main_container_exit_code = AtomicI64::new(-1);

        loop {
            let Some(message) = rx.recv().await else {
                break;
            };

            match message {
                RunLoopMessage::Event(event) => {
                    if let TaskEvent::RunningContainerExited {
                        container,
                        exit_code,
                        ..
                    } = &event
                    {
                        if ctx.model.is_main_container(container) {
                            main_container_exit_code.store(*exit_code, Ordering::SeqCst);
                        }
                    }
                    let steps = EventReactor::react(&event, &ctx).await;
                    ctx.queue.enqueue_all(steps).await;
                }
                RunLoopMessage::StepCompleted => {
                    if ctx.queue.is_quiescent().await {
                        break;
                    }
                }
            }
        }

        executor.shutdown().await;

        let events = ctx.events.all().await;
        let had_failure = events.iter().any(TaskEvent::is_failure);
        let recorded = main_container_exit_code.load(Ordering::SeqCst);
        let exit_code = if recorded >= 0 {
            recorded as i32
        } else if had_failure {
            1
        } else {
            0
        };

        Ok(TaskOutcome {
            exit_code,
            events,
            cleanup_failures: ctx.cleanup_failures().await,
        })
    }
}
