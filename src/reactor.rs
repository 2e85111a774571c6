//! The pure `event -> Vec<TaskStep>` dispatch function that drives forward
//! progress (§4.4). New state-machine logic with no direct teacher
//! counterpart — the teacher sequences a container network's lifecycle
//! imperatively inside `ContainerNetwork`'s own methods — translated here
//! into an explicit reactor over an append-only event log per §9's design
//! note, while keeping the teacher's invariant discipline (health-check
//! absent means healthy, teardown is best-effort and total).

use crate::context::TaskContext;
use crate::event::TaskEvent;
use crate::step::TaskStep;
use crate::CleanupPlanner;

/// Stateless: every query it needs is read back out of `ctx.events` or
/// `ctx.model`, so calling `react` twice with the same event and the same
/// context snapshot produces the same steps (§8 "idempotent reactor").
pub struct EventReactor;

impl EventReactor {
    /// The steps that kick off a brand-new run: create the task network, and
    /// start building or pulling every container's image. There is no
    /// `TaskStarted` event in the log (§3 calls this seeding "synthetic") —
    /// this is called once, directly by the Run Loop, before any event
    /// exists.
    pub fn seed(ctx: &TaskContext) -> Vec<TaskStep> {
        let mut steps = vec![TaskStep::CreateTaskNetwork];
        for container in ctx.model.containers_in_build_order() {
            steps.push(image_step(&container.name, ctx));
        }
        steps
    }

    /// Computes the steps `event` unblocks. Never mutates anything except
    /// `ctx`'s monotonic `isAborting` flag and `cleanup_triggered` latch,
    /// both of which only ever move from false to true.
    pub async fn react(event: &TaskEvent, ctx: &TaskContext) -> Vec<TaskStep> {
        if event.is_failure() {
            ctx.set_aborting();
            return trigger_cleanup(ctx).await;
        }

        match event {
            TaskEvent::UserInterrupted { .. } => {
                ctx.set_aborting();
                trigger_cleanup(ctx).await
            }
            TaskEvent::RunningContainerExited { .. } => trigger_cleanup(ctx).await,

            TaskEvent::ImageBuilt { container, .. } | TaskEvent::ImagePulled { container, .. } => {
                on_image_ready(container, ctx).await
            }
            TaskEvent::TaskNetworkCreated { .. } => on_network_created(ctx).await,
            TaskEvent::ContainerCreated { container, .. } => {
                on_container_created(container, ctx).await
            }
            TaskEvent::ContainerStarted { container, .. } => {
                if ctx.is_aborting() {
                    vec![]
                } else {
                    vec![TaskStep::WaitForContainerToBecomeHealthy {
                        container: container.clone(),
                    }]
                }
            }
            TaskEvent::ContainerBecameHealthy { container, .. } => {
                on_container_healthy(container, ctx).await
            }

            // Teardown-phase events: once cleanup has started, every
            // Stop/Remove/network-delete completion re-plans the remainder.
            TaskEvent::ContainerStopped { .. }
            | TaskEvent::ContainerRemoved { .. }
            | TaskEvent::TaskNetworkDeleted { .. } => {
                if ctx.is_cleanup_triggered() {
                    CleanupPlanner::plan(ctx).await
                } else {
                    vec![]
                }
            }

            TaskEvent::ImageBuildProgress { .. } | TaskEvent::TemporaryFileDeleted { .. } => {
                vec![]
            }

            // `*Failed`/`ExecutionAborted` already handled above via
            // `is_failure`.
            TaskEvent::ImageBuildFailed { .. }
            | TaskEvent::TaskNetworkCreationFailed { .. }
            | TaskEvent::ContainerCreationFailed { .. }
            | TaskEvent::ContainerStartFailed { .. }
            | TaskEvent::ContainerDidNotBecomeHealthy { .. }
            | TaskEvent::ExecutionAborted { .. } => unreachable!("handled by is_failure above"),
        }
    }
}

async fn trigger_cleanup(ctx: &TaskContext) -> Vec<TaskStep> {
    ctx.start_cleanup();
    CleanupPlanner::plan(ctx).await
}

fn image_step(container: &str, ctx: &TaskContext) -> TaskStep {
    let container = ctx
        .model
        .container(container)
        .expect("seed only ever iterates containers present in the model");
    match &container.image_source {
        crate::model::ImageSource::Build { .. } => TaskStep::BuildImage {
            container: container.name.clone(),
        },
        crate::model::ImageSource::Pull { .. } => TaskStep::PullImage {
            container: container.name.clone(),
        },
    }
}

async fn network_created(ctx: &TaskContext) -> bool {
    !ctx.events
        .of_type(|e| matches!(e, TaskEvent::TaskNetworkCreated { .. }))
        .await
        .is_empty()
}

async fn image_ready(name: &str, ctx: &TaskContext) -> bool {
    ctx.events
        .of_type(|e| match e {
            TaskEvent::ImageBuilt { container, .. } | TaskEvent::ImagePulled { container, .. } => {
                container == name
            }
            _ => false,
        })
        .await
        .len()
        > 0
}

async fn container_healthy(name: &str, ctx: &TaskContext) -> bool {
    ctx.events
        .of_type(|e| matches!(e, TaskEvent::ContainerBecameHealthy { container, .. } if container == name))
        .await
        .len()
        > 0
}

async fn container_started(name: &str, ctx: &TaskContext) -> bool {
    ctx.events
        .of_type(|e| matches!(e, TaskEvent::ContainerStarted { container, .. } if container == name))
        .await
        .len()
        > 0
}

/// All of `name`'s declared dependencies have reported healthy (§4.4;
/// containers with no healthcheck still go through `ContainerBecameHealthy`,
/// so this check alone covers the "no healthcheck means healthy" rule).
async fn dependencies_healthy(name: &str, ctx: &TaskContext) -> bool {
    let Some(container) = ctx.model.container(name) else {
        return false;
    };
    for dep in &container.dependencies {
        if !container_healthy(dep, ctx).await {
            return false;
        }
    }
    true
}

async fn on_image_ready(container: &str, ctx: &TaskContext) -> Vec<TaskStep> {
    if ctx.is_aborting() {
        return vec![];
    }
    if network_created(ctx).await {
        vec![TaskStep::CreateContainer {
            container: container.to_owned(),
        }]
    } else {
        vec![]
    }
}

async fn on_network_created(ctx: &TaskContext) -> Vec<TaskStep> {
    if ctx.is_aborting() {
        return vec![];
    }
    let mut steps = Vec::new();
    for name in ctx.model.container_names() {
        if image_ready(name, ctx).await {
            steps.push(TaskStep::CreateContainer {
                container: name.to_owned(),
            });
        }
    }
    steps
}

async fn on_container_created(container: &str, ctx: &TaskContext) -> Vec<TaskStep> {
    if ctx.is_aborting() {
        return vec![];
    }
    if dependencies_healthy(container, ctx).await {
        vec![TaskStep::StartContainer {
            container: container.to_owned(),
        }]
    } else {
        vec![]
    }
}

async fn on_container_healthy(container: &str, ctx: &TaskContext) -> Vec<TaskStep> {
    if ctx.is_aborting() {
        return vec![];
    }
    let mut steps = Vec::new();

    // Any sibling container whose dependencies are now all satisfied (and
    // which hasn't already been started) is unblocked.
    for name in ctx.model.container_names() {
        if name == container {
            continue;
        }
        if container_started(name, ctx).await {
            continue;
        }
        if dependencies_healthy(name, ctx).await {
            steps.push(TaskStep::StartContainer {
                container: name.to_owned(),
            });
        }
    }

    if ctx.model.is_main_container(container) {
        steps.push(TaskStep::RunContainer {
            container: container.to_owned(),
        });
    }

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Container, HealthCheckConfig, ImageSource, Task, TaskModel};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use std::time::SystemTime;

    fn two_container_model() -> Arc<TaskModel> {
        let db = Container {
            name: "db".into(),
            image_source: ImageSource::Pull {
                reference: "postgres:16".into(),
            },
            command: None,
            environment: BTreeMap::new(),
            working_dir: None,
            volume_mounts: BTreeSet::new(),
            port_mappings: BTreeSet::new(),
            health_check: HealthCheckConfig::default(),
            user_and_group: None,
            dependencies: BTreeSet::new(),
        };
        let mut app_deps = BTreeSet::new();
        app_deps.insert("db".to_owned());
        let app = Container {
            name: "app".into(),
            image_source: ImageSource::Build {
                context_path: "/tmp/context".into(),
                dockerfile: None,
                build_args: BTreeMap::new(),
            },
            command: None,
            environment: BTreeMap::new(),
            working_dir: None,
            volume_mounts: BTreeSet::new(),
            port_mappings: BTreeSet::new(),
            health_check: HealthCheckConfig::default(),
            user_and_group: None,
            dependencies: app_deps,
        };
        let task = Task {
            name: "run".into(),
            main_container: "app".into(),
            command_override: None,
            environment_overrides: BTreeMap::new(),
        };
        Arc::new(TaskModel::resolve(task, vec![db, app]).unwrap())
    }

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH
    }

    #[test]
    fn seed_builds_and_pulls_every_container_plus_the_network() {
        let ctx = TaskContext::new(two_container_model());
        let steps = EventReactor::seed(&ctx);
        assert!(steps.contains(&TaskStep::CreateTaskNetwork));
        assert!(steps.contains(&TaskStep::PullImage {
            container: "db".into()
        }));
        assert!(steps.contains(&TaskStep::BuildImage {
            container: "app".into()
        }));
    }

    #[tokio::test]
    async fn container_created_waits_for_unhealthy_dependency() {
        let ctx = TaskContext::new(two_container_model());
        let steps = EventReactor::react(
            &TaskEvent::ContainerCreated {
                container: "app".into(),
                docker_container: "app-id".into(),
                at: now(),
            },
            &ctx,
        )
        .await;
        assert!(steps.is_empty());
    }

    #[tokio::test]
    async fn container_healthy_cascades_to_dependents_and_runs_main_container() {
        let ctx = TaskContext::new(two_container_model());
        ctx.events
            .append(TaskEvent::ContainerCreated {
                container: "app".into(),
                docker_container: "app-id".into(),
                at: now(),
            })
            .await;

        let steps = EventReactor::react(
            &TaskEvent::ContainerBecameHealthy {
                container: "db".into(),
                at: now(),
            },
            &ctx,
        )
        .await;

        assert!(steps.contains(&TaskStep::StartContainer {
            container: "app".into()
        }));
    }

    #[tokio::test]
    async fn main_container_healthy_is_run_not_started_again() {
        let ctx = TaskContext::new(two_container_model());
        let steps = EventReactor::react(
            &TaskEvent::ContainerBecameHealthy {
                container: "app".into(),
                at: now(),
            },
            &ctx,
        )
        .await;
        assert!(steps.contains(&TaskStep::RunContainer {
            container: "app".into()
        }));
        assert!(!steps
            .iter()
            .any(|s| matches!(s, TaskStep::StartContainer { .. })));
    }

    #[tokio::test]
    async fn reacting_to_the_same_event_twice_is_idempotent() {
        let ctx = TaskContext::new(two_container_model());
        let event = TaskEvent::TaskNetworkCreated {
            network: "batect-task-abc".into(),
            at: now(),
        };
        ctx.events
            .append(TaskEvent::ImagePulled {
                container: "db".into(),
                image: "postgres:16".into(),
                at: now(),
            })
            .await;

        let first = EventReactor::react(&event, &ctx).await;
        let second = EventReactor::react(&event, &ctx).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn a_failure_event_sets_aborting_and_starts_cleanup() {
        let ctx = TaskContext::new(two_container_model());
        assert!(!ctx.is_aborting());
        let _ = EventReactor::react(
            &TaskEvent::ContainerCreationFailed {
                container: "db".into(),
                reason: "no such image".into(),
                at: now(),
            },
            &ctx,
        )
        .await;
        assert!(ctx.is_aborting());
        assert!(ctx.is_cleanup_triggered());
    }
}
