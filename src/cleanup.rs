//! Teardown planning (§4.5). Triggered once per run by the first of
//! `RunningContainerExited`, a failure event, or `UserInterrupted` (the Run
//! Loop/Reactor call `TaskContext::start_cleanup` exactly once and re-invoke
//! `plan` on every subsequent teardown-phase event so the plan always
//! reflects the latest event log).
//!
//! Grounded directly on `api_docker::container_runner::total_teardown`'s
//! shape — stop every known container, ignore not-found, then remove the
//! network — generalized here into dependency-reverse ordering (a container
//! is only stopped once every live container that depends on it has
//! stopped) plus temporary-file deletion per §10.5.

use std::collections::BTreeSet;

use crate::context::TaskContext;
use crate::step::TaskStep;
use crate::TaskEvent;

pub struct CleanupPlanner;

impl CleanupPlanner {
    /// Recomputes, from the current event log, every teardown step that is
    /// safe to run right now. Pure and idempotent: calling this twice against
    /// the same event log returns the same steps, and the Step Queue's
    /// structural dedup (§4.2) absorbs re-enqueuing a step already pending.
    pub async fn plan(ctx: &TaskContext) -> Vec<TaskStep> {
        let events = ctx.events.all().await;

        let created: BTreeSet<String> = events
            .iter()
            .filter_map(|e| match e {
                TaskEvent::ContainerCreated { container, .. } => Some(container.clone()),
                _ => None,
            })
            .collect();
        let stopped: BTreeSet<String> = events
            .iter()
            .filter_map(|e| match e {
                TaskEvent::ContainerStopped { container, .. } => Some(container.clone()),
                _ => None,
            })
            .collect();
        let removed: BTreeSet<String> = events
            .iter()
            .filter_map(|e| match e {
                TaskEvent::ContainerRemoved { container, .. } => Some(container.clone()),
                _ => None,
            })
            .collect();

        let live: BTreeSet<String> = created.difference(&removed).cloned().collect();

        let mut steps = Vec::new();
        for container in &live {
            let blocked_by_live_dependent = ctx.model.containers_in_build_order().any(|c| {
                live.contains(&c.name)
                    && c.dependencies.contains(container)
                    && !stopped.contains(&c.name)
            });
            if blocked_by_live_dependent {
                continue;
            }
            if !stopped.contains(container) {
                steps.push(TaskStep::StopContainer {
                    container: container.clone(),
                });
            } else {
                steps.push(TaskStep::RemoveContainer {
                    container: container.clone(),
                });
            }
        }

        // Only once every created container has actually been removed do we
        // touch the network, and only once the network is gone do we clean
        // up temporary files — mirrors `total_teardown`'s strict ordering.
        if live.is_empty() {
            let network_created = events
                .iter()
                .any(|e| matches!(e, TaskEvent::TaskNetworkCreated { .. }));
            let network_deleted = events
                .iter()
                .any(|e| matches!(e, TaskEvent::TaskNetworkDeleted { .. }));

            if network_created && !network_deleted {
                steps.push(TaskStep::DeleteTaskNetwork);
            } else {
                let deleted_paths: BTreeSet<String> = events
                    .iter()
                    .filter_map(|e| match e {
                        TaskEvent::TemporaryFileDeleted { path, .. } => Some(path.clone()),
                        _ => None,
                    })
                    .collect();
                for path in ctx.registered_temp_files().await {
                    if !deleted_paths.contains(&path) {
                        steps.push(TaskStep::DeleteTemporaryFile { path });
                    }
                }
            }
        }

        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Container, HealthCheckConfig, ImageSource, Task, TaskModel};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use std::time::SystemTime;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH
    }

    fn two_container_model() -> Arc<TaskModel> {
        let db = Container {
            name: "db".into(),
            image_source: ImageSource::Pull {
                reference: "postgres:16".into(),
            },
            command: None,
            environment: BTreeMap::new(),
            working_dir: None,
            volume_mounts: Default::default(),
            port_mappings: Default::default(),
            health_check: HealthCheckConfig::default(),
            user_and_group: None,
            dependencies: Default::default(),
        };
        let mut app_deps = BTreeSet::new();
        app_deps.insert("db".to_owned());
        let app = Container {
            name: "app".into(),
            image_source: ImageSource::Pull {
                reference: "app:latest".into(),
            },
            command: None,
            environment: BTreeMap::new(),
            working_dir: None,
            volume_mounts: Default::default(),
            port_mappings: Default::default(),
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

    #[tokio::test]
    async fn stops_the_dependent_before_the_dependency() {
        let ctx = TaskContext::new(two_container_model());
        ctx.events
            .append(TaskEvent::ContainerCreated {
                container: "db".into(),
                docker_container: "db-id".into(),
                at: now(),
            })
            .await;
        ctx.events
            .append(TaskEvent::ContainerCreated {
                container: "app".into(),
                docker_container: "app-id".into(),
                at: now(),
            })
            .await;

        let steps = CleanupPlanner::plan(&ctx).await;
        assert_eq!(
            steps,
            vec![TaskStep::StopContainer {
                container: "app".into()
            }]
        );
    }

    #[tokio::test]
    async fn deletes_the_network_only_once_every_container_is_removed() {
        let ctx = TaskContext::new(two_container_model());
        ctx.events
            .append(TaskEvent::TaskNetworkCreated {
                network: "batect-task-abc".into(),
                at: now(),
            })
            .await;
        ctx.events
            .append(TaskEvent::ContainerCreated {
                container: "db".into(),
                docker_container: "db-id".into(),
                at: now(),
            })
            .await;

        let steps = CleanupPlanner::plan(&ctx).await;
        assert!(!steps.contains(&TaskStep::DeleteTaskNetwork));

        ctx.events
            .append(TaskEvent::ContainerStopped {
                container: "db".into(),
                at: now(),
            })
            .await;
        ctx.events
            .append(TaskEvent::ContainerRemoved {
                container: "db".into(),
                at: now(),
            })
            .await;

        let steps = CleanupPlanner::plan(&ctx).await;
        assert_eq!(steps, vec![TaskStep::DeleteTaskNetwork]);
    }

    #[tokio::test]
    async fn deletes_temp_files_once_the_network_is_gone() {
        let ctx = TaskContext::new(two_container_model());
        ctx.register_temp_file("/tmp/batect-context.tar").await;
        ctx.events
            .append(TaskEvent::TaskNetworkCreated {
                network: "batect-task-abc".into(),
                at: now(),
            })
            .await;
        ctx.events
            .append(TaskEvent::TaskNetworkDeleted { at: now() })
            .await;

        let steps = CleanupPlanner::plan(&ctx).await;
        assert_eq!(
            steps,
            vec![TaskStep::DeleteTemporaryFile {
                path: "/tmp/batect-context.tar".into()
            }]
        );
    }
}
