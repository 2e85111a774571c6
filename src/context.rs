//! `TaskContext`: the per-run, mutable-only-via-event-append value threaded
//! through the Reactor and Cleanup Planner (§3, §9). Replaces an implicit
//! global-ish context with an explicit value, per the design note in §9.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::event::EventStore;
use crate::model::TaskModel;
use crate::queue::StepQueue;

/// Bookkeeping that the Reactor and Cleanup Planner both need but that isn't
/// itself an event: the Docker container id assigned to each created
/// container, and every temporary file the run has registered for cleanup
/// (§10.5).
#[derive(Debug, Default)]
struct Bookkeeping {
    docker_container_ids: BTreeMap<String, String>,
    temp_files: Vec<String>,
    cleanup_failures: Vec<String>,
    network_name: Option<String>,
}

/// Threaded into `EventReactor::react` and `CleanupPlanner::plan`. Cheap to
/// clone (everything interior is `Arc`-shared), so both the Run Loop and
/// spawned step-handler tasks can hold their own handle.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub events: EventStore,
    pub queue: Arc<StepQueue>,
    pub model: Arc<TaskModel>,
    aborting: Arc<AtomicBool>,
    cleanup_triggered: Arc<AtomicBool>,
    bookkeeping: Arc<Mutex<Bookkeeping>>,
}

impl TaskContext {
    pub fn new(model: Arc<TaskModel>) -> Self {
        Self {
            events: EventStore::new(),
            queue: Arc::new(StepQueue::new()),
            model,
            aborting: Arc::new(AtomicBool::new(false)),
            cleanup_triggered: Arc::new(AtomicBool::new(false)),
            bookkeeping: Arc::new(Mutex::new(Bookkeeping::default())),
        }
    }

    /// Marks cleanup as having started, returning whether it was *this* call
    /// that made the transition. Used so `RunningContainerExited`/first
    /// failure/`UserInterrupted` can each ask "am I the one who kicks off
    /// teardown" without a separate lock (§4.5).
    pub fn start_cleanup(&self) -> bool {
        self.cleanup_triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_cleanup_triggered(&self) -> bool {
        self.cleanup_triggered.load(Ordering::SeqCst)
    }

    /// Records a cleanup-stage failure that has no corresponding `TaskEvent`
    /// variant (§7): the step is still treated as done so teardown keeps
    /// making progress, but the failure is surfaced on `TaskOutcome`.
    pub async fn record_cleanup_failure(&self, message: impl Into<String>) {
        self.bookkeeping
            .lock()
            .await
            .cleanup_failures
            .push(message.into());
    }

    pub async fn cleanup_failures(&self) -> Vec<String> {
        self.bookkeeping.lock().await.cleanup_failures.clone()
    }

    /// Monotonic per invariant 6 in §3: once set, never cleared within a run.
    pub fn set_aborting(&self) {
        self.aborting.store(true, Ordering::SeqCst);
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::SeqCst)
    }

    pub async fn record_docker_container_id(&self, container: &str, docker_id: &str) {
        self.bookkeeping
            .lock()
            .await
            .docker_container_ids
            .insert(container.to_owned(), docker_id.to_owned());
    }

    pub async fn docker_container_id(&self, container: &str) -> Option<String> {
        self.bookkeeping
            .lock()
            .await
            .docker_container_ids
            .get(container)
            .cloned()
    }

    pub async fn created_containers(&self) -> Vec<String> {
        self.bookkeeping
            .lock()
            .await
            .docker_container_ids
            .keys()
            .cloned()
            .collect()
    }

    /// Registers a temporary file (e.g. a generated build-context tarball or
    /// Dockerfile) for deletion during cleanup (§10.5).
    pub async fn register_temp_file(&self, path: impl Into<String>) {
        self.bookkeeping.lock().await.temp_files.push(path.into());
    }

    pub async fn registered_temp_files(&self) -> Vec<String> {
        self.bookkeeping.lock().await.temp_files.clone()
    }

    /// Records the generated name of this run's task network (§10.5:
    /// `batect-task-{uuid}`), set once by the `CreateTaskNetwork` handler.
    pub async fn set_network_name(&self, name: impl Into<String>) {
        self.bookkeeping.lock().await.network_name = Some(name.into());
    }

    pub async fn network_name(&self) -> Option<String> {
        self.bookkeeping.lock().await.network_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Container, HealthCheckConfig, ImageSource, Task, TaskModel};
    use std::collections::{BTreeMap, BTreeSet};

    fn trivial_model() -> Arc<TaskModel> {
        let container = Container {
            name: "svc".into(),
            image_source: ImageSource::Pull {
                reference: "alpine:latest".into(),
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
        let task = Task {
            name: "run".into(),
            main_container: "svc".into(),
            command_override: None,
            environment_overrides: BTreeMap::new(),
        };
        Arc::new(TaskModel::resolve(task, vec![container]).unwrap())
    }

    #[tokio::test]
    async fn aborting_is_monotonic() {
        let ctx = TaskContext::new(trivial_model());
        assert!(!ctx.is_aborting());
        ctx.set_aborting();
        assert!(ctx.is_aborting());
        ctx.set_aborting();
        assert!(ctx.is_aborting());
    }

    #[tokio::test]
    async fn bookkeeping_round_trips() {
        let ctx = TaskContext::new(trivial_model());
        ctx.record_docker_container_id("svc", "abc123").await;
        assert_eq!(
            ctx.docker_container_id("svc").await,
            Some("abc123".to_owned())
        );
        ctx.register_temp_file("/tmp/x").await;
        assert_eq!(ctx.registered_temp_files().await, vec!["/tmp/x".to_owned()]);
    }
}
