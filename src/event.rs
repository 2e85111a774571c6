//! The append-only ordered log of everything that happened during one task
//! run (§3, §4.1). Events are the sole input to the Reactor's scheduling
//! decisions — no side channel, no back-pointers into steps.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::RwLock;

/// Raised when `singleOfType` finds no matching event. Treated as a
/// programmer error (§4.1) — it means the Reactor asked a question the event
/// log could not yet answer.
#[derive(Debug, Error)]
#[error("no event of the requested type was found (looking for: {looking_for})")]
pub struct EventNotFound {
    pub looking_for: &'static str,
}

/// Raised when `singleOfType` finds more than one matching event.
#[derive(Debug, Error)]
#[error("expected exactly one event of type {looking_for}, found {count}")]
pub struct EventNotUnique {
    pub looking_for: &'static str,
    pub count: usize,
}

/// An immutable record of something that happened during a task run (§3).
/// Every event records when it happened and (where applicable) which
/// container or network it concerns.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    ImageBuilt {
        container: String,
        image: String,
        at: SystemTime,
    },
    ImagePulled {
        container: String,
        image: String,
        at: SystemTime,
    },
    ImageBuildProgress {
        container: String,
        percent: Option<f32>,
        message: String,
        at: SystemTime,
    },
    ImageBuildFailed {
        container: String,
        reason: String,
        at: SystemTime,
    },
    TaskNetworkCreated {
        network: String,
        at: SystemTime,
    },
    TaskNetworkCreationFailed {
        reason: String,
        at: SystemTime,
    },
    ContainerCreated {
        container: String,
        docker_container: String,
        at: SystemTime,
    },
    ContainerCreationFailed {
        container: String,
        reason: String,
        at: SystemTime,
    },
    ContainerStarted {
        container: String,
        at: SystemTime,
    },
    ContainerStartFailed {
        container: String,
        reason: String,
        at: SystemTime,
    },
    ContainerBecameHealthy {
        container: String,
        at: SystemTime,
    },
    ContainerDidNotBecomeHealthy {
        container: String,
        reason: String,
        at: SystemTime,
    },
    RunningContainerExited {
        container: String,
        exit_code: i64,
        at: SystemTime,
    },
    ContainerStopped {
        container: String,
        at: SystemTime,
    },
    ContainerRemoved {
        container: String,
        at: SystemTime,
    },
    TaskNetworkDeleted {
        at: SystemTime,
    },
    TemporaryFileDeleted {
        path: String,
        at: SystemTime,
    },
    UserInterrupted {
        at: SystemTime,
    },
    ExecutionAborted {
        reason: String,
        at: SystemTime,
    },
}

impl TaskEvent {
    pub fn at(&self) -> SystemTime {
        use TaskEvent::*;
        match self {
            ImageBuilt { at, .. }
            | ImagePulled { at, .. }
            | ImageBuildProgress { at, .. }
            | ImageBuildFailed { at, .. }
            | TaskNetworkCreated { at, .. }
            | TaskNetworkCreationFailed { at, .. }
            | ContainerCreated { at, .. }
            | ContainerCreationFailed { at, .. }
            | ContainerStarted { at, .. }
            | ContainerStartFailed { at, .. }
            | ContainerBecameHealthy { at, .. }
            | ContainerDidNotBecomeHealthy { at, .. }
            | RunningContainerExited { at, .. }
            | ContainerStopped { at, .. }
            | ContainerRemoved { at, .. }
            | TaskNetworkDeleted { at }
            | TemporaryFileDeleted { at, .. }
            | UserInterrupted { at }
            | ExecutionAborted { at, .. } => *at,
        }
    }

    /// The container this event concerns, if any.
    pub fn container(&self) -> Option<&str> {
        use TaskEvent::*;
        match self {
            ImageBuilt { container, .. }
            | ImagePulled { container, .. }
            | ImageBuildProgress { container, .. }
            | ImageBuildFailed { container, .. }
            | ContainerCreated { container, .. }
            | ContainerCreationFailed { container, .. }
            | ContainerStarted { container, .. }
            | ContainerStartFailed { container, .. }
            | ContainerBecameHealthy { container, .. }
            | ContainerDidNotBecomeHealthy { container, .. }
            | RunningContainerExited { container, .. }
            | ContainerStopped { container, .. }
            | ContainerRemoved { container, .. } => Some(container),
            TaskNetworkCreated { .. }
            | TaskNetworkCreationFailed { .. }
            | TaskNetworkDeleted { .. }
            | TemporaryFileDeleted { .. }
            | UserInterrupted { .. }
            | ExecutionAborted { .. } => None,
        }
    }

    /// True for any `*Failed`/abort event — the Reactor treats these as
    /// implicit abort triggers (§7).
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TaskEvent::ImageBuildFailed { .. }
                | TaskEvent::TaskNetworkCreationFailed { .. }
                | TaskEvent::ContainerCreationFailed { .. }
                | TaskEvent::ContainerStartFailed { .. }
                | TaskEvent::ContainerDidNotBecomeHealthy { .. }
                | TaskEvent::ExecutionAborted { .. }
        )
    }

    /// The step that would have produced this kind of event, used only for
    /// `tracing` fields and diagnostics (not for scheduling — §9: events
    /// reference steps only by identity, never by back-pointer).
    pub fn step_kind(&self) -> &'static str {
        use TaskEvent::*;
        match self {
            ImageBuilt { .. } | ImageBuildProgress { .. } | ImageBuildFailed { .. } => {
                "BuildImage"
            }
            ImagePulled { .. } => "PullImage",
            TaskNetworkCreated { .. } | TaskNetworkCreationFailed { .. } => "CreateTaskNetwork",
            ContainerCreated { .. } | ContainerCreationFailed { .. } => "CreateContainer",
            ContainerStarted { .. } | ContainerStartFailed { .. } => "StartContainer",
            ContainerBecameHealthy { .. } | ContainerDidNotBecomeHealthy { .. } => {
                "WaitForContainerToBecomeHealthy"
            }
            RunningContainerExited { .. } => "RunContainer",
            ContainerStopped { .. } => "StopContainer",
            ContainerRemoved { .. } => "RemoveContainer",
            TaskNetworkDeleted { .. } => "DeleteTaskNetwork",
            TemporaryFileDeleted { .. } => "DeleteTemporaryFile",
            UserInterrupted { .. } | ExecutionAborted { .. } => "n/a",
        }
    }
}

/// An append-only, thread-safe sequence of `TaskEvent`s for one task run
/// (§4.1). Many readers, serialised writers: appends take the write lock
/// only for the duration of the `push`, the way the teacher holds
/// `stdout_record`/`stderr_record` locks only long enough to mutate the
/// `VecDeque` (`command_runner.rs`).
#[derive(Debug, Clone, Default)]
pub struct EventStore {
    events: Arc<RwLock<Vec<TaskEvent>>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `event`, returning its index in the log.
    pub async fn append(&self, event: TaskEvent) -> usize {
        let mut events = self.events.write().await;
        events.push(event);
        events.len() - 1
    }

    /// A snapshot of every event appended so far, in append order.
    pub async fn all(&self) -> Vec<TaskEvent> {
        self.events.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// All events for which `predicate` holds, in append order.
    pub async fn of_type<F>(&self, predicate: F) -> Vec<TaskEvent>
    where
        F: Fn(&TaskEvent) -> bool,
    {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    /// Exactly one matching event, or `EventNotFound`/`EventNotUnique`.
    pub async fn single_of_type<F>(
        &self,
        looking_for: &'static str,
        predicate: F,
    ) -> Result<TaskEvent, SingleOfTypeError>
    where
        F: Fn(&TaskEvent) -> bool,
    {
        let matches = self.of_type(predicate).await;
        match matches.len() {
            0 => Err(SingleOfTypeError::NotFound(EventNotFound { looking_for })),
            1 => Ok(matches.into_iter().next().unwrap()),
            count => Err(SingleOfTypeError::NotUnique(EventNotUnique {
                looking_for,
                count,
            })),
        }
    }

    pub async fn any_failure(&self) -> Option<TaskEvent> {
        self.events
            .read()
            .await
            .iter()
            .find(|e| e.is_failure())
            .cloned()
    }
}

#[derive(Debug, Error)]
pub enum SingleOfTypeError {
    #[error(transparent)]
    NotFound(#[from] EventNotFound),
    #[error(transparent)]
    NotUnique(#[from] EventNotUnique),
}

/// 100ms per §9's open question on the health-poll lower bound, paired at
/// call sites with `max(HEALTH_POLL_FLOOR, declared_interval)`.
pub const HEALTH_POLL_FLOOR: Duration = Duration::from_millis(100);

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH
    }

    #[tokio::test]
    async fn append_is_ordered_and_readable() {
        let store = EventStore::new();
        store
            .append(TaskEvent::TaskNetworkCreated {
                network: "net".into(),
                at: now(),
            })
            .await;
        store
            .append(TaskEvent::ContainerCreated {
                container: "svc".into(),
                docker_container: "abc123".into(),
                at: now(),
            })
            .await;

        let all = store.all().await;
        assert_eq!(all.len(), 2);
        assert!(matches!(all[0], TaskEvent::TaskNetworkCreated { .. }));
        assert!(matches!(all[1], TaskEvent::ContainerCreated { .. }));
    }

    #[tokio::test]
    async fn single_of_type_reports_not_found_and_not_unique() {
        let store = EventStore::new();
        let err = store
            .single_of_type("TaskNetworkCreated", |e| {
                matches!(e, TaskEvent::TaskNetworkCreated { .. })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SingleOfTypeError::NotFound(_)));

        store
            .append(TaskEvent::TaskNetworkCreated {
                network: "a".into(),
                at: now(),
            })
            .await;
        store
            .append(TaskEvent::TaskNetworkCreated {
                network: "b".into(),
                at: now(),
            })
            .await;

        let err = store
            .single_of_type("TaskNetworkCreated", |e| {
                matches!(e, TaskEvent::TaskNetworkCreated { .. })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SingleOfTypeError::NotUnique(_)));
    }
}
