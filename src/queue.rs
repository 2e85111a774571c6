//! The FIFO of `TaskStep`s ready to execute (§4.2). Enqueue dedups by
//! structural equality against steps already queued, matching invariant 5 in
//! §3 (the queue never contains two steps whose merge would be semantically
//! equivalent).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify};

use crate::step::TaskStep;

/// Grounded on the teacher's habit of wrapping shared mutable state behind a
/// `tokio::sync::Mutex` and only holding the lock for the duration of the
/// actual mutation (`command_runner.rs`'s `stdout_record`/`stderr_record`).
#[derive(Debug, Default)]
pub struct StepQueue {
    inner: Mutex<VecDeque<TaskStep>>,
    notify: Notify,
    /// Steps claimed by `pop_wait` but not yet `release`d. Incremented in the
    /// same critical section as the pop (§4.6) so a concurrent
    /// `is_quiescent` check can never observe the step as both gone from the
    /// queue and not yet counted as in-flight.
    in_flight: AtomicUsize,
}

impl StepQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `step` unless an equal step is already present.
    pub async fn enqueue(&self, step: TaskStep) {
        let mut queue = self.inner.lock().await;
        if !queue.contains(&step) {
            queue.push_back(step);
            self.notify.notify_one();
        }
    }

    pub async fn enqueue_all(&self, steps: impl IntoIterator<Item = TaskStep>) {
        for step in steps {
            self.enqueue(step).await;
        }
    }

    pub async fn pop(&self) -> Option<TaskStep> {
        self.inner.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Pops the next step, waiting for one to be enqueued if the queue is
    /// currently empty. Lets the Step Executor's workers block instead of
    /// busy-polling an empty queue between bursts of events. Claims the step
    /// as in-flight atomically with the pop — pair with `release` once the
    /// step has been fully handled.
    pub async fn pop_wait(&self) -> TaskStep {
        loop {
            {
                let mut queue = self.inner.lock().await;
                if let Some(step) = queue.pop_front() {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    return step;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Releases one step claimed by `pop_wait`, once its handler has
    /// finished and every event it produced has been appended.
    pub fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Nothing queued and nothing still being handled — the Run Loop's
    /// termination condition (§4.6).
    pub async fn is_quiescent(&self) -> bool {
        self.is_empty().await && self.in_flight() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_dedups_structurally_equal_steps() {
        let queue = StepQueue::new();
        queue
            .enqueue(TaskStep::StartContainer {
                container: "db".into(),
            })
            .await;
        queue
            .enqueue(TaskStep::StartContainer {
                container: "db".into(),
            })
            .await;
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn pop_returns_fifo_order() {
        let queue = StepQueue::new();
        queue.enqueue(TaskStep::CreateTaskNetwork).await;
        queue
            .enqueue(TaskStep::BuildImage {
                container: "db".into(),
            })
            .await;

        assert_eq!(queue.pop().await, Some(TaskStep::CreateTaskNetwork));
        assert_eq!(
            queue.pop().await,
            Some(TaskStep::BuildImage {
                container: "db".into()
            })
        );
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn pop_wait_claims_in_flight_before_returning() {
        let queue = StepQueue::new();
        queue.enqueue(TaskStep::CreateTaskNetwork).await;

        assert!(!queue.is_quiescent().await);
        let step = queue.pop_wait().await;
        assert_eq!(step, TaskStep::CreateTaskNetwork);
        assert_eq!(queue.in_flight(), 1);
        assert!(!queue.is_quiescent().await);

        queue.release();
        assert_eq!(queue.in_flight(), 0);
        assert!(queue.is_quiescent().await);
    }
}
