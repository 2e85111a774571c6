//! Attaches to the main container's stdio and turns OS-level interrupts into
//! graceful-then-forced container teardown (§4.3 `RunContainer`, §5).
//!
//! Grounded on `ContainerRunner::start_container`'s attach-then-start
//! sequencing (`container_runner.rs`) for the stdio half, and on the
//! teacher's `CTRLC_ISSUED` static (`misc.rs`, gated by the `ctrlc_support`
//! feature) for the signal half — generalized here from a single boolean
//! flag to a counter, since a *second* interrupt needs to be distinguished
//! from the first to implement the grace-period escalation in §5.

use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use owo_colors::OwoColorize;
use stacked_errors::{Result, StackableErr};
use tokio::sync::{mpsc, Notify};

use crate::context::TaskContext;
use crate::docker::{DockerClient, OutputChunk};
use crate::event::TaskEvent;
use crate::executor::RunLoopMessage;
use crate::run_loop::EngineConfig;
use crate::terminal::next_terminal_color;

/// Attaches to `container_id`, forwards its output to this process's own
/// stdout/stderr with a colored `[name]` prefix, and returns its exit code
/// once the container finishes.
pub async fn run_attached(
    docker: &dyn DockerClient,
    container_name: &str,
    container_id: &str,
) -> Result<i64> {
    let color = next_terminal_color();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();
    let prefix_name = container_name.to_owned();
    let forward = tokio::spawn(async move {
        let prefix = format!("[{prefix_name}] ").color(color).to_string();
        while let Some(chunk) = rx.recv().await {
            match chunk {
                OutputChunk::Stdout(bytes) => write_prefixed(&mut std::io::stdout(), &prefix, &bytes),
                OutputChunk::Stderr(bytes) => write_prefixed(&mut std::io::stderr(), &prefix, &bytes),
            }
        }
    });

    let exit_code = docker
        .run_attached(container_id, tx)
        .await
        .stack_err_with(|| format!("failed to run container {container_name}"))?;
    let _ = forward.await;
    Ok(exit_code)
}

fn write_prefixed(w: &mut impl Write, prefix: &str, bytes: &[u8]) {
    for line in bytes.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let _ = w.write_all(prefix.as_bytes());
        let _ = w.write_all(line);
        let _ = w.write_all(b"\n");
    }
}

/// Shared signal a `ctrlc` handler bumps on every SIGINT/SIGTERM (§5). `0`
/// means no interrupt yet; each bump is one more interrupt received.
#[derive(Debug, Default)]
pub struct InterruptSignal {
    count: AtomicU8,
    notify: Notify,
}

impl InterruptSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn bump(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait_for_more_than(&self, seen: u8) -> u8 {
        loop {
            let current = self.count.load(Ordering::SeqCst);
            if current > seen {
                return current;
            }
            self.notify.notified().await;
        }
    }
}

/// Installs the process-wide `ctrlc` handler once per run, bumping `signal`
/// on every SIGINT/SIGTERM.
pub fn install_ctrlc_handler(signal: Arc<InterruptSignal>) -> Result<()> {
    ctrlc::set_handler(move || signal.bump()).stack_err("failed to install Ctrl-C handler")
}

/// Watches `signal` for the run's lifetime. The first interrupt sets
/// `isAborting` and appends `UserInterrupted`, which the Reactor turns into
/// the normal (dependency-reverse, grace-period) teardown cascade. A second
/// interrupt arriving within `config.second_interrupt_grace_period` of the
/// first escalates by force-killing every still-live container directly,
/// bypassing the queue — deliberately, since the user has already asked
/// twice and a queued `StopContainer` step may still be mid-grace-period.
pub async fn watch_for_interrupts(
    signal: Arc<InterruptSignal>,
    ctx: TaskContext,
    docker: Arc<dyn DockerClient>,
    tx: mpsc::UnboundedSender<RunLoopMessage>,
    config: EngineConfig,
) {
    let first = signal.wait_for_more_than(0).await;

    ctx.set_aborting();
    let event = TaskEvent::UserInterrupted {
        at: SystemTime::now(),
    };
    ctx.events.append(event.clone()).await;
    if tx.send(RunLoopMessage::Event(event)).is_err() {
        return;
    }

    let deadline = tokio::time::sleep(config.second_interrupt_grace_period);
    tokio::pin!(deadline);
    tokio::select! {
        _ = &mut deadline => {}
        _ = signal.wait_for_more_than(first) => {
            escalate_to_kill(&ctx, &*docker, &tx).await;
        }
    }
}

async fn escalate_to_kill(
    ctx: &TaskContext,
    docker: &dyn DockerClient,
    tx: &mpsc::UnboundedSender<RunLoopMessage>,
) {
    for container in ctx.created_containers().await {
        let Some(docker_id) = ctx.docker_container_id(&container).await else {
            continue;
        };
        if let Err(e) = docker.kill_container(&docker_id).await {
            ctx.record_cleanup_failure(format!("failed to force-kill {container}: {e}"))
                .await;
            continue;
        }
        let event = TaskEvent::ContainerStopped {
            container,
            at: SystemTime::now(),
        };
        ctx.events.append(event.clone()).await;
        if tx.send(RunLoopMessage::Event(event)).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_for_more_than_unblocks_once_bumped() {
        let signal = InterruptSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait_for_more_than(0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.bump();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_for_more_than should unblock after bump")
            .unwrap();
        assert_eq!(result, 1);
    }
}
