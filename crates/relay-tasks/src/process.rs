//! Child process management
//!
//! One manager exists per run and supervises every spawned task
//! process. Closing the manager interrupts all children (SIGINT, then
//! SIGKILL after a grace period) and refuses new work; a child that
//! dies this way surfaces as `ProcessError::Closing`, which the
//! executor reports as cancellation rather than failure.

use std::collections::HashSet;
use std::process::ExitStatus;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

/// How long a child gets between SIGINT and SIGKILL.
const GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Errors from process supervision.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The manager is shutting down; no new children are accepted and
    /// running children are being stopped.
    #[error("process manager is closing")]
    Closing,

    /// Spawn failure
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    /// Wait failure
    #[error("failed to wait for child process: {0}")]
    Wait(#[from] std::io::Error),
}

/// Tracks live children for one run.
pub struct ProcessManager {
    closing: watch::Sender<bool>,
    children: Mutex<HashSet<u32>>,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            closing,
            children: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Spawn a child under supervision.
    pub fn spawn(&self, mut command: Command) -> Result<ManagedChild, ProcessError> {
        if self.is_closing() {
            return Err(ProcessError::Closing);
        }
        let label = format!("{:?}", command.as_std());
        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: label,
            source,
        })?;
        if let Some(pid) = child.id() {
            self.children.lock().unwrap().insert(pid);
        }
        Ok(ManagedChild {
            pid: child.id(),
            child,
            closing: self.closing.subscribe(),
        })
    }

    fn deregister(&self, pid: Option<u32>) {
        if let Some(pid) = pid {
            self.children.lock().unwrap().remove(&pid);
        }
    }

    /// Stop accepting work and interrupt every live child. Idempotent.
    pub fn close(&self) {
        if self.closing.send_replace(true) {
            return;
        }
        let children = self.children.lock().unwrap();
        debug!(children = children.len(), "closing process manager");
        for pid in children.iter() {
            interrupt(*pid);
        }
    }
}

#[cfg(unix)]
fn interrupt(pid: u32) {
    // SIGINT first; the supervising wait escalates to SIGKILL after
    // the grace period.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGINT);
    }
}

#[cfg(not(unix))]
fn interrupt(_pid: u32) {}

/// A spawned child plus the shutdown signal it watches.
pub struct ManagedChild {
    child: Child,
    pid: Option<u32>,
    closing: watch::Receiver<bool>,
}

impl ManagedChild {
    pub fn stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the child, honoring manager shutdown: on close, the
    /// child gets the grace period to react to SIGINT before being
    /// killed, and the wait reports `Closing`.
    pub async fn wait(mut self, manager: &ProcessManager) -> Result<ExitStatus, ProcessError> {
        let result = loop {
            tokio::select! {
                status = self.child.wait() => {
                    break status.map_err(ProcessError::Wait);
                }
                changed = self.closing.changed() => {
                    if changed.is_err() || *self.closing.borrow() {
                        break self.stop().await;
                    }
                }
            }
        };
        manager.deregister(self.pid);
        result
    }

    async fn stop(&mut self) -> Result<ExitStatus, ProcessError> {
        match tokio::time::timeout(GRACE_PERIOD, self.child.wait()).await {
            Ok(_) => Err(ProcessError::Closing),
            Err(_) => {
                warn!(pid = ?self.pid, "child ignored interrupt, killing");
                if let Err(err) = self.child.start_kill() {
                    warn!(pid = ?self.pid, error = %err, "failed to kill child");
                }
                let _ = self.child.wait().await;
                Err(ProcessError::Closing)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }

    #[tokio::test]
    async fn test_exit_status_is_reported() {
        let manager = ProcessManager::new();
        let child = manager.spawn(sh("exit 3")).unwrap();
        let status = child.wait(&manager).await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_spawn_after_close_is_rejected() {
        let manager = ProcessManager::new();
        manager.close();
        match manager.spawn(sh("true")).map(|_| ()) {
            Err(ProcessError::Closing) => {}
            other => panic!("expected Closing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_interrupts_running_child() {
        let manager = ProcessManager::new();
        let child = manager.spawn(sh("sleep 30")).unwrap();

        let waiter = child.wait(&manager);
        tokio::pin!(waiter);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(50)) => manager.close(),
            _ = &mut waiter => panic!("child finished before close"),
        }

        match waiter.await {
            Err(ProcessError::Closing) => {}
            other => panic!("expected Closing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let manager = ProcessManager::new();
        let mut command = Command::new("relay-definitely-not-a-binary");
        command.stdin(Stdio::null());
        match manager.spawn(command) {
            Err(ProcessError::Spawn { .. }) => {}
            other => panic!("expected Spawn error, got {:?}", other.map(|_| ())),
        }
    }
}
