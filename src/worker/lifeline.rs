use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Supervisor task guarding an engine process.
///
/// Kills the engine (and its process group) when terminated, cancelled or
/// dropped, so a worker going away never leaves an orphaned browser behind.
/// It also notices when the engine dies on its own.
pub struct Lifeline {
    cancel: CancellationToken,
    exited: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Lifeline {
    pub fn watch(mut child: Child) -> Self {
        let cancel = CancellationToken::new();
        let exited = Arc::new(AtomicBool::new(false));
        let pid = child.id();

        let task = {
            let cancel = cancel.clone();
            let exited = exited.clone();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        exited.store(true, Ordering::SeqCst);
                        match status {
                            Ok(status) => {
                                tracing::warn!(pid = ?pid, status = %status, "Engine process exited");
                            }
                            Err(e) => {
                                tracing::warn!(pid = ?pid, error = %e, "Lost track of engine process");
                            }
                        }
                    }
                    _ = cancel.cancelled() => {
                        kill_group(pid);
                        if let Err(e) = child.start_kill() {
                            tracing::debug!(pid = ?pid, error = %e, "Engine process already gone");
                        }
                        let _ = child.wait().await;
                        exited.store(true, Ordering::SeqCst);
                        tracing::debug!(pid = ?pid, "Engine process killed");
                    }
                }
            })
        };

        Self {
            cancel,
            exited,
            task: Some(task),
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    /// Pid of the supervisor, which lives inside the current process.
    pub fn pid(&self) -> u32 {
        std::process::id()
    }

    /// Kills the engine and waits until it has been reaped.
    pub async fn terminate(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Lifeline task failed");
            }
        }
    }

    /// Kills the engine in the background.
    pub fn abandon(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Lifeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions. The engine was
    // spawned as the leader of its own process group, so -pid only reaches
    // the engine and whatever it spawned.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}
