use std::time::Duration;

use tokio::process::Child;
use tokio::time::Instant;

use crate::launcher::{BoxFuture, WorkerProcess};

pub(crate) struct ChildProcess {
    child: Child,
    kill_grace: Duration,
}

impl ChildProcess {
    pub(crate) fn new(child: Child, kill_grace: Duration) -> Self {
        Self { child, kill_grace }
    }
}

impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn wait(&mut self) -> BoxFuture<'_, Option<i32>> {
        Box::pin(async move {
            match self.child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    tracing::debug!(target: "kiln.supervisor", error = %err, "failed to wait for worker");
                    None
                }
            }
        })
    }

    fn terminate(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(terminate_process_tree(&mut self.child, self.kill_grace))
    }
}

/// SIGTERM the worker's process group, then SIGKILL it once `grace` runs out.
async fn terminate_process_tree(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let pid = pid as i32;
            // Negative pid targets the process group, which we set to the child's pid via
            // `setpgid(0, 0)` in `pre_exec`.
            unsafe {
                let _ = libc::kill(-pid, libc::SIGTERM);
            }

            let start = Instant::now();
            while start.elapsed() < grace {
                match child.try_wait() {
                    Ok(Some(_)) => return,
                    Ok(None) => {}
                    Err(_) => break,
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }

            unsafe {
                let _ = libc::kill(-pid, libc::SIGKILL);
            }
            let _ = child.wait().await;
            return;
        }
    }

    let _ = grace;
    let _ = child.start_kill();
    let _ = child.wait().await;
}
