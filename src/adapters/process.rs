//! Subprocess adapter backed by `tokio::process`.

use crate::ports::process::{CommandSpec, ProcessOutcome, ProcessOutput, ProcessRunner};
use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PIPE_DRAIN: Duration = Duration::from_secs(1);

/// Spawns real processes. On cancellation the child gets SIGTERM, then
/// SIGKILL if it is still alive after `kill_grace`.
#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    kill_grace: Duration,
}

impl TokioProcessRunner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        command: CommandSpec,
        cancel: CancellationToken,
    ) -> io::Result<ProcessOutcome> {
        let mut child = TokioCommand::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        debug!(program = %command.program, pid = ?child.id(), "spawned process");

        let stdout = capture(child.stdout.take());
        let stderr = capture(child.stderr.take());

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                Ok(ProcessOutcome::Exited(ProcessOutput {
                    code: status.code(),
                    stdout: collect(stdout).await,
                    stderr: collect(stderr).await,
                }))
            }
            _ = cancel.cancelled() => {
                self.stop(&mut child, &command.program).await;
                // Grandchildren may still hold the pipe open.
                let stderr = tokio::time::timeout(PIPE_DRAIN, collect(stderr))
                    .await
                    .unwrap_or_default();
                Ok(ProcessOutcome::Cancelled { stderr })
            }
        }
    }
}

impl TokioProcessRunner {
    async fn stop(&self, child: &mut Child, program: &str) {
        terminate(child);
        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(_) => debug!(program, "process exited after termination signal"),
            Err(_) => {
                warn!(program, grace = ?self.kill_grace, "process ignored termination, killing");
                if let Err(e) = child.kill().await {
                    warn!(program, error = %e, "failed to kill process");
                }
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // No pid means the child was already reaped.
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid, error = %e, "failed to send SIGTERM");
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

fn capture<R>(stream: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).to_string()
    })
}

async fn collect(handle: JoinHandle<String>) -> String {
    handle.await.unwrap_or_default()
}
