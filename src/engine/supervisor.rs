use std::collections::BTreeMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use super::error::ExecError;
use super::output;
use super::types::{CommandSpec, ExecutionResult, TIMEOUT_EXIT_CODE};

/// How long output may keep arriving once the child and its group are gone.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Wraps `tokio::process::Command` with env filtering, output limits,
/// timeout and kill.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    /// Environment variables to inherit from host (allowlist).
    pub env_allowlist: Vec<String>,
    /// Maximum bytes kept per output stream before truncation.
    pub max_output_bytes: usize,
}

impl ProcessSupervisor {
    pub fn new(env_allowlist: Vec<String>, max_output_bytes: usize) -> Self {
        Self {
            env_allowlist,
            max_output_bytes,
        }
    }

    /// Build a filtered env map: only allowlisted host vars + command vars.
    fn build_env(&self, extra: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = Vec::new();
        for key in &self.env_allowlist {
            if let Ok(val) = std::env::var(key) {
                env.push((key.clone(), val));
            }
        }
        for (k, v) in extra {
            env.push((k.clone(), v.clone()));
        }
        env
    }

    /// Spawn the command with all three standard streams piped, as the
    /// leader of a new process group.
    ///
    /// The child is killed if its handle is dropped, so no exit path can
    /// leave it running unattended.
    pub(crate) fn spawn(&self, spec: &CommandSpec) -> Result<Child, ExecError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.current_dir(&spec.cwd);
        cmd.env_clear();
        for (k, v) in self.build_env(&spec.env) {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // Own process group, so a kill reaches everything the child started.
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::debug!(command = %spec.display(), cwd = %spec.cwd.display(), "spawning process");
        cmd.spawn().map_err(|source| ExecError::Spawn {
            program: spec.program.clone(),
            source,
        })
    }

    /// Run a command to completion, racing it against `timeout`.
    ///
    /// On timeout the child's process group is killed and the child reaped,
    /// the readers are abandoned and the fixed timeout result is returned;
    /// output captured so far is discarded. When the child exits first, any
    /// processes it left behind are killed and the result carries the
    /// child's own exit code.
    pub async fn execute(
        &self,
        spec: &CommandSpec,
        stdin: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecError> {
        let started = Instant::now();
        let mut child = self.spawn(spec)?;
        let pid = child.id();

        let stdin_pipe = take_pipe(child.stdin.take(), "stdin")?;
        let stdin_task = if stdin.is_empty() {
            drop(stdin_pipe);
            None
        } else {
            let input = stdin.as_bytes().to_vec();
            let mut pipe = stdin_pipe;
            Some(tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    tracing::debug!(error = %e, "stdin write failed");
                }
                // dropping the pipe half-closes stdin
            }))
        };

        let limit = self.max_output_bytes;
        let stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stderr = take_pipe(child.stderr.take(), "stderr")?;
        let mut stdout_task = tokio::spawn(output::collect(output::chunks(stdout), limit));
        let mut stderr_task = tokio::spawn(output::collect(output::chunks(stderr), limit));

        let abandon = |stdin_task: Option<tokio::task::JoinHandle<()>>| {
            if let Some(task) = stdin_task {
                task.abort();
            }
        };

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                kill_process_group(pid).await;
                stdout_task.abort();
                stderr_task.abort();
                abandon(stdin_task);
                return Err(ExecError::Io(e));
            }
            Err(_) => {
                tracing::warn!(
                    command = %spec.display(),
                    timeout_ms = timeout.as_millis() as u64,
                    "process timed out, killing"
                );
                kill_process_group(pid).await;
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill timed out process");
                }
                stdout_task.abort();
                stderr_task.abort();
                abandon(stdin_task);
                return Ok(ExecutionResult::timed_out(timeout));
            }
        };
        abandon(stdin_task);

        // Leftover background processes would hold the pipes open.
        kill_process_group(pid).await;
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            tokio::join!(&mut stdout_task, &mut stderr_task)
        })
        .await;
        let (stdout, stderr) = match drained {
            Ok((stdout, stderr)) => (stdout.unwrap_or_default(), stderr.unwrap_or_default()),
            Err(_) => {
                tracing::warn!(command = %spec.display(), "output still open after exit, dropping it");
                stdout_task.abort();
                stderr_task.abort();
                Default::default()
            }
        };

        let exit_code = reported_exit_code(status);
        tracing::info!(
            command = %spec.display(),
            exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "process finished"
        );

        Ok(ExecutionResult {
            stdout: stdout.into_text(),
            stderr: stderr.into_text(),
            exit_code,
        })
    }
}

/// SIGKILL every process in the group led by `pid`.
///
/// A group with no members left is not an error.
#[cfg(unix)]
pub(crate) async fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    let status = Command::new("kill")
        .args(["-KILL", &format!("-{pid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        tracing::warn!(pid, error = %e, "failed to signal process group");
    }
}

#[cfg(not(unix))]
pub(crate) async fn kill_process_group(pid: Option<u32>) {
    tracing::debug!(?pid, "process group kill not implemented on this platform");
}

pub(crate) fn take_pipe<T>(pipe: Option<T>, name: &str) -> Result<T, ExecError> {
    pipe.ok_or_else(|| ExecError::Io(io::Error::other(format!("child {name} is not piped"))))
}

/// Exit code as reported to callers.
///
/// Signal deaths map to `128 + signal`. A child exiting with the timeout
/// code on its own is reported as a plain failure so 124 stays unambiguous.
pub(crate) fn reported_exit_code(status: ExitStatus) -> i32 {
    let code = status.code().unwrap_or_else(|| signal_exit_code(status));
    if code == TIMEOUT_EXIT_CODE {
        tracing::warn!("process exited with reserved timeout code, reporting 1");
        return 1;
    }
    code
}

#[cfg(unix)]
fn signal_exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| 128 + sig).unwrap_or(-1)
}

#[cfg(not(unix))]
fn signal_exit_code(_status: ExitStatus) -> i32 {
    -1
}
