use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::Stream;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use super::error::ExecError;
use super::output::{self, Utf8Decoder};
use super::supervisor::{ProcessSupervisor, kill_process_group, reported_exit_code, take_pipe};
use super::types::CommandSpec;
use super::workspace::Workspace;

/// How long readers may keep draining after the child's process group
/// is gone.
const READER_GRACE: Duration = Duration::from_secs(1);

/// Resolves to the session's exit code once the workspace is released.
pub type ExitFuture = Shared<BoxFuture<'static, i32>>;

/// Starts interactive sessions: a child process with live output callbacks
/// and caller-driven stdin.
#[derive(Debug, Clone)]
pub struct SessionController {
    supervisor: ProcessSupervisor,
}

impl SessionController {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self { supervisor }
    }

    /// Spawn `command` and hand back a handle without waiting for it.
    ///
    /// The session takes ownership of `workspace` and releases it after the
    /// child has exited and both readers are done, before `exit` resolves.
    /// Callbacks run on the reader tasks, in order per stream; the two
    /// streams are not ordered relative to each other.
    pub fn open<O, E>(
        &self,
        command: &CommandSpec,
        workspace: Workspace,
        on_stdout: O,
        on_stderr: E,
    ) -> Result<InteractiveHandle, ExecError>
    where
        O: FnMut(String) + Send + 'static,
        E: FnMut(String) + Send + 'static,
    {
        let mut child = self.supervisor.spawn(command)?;
        let pid = child.id();
        let stdin = take_pipe(child.stdin.take(), "stdin")?;
        let stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stderr = take_pipe(child.stderr.take(), "stderr")?;

        let stdout_task = tokio::spawn(forward(output::chunks(stdout), on_stdout));
        let stderr_task = tokio::spawn(forward(output::chunks(stderr), on_stderr));

        let (kill_tx, mut kill_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = oneshot::channel();
        let session = workspace.name().to_string();
        tracing::info!(session = %session, command = %command.display(), "interactive session started");

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = killed(&mut kill_rx) => {
                    tracing::info!(session = %workspace.name(), "killing interactive session");
                    kill_process_group(pid).await;
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "failed to kill session process");
                    }
                    child.wait().await
                }
            };
            let exit_code = match status {
                Ok(status) => reported_exit_code(status),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to wait for session process");
                    -1
                }
            };

            // Nothing the session started outlives it.
            kill_process_group(pid).await;
            finish_reader(stdout_task).await;
            finish_reader(stderr_task).await;
            tracing::info!(session = %workspace.name(), exit_code, "interactive session ended");
            workspace.release();
            let _ = exit_tx.send(exit_code);
        });

        let exit = async move { exit_rx.await.unwrap_or(-1) }.boxed().shared();
        Ok(InteractiveHandle {
            inner: Arc::new(SessionShared {
                stdin: Mutex::new(Some(stdin)),
                kill_tx,
            }),
            exit,
            session,
        })
    }
}

struct SessionShared {
    stdin: Mutex<Option<ChildStdin>>,
    kill_tx: watch::Sender<bool>,
}

/// Handle to a running interactive session.
///
/// Clones drive the same session. When the last clone is dropped the
/// process is killed, as if [`InteractiveHandle::kill`] had been called.
#[derive(Clone)]
pub struct InteractiveHandle {
    inner: Arc<SessionShared>,
    exit: ExitFuture,
    session: String,
}

impl InteractiveHandle {
    /// Name of the session's workspace, for logs.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Forward `data` to the child's stdin and flush it.
    pub async fn write(&self, data: &[u8]) -> Result<(), ExecError> {
        let mut guard = self.inner.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| ExecError::Session("stdin already closed".into()))?;
        stdin
            .write_all(data)
            .await
            .map_err(|e| ExecError::Session(format!("write stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ExecError::Session(format!("flush stdin: {e}")))?;
        Ok(())
    }

    /// Half-close stdin so the child observes end of input.
    pub async fn close_stdin(&self) -> Result<(), ExecError> {
        let stdin = self.inner.stdin.lock().await.take();
        if let Some(mut stdin) = stdin {
            stdin
                .shutdown()
                .await
                .map_err(|e| ExecError::Session(format!("close stdin: {e}")))?;
        }
        Ok(())
    }

    /// Terminate the child. Safe to call any number of times.
    pub fn kill(&self) {
        self.inner.kill_tx.send_replace(true);
    }

    /// Future resolving to the exit code, after the workspace is gone.
    pub fn exit(&self) -> ExitFuture {
        self.exit.clone()
    }
}

impl std::fmt::Debug for InteractiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveHandle")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Completes on `kill()` or once every handle has been dropped.
async fn killed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|killed| *killed).await;
}

async fn forward<S, F>(stream: S, mut sink: F)
where
    S: Stream<Item = io::Result<Vec<u8>>>,
    F: FnMut(String),
{
    tokio::pin!(stream);
    let mut decoder = Utf8Decoder::default();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                let text = decoder.push(&bytes);
                if !text.is_empty() {
                    sink(text);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "session output read failed");
                break;
            }
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        sink(rest);
    }
}

async fn finish_reader(mut task: JoinHandle<()>) {
    if tokio::time::timeout(READER_GRACE, &mut task).await.is_err() {
        task.abort();
    }
}
