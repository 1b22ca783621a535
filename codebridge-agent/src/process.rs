// ABOUTME: Process supervisor - owns one Claude CLI process for the lifetime of one query.
// ABOUTME: Pumps framed stdout into a record channel, logs stderr, honours cancellation.

use crate::bridge::{record_channel, RecordReceiver, RecordSender};
use crate::error::QueryError;
use crate::framer::LineFramer;
use crate::invocation::InvocationParams;
use crate::mcp::McpConfigFile;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const READ_CHUNK: usize = 8 * 1024;

/// One spawned backend process. Never reused across queries.
pub struct ProcessHandle {
    child: Child,
    stdout: ChildStdout,
    stderr_task: JoinHandle<()>,
    cancel: CancellationToken,
    /// Deleted when the handle drops, whatever the outcome
    _mcp_config: Option<McpConfigFile>,
}

impl ProcessHandle {
    /// Launch the CLI for `params`. Fails fast with no records if the
    /// config file cannot be written or the executable cannot be started.
    pub fn spawn(
        binary: &Path,
        params: &InvocationParams,
        cancel: CancellationToken,
    ) -> Result<Self, QueryError> {
        let mcp_config =
            McpConfigFile::write_if_any(&params.mcp_servers).map_err(QueryError::McpConfig)?;
        let args = params.cli_args(mcp_config.as_ref().map(|f| f.path()));

        let mut args_preview = args.iter().take(6).cloned().collect::<Vec<_>>().join(" ");
        if args.len() > 6 {
            args_preview.push_str(" ...");
        }
        tracing::info!(
            cli_path = %binary.display(),
            cwd = ?params.working_dir,
            args_preview = %args_preview,
            "Spawning claude CLI"
        );

        let mut command = Command::new(binary);
        command
            .args(&args)
            .envs(&params.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = params.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| {
            tracing::error!(error = %source, cli_path = %binary.display(), "Claude CLI spawn error");
            QueryError::Spawn {
                binary: binary.to_path_buf(),
                source,
            }
        })?;

        let stdout = child.stdout.take().ok_or_else(|| QueryError::Spawn {
            binary: binary.to_path_buf(),
            source: std::io::Error::other("stdout not captured"),
        })?;
        let stderr_task = match child.stderr.take() {
            Some(stderr) => tokio::spawn(forward_stderr(stderr)),
            None => tokio::spawn(async {}),
        };

        Ok(Self {
            child,
            stdout,
            stderr_task,
            cancel,
            _mcp_config: mcp_config,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Spawn the pump task and hand back the consumer end
    pub fn into_receiver(self) -> RecordReceiver {
        let (tx, rx) = record_channel();
        tokio::spawn(self.run(tx));
        rx
    }

    /// Read stdout to EOF, then report the exit status
    pub async fn run(mut self, tx: RecordSender) {
        let mut framer = LineFramer::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut kill_sent = false;
        let mut read_error = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled(), if !kill_sent => {
                    tracing::info!(pid = ?self.child.id(), "Aborting claude CLI process");
                    self.terminate();
                    kill_sent = true;
                }
                _ = tx.receiver_dropped(), if !kill_sent => {
                    tracing::debug!(pid = ?self.child.id(), "Record receiver dropped, stopping CLI");
                    self.terminate();
                    kill_sent = true;
                }
                read = self.stdout.read(&mut buf) => {
                    match read {
                        Ok(0) => break,
                        Ok(n) => {
                            for record in framer.push(&buf[..n]) {
                                tx.push(record);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed reading Claude CLI stdout");
                            read_error = Some(e);
                            break;
                        }
                    }
                }
            }
        }

        if let Some(record) = framer.finish() {
            tx.push(record);
        }

        let status = self.child.wait().await;
        if let Err(e) = self.stderr_task.await {
            tracing::warn!(error = %e, "stderr reader task failed to complete");
        }

        match status {
            Ok(status) => match exit_outcome(status, read_error, kill_sent) {
                Some(err) => {
                    tracing::error!(code = ?status.code(), error = %err, "Claude CLI query failed");
                    tx.fail(err);
                }
                None => {
                    tracing::debug!(code = ?status.code(), cancelled = kill_sent, "Claude CLI finished");
                    tx.close();
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to wait for Claude CLI");
                tx.fail(QueryError::Transport(format!("failed to wait for Claude CLI: {}", e)));
            }
        }
    }

    fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "Kill request failed, process likely already exited");
        }
    }
}

/// A non-zero exit code is an error; zero or killed-by-signal is a clean end
fn exit_error(status: ExitStatus) -> Option<QueryError> {
    match status.code() {
        Some(0) | None => None,
        Some(code) => Some(QueryError::AbnormalExit { code }),
    }
}

/// Terminal error for a finished process. A non-zero exit wins; a clean
/// exit after a failed stdout read is still an error unless we killed it.
fn exit_outcome(
    status: ExitStatus,
    read_error: Option<std::io::Error>,
    killed: bool,
) -> Option<QueryError> {
    if let Some(err) = exit_error(status) {
        return Some(err);
    }
    match read_error {
        Some(e) if !killed => Some(QueryError::Transport(format!(
            "failed reading Claude CLI output: {}",
            e
        ))),
        _ => None,
    }
}

/// Stderr goes to the log verbatim and is never parsed
async fn forward_stderr(stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                if !text.is_empty() {
                    tracing::warn!(stderr = %text, "Claude CLI stderr");
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Stopped reading Claude CLI stderr");
                break;
            }
        }
    }
}

/// Spawn the CLI and return its record stream
pub fn spawn_query(
    binary: &Path,
    params: &InvocationParams,
    cancel: CancellationToken,
) -> Result<RecordReceiver, QueryError> {
    Ok(ProcessHandle::spawn(binary, params, cancel)?.into_receiver())
}
