//! Persistent shell session with command-boundary framing
//!
//! One long-lived child shell process per pipeline invocation, handling
//! one command at a time, rather than spawning a fresh
//! `tokio::process::Command` with its own `timeout` + `kill` per step. The
//! per-command timeout and process-group teardown are kept for each
//! submitted command, but the shell process itself persists across every
//! command in a pipeline so state (cwd, exported variables) carries
//! between steps.
//!
//! Boundary detection is a small state machine over the streaming stdout
//! buffer: each submitted command is wrapped so the shell echoes a unique
//! end marker carrying the exit code; the reader consumes output up to
//! that marker as the command's stdout.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};

use crate::error::{EngineError, EngineResult};
use crate::process_group::PlatformProcessGroup;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Output produced by one submitted command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A single submitted command and where its result should go.
struct Submission {
    command: String,
    on_output_line: mpsc::UnboundedSender<OutputLine>,
    reply: oneshot::Sender<EngineResult<CommandOutput>>,
}

/// A request to tear down the session's process group rather than run a
/// command, used to clean up the shell session and its process group on a
/// failed step, not just on a timed-out one.
struct ShutdownRequest {
    ack: oneshot::Sender<()>,
}

/// One line of streamed output, tagged by stream, emitted as it arrives so
/// callers can forward it to the real-time log channel incrementally.
#[derive(Debug, Clone)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// A handle to the running shell session. Cloning shares the same
/// underlying process; only one command may be in flight at a time,
/// enforced by an internal mpsc channel (a natural single-queue mailbox,
/// matching "exactly one command in flight").
#[derive(Clone)]
pub struct ShellSession {
    submit: mpsc::UnboundedSender<Submission>,
    shutdown: mpsc::UnboundedSender<ShutdownRequest>,
}

impl ShellSession {
    /// Spawn the platform shell (`sh` on POSIX, `powershell -NoProfile
    /// -NonInteractive -Command -` elsewhere) in `cwd`, with `env` applied
    /// (notably `GIT_SSH_COMMAND` when an SSH key handle is supplied), and
    /// start its driving task.
    pub fn spawn(cwd: &std::path::Path, env: &[(String, String)]) -> std::io::Result<Self> {
        let mut command = platform_shell_command();
        command
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in env {
            command.env(k, v);
        }
        #[cfg(unix)]
        unsafe {
            use std::os::unix::process::CommandExt;
            command.pre_exec(|| {
                // Session-leader so the whole process tree this shell
                // spawns can be signalled as a unit via its negative pid.
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        let child = command.spawn()?;
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive_session(child, submit_rx, shutdown_rx));
        Ok(Self { submit: submit_tx, shutdown: shutdown_tx })
    }

    /// Submit one command and await its completion. `on_output_line`
    /// receives each line as it streams in, for real-time forwarding;
    /// lines are also accumulated into the returned [`CommandOutput`].
    pub async fn run(
        &self,
        command: &str,
        on_output_line: mpsc::UnboundedSender<OutputLine>,
    ) -> EngineResult<CommandOutput> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit
            .send(Submission {
                command: command.to_string(),
                on_output_line,
                reply: reply_tx,
            })
            .map_err(|_| EngineError::StepFailure {
                step: "shell".to_string(),
                message: "shell session has exited unexpectedly".to_string(),
            })?;

        reply_rx.await.map_err(|_| EngineError::StepFailure {
            step: "shell".to_string(),
            message: "shell session has exited unexpectedly".to_string(),
        })?
    }

    /// Tear down the session's process group (SIGTERM then SIGKILL after a
    /// grace period) and stop its driving task. Idempotent: a session whose
    /// task has already exited simply drops the request.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.shutdown.send(ShutdownRequest { ack: ack_tx }).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

#[cfg(unix)]
fn platform_shell_command() -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-s");
    cmd
}

#[cfg(not(unix))]
fn platform_shell_command() -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("powershell");
    cmd.args(["-NoProfile", "-NonInteractive", "-Command", "-"]);
    cmd
}

/// Grace period before escalating from SIGTERM to SIGKILL on an explicit
/// shell-session shutdown.
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Drives the child's stdin/stdout for its entire lifetime: pulls one
/// [`Submission`] at a time off the channel, writes its framed command,
/// and parses output up to the end marker before replying. Also watches for
/// an explicit [`ShutdownRequest`] (a failed step, or caller-driven
/// cancellation) and tears down the process group on demand.
async fn drive_session(
    child: Child,
    mut submit_rx: mpsc::UnboundedReceiver<Submission>,
    mut shutdown_rx: mpsc::UnboundedReceiver<ShutdownRequest>,
) {
    let mut group = PlatformProcessGroupHandle::new(child);

    loop {
        tokio::select! {
            biased;
            shutdown = shutdown_rx.recv() => {
                match shutdown {
                    Some(req) => {
                        if !group.process_group.terminate_gracefully(TERMINATE_GRACE).await {
                            group.process_group.kill().await;
                        }
                        let _ = req.ack.send(());
                        break;
                    }
                    None => break,
                }
            }
            submission = submit_rx.recv() => {
                let Some(submission) = submission else { break };
                let result = run_one_command(&mut group, &submission.command, &submission.on_output_line).await;
                let shell_is_dead = result_is_shell_dead(&result);
                let _ = submission.reply.send(result);
                if shell_is_dead {
                    break;
                }
            }
        }
    }
}

fn result_is_shell_dead(result: &EngineResult<CommandOutput>) -> bool {
    matches!(result, Err(EngineError::StepFailure { message, .. }) if message.contains("shell session has exited"))
}

struct PlatformProcessGroupHandle {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: BufReader<tokio::process::ChildStderr>,
    process_group: PlatformProcessGroup,
}

impl PlatformProcessGroupHandle {
    fn new(mut child: Child) -> Self {
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
        let stderr = BufReader::new(child.stderr.take().expect("piped stderr"));
        let process_group = PlatformProcessGroup::new(child);
        Self { stdin, stdout, stderr, process_group }
    }
}

async fn run_one_command(
    handle: &mut PlatformProcessGroupHandle,
    command: &str,
    on_output_line: &mpsc::UnboundedSender<OutputLine>,
) -> EngineResult<CommandOutput> {
    let marker = format!("__DEPLOY_CENTER_END_{}__", uuid::Uuid::new_v4().simple());
    // Echo the same marker on both streams so each reader can independently
    // find its own command boundary; only stdout's echo carries the exit
    // code (stderr's sentinel just closes out that stream's read).
    let framed = format!("{command}\necho \"{marker}:$?\"\necho \"{marker}\" >&2\n");

    if handle.stdin.write_all(framed.as_bytes()).await.is_err() || handle.stdin.flush().await.is_err() {
        return Err(EngineError::StepFailure {
            step: "shell".to_string(),
            message: "shell session has exited unexpectedly".to_string(),
        });
    }

    let marker_for_stderr = marker.clone();
    let read = tokio::time::timeout(COMMAND_TIMEOUT, async {
        tokio::try_join!(
            read_stdout_until_marker(&mut handle.stdout, &marker, on_output_line),
            read_stderr_until_marker(&mut handle.stderr, &marker_for_stderr, on_output_line),
        )
    })
    .await;

    match read {
        Ok(Ok((mut output, stderr))) => {
            output.stderr = stderr;
            Ok(output)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            handle.process_group.kill().await;
            Err(EngineError::StepFailure {
                step: "shell".to_string(),
                message: format!("command timed out after {:?}", COMMAND_TIMEOUT),
            })
        }
    }
}

/// Read lines from the shell's stdout until the framed end marker appears,
/// splitting the exit code out of it and forwarding every line seen along
/// the way to `on_output_line` as it's read.
async fn read_stdout_until_marker(
    stdout: &mut BufReader<ChildStdout>,
    marker: &str,
    on_output_line: &mpsc::UnboundedSender<OutputLine>,
) -> EngineResult<CommandOutput> {
    let mut output = CommandOutput::default();
    let mut line = String::new();
    loop {
        line.clear();
        let n = stdout.read_line(&mut line).await.map_err(|e| EngineError::StepFailure {
            step: "shell".to_string(),
            message: format!("failed to read shell output: {e}"),
        })?;
        if n == 0 {
            return Err(EngineError::StepFailure {
                step: "shell".to_string(),
                message: "shell session has exited unexpectedly".to_string(),
            });
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if let Some(rest) = trimmed.strip_prefix(marker) {
            let exit_code = rest.trim_start_matches(':').trim().parse().unwrap_or(-1);
            output.exit_code = exit_code;
            return Ok(output);
        }
        output.stdout.push_str(trimmed);
        output.stdout.push('\n');
        let _ = on_output_line.send(OutputLine::Stdout(trimmed.to_string()));
    }
}

/// Read lines from the shell's stderr until the framed end marker appears.
/// Every line is forwarded to `on_output_line`; classification into
/// warnings vs. errors buckets happens one layer up, in the pipeline
/// runner, which owns that policy.
async fn read_stderr_until_marker(
    stderr: &mut BufReader<tokio::process::ChildStderr>,
    marker: &str,
    on_output_line: &mpsc::UnboundedSender<OutputLine>,
) -> EngineResult<String> {
    let mut captured = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = stderr.read_line(&mut line).await.map_err(|e| EngineError::StepFailure {
            step: "shell".to_string(),
            message: format!("failed to read shell error output: {e}"),
        })?;
        if n == 0 {
            return Err(EngineError::StepFailure {
                step: "shell".to_string(),
                message: "shell session has exited unexpectedly".to_string(),
            });
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == marker {
            return Ok(captured);
        }
        captured.push_str(trimmed);
        captured.push('\n');
        let _ = on_output_line.send(OutputLine::Stderr(trimmed.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn runs_a_simple_command_and_captures_stdout() {
        let dir = tempdir().unwrap();
        let session = ShellSession::spawn(dir.path(), &[]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let output = session.run("echo hello-from-shell", tx).await.unwrap();
        assert!(output.stdout.contains("hello-from-shell"));
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn reports_nonzero_exit_code() {
        let dir = tempdir().unwrap();
        let session = ShellSession::spawn(dir.path(), &[]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let output = session.run("exit 7", tx).await.unwrap();
        assert_eq!(output.exit_code, 7);
    }

    #[tokio::test]
    async fn state_carries_across_commands_in_the_same_session() {
        let dir = tempdir().unwrap();
        let session = ShellSession::spawn(dir.path(), &[]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        session.run("export FOO=bar", tx.clone()).await.unwrap();
        let output = session.run("echo $FOO", tx).await.unwrap();
        assert!(output.stdout.contains("bar"));
    }
}
