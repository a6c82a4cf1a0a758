//! Builder for executing external tool commands with timeout and
//! cancellation support.
//!
//! Children are spawned with `kill_on_drop`, and explicitly killed on timeout
//! or cancellation, so an abandoned invocation never leaves an orphan behind.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Default command timeout: 5 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Process exit status.
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
}

/// Why a tool invocation did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The program could not be started (missing binary, permissions).
    #[error("{tool}: failed to spawn: {message}")]
    Spawn { tool: String, message: String },
    /// Communicating with the running process failed.
    #[error("{tool}: I/O error: {message}")]
    Io { tool: String, message: String },
    /// The process exited with a non-zero status.
    #[error("{tool}: exited with status {status}: {}", last_lines(.stderr, 5))]
    Exit {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },
    /// The deadline expired; the process was killed.
    #[error("{tool}: timed out after {after:?}")]
    TimedOut { tool: String, after: Duration },
    /// The caller cancelled; the process was killed.
    #[error("{tool}: cancelled")]
    Cancelled { tool: String },
}

impl CommandError {
    /// Name of the program that failed.
    pub fn tool(&self) -> &str {
        match self {
            CommandError::Spawn { tool, .. }
            | CommandError::Io { tool, .. }
            | CommandError::Exit { tool, .. }
            | CommandError::TimedOut { tool, .. }
            | CommandError::Cancelled { tool } => tool,
        }
    }
}

impl From<CommandError> for sc_core::Error {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Cancelled { .. } => sc_core::Error::Cancelled,
            other => sc_core::Error::tool(other.tool().to_string(), other.to_string()),
        }
    }
}

/// Keep the tail of stderr; ffmpeg prints its banner first and the cause last.
fn last_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.trim().lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join(" | ")
}

/// A builder for constructing and executing external tool invocations.
///
/// # Example
///
/// ```no_run
/// use sc_av::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn example() -> sc_core::Result<()> {
/// let output = ToolCommand::new(PathBuf::from("ffprobe"))
///     .arg("-v").arg("quiet")
///     .arg("-print_format").arg("json")
///     .arg("-show_format")
///     .arg("/path/to/clip.mp4")
///     .execute()
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    stdin_data: Option<Vec<u8>>,
    cancellation: Option<CancellationToken>,
}

impl ToolCommand {
    /// Create a new command for the given program path.
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            stdin_data: None,
            cancellation: None,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    /// Provide data to be written to the process's stdin.
    pub fn stdin(&mut self, data: Vec<u8>) -> &mut Self {
        self.stdin_data = Some(data);
        self
    }

    /// Kill the process when `token` is cancelled.
    pub fn cancellation(&mut self, token: CancellationToken) -> &mut Self {
        self.cancellation = Some(token);
        self
    }

    /// Arguments collected so far.
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Execute the command, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] describing whether the process could not be
    /// spawned, exited non-zero, timed out, or was cancelled. In the last two
    /// cases the child has been killed and reaped before this returns.
    pub async fn execute(&self) -> Result<ToolOutput, CommandError> {
        let tool = self.program_name();
        tracing::debug!("exec {} {}", self.program.display(), self.args.join(" "));

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(if self.stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| CommandError::Spawn {
            tool: tool.clone(),
            message: e.to_string(),
        })?;

        if let Some(ref data) = self.stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                match stdin.write_all(data).await {
                    Ok(()) => {}
                    // The child exited or closed stdin without reading it.
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                    Err(e) => {
                        return Err(CommandError::Io {
                            tool: tool.clone(),
                            message: format!("failed to write stdin: {e}"),
                        })
                    }
                }
                // Dropping stdin closes the pipe so the child can proceed.
            }
        }

        // Drain both pipes concurrently with the wait so a chatty child
        // cannot block on a full pipe buffer.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(ref mut p) = stdout_pipe {
                let _ = p.read_to_end(&mut buf).await;
            }
            buf
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(ref mut p) = stderr_pipe {
                let _ = p.read_to_end(&mut buf).await;
            }
            buf
        };
        let run = async {
            let (status, stdout, stderr) = tokio::join!(child.wait(), read_stdout, read_stderr);
            (status, stdout, stderr)
        };

        let cancelled = async {
            match &self.cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            res = tokio::time::timeout(self.timeout, run) => Some(res),
            _ = cancelled => None,
        };

        match outcome {
            Some(Ok((Ok(status), stdout, stderr))) => {
                let output = ToolOutput {
                    status,
                    stdout: String::from_utf8_lossy(&stdout).to_string(),
                    stderr: String::from_utf8_lossy(&stderr).to_string(),
                };
                if !status.success() {
                    return Err(CommandError::Exit {
                        tool,
                        status,
                        stderr: output.stderr,
                    });
                }
                Ok(output)
            }
            Some(Ok((Err(e), _, _))) => Err(CommandError::Io {
                tool,
                message: format!("waiting for process: {e}"),
            }),
            Some(Err(_elapsed)) => {
                terminate(&mut child).await;
                Err(CommandError::TimedOut {
                    tool,
                    after: self.timeout,
                })
            }
            None => {
                terminate(&mut child).await;
                Err(CommandError::Cancelled { tool })
            }
        }
    }
}

/// Kill and reap the child.
async fn terminate(child: &mut tokio::process::Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!("failed to kill child process: {e}");
    }
}
