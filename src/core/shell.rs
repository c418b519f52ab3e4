//! Persistent privileged shell
//!
//! One elevated `sh` subprocess receives every firewall command on stdin.
//! Shell stdout has no message boundaries, so each command line is suffixed
//! with `; echo <END_MARKER> $?` and output is accumulated until that trailer
//! appears at the end of stdout. The trailer carries the exit code and is
//! stripped from the returned output.
//!
//! The session is created lazily and thrown away on any fault (spawn or write
//! failure, end of stream, timeout, malformed trailer, or the calling future
//! being dropped mid-command). The next command then spawns a fresh shell.

use crate::core::error::{Error, Result};
use crate::elevation::ElevationError;
use std::fmt;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Terminates every command's stdout. Long and namespaced so no real command
/// output contains it.
pub const END_MARKER: &str = "___vpn_bypass.shell.end_of_output___";

/// Default per-command timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Grace period for stderr written just before the end marker
const STDERR_SETTLE: Duration = Duration::from_millis(10);

const READ_CHUNK: usize = 1024;

/// Output of one shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ exit_code: {}, stdout: \"{}\", stderr: \"{}\" }}",
            self.exit_code,
            self.stdout.trim(),
            self.stderr.trim()
        )
    }
}

/// Executes single shell command lines with root privileges
///
/// [`ShellChannel`] is the production implementation; tests substitute an
/// in-memory firewall.
pub trait CommandRunner: Send + Sync + 'static {
    fn run_command(&self, command: &str) -> impl Future<Output = Result<CommandResult>> + Send;
}

type Launcher = Box<dyn Fn() -> std::result::Result<Command, ElevationError> + Send + Sync>;

/// Owner of the single privileged shell session
///
/// Commands are serialized by an internal lock; share the channel as an
/// `Arc<ShellChannel>` between every component issuing commands.
pub struct ShellChannel {
    launcher: Launcher,
    timeout_secs: u64,
    session: Mutex<Option<Session>>,
}

impl ShellChannel {
    /// Channel whose shell is elevated through [`crate::elevation`]
    pub fn new() -> Self {
        Self::with_launcher(crate::elevation::create_elevated_shell_command)
    }

    /// Channel spawning its shell from `launcher`
    pub fn with_launcher<F>(launcher: F) -> Self
    where
        F: Fn() -> std::result::Result<Command, ElevationError> + Send + Sync + 'static,
    {
        Self {
            launcher: Box::new(launcher),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            session: Mutex::new(None),
        }
    }

    /// Sets the timeout used by [`CommandRunner::run_command`]
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    /// Runs one command line in the root shell.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an empty command
    /// - `PrivilegedAccessDenied` if the shell cannot be spawned, written to,
    ///   or exits before the end marker
    /// - `Timeout` if the end marker does not arrive within `timeout_secs`
    /// - `MalformedOutput` if the trailer's exit code cannot be parsed
    ///
    /// Every error discards the session.
    pub async fn run(&self, command: &str, timeout_secs: u64) -> Result<CommandResult> {
        let command = command.trim();
        if command.is_empty() {
            return Err(Error::InvalidArgument("Empty command".to_string()));
        }

        let mut slot = self.session.lock().await;
        debug!(command, "root shell command");

        // The session only goes back into the slot after a clean exchange. On
        // error, or if this future is dropped, it is dropped here and killed.
        let outcome = async {
            let mut session = match slot.take() {
                Some(mut session) => {
                    if session.is_alive() {
                        session
                    } else {
                        self.spawn()?
                    }
                }
                None => self.spawn()?,
            };
            let result = session.execute(command, timeout_secs).await?;
            Ok::<_, Error>((session, result))
        }
        .await;

        match outcome {
            Ok((session, result)) => {
                *slot = Some(session);
                debug!(%result, "root shell result");
                Ok(result)
            }
            Err(e) => {
                debug!(error = %e, "root shell result");
                Err(e)
            }
        }
    }

    /// Kills the current session, if any. The next command respawns it.
    pub async fn shutdown(&self) {
        let mut slot = self.session.lock().await;
        if let Some(mut session) = slot.take() {
            info!("Shutting down root shell");
            session.kill().await;
        }
    }

    fn spawn(&self) -> Result<Session> {
        let mut cmd = (self.launcher)().map_err(|e| {
            Error::PrivilegedAccessDenied(format!("Privilege escalation unavailable: {e}"))
        })?;
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::PrivilegedAccessDenied(format!("Failed to spawn root shell: {e}")))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(Error::PrivilegedAccessDenied(
                "Root shell started without pipes".to_string(),
            ));
        };

        info!(pid = ?child.id(), "Spawned root shell");
        Ok(Session {
            child,
            stdin,
            stdout,
            stderr,
        })
    }
}

impl Default for ShellChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for ShellChannel {
    async fn run_command(&self, command: &str) -> Result<CommandResult> {
        self.run(command, self.timeout_secs).await
    }
}

/// A live shell subprocess and its pipes
struct Session {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

impl Session {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }

    async fn execute(&mut self, command: &str, timeout_secs: u64) -> Result<CommandResult> {
        let line = format!("{command}; echo {END_MARKER} $?\n");
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::PrivilegedAccessDenied(format!("Write to root shell failed: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| Error::PrivilegedAccessDenied(format!("Write to root shell failed: {e}")))?;

        match tokio::time::timeout(Duration::from_secs(timeout_secs), self.collect_output()).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                command: command.to_string(),
                seconds: timeout_secs,
            }),
        }
    }

    async fn collect_output(&mut self) -> Result<CommandResult> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut out_buf = [0u8; READ_CHUNK];
        let mut err_buf = [0u8; READ_CHUNK];

        loop {
            tokio::select! {
                read = self.stdout.read(&mut out_buf) => {
                    let size = read.map_err(closed)?;
                    if size == 0 {
                        return Err(closed("stdout reached end of stream"));
                    }
                    stdout.extend_from_slice(&out_buf[..size]);

                    if let Some(trailer) = split_trailer(&stdout) {
                        let (body, exit_code) = trailer?;
                        self.drain_stderr(&mut stderr, &mut err_buf).await?;
                        return Ok(CommandResult {
                            exit_code,
                            stdout: body,
                            stderr: String::from_utf8_lossy(&stderr).into_owned(),
                        });
                    }
                }
                read = self.stderr.read(&mut err_buf) => {
                    let size = read.map_err(closed)?;
                    if size == 0 {
                        return Err(closed("stderr reached end of stream"));
                    }
                    stderr.extend_from_slice(&err_buf[..size]);
                }
            }
        }
    }

    /// Picks up stderr still in flight when the end marker arrived
    async fn drain_stderr(&mut self, stderr: &mut Vec<u8>, buf: &mut [u8]) -> Result<()> {
        while let Ok(read) = tokio::time::timeout(STDERR_SETTLE, self.stderr.read(buf)).await {
            let size = read.map_err(closed)?;
            if size == 0 {
                return Err(closed("stderr reached end of stream"));
            }
            stderr.extend_from_slice(&buf[..size]);
        }
        Ok(())
    }
}

fn closed(reason: impl fmt::Display) -> Error {
    Error::PrivilegedAccessDenied(format!("Root shell closed: {reason}"))
}

/// Splits `<body><END_MARKER> <code>\n` at the end of stdout.
///
/// Returns `None` while the trailer has not fully arrived. The marker need not
/// start a line: output without a trailing newline runs straight into it.
fn split_trailer(stdout: &[u8]) -> Option<Result<(String, i32)>> {
    if stdout.last() != Some(&b'\n') {
        return None;
    }
    let text = String::from_utf8_lossy(stdout);
    let index = text.rfind(END_MARKER)?;
    let code = text[index + END_MARKER.len()..]
        .strip_prefix(' ')?
        .strip_suffix('\n')?;
    if code.contains('\n') {
        return None;
    }

    Some(
        code.trim()
            .parse::<i32>()
            .map(|exit_code| (text[..index].to_string(), exit_code))
            .map_err(|_| Error::MalformedOutput(format!("bad exit code '{}'", code.trim()))),
    )
}
