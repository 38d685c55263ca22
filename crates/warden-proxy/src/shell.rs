//! Elevated command interpreter session.
//!
//! One process, one command at a time. After each command the session writes
//! a unique marker to both output streams and reads until it sees it, so the
//! output of one command never leaks into the next.
//!
//! Standard output is drained before standard error. A command that writes
//! more than a pipe buffer to stderr would stall the shell; the rule commands
//! this is used for write a line or two at most.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::error::PrivilegeError;

/// Program and arguments used by default to obtain a root shell.
pub const DEFAULT_SHELL: [&str; 3] = ["su", "-c", "sh"];

/// Attempts made to reap the shell after `exit` before killing it.
const EXIT_POLL_ATTEMPTS: u32 = 10;

/// Delay between reap attempts.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Output of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// Everything the command wrote to standard output.
    pub stdout: String,
    /// Everything the command wrote to standard error.
    pub stderr: String,
    /// Exit status reported by the shell.
    pub exit_code: i32,
}

impl CommandOutput {
    /// Returns true if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// How to start the elevated shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegedShell {
    program: String,
    args: Vec<String>,
}

impl Default for PrivilegedShell {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL[0], DEFAULT_SHELL[1..].iter().copied())
    }
}

impl PrivilegedShell {
    /// Creates a launcher for `program` with `args`.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Program that is executed.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Full command line, for display.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Spawns the shell.
    pub fn open(&self) -> Result<ShellSession, PrivilegeError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PrivilegeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PrivilegeError::Io(std::io::Error::new(
                    ErrorKind::BrokenPipe,
                    "shell pipes unavailable",
                )));
            }
        };

        let marker = format!(
            "__warden_eoc_{}_{}__",
            std::process::id(),
            SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
        );

        tracing::debug!("Opened shell {} (pid {})", self.command_line(), child.id());

        Ok(ShellSession {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            stderr: BufReader::new(stderr),
            marker,
            closed: false,
        })
    }
}

/// A live shell process.
///
/// Dropping the session closes it.
pub struct ShellSession {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    stderr: BufReader<ChildStderr>,
    marker: String,
    closed: bool,
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("pid", &self.child.id())
            .field("marker", &self.marker)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ShellSession {
    /// Process id of the shell.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Runs one command line and returns what it printed.
    pub fn execute(&mut self, command: &str) -> Result<CommandOutput, PrivilegeError> {
        let closed = || PrivilegeError::SessionClosed {
            command: command.to_string(),
        };

        let stdin = self.stdin.as_mut().ok_or_else(closed)?;
        let script = format!(
            "{command}\necho \"{marker} $?\"\necho \"{marker}\" 1>&2\n",
            marker = self.marker
        );

        if let Err(e) = stdin.write_all(script.as_bytes()).and_then(|_| stdin.flush()) {
            return Err(match e.kind() {
                ErrorKind::BrokenPipe => closed(),
                _ => PrivilegeError::Io(e),
            });
        }

        let (stdout, status) =
            read_until_marker(&mut self.stdout, &self.marker)?.ok_or_else(closed)?;
        let (stderr, _) =
            read_until_marker(&mut self.stderr, &self.marker)?.ok_or_else(closed)?;

        let exit_code = status.trim().parse().unwrap_or(-1);

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// Ends the shell, killing it if it does not exit promptly.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let pid = self.child.id();
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(b"exit\n");
            let _ = stdin.flush();
        }

        for _ in 0..EXIT_POLL_ATTEMPTS {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!("Shell {} exited: {}", pid, status);
                    return;
                }
                Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
                Err(e) => {
                    tracing::debug!("Waiting for shell {} failed: {}", pid, e);
                    return;
                }
            }
        }

        tracing::debug!("Shell {} still running, killing", pid);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reads lines until one contains `marker`.
///
/// Returns the text before the marker and the remainder of the marker line,
/// or `None` on EOF. Output that is not UTF-8 is decoded lossily.
fn read_until_marker<R: BufRead>(
    reader: &mut R,
    marker: &str,
) -> Result<Option<(String, String)>, PrivilegeError> {
    let marker = marker.as_bytes();
    let mut output = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }

        if let Some(idx) = find_bytes(&line, marker) {
            output.extend_from_slice(&line[..idx]);
            let rest = String::from_utf8_lossy(&line[idx + marker.len()..])
                .trim_end()
                .to_string();
            return Ok(Some((String::from_utf8_lossy(&output).into_owned(), rest)));
        }

        output.extend_from_slice(&line);
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
