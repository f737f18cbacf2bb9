//! Daemon process spawning and control.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::config::ProcessConfig;

/// Error type for process spawning operations.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The binary was not found.
    #[error("Daemon binary not found")]
    NotFound,
    /// Permission denied when spawning.
    #[error("Permission denied")]
    PermissionDenied,
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io(err),
        }
    }
}

/// A running daemon process.
#[derive(Debug)]
pub struct DaemonProcess {
    child: Child,
}

impl DaemonProcess {
    /// Spawn the daemon described by `config` with both output pipes captured.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the process fails to spawn.
    pub fn spawn(config: &ProcessConfig) -> Result<Self, SpawnError> {
        let mut cmd = Command::new(config.binary_path());
        cmd.args(config.build_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(SpawnError::from_io)?;
        tracing::debug!(
            pid = child.id(),
            binary = %config.binary_path().display(),
            "Spawned daemon"
        );

        Ok(Self { child })
    }

    /// Take both output pipes as a single line stream.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_output(&mut self) -> Option<DaemonOutput> {
        let stdout = self.child.stdout.take();
        let stderr = self.child.stderr.take();
        if stdout.is_none() && stderr.is_none() {
            return None;
        }
        Some(DaemonOutput::new(stdout, stderr))
    }

    /// Get the process ID, if still running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Check if the process has exited without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the process state cannot be queried.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Whether the OS still reports the process as alive.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Forcefully kill the process and reap it.
    ///
    /// # Errors
    ///
    /// Returns an error if the kill signal cannot be sent.
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }

    /// Attempt graceful termination with a timeout.
    ///
    /// On Unix, sends SIGTERM first, then SIGKILL after the timeout.
    /// On other platforms, falls back to immediate kill.
    ///
    /// # Errors
    ///
    /// Returns an error if termination fails.
    pub async fn graceful_terminate(&mut self, timeout: Duration) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            self.graceful_terminate_unix(timeout).await
        }

        #[cfg(not(unix))]
        {
            let _ = timeout;
            self.kill().await
        }
    }

    #[cfg(unix)]
    async fn graceful_terminate_unix(&mut self, timeout: Duration) -> std::io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.id() else {
            // Already reaped.
            return Ok(());
        };

        let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
        if let Err(errno) = kill(nix_pid, Signal::SIGTERM) {
            tracing::debug!(pid, %errno, "SIGTERM failed, escalating to kill");
            return self.child.kill().await;
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid, %status, "Daemon exited after SIGTERM");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(pid, ?timeout, "Daemon ignored SIGTERM, killing");
                self.child.kill().await
            }
        }
    }
}

/// Merged line stream over the daemon's stdout and stderr.
///
/// Ends once both pipes have closed.
#[derive(Debug)]
pub struct DaemonOutput {
    stdout: Option<LineReader<ChildStdout>>,
    stderr: Option<LineReader<ChildStderr>>,
}

impl DaemonOutput {
    fn new(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) -> Self {
        Self {
            stdout: stdout.map(LineReader::new),
            stderr: stderr.map(LineReader::new),
        }
    }

    /// Read the next line from whichever pipe produces one first.
    ///
    /// Cancel safe: dropping the future loses no data.
    ///
    /// # Errors
    ///
    /// Returns an error if reading from a pipe fails.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let (line, from_stdout) = match (self.stdout.as_mut(), self.stderr.as_mut()) {
                (None, None) => return Ok(None),
                (Some(out), None) => (out.next_line().await?, true),
                (None, Some(err)) => (err.next_line().await?, false),
                (Some(out), Some(err)) => tokio::select! {
                    line = out.next_line() => (line?, true),
                    line = err.next_line() => (line?, false),
                },
            };

            match line {
                Some(line) => return Ok(Some(line)),
                None if from_stdout => self.stdout = None,
                None => self.stderr = None,
            }
        }
    }
}

/// Newline-delimited reader that tolerates bytes that are not UTF-8.
///
/// Invalid sequences are replaced with U+FFFD. Partial lines survive a
/// cancelled read in `pending`.
#[derive(Debug)]
struct LineReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::new(),
        }
    }

    /// Next line without its terminator, or `None` at end of stream.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.pending).await?;
        if read == 0 && self.pending.is_empty() {
            return Ok(None);
        }

        let mut bytes = self.pending.as_slice();
        if let Some(rest) = bytes.strip_suffix(b"\n") {
            bytes = rest.strip_suffix(b"\r").unwrap_or(rest);
        }
        let line = String::from_utf8_lossy(bytes).into_owned();
        self.pending.clear();
        Ok(Some(line))
    }
}
