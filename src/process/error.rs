//! Supervisor errors and failure classification.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::logs::{LogLevel, LogRecord};
use crate::process::{SpawnError, TransitionError};

/// Bind conflicts as reported across platforms, e.g. POSIX
/// `bind: address already in use` and the Windows socket wording
/// `bind: Only one usage of each socket address ... is normally permitted`.
static BIND_CONFLICT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)address already in use|only one usage of each socket address|bind:.*\bin use\b|\beaddrinuse\b",
    )
    .expect("bind conflict pattern is valid")
});

/// Caller-facing failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BinaryNotFound,
    PortInUse,
    StartupFailed,
    StartupTimeout,
    ProcessExitedUnexpectedly,
    InvalidState,
    Io,
}

/// Error type for supervisor operations.
///
/// Startup failures carry the log history captured up to the failure, so
/// they stay diagnosable after the buffer moves on.
#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    /// The configured binary does not exist. Nothing was spawned.
    #[error("The daemon binary was not found at {}", .path.display())]
    BinaryNotFound { path: PathBuf },

    /// The daemon could not bind an address it needs.
    #[error("The daemon process errored on start: {detail}")]
    Bind { detail: String, logs: Vec<LogRecord> },

    /// The daemon reported some other unrecoverable startup condition.
    #[error("The daemon process errored on start: {detail}")]
    StartupFailed { detail: String, logs: Vec<LogRecord> },

    /// No readiness or failure line was seen in time.
    #[error("The daemon process did not become ready within {timeout:?}")]
    StartupTimeout {
        timeout: Duration,
        logs: Vec<LogRecord>,
    },

    /// The daemon's output closed before it reported readiness.
    #[error("The daemon process exited before it became ready")]
    ExitedUnexpectedly { logs: Vec<LogRecord> },

    /// Spawning the daemon failed.
    #[error("Failed to spawn daemon: {0}")]
    Spawn(#[from] SpawnError),

    /// The spawned process had no output pipes.
    #[error("Daemon output not available")]
    NoOutput,

    /// Stopping the daemon failed.
    #[error("Failed to terminate daemon: {0}")]
    Terminate(#[source] std::io::Error),

    /// A lifecycle call raced an incompatible state.
    #[error(transparent)]
    State(#[from] TransitionError),
}

impl ProcessError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BinaryNotFound { .. } => ErrorKind::BinaryNotFound,
            Self::Bind { .. } => ErrorKind::PortInUse,
            Self::StartupFailed { .. } => ErrorKind::StartupFailed,
            Self::StartupTimeout { .. } => ErrorKind::StartupTimeout,
            Self::ExitedUnexpectedly { .. } => ErrorKind::ProcessExitedUnexpectedly,
            Self::State(_) => ErrorKind::InvalidState,
            Self::Spawn(_) | Self::NoOutput | Self::Terminate(_) => ErrorKind::Io,
        }
    }

    /// The daemon's own description of the failure, verbatim.
    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Bind { detail, .. } | Self::StartupFailed { detail, .. } => Some(detail),
            _ => None,
        }
    }

    /// Log history captured when the error was raised.
    #[must_use]
    pub fn logs(&self) -> &[LogRecord] {
        match self {
            Self::Bind { logs, .. }
            | Self::StartupFailed { logs, .. }
            | Self::StartupTimeout { logs, .. }
            | Self::ExitedUnexpectedly { logs } => logs,
            _ => &[],
        }
    }
}

/// Whether `record` reports an unrecoverable startup condition.
#[must_use]
pub fn is_startup_failure(record: &LogRecord) -> bool {
    match record.level {
        Some(LogLevel::Crit) => true,
        Some(level) if level.is_error() => record.err().is_some() || is_bind_conflict(record),
        _ => false,
    }
}

/// Whether `record` describes an address conflict.
#[must_use]
pub fn is_bind_conflict(record: &LogRecord) -> bool {
    record.err().is_some_and(|err| BIND_CONFLICT.is_match(err))
        || BIND_CONFLICT.is_match(record.message_text())
}

/// Turn a failure record plus the captured history into a typed error.
///
/// The detail comes from the `err` field when present, else the message.
#[must_use]
pub fn classify_failure(record: &LogRecord, mut logs: Vec<LogRecord>) -> ProcessError {
    if !logs.contains(record) {
        logs.push(record.clone());
    }

    let detail = record
        .err()
        .or(record.message.as_deref())
        .unwrap_or(&record.raw)
        .to_string();

    if is_bind_conflict(record) {
        ProcessError::Bind { detail, logs }
    } else {
        ProcessError::StartupFailed { detail, logs }
    }
}
