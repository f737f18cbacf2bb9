//! Background capture of daemon output.
//!
//! The monitor reads the daemon's merged output line by line, keeps the most
//! recent records in a [`LogBuffer`], hands every record to the configured
//! callback, and resolves the supervisor's startup wait on the first
//! readiness or failure line.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LogCallback;
use crate::logs::{LogBuffer, LogLevel, LogRecord};
use crate::process::{is_startup_failure, DaemonOutput, StateMachine};

const DAEMON_TARGET: &str = "tunnel_supervisor::daemon";

/// Message the daemon logs once its local API is listening.
const WEB_SERVICE_READY: &str = "starting web service";

/// Startup-relevant line classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    /// The local API is bound and serving.
    Ready,
    /// The daemon cannot start.
    Failure,
}

impl Sentinel {
    /// Classify a record, if it is a sentinel at all.
    #[must_use]
    pub fn detect(record: &LogRecord) -> Option<Self> {
        if is_startup_failure(record) {
            return Some(Self::Failure);
        }
        if record.message_text().contains(WEB_SERVICE_READY) && record.addr().is_some() {
            return Some(Self::Ready);
        }
        None
    }
}

/// How the startup window ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StartupOutcome {
    Ready { addr: String },
    Failed(LogRecord),
    Exited,
}

impl StartupOutcome {
    fn from_record(record: &LogRecord) -> Option<Self> {
        match Sentinel::detect(record)? {
            Sentinel::Failure => Some(Self::Failed(record.clone())),
            Sentinel::Ready => record.addr().map(|addr| Self::Ready {
                addr: addr.to_string(),
            }),
        }
    }
}

/// Where parsed records go: retention, tracing, and the callback.
#[derive(Clone)]
pub(crate) struct RecordSink {
    buffer: LogBuffer,
    callback: Option<LogCallback>,
}

impl RecordSink {
    pub(crate) fn new(buffer: LogBuffer, callback: Option<LogCallback>) -> Self {
        Self { buffer, callback }
    }

    /// Parse, retain, and forward one line.
    pub(crate) fn accept(&self, line: &str) -> LogRecord {
        let record = LogRecord::parse(line);
        trace_record(&record);
        self.buffer.push(record.clone());

        if let Some(callback) = &self.callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&record))).is_err() {
                tracing::warn!(line = %record.raw, "Log callback panicked");
            }
        }
        record
    }

    #[cfg(test)]
    pub(crate) fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }
}

/// Re-emit a daemon record through `tracing` at the matching level.
fn trace_record(record: &LogRecord) {
    match record.level {
        Some(LogLevel::Debug) => tracing::debug!(target: DAEMON_TARGET, "{}", record.raw),
        Some(LogLevel::Info) => tracing::info!(target: DAEMON_TARGET, "{}", record.raw),
        Some(LogLevel::Warn) => tracing::warn!(target: DAEMON_TARGET, "{}", record.raw),
        Some(LogLevel::Error | LogLevel::Crit) => {
            tracing::error!(target: DAEMON_TARGET, "{}", record.raw);
        }
        None => tracing::trace!(target: DAEMON_TARGET, "{}", record.raw),
    }
}

/// Read early output until the first sentinel or the end of the stream.
///
/// Used when background monitoring is disabled.
pub(crate) async fn scan_startup(output: &mut DaemonOutput, sink: &RecordSink) -> StartupOutcome {
    loop {
        match output.next_line().await {
            Ok(Some(line)) => {
                let record = sink.accept(&line);
                if let Some(outcome) = StartupOutcome::from_record(&record) {
                    return outcome;
                }
            }
            Ok(None) => return StartupOutcome::Exited,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read daemon output");
                return StartupOutcome::Exited;
            }
        }
    }
}

/// Clears the monitoring flag however the task ends, abort included.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Handle to the background capture task for one daemon run.
#[derive(Debug)]
pub struct LogMonitor {
    buffer: LogBuffer,
    active: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LogMonitor {
    /// Create an idle monitor retaining up to `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: LogBuffer::new(capacity),
            active: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// Whether the capture task is currently running.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Snapshot of the retained records, oldest first.
    #[must_use]
    pub fn logs(&self) -> Vec<LogRecord> {
        self.buffer.snapshot()
    }

    #[must_use]
    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    pub(crate) fn sink(&self, callback: Option<LogCallback>) -> RecordSink {
        RecordSink::new(self.buffer.clone(), callback)
    }

    /// Spawn the capture task over `output`.
    ///
    /// `signal` receives exactly one [`StartupOutcome`]. Once the stream
    /// closes after startup, `state` is told the daemon exited.
    pub(crate) fn spawn(
        &mut self,
        output: DaemonOutput,
        callback: Option<LogCallback>,
        signal: oneshot::Sender<StartupOutcome>,
        state: StateMachine,
    ) {
        self.active.store(true, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.active));
        let sink = self.sink(callback);
        let cancel = self.cancel.clone();

        self.handle = Some(tokio::spawn(async move {
            let _guard = guard;
            run(output, sink, signal, state, cancel).await;
        }));
    }

    /// Wait for the task to finish, escalating if it lingers.
    ///
    /// The task normally ends on its own once the daemon's output closes.
    /// After `join_timeout` it is cancelled, and after a second
    /// `join_timeout` it is aborted.
    pub(crate) async fn shutdown(&mut self, join_timeout: Duration) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        if tokio::time::timeout(join_timeout, &mut handle).await.is_ok() {
            return;
        }

        tracing::debug!("Log monitor still running after output close, cancelling");
        self.cancel.cancel();
        if tokio::time::timeout(join_timeout, &mut handle).await.is_err() {
            tracing::warn!("Log monitor did not stop after cancellation, aborting");
            handle.abort();
        }
    }
}

impl Drop for LogMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run(
    mut output: DaemonOutput,
    sink: RecordSink,
    signal: oneshot::Sender<StartupOutcome>,
    state: StateMachine,
    cancel: CancellationToken,
) {
    let mut signal = Some(signal);
    let mut closed = false;

    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Log monitor cancelled");
                return;
            }
            line = output.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                let record = sink.accept(&line);
                if signal.is_some() {
                    if let Some(outcome) = StartupOutcome::from_record(&record) {
                        if let Some(tx) = signal.take() {
                            // The supervisor may have given up waiting.
                            let _ = tx.send(outcome);
                        }
                    }
                }
            }
            Ok(None) => {
                closed = true;
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read daemon output, capture stopped");
                break;
            }
        }
    }

    if let Some(tx) = signal.take() {
        let _ = tx.send(StartupOutcome::Exited);
    } else if closed && state.mark_exited() {
        // A read error says nothing about liveness; only end of stream does.
        tracing::warn!("Daemon output closed without stop, marking process stopped");
    }
}
