//! Lifecycle supervision for a single daemon process.
//!
//! [`ProcessSupervisor`] spawns the daemon, waits until it reports that its
//! local API is listening, keeps its output captured while it runs, and
//! tears it down again. One supervisor owns at most one child and one
//! [`LogMonitor`] at a time and can be started again after a stop or after
//! the daemon dies on its own.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::config::{ConfigError, ConfigLoader, ProcessConfig};
use crate::logs::LogRecord;
use crate::process::monitor::{scan_startup, StartupOutcome};
use crate::process::{
    classify_failure, DaemonOutput, DaemonProcess, LogMonitor, ProcessError, ProcessState,
    SpawnError, StateMachine,
};

/// Default grace period between SIGTERM and SIGKILL on stop.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on each wait for the monitor task during teardown.
pub const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Supervisor for one tunneling daemon.
#[derive(Debug)]
pub struct ProcessSupervisor {
    config: ProcessConfig,
    state: StateMachine,
    process: Mutex<Option<DaemonProcess>>,
    monitor: LogMonitor,
    /// Output pipes held open when background monitoring is off.
    idle_output: Option<DaemonOutput>,
    api_url: Option<String>,
    terminate_timeout: Duration,
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(config: ProcessConfig) -> Self {
        let monitor = LogMonitor::new(config.max_logs());
        Self {
            config,
            state: StateMachine::new(),
            process: Mutex::new(None),
            monitor,
            idle_output: None,
            api_url: None,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
        }
    }

    /// Build a supervisor from the settings file `loader` finds.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if no settings file names a binary or the
    /// file is invalid.
    pub fn from_loader(loader: &ConfigLoader) -> Result<Self, ConfigError> {
        Ok(Self::new(loader.load_config()?))
    }

    /// Override the grace period given to the daemon on stop.
    #[must_use]
    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state.state()
    }

    /// OS process id of the current child, if one is held.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process_slot().as_ref().and_then(DaemonProcess::id)
    }

    /// Local API address, e.g. `http://127.0.0.1:4040`.
    ///
    /// `None` until the first successful start.
    #[must_use]
    pub fn api_url(&self) -> Option<&str> {
        self.api_url.as_deref()
    }

    /// Snapshot of the retained daemon records, oldest first.
    #[must_use]
    pub fn logs(&self) -> Vec<LogRecord> {
        self.monitor.logs()
    }

    #[must_use]
    pub fn log_monitor(&self) -> &LogMonitor {
        &self.monitor
    }

    /// Whether the daemon is running and the OS confirms it is alive.
    ///
    /// A daemon found dead here is marked stopped, so a later
    /// [`start`](Self::start) spawns a fresh one.
    pub fn is_running(&self) -> bool {
        if self.state.state() != ProcessState::Running {
            return false;
        }

        let alive = self
            .process_slot()
            .as_mut()
            .is_some_and(DaemonProcess::is_alive);
        if !alive && self.state.mark_exited() {
            tracing::warn!("Daemon exited without stop, marking process stopped");
        }
        alive
    }

    /// Start the daemon and wait until it is ready.
    ///
    /// Does nothing if the daemon is already running.
    ///
    /// # Errors
    ///
    /// - `ProcessError::BinaryNotFound` if the configured binary is missing.
    /// - `ProcessError::Bind` / `ProcessError::StartupFailed` if the daemon
    ///   logged a failure during startup.
    /// - `ProcessError::StartupTimeout` if neither readiness nor failure was
    ///   seen within the configured timeout.
    /// - `ProcessError::ExitedUnexpectedly` if its output closed first.
    ///
    /// Every failure leaves the supervisor stopped with no live child. If
    /// the returned future is dropped before it resolves, the half-started
    /// daemon is killed by the next `start` or `stop`.
    pub async fn start(&mut self) -> Result<(), ProcessError> {
        if self.is_running() {
            tracing::debug!("Daemon already running");
            return Ok(());
        }

        let binary = self.config.binary_path();
        if !binary.is_file() {
            tracing::warn!(path = %binary.display(), "Daemon binary not found");
            return Err(ProcessError::BinaryNotFound {
                path: binary.to_path_buf(),
            });
        }

        self.reap_stale().await;
        self.state.transition(ProcessState::Starting)?;
        self.monitor = LogMonitor::new(self.config.max_logs());

        let mut process = match DaemonProcess::spawn(&self.config) {
            Ok(process) => process,
            Err(e) => {
                self.settle_stopped();
                return Err(match e {
                    SpawnError::NotFound => ProcessError::BinaryNotFound {
                        path: self.config.binary_path().to_path_buf(),
                    },
                    other => ProcessError::Spawn(other),
                });
            }
        };
        let pid = process.id();

        let Some(mut output) = process.take_output() else {
            let _ = process.kill().await;
            self.settle_stopped();
            return Err(ProcessError::NoOutput);
        };
        *self.process.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(process);

        let timeout = self.config.startup_timeout();
        let callback = self.config.log_callback().cloned();
        tracing::info!(pid, ?timeout, monitoring = self.config.monitoring(), "Waiting for daemon");

        let outcome = if self.config.monitoring() {
            let (tx, rx) = oneshot::channel();
            self.monitor.spawn(output, callback, tx, self.state.clone());
            tokio::time::timeout(timeout, rx)
                .await
                .map(|received| received.unwrap_or(StartupOutcome::Exited))
        } else {
            let sink = self.monitor.sink(callback);
            let scanned = tokio::time::timeout(timeout, scan_startup(&mut output, &sink)).await;
            self.idle_output = Some(output);
            scanned
        };

        match outcome {
            Ok(StartupOutcome::Ready { addr }) => {
                let url = format!("http://{addr}");
                self.state.transition(ProcessState::Running)?;
                tracing::info!(pid, api_url = %url, "Daemon ready");
                self.api_url = Some(url);
                Ok(())
            }
            Ok(StartupOutcome::Failed(record)) => {
                let err = classify_failure(&record, self.monitor.logs());
                tracing::warn!(pid, error = %err, "Daemon failed to start");
                self.abort_start().await;
                Err(err)
            }
            Ok(StartupOutcome::Exited) => {
                let logs = self.monitor.logs();
                tracing::warn!(pid, lines = logs.len(), "Daemon exited during startup");
                self.abort_start().await;
                Err(ProcessError::ExitedUnexpectedly { logs })
            }
            Err(_) => {
                let logs = self.monitor.logs();
                tracing::warn!(pid, ?timeout, lines = logs.len(), "Daemon startup timed out");
                self.abort_start().await;
                Err(ProcessError::StartupTimeout { timeout, logs })
            }
        }
    }

    /// Stop the daemon, gracefully if it allows.
    ///
    /// Sends SIGTERM, waits up to the terminate timeout, then kills. Waits
    /// for the monitor task to finish. Safe to call when not running.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError::Terminate` if the daemon could not be
    /// signalled. The supervisor is stopped either way.
    pub async fn stop(&mut self) -> Result<(), ProcessError> {
        if !self.is_running() {
            self.reap_stale().await;
            return Ok(());
        }

        if self.state.transition(ProcessState::Stopping).is_err() {
            // Exited between the liveness check and here.
            self.reap_stale().await;
            return Ok(());
        }
        let process = self.take_process();
        tracing::info!(pid = process.as_ref().and_then(DaemonProcess::id), "Stopping daemon");

        let result = match process {
            Some(mut process) => process.graceful_terminate(self.terminate_timeout).await,
            None => Ok(()),
        };

        self.idle_output = None;
        self.monitor.shutdown(MONITOR_JOIN_TIMEOUT).await;
        self.state.transition(ProcessState::Stopped)?;
        tracing::info!("Daemon stopped");

        result.map_err(ProcessError::Terminate)
    }

    /// Kill the child and return to `Stopped` after a failed start.
    async fn abort_start(&mut self) {
        if let Some(mut process) = self.take_process() {
            if let Err(e) = process.kill().await {
                tracing::debug!(error = %e, "Kill after failed start");
            }
        }
        self.idle_output = None;
        self.monitor.shutdown(MONITOR_JOIN_TIMEOUT).await;
        self.settle_stopped();
    }

    /// Release anything left over from a daemon that died on its own, or
    /// from a `start`/`stop` whose future was dropped part way.
    ///
    /// `&mut self` rules out a call still in flight, so `Starting` or
    /// `Stopping` seen here is stale and is settled to `Stopped`.
    async fn reap_stale(&mut self) {
        self.idle_output = None;
        if let Some(mut process) = self.take_process() {
            if process.is_alive() {
                tracing::warn!(pid = process.id(), "Killing orphaned daemon");
                if let Err(e) = process.kill().await {
                    tracing::debug!(error = %e, "Kill of orphaned daemon");
                }
            }
        }
        self.monitor.shutdown(MONITOR_JOIN_TIMEOUT).await;

        let state = self.state.state();
        if matches!(state, ProcessState::Starting | ProcessState::Stopping) {
            tracing::warn!(?state, "Recovering from an interrupted start or stop");
            self.settle_stopped();
        }
    }

    fn settle_stopped(&self) {
        if let Err(e) = self.state.transition(ProcessState::Stopped) {
            tracing::debug!(error = %e, "Already settled");
        }
    }

    fn take_process(&mut self) -> Option<DaemonProcess> {
        self.process
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn process_slot(&self) -> MutexGuard<'_, Option<DaemonProcess>> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
