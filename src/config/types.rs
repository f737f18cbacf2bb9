//! Process configuration and its builder.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::logs::LogRecord;

use super::{ConfigError, ProcessSettings};

/// Default time allowed for the daemon to report readiness.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Default number of records retained per process.
pub const DEFAULT_MAX_LOGS: usize = 100;

/// Callback invoked once for every record the daemon produces.
pub type LogCallback = Arc<dyn Fn(&LogRecord) + Send + Sync>;

/// Immutable configuration for one supervised daemon.
///
/// Built with [`ProcessConfig::builder`]. Use [`ProcessConfig::to_builder`]
/// to derive a variant without touching the original.
#[derive(Clone)]
pub struct ProcessConfig {
    binary_path: PathBuf,
    config_path: Option<PathBuf>,
    startup_timeout: Duration,
    max_logs: usize,
    log_callback: Option<LogCallback>,
    monitoring: bool,
    region: Option<String>,
    auth_token: Option<String>,
    extra_args: Vec<String>,
}

impl ProcessConfig {
    /// Start building a configuration for the binary at `binary_path`.
    #[must_use]
    pub fn builder(binary_path: impl Into<PathBuf>) -> ProcessConfigBuilder {
        ProcessConfigBuilder::new(binary_path)
    }

    /// A builder seeded with every value of this configuration.
    #[must_use]
    pub fn to_builder(&self) -> ProcessConfigBuilder {
        ProcessConfigBuilder {
            binary_path: self.binary_path.clone(),
            config_path: self.config_path.clone(),
            startup_timeout: self.startup_timeout,
            max_logs: self.max_logs,
            log_callback: self.log_callback.clone(),
            monitoring: self.monitoring,
            region: self.region.clone(),
            auth_token: self.auth_token.clone(),
            extra_args: self.extra_args.clone(),
        }
    }

    #[must_use]
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    #[must_use]
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    #[must_use]
    pub fn max_logs(&self) -> usize {
        self.max_logs
    }

    #[must_use]
    pub fn log_callback(&self) -> Option<&LogCallback> {
        self.log_callback.as_ref()
    }

    /// Whether a background task keeps capturing logs after startup.
    #[must_use]
    pub fn monitoring(&self) -> bool {
        self.monitoring
    }

    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    #[must_use]
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    #[must_use]
    pub fn extra_args(&self) -> &[String] {
        &self.extra_args
    }

    /// Build the daemon's command-line arguments.
    ///
    /// The daemon is asked to log logfmt to stdout so the monitor can read
    /// it from the pipe instead of a file.
    #[must_use]
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "start".to_string(),
            "--none".to_string(),
            "--log=stdout".to_string(),
            "--log-format=logfmt".to_string(),
        ];

        if let Some(path) = &self.config_path {
            args.push(format!("--config={}", path.display()));
        }

        if let Some(region) = &self.region {
            args.push(format!("--region={region}"));
        }

        if let Some(token) = &self.auth_token {
            args.push(format!("--authtoken={token}"));
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }
}

impl fmt::Debug for ProcessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessConfig")
            .field("binary_path", &self.binary_path)
            .field("config_path", &self.config_path)
            .field("startup_timeout", &self.startup_timeout)
            .field("max_logs", &self.max_logs)
            .field("log_callback", &self.log_callback.as_ref().map(|_| "<fn>"))
            .field("monitoring", &self.monitoring)
            .field("region", &self.region)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("extra_args", &self.extra_args)
            .finish()
    }
}

/// Builder for [`ProcessConfig`].
#[derive(Clone)]
pub struct ProcessConfigBuilder {
    binary_path: PathBuf,
    config_path: Option<PathBuf>,
    startup_timeout: Duration,
    max_logs: usize,
    log_callback: Option<LogCallback>,
    monitoring: bool,
    region: Option<String>,
    auth_token: Option<String>,
    extra_args: Vec<String>,
}

impl ProcessConfigBuilder {
    /// Create a builder with defaults for everything but the binary.
    #[must_use]
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            config_path: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            max_logs: DEFAULT_MAX_LOGS,
            log_callback: None,
            monitoring: true,
            region: None,
            auth_token: None,
            extra_args: Vec::new(),
        }
    }

    /// Seed a builder from settings loaded off disk.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingField` if the settings name no binary.
    pub fn from_settings(settings: &ProcessSettings) -> Result<Self, ConfigError> {
        let binary_path = settings
            .binary_path
            .clone()
            .ok_or(ConfigError::MissingField("binary_path"))?;

        Ok(Self {
            binary_path,
            config_path: settings.config_path.clone(),
            startup_timeout: Duration::from_secs(settings.startup_timeout_secs),
            max_logs: settings.max_logs,
            log_callback: None,
            monitoring: settings.monitoring,
            region: settings.region.clone(),
            auth_token: settings.auth_token.clone(),
            extra_args: settings.extra_args.clone(),
        })
    }

    #[must_use]
    pub fn binary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = path.into();
        self
    }

    /// Point the daemon at a configuration file.
    #[must_use]
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_logs(mut self, max_logs: usize) -> Self {
        self.max_logs = max_logs;
        self
    }

    /// Register a callback for every record the daemon produces.
    #[must_use]
    pub fn log_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&LogRecord) + Send + Sync + 'static,
    {
        self.log_callback = Some(Arc::new(callback));
        self
    }

    /// Disable the background monitor; only startup output is inspected.
    #[must_use]
    pub fn without_monitoring(mut self) -> Self {
        self.monitoring = false;
        self
    }

    #[must_use]
    pub fn monitoring(mut self, enabled: bool) -> Self {
        self.monitoring = enabled;
        self
    }

    #[must_use]
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    #[must_use]
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Append raw arguments after the generated ones.
    #[must_use]
    pub fn extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Validate and freeze the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if a value is out of range.
    pub fn build(self) -> Result<ProcessConfig, ConfigError> {
        if self.binary_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("binary_path", "must not be empty"));
        }
        if self.max_logs == 0 {
            return Err(ConfigError::invalid("max_logs", "must be at least 1"));
        }
        if self.startup_timeout.is_zero() {
            return Err(ConfigError::invalid("startup_timeout", "must be non-zero"));
        }
        if self.region.as_deref().is_some_and(|r| r.trim().is_empty()) {
            return Err(ConfigError::invalid("region", "must not be blank"));
        }
        if self.auth_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(ConfigError::invalid("auth_token", "must not be blank"));
        }

        Ok(ProcessConfig {
            binary_path: self.binary_path,
            config_path: self.config_path,
            startup_timeout: self.startup_timeout,
            max_logs: self.max_logs,
            log_callback: self.log_callback,
            monitoring: self.monitoring,
            region: self.region,
            auth_token: self.auth_token,
            extra_args: self.extra_args,
        })
    }
}

impl fmt::Debug for ProcessConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessConfigBuilder")
            .field("binary_path", &self.binary_path)
            .field("max_logs", &self.max_logs)
            .field("monitoring", &self.monitoring)
            .finish_non_exhaustive()
    }
}
