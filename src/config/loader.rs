//! Configuration file loader.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{ProcessConfig, ProcessConfigBuilder, DEFAULT_MAX_LOGS, DEFAULT_STARTUP_TIMEOUT};

/// Process settings loaded from a TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// Path to the daemon binary.
    pub binary_path: Option<PathBuf>,
    /// Daemon configuration file passed with `--config`.
    pub config_path: Option<PathBuf>,
    /// Seconds to wait for the daemon to report readiness.
    pub startup_timeout_secs: u64,
    /// Number of log records retained in memory.
    pub max_logs: usize,
    /// Keep capturing logs after startup.
    pub monitoring: bool,
    pub region: Option<String>,
    pub auth_token: Option<String>,
    /// Additional raw arguments for the daemon.
    pub extra_args: Vec<String>,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            binary_path: None,
            config_path: None,
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT.as_secs(),
            max_logs: DEFAULT_MAX_LOGS,
            monitoring: true,
            region: None,
            auth_token: None,
            extra_args: Vec::new(),
        }
    }
}

/// File name looked up in the working directory.
const LOCAL_FILE: &str = ".tunnel-supervisor.toml";

/// Locates the settings file and turns it into a [`ProcessConfig`].
///
/// The first candidate that exists wins: `./.tunnel-supervisor.toml`, then
/// `<config_dir>/tunnel-supervisor/config.toml`. Relative `binary_path` and
/// `config_path` values are resolved against the directory of that file.
#[derive(Debug)]
pub struct ConfigLoader {
    candidates: Vec<PathBuf>,
}

impl ConfigLoader {
    #[must_use]
    pub fn new() -> Self {
        let user = dirs::config_dir().map(|dir| dir.join("tunnel-supervisor").join("config.toml"));
        Self {
            candidates: std::iter::once(PathBuf::from(LOCAL_FILE)).chain(user).collect(),
        }
    }

    /// Only consider `path`.
    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            candidates: vec![path.into()],
        }
    }

    /// Settings from the first file found, or defaults when there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if a settings file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<ProcessSettings, ConfigError> {
        match self.locate() {
            Some(path) => read_settings(path),
            None => {
                tracing::debug!(candidates = ?self.candidates, "No settings file, using defaults");
                Ok(ProcessSettings::default())
            }
        }
    }

    /// A builder seeded from the settings file, open to further overrides.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingField` when no file names a binary, and
    /// read, parse, or field errors wrapped with the offending file.
    pub fn load_builder(&self) -> Result<ProcessConfigBuilder, ConfigError> {
        let path = self.locate().ok_or(ConfigError::MissingField("binary_path"))?;
        builder_from_file(path)
    }

    /// Load and validate a complete configuration.
    ///
    /// # Errors
    ///
    /// Same as [`load_builder`](Self::load_builder), plus validation errors
    /// wrapped with the file they came from.
    pub fn load_config(&self) -> Result<ProcessConfig, ConfigError> {
        let path = self.locate().ok_or(ConfigError::MissingField("binary_path"))?;
        builder_from_file(path)?
            .build()
            .map_err(|e| e.in_file(path))
    }

    fn locate(&self) -> Option<&Path> {
        self.candidates
            .iter()
            .map(PathBuf::as_path)
            .find(|path| path.is_file())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn read_settings(path: &Path) -> Result<ProcessSettings, ConfigError> {
    tracing::debug!(path = %path.display(), "Loading settings file");
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;

    toml::from_str(&content).map_err(|source| ConfigError::ParseError {
        path: path.to_path_buf(),
        source,
    })
}

fn builder_from_file(path: &Path) -> Result<ProcessConfigBuilder, ConfigError> {
    let mut settings = read_settings(path)?;
    if let Some(base) = path.parent() {
        settings.binary_path = settings.binary_path.map(|p| base.join(p));
        settings.config_path = settings.config_path.map(|p| base.join(p));
    }
    ProcessConfigBuilder::from_settings(&settings).map_err(|e| e.in_file(path))
}

/// Errors that can occur while building or loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    #[error("Missing required setting: {0}")]
    MissingField(&'static str),

    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("In config file {path}: {source}")]
    InFile {
        path: PathBuf,
        source: Box<ConfigError>,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::Invalid { field, reason }
    }

    fn in_file(self, path: &Path) -> Self {
        Self::InFile {
            path: path.to_path_buf(),
            source: Box::new(self),
        }
    }
}
