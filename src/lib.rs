//! Tunnel Supervisor - lifecycle and log monitoring for a local tunneling daemon.

pub mod config;
pub mod logs;
pub mod process;

pub use config::{ProcessConfig, ProcessConfigBuilder};
pub use logs::{LogLevel, LogRecord};
pub use process::{ErrorKind, LogMonitor, ProcessError, ProcessState, ProcessSupervisor};
