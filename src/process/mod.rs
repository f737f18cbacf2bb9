//! Daemon process supervision and log monitoring.

mod child;
mod error;
mod monitor;
pub mod probe;
mod state;
mod supervisor;

pub use child::*;
pub use error::*;
pub use monitor::*;
pub use state::*;
pub use supervisor::*;
