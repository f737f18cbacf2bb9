//! Daemon log records and bounded retention.

mod buffer;
mod record;

pub use buffer::*;
pub use record::*;
