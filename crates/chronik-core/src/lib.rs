//! `chronik-core` — configuration and shared error types for chronik.

pub mod config;
pub mod error;

pub use config::{ChronikConfig, DatabaseConfig, SchedulerConfig};
pub use error::{CoreError, Result};
