use thiserror::Error;

use crate::types::JobId;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The recurrence expression could not be parsed.
    #[error("Invalid schedule {expression:?}: {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// A behavior or its input could not be serialized.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A stored payload is corrupt or names an unregistered behavior.
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// One or more requested jobs do not exist in the store.
    #[error("Jobs not found: {ids:?}")]
    NotFound { ids: Vec<JobId> },

    /// The durable store failed (including partial batch failures, which
    /// are rolled back by the store before this is returned).
    #[error("Store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The scheduler was stopped; nothing can be armed any more.
    #[error("Scheduler stopped")]
    Stopped,

    /// A store write failed after the scheduler had already been mutated.
    /// The in-memory change was rolled back before returning.
    #[error("{operation}: store write failed, rolled back {rolled_back} scheduler entries: {source}")]
    ConsistencyRollback {
        operation: &'static str,
        rolled_back: usize,
        #[source]
        source: Box<SchedulerError>,
    },
}

impl SchedulerError {
    pub fn invalid_schedule(expression: &str, reason: impl Into<String>) -> Self {
        SchedulerError::InvalidSchedule {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    /// Wrap any store-side failure.
    pub fn store(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        SchedulerError::Store(err.into())
    }

    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidSchedule { .. } => "INVALID_SCHEDULE",
            SchedulerError::Encoding(_) => "ENCODING_ERROR",
            SchedulerError::Decoding(_) => "DECODING_ERROR",
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::Store(_) => "STORE_ERROR",
            SchedulerError::Stopped => "STOPPED",
            SchedulerError::ConsistencyRollback { .. } => "CONSISTENCY_ROLLBACK",
        }
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(err: rusqlite::Error) -> Self {
        SchedulerError::Store(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
