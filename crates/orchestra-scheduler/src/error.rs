use orchestra_notify::NotifyError;
use thiserror::Error;

/// Errors that can occur within the scheduling and dispatch engine.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A schedule or duration string could not be parsed.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// No work item with the given ID exists.
    #[error("Work item not found: {id}")]
    NotFound { id: String },

    /// The requesting probe does not own the work item.
    #[error("Access denied to work item {id}")]
    AccessDenied { id: String },

    /// The work item is not in one of the states the transition allows.
    #[error("Work item {id} is in state {state}")]
    InconsistentState { id: String, state: String },

    /// No job with the given ID exists in the store or the registry.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// A signed experiment failed verification.
    #[error("Signature error: {0}")]
    Signature(String),

    /// A persisted row violates an invariant (e.g. a job referencing no payload).
    #[error("Corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),
}

impl SchedulerError {
    /// Short error code string for callers that map failures onto a
    /// transport (e.g. 400 / 401 / 404 on an HTTP surface).
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidFormat(_) => "INVALID_FORMAT",
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::AccessDenied { .. } => "ACCESS_DENIED",
            SchedulerError::InconsistentState { .. } => "INCONSISTENT_STATE",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::Signature(_) => "SIGNATURE_ERROR",
            SchedulerError::CorruptRecord { .. } => "CORRUPT_RECORD",
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Notify(_) => "NOTIFY_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
