use thiserror::Error;

use crate::scheduler::job::JobStatus;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {0} is not queued")]
    JobNotQueued(String),

    #[error("Job {0} is already queued")]
    JobAlreadyQueued(String),

    #[error("Queue is at capacity ({0} jobs)")]
    QueueAtCapacity(usize),

    #[error("Invalid state transition: {from} -> {to} (legal from {from}: {legal:?})")]
    InvalidStateTransition {
        from: JobStatus,
        to: JobStatus,
        legal: Vec<JobStatus>,
    },

    #[error("Backend connection failure: {0}")]
    Connection(String),

    #[error("Invalid backend configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Backend authentication failure: {0}")]
    AuthFailed(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Circuit open for backend '{0}'")]
    CircuitOpen(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Store busy: {0}")]
    StoreBusy(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, _) = &err {
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return Error::StoreBusy(err.to_string());
            }
        }
        Error::Store(err.to_string())
    }
}

impl Error {
    /// Contention errors are retried with backoff rather than surfaced.
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::StoreBusy(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
