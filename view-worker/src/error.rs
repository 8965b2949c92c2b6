use thiserror::Error;
use view_common::counts::CountStoreError;
use view_common::event::{EventParseError, ViewJobError};
use view_common::pgqueue;
use view_common::store::StoreError;

/// Enumeration of errors that stop the worker, either at startup or while resolving a job.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred when executing a job")]
    DatabaseError(#[from] pgqueue::DatabaseError),
    #[error("failed to set up the dedup store: {0}")]
    StoreError(#[from] StoreError),
    #[error("failed to set up the count store: {0}")]
    CountStoreError(#[from] CountStoreError),
}

/// Why a single view job could not be ingested.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Parse(#[from] EventParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    /// Malformed events and misconfigured stores never recover on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Parse(_) => false,
            IngestError::Store(StoreError::InvalidConfiguration(_)) => false,
            IngestError::Store(_) => true,
        }
    }

    pub fn to_job_error(&self) -> ViewJobError {
        let message = self.to_string();
        match self {
            IngestError::Parse(_) => ViewJobError::new_parse(&message),
            IngestError::Store(StoreError::Timeout(_)) => ViewJobError::new_timeout(&message),
            IngestError::Store(_) => ViewJobError::new_store(&message),
        }
    }
}

/// Errors that leave a single entity dirty until the next sync cycle.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("dedup store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("durable count update failed: {0}")]
    Count(#[from] CountStoreError),
}
