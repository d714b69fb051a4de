use thiserror::Error;

use crate::core::jobs::JobStatus;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database is not configured")]
    NotConfigured,

    #[error("cannot modify bucket {0} inside a read transaction")]
    ReadOnly(String),

    #[error("bucket {0} does not exist")]
    BucketNotFound(String),

    #[error("job {0} not found")]
    JobNotFound(u64),

    #[error("no logs found for job {0}")]
    LogsNotFound(u64),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: u64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("executor is shutting down")]
    ShuttingDown,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("store error in bucket {bucket}: {source}")]
    Store {
        bucket: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to encode or decode record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("transport failure: {0}")]
    TransportFailure(String),
}

impl Error {
    pub(crate) fn store(bucket: impl Into<String>, source: rusqlite::Error) -> Self {
        Error::Store {
            bucket: bucket.into(),
            source,
        }
    }

    /// True for the absent-record family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::JobNotFound(_) | Error::LogsNotFound(_) | Error::BucketNotFound(_)
        )
    }
}
