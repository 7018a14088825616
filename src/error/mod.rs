use std::io;

/// Errors in bucketgate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `start` called on a bucket that is already running or has been retired.
    #[error("Bucket already started")]
    AlreadyStarted,
    /// `stop` called on a bucket that is not running.
    #[error("Bucket not started")]
    NotStarted,
    /// Routine rejection: not enough capacity left in the client's bucket.
    #[error("Not enough capacity")]
    CapacityExceeded,
    /// The registry has been shut down and no longer hands out buckets.
    #[error("Bucket registry closed")]
    RegistryClosed,
    #[error("Runtime: {0}")]
    Runtime(String),
    #[error("HTTP server: {0}")]
    Http(#[from] hyper::Error),
    #[error("Configure: {0}")]
    Config(String),
    #[error("Fail to decode payload: {0}")]
    Decode(String),
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error is an expected admission rejection rather than a fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::CapacityExceeded)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
