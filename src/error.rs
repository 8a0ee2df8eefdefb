// src/error.rs

//! Error types for the update engine
//!
//! Every public operation reports one of a closed set of [`ResultCode`]s.
//! Internally errors carry a message for logging; [`Error::code`] collapses
//! them onto the code an outer firmware manager sees.

use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

/// Closed set of result codes returned across the public operation surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
pub enum ResultCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
    InvalidData,
    Busy,
}

/// Update engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Another entry point is executing, or another process holds the update lock
    #[error("Update engine is busy")]
    Busy,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is not allowed in the current transaction state
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// No free registry slot left
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// Malformed package, manifest or stored record
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// The format converter did not finish in time
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl Error {
    /// Result code reported to the caller for this error
    pub fn code(&self) -> ResultCode {
        match self {
            Self::Busy => ResultCode::Busy,
            Self::InvalidArgument(_) => ResultCode::InvalidArgument,
            Self::FailedPrecondition(_) => ResultCode::FailedPrecondition,
            Self::NotFound(_) => ResultCode::NotFound,
            Self::AlreadyExists(_) => ResultCode::AlreadyExists,
            Self::ResourceExhausted(_) => ResultCode::ResourceExhausted,
            Self::Unimplemented(_) => ResultCode::Unimplemented,
            Self::InvalidData(_) => ResultCode::InvalidData,
            Self::DeadlineExceeded(_) => ResultCode::DeadlineExceeded,
            Self::Internal(_) | Self::Io(_) | Self::Database(_) => ResultCode::Internal,
        }
    }
}

/// Result type alias for update engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Collapse an operation result into its result code
pub fn result_code<T>(result: &Result<T>) -> ResultCode {
    match result {
        Ok(_) => ResultCode::Ok,
        Err(e) => e.code(),
    }
}
