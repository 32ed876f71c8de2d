//! Error types and Result aliases for btreedb

use thiserror::Error;

use crate::types::Pgno;

/// Primary result codes surfaced by the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorCode {
    #[error("SQL logic error")]
    Error,
    #[error("internal logic error")]
    Internal,
    #[error("query aborted")]
    Abort,
    #[error("database table is locked")]
    Locked,
    #[error("out of memory")]
    NoMem,
    #[error("attempt to write a readonly database")]
    ReadOnly,
    #[error("disk I/O error")]
    IoErr,
    #[error("database disk image is malformed")]
    Corrupt,
    #[error("database or disk is full")]
    Full,
    #[error("unable to open database file")]
    CantOpen,
    #[error("bad parameter or other API misuse")]
    Misuse,
    #[error("file is not a database")]
    NotADb,
    #[error("string or blob too big")]
    TooBig,
}

/// Error carrying a result code and an optional detail message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}{}", detail(.message))]
pub struct Error {
    pub code: ErrorCode,
    pub message: Option<String>,
}

fn detail(message: &Option<String>) -> String {
    match message {
        Some(msg) => format!(": {}", msg),
        None => String::new(),
    }
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Corruption detected while reading or modifying `pgno`.
    pub fn corrupt(pgno: Pgno) -> Self {
        Self::with_message(ErrorCode::Corrupt, format!("page {}", pgno))
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn is_corrupt(&self) -> bool {
        self.code == ErrorCode::Corrupt
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::new(code)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::with_message(ErrorCode::IoErr, err.to_string())
    }
}

/// Result type alias for btreedb operations
pub type Result<T> = std::result::Result<T, Error>;
