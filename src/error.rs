//! Status codes and errors surfaced to embedding callers.
//!
//! `Status` is the flat code every facade call records as its last error.
//! `EngineError` is what the Rust API actually returns; every variant maps
//! back onto a `Status` so callers that speak codes can still do so.

use std::fmt;
use std::io;

use thiserror::Error;

/// Outcome code of an embedding call.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok = 0,
    InvalidArg,
    ObjectExpected,
    StringExpected,
    NameExpected,
    FunctionExpected,
    NumberExpected,
    BooleanExpected,
    ArrayExpected,
    GenericFailure,
    PendingException,
    Cancelled,
    EscapeCalledTwice,
    HandleScopeMismatch,
    CallbackScopeMismatch,
    QueueFull,
    Closing,
    BigintExpected,
    DateExpected,
    ArrayBufferExpected,
    DetachableArrayBufferExpected,
}

const STATUS_TABLE: [Status; 21] = [
    Status::Ok,
    Status::InvalidArg,
    Status::ObjectExpected,
    Status::StringExpected,
    Status::NameExpected,
    Status::FunctionExpected,
    Status::NumberExpected,
    Status::BooleanExpected,
    Status::ArrayExpected,
    Status::GenericFailure,
    Status::PendingException,
    Status::Cancelled,
    Status::EscapeCalledTwice,
    Status::HandleScopeMismatch,
    Status::CallbackScopeMismatch,
    Status::QueueFull,
    Status::Closing,
    Status::BigintExpected,
    Status::DateExpected,
    Status::ArrayBufferExpected,
    Status::DetachableArrayBufferExpected,
];

impl Status {
    /// Canonical human readable message. `Ok` has none.
    pub fn message(self) -> Option<&'static str> {
        let msg = match self {
            Status::Ok => return None,
            Status::InvalidArg => "Invalid parameter",
            Status::ObjectExpected => "Need object",
            Status::StringExpected => "Need string",
            Status::NameExpected => "Need string or symbol",
            Status::FunctionExpected => "Need function",
            Status::NumberExpected => "Need number",
            Status::BooleanExpected => "Need boolean",
            Status::ArrayExpected => "Need array",
            Status::GenericFailure => "Generic failure",
            Status::PendingException => "An exception is blocking",
            Status::Cancelled => "Asynchronous work cancelled",
            Status::EscapeCalledTwice => "Escape called twice",
            Status::HandleScopeMismatch => "Handle scope mismatch",
            Status::CallbackScopeMismatch => "Callback scope mismatch",
            Status::QueueFull => "Asynchronous work queue is full",
            Status::Closing => "Asynchronous work handle is closing",
            Status::BigintExpected => "Need bigint",
            Status::DateExpected => "Need date",
            Status::ArrayBufferExpected => "Need arraybuffer",
            Status::DetachableArrayBufferExpected => "Need detachable arraybuffer",
        };
        Some(msg)
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Inverse of [`Status::code`]; `None` for codes outside the table.
    pub fn from_code(code: i32) -> Option<Status> {
        usize::try_from(code)
            .ok()
            .and_then(|idx| STATUS_TABLE.get(idx).copied())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => f.write_str(msg),
            None => f.write_str("Ok"),
        }
    }
}

/// Snapshot of the last facade call outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedErrorInfo {
    pub status: Status,
    pub message: Option<&'static str>,
    /// Error code reported by the underlying runtime, 0 when none.
    pub engine_error_code: u32,
}

impl Default for ExtendedErrorInfo {
    fn default() -> Self {
        Self {
            status: Status::Ok,
            message: None,
            engine_error_code: 0,
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid parameter: {0}")]
    InvalidArg(String),

    #[error("Asynchronous work queue is full ({0} items waiting)")]
    QueueFull(usize),

    #[error("Asynchronous work handle is closing")]
    Closing,

    #[error("Worker pool is shut down")]
    PoolShutDown,

    #[error("An exception is blocking")]
    PendingException,

    #[error("Failed to initialize event loop: {0}")]
    LoopInit(#[source] io::Error),

    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    #[error("Generic failure: {0}")]
    Generic(String),
}

impl EngineError {
    pub fn status(&self) -> Status {
        match self {
            EngineError::InvalidArg(_) => Status::InvalidArg,
            EngineError::QueueFull(_) => Status::QueueFull,
            EngineError::Closing => Status::Closing,
            EngineError::PendingException => Status::PendingException,
            EngineError::PoolShutDown
            | EngineError::LoopInit(_)
            | EngineError::ThreadSpawn(_)
            | EngineError::Generic(_) => Status::GenericFailure,
        }
    }

    pub(crate) fn invalid_arg(what: impl Into<String>) -> Self {
        EngineError::InvalidArg(what.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip_through_table() {
        for (idx, status) in STATUS_TABLE.iter().enumerate() {
            assert_eq!(status.code(), idx as i32);
            assert_eq!(Status::from_code(idx as i32), Some(*status));
        }
        assert_eq!(Status::from_code(-1), None);
        assert_eq!(Status::from_code(STATUS_TABLE.len() as i32), None);
    }

    #[test]
    fn test_status_messages() {
        assert_eq!(Status::Ok.message(), None);
        assert_eq!(Status::InvalidArg.message(), Some("Invalid parameter"));
        assert_eq!(
            Status::Cancelled.message(),
            Some("Asynchronous work cancelled")
        );
        assert_eq!(Status::QueueFull.to_string(), "Asynchronous work queue is full");
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(EngineError::invalid_arg("x").status(), Status::InvalidArg);
        assert_eq!(EngineError::QueueFull(3).status(), Status::QueueFull);
        assert_eq!(EngineError::Closing.status(), Status::Closing);
        assert_eq!(EngineError::PoolShutDown.status(), Status::GenericFailure);
        assert_eq!(
            EngineError::PendingException.status(),
            Status::PendingException
        );
    }
}
