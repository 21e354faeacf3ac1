//! Error types for wsrelay.

use thiserror::Error;

use crate::frame::FrameError;

/// Exit codes for the listen and probe subcommands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Normal exit
    Success = 0,
    /// Listen failed
    ListenFailed = 10,
    /// Relay connection failed
    ConnectionFailed = 11,
    /// Not authorized by the relay
    Unauthorized = 12,
    /// Buffer limit exceeded
    BufferLimitExceeded = 20,
    /// Resume rejected
    ResumeRejected = 21,
    /// Reconnect budget exhausted
    RelayUnavailable = 22,
    /// Protocol violation
    ProtocolViolation = 23,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Main error type for wsrelay.
#[derive(Debug, Error)]
pub enum Error {
    #[error("listen failed: {0}")]
    ListenFailed(String),

    #[error("relay connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not authorized to use the relay endpoint")]
    Unauthorized,

    #[error("relay unavailable: {0}")]
    RelayUnavailable(String),

    #[error("resume rejected: {0}")]
    ResumeRejected(String),

    #[error("buffer limit exceeded")]
    BufferLimitExceeded,

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("protocol violation: {0}")]
    Frame(#[from] FrameError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::ListenFailed(_) => ExitCode::ListenFailed,
            Error::ConnectionFailed(_) => ExitCode::ConnectionFailed,
            Error::Unauthorized => ExitCode::Unauthorized,
            Error::RelayUnavailable(_) => ExitCode::RelayUnavailable,
            Error::ResumeRejected(_) => ExitCode::ResumeRejected,
            Error::BufferLimitExceeded => ExitCode::BufferLimitExceeded,
            Error::SessionClosed(_) => ExitCode::Success,
            Error::Frame(_) => ExitCode::ProtocolViolation,
            Error::ProtocolViolation(_) => ExitCode::ProtocolViolation,
            Error::Io(_) => ExitCode::ListenFailed,
            Error::Config(_) => ExitCode::ListenFailed,
        }
    }
}

/// Result type alias for wsrelay operations.
pub type Result<T> = std::result::Result<T, Error>;
