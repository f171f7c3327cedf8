//! WolfKV Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wal::entry::LogId;

/// Result type alias for WolfKV operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes carried on failed replication responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    Unknown = 0,
    Protocol = 1,
    Consistency = 2,
    Storage = 3,
    NotMaster = 4,
    Unauthorized = 5,
    UnknownCommand = 6,
    Transport = 7,
    Config = 8,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Decode a wire code; anything unrecognized becomes `Unknown`
    pub fn from_u32(code: u32) -> Self {
        match code {
            1 => ErrorCode::Protocol,
            2 => ErrorCode::Consistency,
            3 => ErrorCode::Storage,
            4 => ErrorCode::NotMaster,
            5 => ErrorCode::Unauthorized,
            6 => ErrorCode::UnknownCommand,
            7 => ErrorCode::Transport,
            8 => ErrorCode::Config,
            _ => ErrorCode::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.as_u32())
    }
}

/// WolfKV error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown command id {0}")]
    UnknownCommand(u32),

    #[error("Credential mismatch")]
    Unauthorized,

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Consistency errors
    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Log mismatch at id {id}: local timestamp {local:?}, remote timestamp {remote:?}")]
    LogMismatch {
        id: LogId,
        local: Option<u64>,
        remote: Option<u64>,
    },

    #[error("Out-of-sequence entry: expected id {expected}, got {got}")]
    OutOfSequence { expected: LogId, got: LogId },

    #[error("Not master: current master is {0:?}")]
    NotMaster(String),

    // Transport errors
    #[error("Transport error talking to {peer}: {reason}")]
    Transport { peer: String, reason: String },

    #[error("Remote error {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Shorthand for a transport failure against `peer`
    pub fn transport(peer: &str, reason: impl std::fmt::Display) -> Self {
        Error::Transport {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => ErrorCode::Config,
            Error::Protocol(_) | Error::Serialization(_) => ErrorCode::Protocol,
            Error::UnknownCommand(_) => ErrorCode::UnknownCommand,
            Error::Unauthorized => ErrorCode::Unauthorized,
            Error::Consistency(_) | Error::LogMismatch { .. } | Error::OutOfSequence { .. } => {
                ErrorCode::Consistency
            }
            Error::NotMaster(_) => ErrorCode::NotMaster,
            Error::Transport { .. } => ErrorCode::Transport,
            Error::Remote { code, .. } => *code,
            Error::Storage(_) | Error::Io(_) => ErrorCode::Storage,
            Error::Cancelled => ErrorCode::Unknown,
        }
    }

    /// Check if this error is a consistency violation
    pub fn is_consistency(&self) -> bool {
        self.code() == ErrorCode::Consistency
    }

    /// Check if the tailing loop may absorb this error and keep going
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::Remote { code, .. } => !matches!(code, ErrorCode::Unauthorized | ErrorCode::Config),
            other => other.is_consistency(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(format!("SQLite error: {}", e))
    }
}
