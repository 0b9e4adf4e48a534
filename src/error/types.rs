//! Error types
//!
//! Defines the error taxonomy shared by the codec, data channels, sessions,
//! the connection pool and the status watcher.

use std::fmt;
use std::io;
use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type FaxResult<T> = Result<T, FaxError>;

/// All failures surfaced by the client.
#[derive(Debug)]
pub enum FaxError {
    /// Socket-level fault on the control or data connection.
    Transport(io::Error),
    /// A control-channel read or write exceeded the configured timeout.
    Timeout(String),
    /// The server answered with a code outside the accepted set, or the
    /// reply could not be parsed. `response` keeps the raw reply text.
    Protocol {
        code: Option<u16>,
        response: String,
    },
    /// Code 550 on a path-based command.
    NotFound(String),
    /// No session became available within the blocking timeout.
    PoolExhausted(Duration),
    /// The pool is not running.
    PoolStopped,
    /// Block and Compressed transfer modes are not implemented.
    UnsupportedMode(char),
    /// The data connection could not be established or broke mid-transfer.
    TransferFailed(String),
    /// The transfer was cancelled before it completed.
    Cancelled,
    /// A pooled session was used after being invalidated or released.
    InvalidSession(u64),
    InvalidArgument(String),
    Config(String),
}

impl FaxError {
    /// Builds a `Protocol` error from a reply that was not accepted.
    pub fn unexpected(code: u16, response: impl Into<String>) -> Self {
        FaxError::Protocol {
            code: Some(code),
            response: response.into(),
        }
    }

    /// Builds a `Protocol` error for a reply that could not be interpreted.
    pub fn mangled(response: impl Into<String>) -> Self {
        FaxError::Protocol {
            code: None,
            response: response.into(),
        }
    }

    /// Response code carried by the error, if any.
    pub fn code(&self) -> Option<u16> {
        match self {
            FaxError::Protocol { code, .. } => *code,
            FaxError::NotFound(_) => Some(550),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FaxError::NotFound(_))
    }
}

impl fmt::Display for FaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaxError::Transport(e) => write!(f, "Transport error: {}", e),
            FaxError::Timeout(what) => write!(f, "Timed out: {}", what),
            FaxError::Protocol {
                code: Some(code),
                response,
            } => write!(f, "Unexpected response {}: {}", code, response),
            FaxError::Protocol { code: None, response } => {
                write!(f, "Mangled response: {}", response)
            }
            FaxError::NotFound(response) => write!(f, "Not found: {}", response),
            FaxError::PoolExhausted(timeout) => write!(
                f,
                "No session available after waiting {} ms",
                timeout.as_millis()
            ),
            FaxError::PoolStopped => write!(f, "Connection pool is not running"),
            FaxError::UnsupportedMode(mode) => {
                write!(f, "Transfer mode {} is not supported", mode)
            }
            FaxError::TransferFailed(msg) => write!(f, "Transfer failed: {}", msg),
            FaxError::Cancelled => write!(f, "Transfer cancelled"),
            FaxError::InvalidSession(id) => write!(f, "Pooled session {} is not usable", id),
            FaxError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            FaxError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for FaxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FaxError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FaxError {
    fn from(error: io::Error) -> Self {
        FaxError::Transport(error)
    }
}

impl From<config::ConfigError> for FaxError {
    fn from(error: config::ConfigError) -> Self {
        FaxError::Config(error.to_string())
    }
}
