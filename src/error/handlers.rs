//! Error handlers
//!
//! Maps errors onto the recovery action the pool should take.

use crate::error::types::FaxError;
use log::{debug, warn};

/// What the owner of a session should do after an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// The control connection is unusable; drop and reopen the session.
    InvalidateSession,
    /// The session may recover on its own; the background health check
    /// will reopen it if the next probe fails.
    Transient,
    /// The failure belongs to the caller's request only.
    Caller,
}

/// Classify an error for the pool.
pub fn recovery_for(err: &FaxError) -> Recovery {
    match err {
        FaxError::Transport(_) | FaxError::Timeout(_) => Recovery::InvalidateSession,
        // 421 means the server is closing the control connection.
        FaxError::Protocol { code: Some(421), .. } => Recovery::InvalidateSession,
        FaxError::Protocol { .. } | FaxError::TransferFailed(_) => Recovery::Transient,
        FaxError::NotFound(_)
        | FaxError::PoolExhausted(_)
        | FaxError::PoolStopped
        | FaxError::UnsupportedMode(_)
        | FaxError::Cancelled
        | FaxError::InvalidSession(_)
        | FaxError::InvalidArgument(_)
        | FaxError::Config(_) => Recovery::Caller,
    }
}

/// True when the session that produced `err` must not be reused.
pub fn is_session_fatal(err: &FaxError) -> bool {
    recovery_for(err) == Recovery::InvalidateSession
}

/// Log an error that occurred after the transfer had already been
/// cancelled. Such errors are a consequence of the cancellation.
pub fn log_suppressed(context: &str, err: &FaxError) {
    debug!("{}: ignoring error after cancellation: {}", context, err);
}

/// Log a failure of a background activity that will be retried.
pub fn log_background(context: &str, err: &FaxError) {
    warn!("{}: {}", context, err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn socket_faults_invalidate() {
        let err = FaxError::Transport(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(is_session_fatal(&err));
    }

    #[test]
    fn not_found_is_callers_problem() {
        assert_eq!(
            recovery_for(&FaxError::NotFound("550 nope".into())),
            Recovery::Caller
        );
        assert_eq!(
            recovery_for(&FaxError::unexpected(500, "500 what")),
            Recovery::Transient
        );
    }
}
