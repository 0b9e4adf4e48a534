//! Transfer result types
//!
//! Lifecycle and progress events reported by data channels.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Bytes flow from the server to the client (`retr`, `list`, `nlst`).
    Get,
    /// Bytes flow from the client to the server (`stor`, `stou`, `stot`).
    Put,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Get => f.write_str("get"),
            TransferDirection::Put => f.write_str("put"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Started {
        direction: TransferDirection,
    },
    /// Total bytes moved so far, sent every time at least
    /// `PROGRESS_THRESHOLD` bytes accumulated since the previous report.
    Progress {
        direction: TransferDirection,
        bytes: u64,
    },
    Completed {
        direction: TransferDirection,
        bytes: u64,
    },
    Failed {
        direction: TransferDirection,
        bytes: u64,
        reason: String,
    },
    Cancelled {
        direction: TransferDirection,
        bytes: u64,
    },
}

/// Receives data channel events. Called on the transfer task, so
/// implementations must return quickly.
pub trait TransferListener: Send + Sync {
    fn on_transfer_event(&self, event: &TransferEvent);
}
