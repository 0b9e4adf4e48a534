//! Transfer module for the fax client
//!
//! Handles data connections, line-ending and compression filters, and
//! transfer progress reporting.

pub mod data_channel;
pub mod filters;
pub mod modes;
pub mod results;

// Re-export key types
pub use data_channel::{CancelHandle, DataChannel, PROGRESS_THRESHOLD};
pub use filters::{InboundFilter, LineEnding, OutboundFilter};
pub use modes::{DataEndpoint, PassiveDescriptor};
pub use results::{TransferDirection, TransferEvent, TransferListener};
