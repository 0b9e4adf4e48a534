//! Error handling
//!
//! Defines error types and recovery classification for the fax client.

pub mod handlers;
pub mod types;

pub use handlers::{Recovery, is_session_fatal, recovery_for};
pub use types::*;
