//! Protocol session
//!
//! One control connection to a fax server and the full command surface
//! on top of it.

pub mod commands;
pub mod jobs;
pub mod state;
pub mod transfers;

pub use jobs::{SessionFuture, SharedJob};
pub use state::{ProtocolSession, SessionOptions};
