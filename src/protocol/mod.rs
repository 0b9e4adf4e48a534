//! Fax control protocol
//!
//! Handles command serialisation, reply parsing, and reply-code validation.

pub mod codec;
pub mod commands;
pub mod parser;
pub mod responses;

pub use codec::{WireCodec, check};
pub use commands::{Charset, Command, Timezone, TransferMode, TransferType};
pub use responses::Response;
