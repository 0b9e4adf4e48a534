//! Data connection endpoints
//!
//! Handles active and passive mode endpoints.

use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Address the server reported in its last `pasv` reply.
///
/// The session keeps one of these until the next transfer attempt ends,
/// successful or not. The following transfer sends a fresh `pasv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassiveDescriptor {
    pub address: SocketAddr,
}

impl PassiveDescriptor {
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }
}

/// Where the data connection comes from.
#[derive(Debug)]
pub enum DataEndpoint {
    /// The client listens; the server connects after the `port` command.
    Active(TcpListener),
    /// The client connects to the address the server reported.
    Passive(SocketAddr),
}

impl DataEndpoint {
    pub fn is_passive(&self) -> bool {
        matches!(self, DataEndpoint::Passive(_))
    }
}
