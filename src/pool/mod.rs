//! Connection pool
//!
//! Bounded pool of authenticated sessions with lazy growth, blocking
//! acquire and a background health supervisor.

pub mod core;
pub mod health;
pub mod lease;
pub mod types;

pub use self::core::ConnectionPool;
pub use lease::PoolLease;
pub use types::{PoolStats, PooledSession};
