pub mod config;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod watcher;

pub use config::{ClientConfig, ClientPoolConfiguration, WatcherConfig};
pub use error::{FaxError, FaxResult};
pub use pool::{ConnectionPool, PoolLease, PoolStats};
pub use session::{ProtocolSession, SessionOptions, SharedJob};
pub use watcher::{StatusListener, StatusWatcher};
