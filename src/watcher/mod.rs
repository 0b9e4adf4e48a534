//! Status watcher
//!
//! Receives the event stream fax servers push over trigger connections
//! and fans the parsed events out to registered listeners.

pub mod dispatch;
pub mod events;
pub mod host;
pub mod listener;
pub mod service;

pub use events::{
    EventCode, EventDetail, EventType, StatusEvent, TYPE_ALL, TYPE_JOB, TYPE_MODEM, TYPE_RECEIVE,
    TYPE_SEND,
};
pub use host::WatcherState;
pub use listener::{EventMask, ListenerWrapper, StatusListener};
pub use service::StatusWatcher;
