//! Pool types
//!
//! A pooled session and the bookkeeping the pool and its health
//! supervisor keep for it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::session::ProtocolSession;

/// Pool metadata of one session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionMeta {
    pub working: bool,
    pub valid: bool,
    /// A health probe or reopen is in progress.
    pub busy: bool,
    pub destroy_on_release: bool,
    /// `None` asks the supervisor for a probe on its next pass.
    pub last_noop: Option<Instant>,
    pub last_reopen: Option<Instant>,
    pub last_release: Instant,
    /// Earliest time an invalid session may be reopened.
    pub retry_at: Option<Instant>,
}

impl SessionMeta {
    fn new(working: bool) -> Self {
        let now = Instant::now();
        Self {
            working,
            valid: true,
            busy: false,
            destroy_on_release: false,
            last_noop: Some(now),
            last_reopen: None,
            last_release: now,
            retry_at: None,
        }
    }

    /// Can be handed to a caller.
    pub fn is_available(&self) -> bool {
        self.valid && !self.busy && !self.working
    }
}

/// A `ProtocolSession` owned by a pool.
pub struct PooledSession {
    id: u64,
    pub(crate) session: tokio::sync::Mutex<ProtocolSession>,
    pub(crate) meta: Mutex<SessionMeta>,
}

impl PooledSession {
    pub(crate) fn new(id: u64, session: ProtocolSession, working: bool) -> Self {
        Self {
            id,
            session: tokio::sync::Mutex::new(session),
            meta: Mutex::new(SessionMeta::new(working)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.meta().valid
    }

    pub fn is_working(&self) -> bool {
        self.meta().working
    }

    pub fn last_reopen(&self) -> Option<Instant> {
        self.meta().last_reopen
    }

    pub(crate) fn meta(&self) -> std::sync::MutexGuard<'_, SessionMeta> {
        // Metadata stays consistent even if a holder panicked.
        self.meta.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn invalidate(&self) {
        self.meta().valid = false;
    }
}

/// Snapshot of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub running: bool,
    /// Idle sessions.
    pub size: usize,
    pub working_size: usize,
    /// Idle plus working.
    pub total_size: usize,
    /// Sessions being created right now.
    pub pending: usize,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    /// Mean time to open and authenticate a session, over recent creations.
    pub average_creation_time: Option<Duration>,
}
