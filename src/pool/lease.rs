//! Pool leases
//!
//! A `PoolLease` is the pool-aware face of a `ProtocolSession`: it checks
//! that the session is still valid and checked out before handing it
//! over, and invalidates it when an operation fails in a way that leaves
//! the control connection unusable. Dropping the lease returns the
//! session to the pool.

use log::debug;
use std::sync::Arc;
use tokio::sync::MutexGuard;

use crate::error::{FaxError, FaxResult, Recovery, recovery_for};
use crate::pool::core::ConnectionPool;
use crate::pool::types::PooledSession;
use crate::session::{ProtocolSession, SessionFuture};

pub struct PoolLease {
    pool: ConnectionPool,
    pooled: Arc<PooledSession>,
}

impl PoolLease {
    pub(crate) fn new(pool: ConnectionPool, pooled: Arc<PooledSession>) -> Self {
        Self { pool, pooled }
    }

    pub fn id(&self) -> u64 {
        self.pooled.id()
    }

    pub fn is_valid(&self) -> bool {
        let meta = self.pooled.meta();
        meta.valid && meta.working
    }

    /// Exclusive access to the session.
    ///
    /// Fails with `InvalidSession` once the session was invalidated or
    /// the pool stopped.
    pub async fn session(&self) -> FaxResult<MutexGuard<'_, ProtocolSession>> {
        self.check()?;
        let guard = self.pooled.session.lock().await;
        self.check()?;
        Ok(guard)
    }

    /// Run `f` on the session and update the session's health from its
    /// outcome.
    pub async fn call<T, F>(&self, f: F) -> FaxResult<T>
    where
        F: for<'a> FnOnce(&'a mut ProtocolSession) -> SessionFuture<'a, T>,
    {
        let mut session = self.session().await?;
        let result = f(&mut *session).await;
        drop(session);

        if let Err(e) = &result {
            match recovery_for(e) {
                Recovery::InvalidateSession => {
                    debug!("Invalidating session {} after: {}", self.id(), e);
                    self.invalidate();
                }
                Recovery::Transient => {
                    // Probe it on the supervisor's next pass.
                    self.pooled.meta().last_noop = None;
                }
                Recovery::Caller => {}
            }
        }
        result
    }

    /// Mark the session unusable; it is destroyed on release.
    pub fn invalidate(&self) {
        self.pooled.invalidate();
    }

    /// Hand the session back now.
    pub fn release(self) {
        drop(self);
    }

    fn check(&self) -> FaxResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(FaxError::InvalidSession(self.id()))
        }
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.pool.release_session(&self.pooled);
    }
}

impl std::fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease")
            .field("id", &self.id())
            .field("valid", &self.is_valid())
            .finish()
    }
}
