//! Module `core`
//!
//! `ConnectionPool`: a bounded set of authenticated sessions to one fax
//! server. Callers borrow a session with `acquire`, which grows the pool
//! lazily up to its maximum and otherwise waits for a release.

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::config::ClientPoolConfiguration;
use crate::error::handlers::log_background;
use crate::error::{FaxError, FaxResult};
use crate::pool::health;
use crate::pool::lease::PoolLease;
use crate::pool::types::{PoolStats, PooledSession};
use crate::session::ProtocolSession;

/// Number of recent creation times kept for the average.
const CREATION_SAMPLES: usize = 32;

/// Bound on saying goodbye to a session being destroyed.
const DESTROY_TIMEOUT: Duration = Duration::from_secs(5);

/// How often `start` and `restart` look at creations started elsewhere.
const PENDING_POLL: Duration = Duration::from_millis(10);

/// Everything behind the pool-wide lock.
#[derive(Default)]
pub(crate) struct PoolState {
    pub running: bool,
    pub idle: VecDeque<u64>,
    pub working: HashSet<u64>,
    pub sessions: HashMap<u64, Arc<PooledSession>>,
    /// Sessions being created outside the lock.
    pub pending: usize,
    pub creation_samples: VecDeque<Duration>,
}

pub(crate) struct PoolShared {
    pub config: ClientPoolConfiguration,
    state: Mutex<PoolState>,
    /// Signalled whenever a session may have become available.
    pub available: Notify,
    supervisor: Mutex<Option<Supervisor>>,
    next_id: AtomicU64,
}

struct Supervisor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PoolShared {
    pub fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum Take {
    Idle(Arc<PooledSession>),
    Grow,
    Wait,
}

/// Pool of sessions to the configured server. Cloning yields another
/// handle to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// A stopped pool; call `start` before `acquire`.
    pub fn new(config: ClientPoolConfiguration) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                state: Mutex::new(PoolState::default()),
                available: Notify::new(),
                supervisor: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ClientPoolConfiguration {
        &self.shared.config
    }

    /// Start the health supervisor and open `min_pool_size` sessions.
    /// Returns once the pool holds its minimum. Sessions that fail to
    /// open are logged; the supervisor keeps trying.
    pub async fn start(&self) -> FaxResult<()> {
        self.shared
            .config
            .validate()
            .map_err(|e| FaxError::Config(e.to_string()))?;
        {
            let mut state = self.shared.state();
            if state.running {
                return Ok(());
            }
            state.running = true;
        }

        let (shutdown, rx) = watch::channel(false);
        let handle = health::spawn_supervisor(Arc::downgrade(&self.shared), rx);
        *self.supervisor_slot() = Some(Supervisor { shutdown, handle });

        info!(
            "Starting session pool for {} (min {}, max {})",
            self.shared.config.server_address(),
            self.shared.config.min_pool_size,
            self.shared.config.max_pool_size
        );
        reach_minimum(&self.shared).await;
        Ok(())
    }

    /// Close every session and stop the supervisor. Outstanding leases
    /// become invalid and their sessions are closed as soon as any call
    /// in progress on them finishes; `acquire` fails until the next
    /// `start`.
    pub async fn stop(&self) {
        let (idle, working) = {
            let mut state = self.shared.state();
            if !state.running {
                return;
            }
            state.running = false;
            state.idle.clear();
            state.working.clear();
            let mut idle = Vec::new();
            let mut working = Vec::new();
            for (_, pooled) in state.sessions.drain() {
                let mut meta = pooled.meta();
                meta.valid = false;
                if meta.working {
                    meta.working = false;
                    drop(meta);
                    working.push(pooled);
                } else {
                    drop(meta);
                    idle.push(pooled);
                }
            }
            (idle, working)
        };
        self.shared.available.notify_waiters();

        let supervisor = self.supervisor_slot().take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.shutdown.send(true);
            if let Err(e) = supervisor.handle.await {
                warn!("Health supervisor ended abnormally: {}", e);
            }
        }

        info!(
            "Stopping session pool for {} ({} idle, {} working)",
            self.shared.config.server_address(),
            idle.len(),
            working.len()
        );
        for pooled in idle {
            destroy(pooled).await;
        }
        // The session lock orders this after a call already in progress.
        for pooled in working {
            tokio::spawn(destroy(pooled));
        }
    }

    /// Close idle sessions, retire working ones as they come back, and
    /// reopen up to the minimum. The pool keeps running throughout.
    pub async fn restart(&self) -> FaxResult<()> {
        let drained = {
            let mut state = self.shared.state();
            if !state.running {
                return Err(FaxError::PoolStopped);
            }
            for id in &state.working {
                if let Some(pooled) = state.sessions.get(id) {
                    pooled.meta().destroy_on_release = true;
                }
            }
            let ids: Vec<u64> = state.idle.drain(..).collect();
            ids.into_iter()
                .filter_map(|id| state.sessions.remove(&id))
                .collect::<Vec<_>>()
        };

        info!(
            "Restarting session pool for {} ({} idle sessions closed)",
            self.shared.config.server_address(),
            drained.len()
        );
        for pooled in drained {
            destroy(pooled).await;
        }
        reach_minimum(&self.shared).await;
        Ok(())
    }

    /// Borrow a session.
    ///
    /// Takes an idle session when one is available, else opens a new one
    /// while below the maximum, else waits for a release. Gives up with
    /// `PoolExhausted` once the blocking timeout has passed.
    pub async fn acquire(&self) -> FaxResult<PoolLease> {
        let limit = self.shared.config.blocking_timeout();
        let retry_interval = self.shared.config.retry_interval();
        let deadline = Instant::now() + limit;

        loop {
            match self.take()? {
                Take::Idle(pooled) => {
                    debug!("Acquired idle session {}", pooled.id());
                    return Ok(PoolLease::new(self.clone(), pooled));
                }
                Take::Grow => match create_reserved(&self.shared, true).await {
                    Ok(pooled) => {
                        debug!("Acquired new session {}", pooled.id());
                        return Ok(PoolLease::new(self.clone(), pooled));
                    }
                    Err(FaxError::PoolStopped) => return Err(FaxError::PoolStopped),
                    Err(e) => log_background("Opening pooled session", &e),
                },
                Take::Wait => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(FaxError::PoolExhausted(limit));
            }
            let wait = retry_interval.min(deadline - now);
            let _ = tokio::time::timeout(wait, self.shared.available.notified()).await;
        }
    }

    /// Hand a session back. Same as dropping the lease.
    pub fn release(&self, lease: PoolLease) {
        drop(lease);
    }

    /// Idle sessions.
    pub fn size(&self) -> usize {
        self.shared.state().idle.len()
    }

    /// Idle plus working sessions.
    pub fn total_size(&self) -> usize {
        self.shared.state().sessions.len()
    }

    pub fn working_size(&self) -> usize {
        self.shared.state().working.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state();
        let average_creation_time = if state.creation_samples.is_empty() {
            None
        } else {
            let sum: Duration = state.creation_samples.iter().sum();
            Some(sum / state.creation_samples.len() as u32)
        };
        PoolStats {
            running: state.running,
            size: state.idle.len(),
            working_size: state.working.len(),
            total_size: state.sessions.len(),
            pending: state.pending,
            min_pool_size: self.shared.config.min_pool_size,
            max_pool_size: self.shared.config.max_pool_size,
            average_creation_time,
        }
    }

    fn take(&self) -> FaxResult<Take> {
        let config = &self.shared.config;
        let mut state = self.shared.state();
        if !state.running {
            return Err(FaxError::PoolStopped);
        }

        let found = state.idle.iter().position(|id| {
            state
                .sessions
                .get(id)
                .is_some_and(|pooled| pooled.meta().is_available())
        });
        if let Some(index) = found {
            if let Some(id) = state.idle.remove(index) {
                if let Some(pooled) = state.sessions.get(&id).cloned() {
                    pooled.meta().working = true;
                    state.working.insert(id);
                    return Ok(Take::Idle(pooled));
                }
            }
        }

        if !config.pooling_enabled || state.sessions.len() + state.pending < config.max_pool_size {
            state.pending += 1;
            return Ok(Take::Grow);
        }
        Ok(Take::Wait)
    }

    /// Called when a lease goes away.
    pub(crate) fn release_session(&self, pooled: &Arc<PooledSession>) {
        let config = &self.shared.config;
        let id = pooled.id();
        let mut state = self.shared.state();
        state.working.remove(&id);

        // Already removed by `stop`.
        if !state.sessions.contains_key(&id) {
            return;
        }

        let destroy_now = {
            let mut meta = pooled.meta();
            meta.working = false;
            meta.last_release = Instant::now();
            !meta.valid || meta.destroy_on_release || !config.pooling_enabled || !state.running
        };

        if !destroy_now {
            state.idle.push_back(id);
            drop(state);
            debug!("Released session {} to the idle queue", id);
            self.shared.available.notify_one();
            return;
        }

        state.sessions.remove(&id);
        let replace = state.running
            && config.pooling_enabled
            && state.sessions.len() + state.pending < config.min_pool_size;
        if replace {
            state.pending += 1;
        }
        drop(state);
        debug!("Released session {} for destruction", id);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // No runtime left; dropping the session closes its socket.
            if replace {
                self.shared.state().pending -= 1;
            }
            return;
        };
        let pooled = Arc::clone(pooled);
        runtime.spawn(destroy(pooled));
        if replace {
            let shared = Arc::clone(&self.shared);
            runtime.spawn(async move {
                match create_reserved(&shared, false).await {
                    Ok(pooled) => debug!("Replaced released session with {}", pooled.id()),
                    Err(e) => log_background("Replacing pooled session", &e),
                }
            });
        }
    }

    fn supervisor_slot(&self) -> MutexGuard<'_, Option<Supervisor>> {
        self.shared
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Open and log in a session the way the pool configuration says.
pub(crate) async fn open_session(config: &ClientPoolConfiguration) -> FaxResult<ProtocolSession> {
    let mut session = ProtocolSession::open(&config.host, config.port, config.session_options()).await?;
    session
        .authenticate(&config.user, config.password.as_deref())
        .await?;
    if let Some(admin) = config.admin_password.as_deref() {
        session.admin(admin).await?;
    }
    session.tzone(config.timezone).await?;
    Ok(session)
}

/// Create a session for a slot already reserved in `pending`.
async fn create_reserved(shared: &Arc<PoolShared>, working: bool) -> FaxResult<Arc<PooledSession>> {
    let started = Instant::now();
    let opened = open_session(&shared.config).await;

    let mut state = shared.state();
    state.pending -= 1;
    let session = opened?;

    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let pooled = Arc::new(PooledSession::new(id, session, working));
    if !state.running {
        drop(state);
        tokio::spawn(destroy(pooled));
        return Err(FaxError::PoolStopped);
    }

    state.creation_samples.push_back(started.elapsed());
    if state.creation_samples.len() > CREATION_SAMPLES {
        state.creation_samples.pop_front();
    }
    state.sessions.insert(id, Arc::clone(&pooled));
    if working {
        state.working.insert(id);
    } else {
        state.idle.push_back(id);
    }
    drop(state);

    if !working {
        shared.available.notify_one();
    }
    Ok(pooled)
}

/// Open idle sessions until the pool holds `min_pool_size`.
pub(crate) async fn fill_to_minimum(shared: &Arc<PoolShared>) {
    loop {
        {
            let mut state = shared.state();
            if !state.running || state.sessions.len() + state.pending >= shared.config.min_pool_size {
                return;
            }
            state.pending += 1;
        }
        if let Err(e) = create_reserved(shared, false).await {
            log_background("Filling session pool", &e);
            return;
        }
    }
}

/// Fill to the minimum, then wait for creations started by other tasks
/// (the supervisor, a replacement) to land.
async fn reach_minimum(shared: &Arc<PoolShared>) {
    loop {
        fill_to_minimum(shared).await;
        {
            let state = shared.state();
            if !state.running
                || state.pending == 0
                || state.sessions.len() >= shared.config.min_pool_size
            {
                return;
            }
        }
        tokio::time::sleep(PENDING_POLL).await;
    }
}

/// Say goodbye and drop the connection. Failures only matter to the log.
pub(crate) async fn destroy(pooled: Arc<PooledSession>) {
    let id = pooled.id();
    let mut session = pooled.session.lock().await;
    match tokio::time::timeout(DESTROY_TIMEOUT, session.quit()).await {
        Ok(Ok(())) => debug!("Destroyed session {}", id),
        Ok(Err(e)) => debug!("Destroyed session {} without goodbye: {}", id, e),
        Err(_) => debug!("Destroyed session {} after quit timed out", id),
    }
}
