//! Health supervisor
//!
//! One task per pool. On every tick it looks at the idle sessions:
//! sessions idle past `max_idle_time` are reopened, sessions not probed
//! within `max_noop_interval` get a `noop`, and invalid sessions are
//! reopened once their backoff has passed. A failed probe or reopen marks
//! the session invalid and schedules the next attempt.

use log::{debug, error, info};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant as TickInstant, MissedTickBehavior, interval_at};

use crate::error::handlers::log_background;
use crate::error::FaxResult;
use crate::pool::core::{PoolShared, fill_to_minimum, open_session};
use crate::pool::types::PooledSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    Noop,
    Reopen,
}

pub(crate) fn spawn_supervisor(pool: Weak<PoolShared>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = match pool.upgrade() {
            Some(shared) => shared.config.health_check_interval(),
            None => return,
        };
        // `start` fills the pool itself; the first pass waits a period.
        let mut ticker = interval_at(TickInstant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Health supervisor running every {:?}", period);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let Some(shared) = pool.upgrade() else {
                break;
            };
            if !shared.state().running {
                break;
            }
            run_checks(&shared).await;
            fill_to_minimum(&shared).await;
        }
        debug!("Health supervisor stopped");
    })
}

/// Pick the idle sessions that need attention and mark them busy so
/// `acquire` skips them while they are checked.
fn due_checks(shared: &PoolShared) -> Vec<(Arc<PooledSession>, Check)> {
    let config = &shared.config;
    let now = Instant::now();
    let state = shared.state();
    let mut due = Vec::new();

    for id in &state.idle {
        let Some(pooled) = state.sessions.get(id) else {
            continue;
        };
        let mut meta = pooled.meta();
        if meta.busy || meta.working {
            continue;
        }
        let check = if !meta.valid {
            match meta.retry_at {
                Some(at) if at > now => None,
                _ => Some(Check::Reopen),
            }
        } else if now.duration_since(meta.last_release) > config.max_idle_time() {
            Some(Check::Reopen)
        } else {
            match meta.last_noop {
                Some(at) if now.duration_since(at) <= config.max_noop_interval() => None,
                _ => Some(Check::Noop),
            }
        };
        if let Some(check) = check {
            meta.busy = true;
            due.push((Arc::clone(pooled), check));
        }
    }
    due
}

async fn run_checks(shared: &Arc<PoolShared>) {
    let due = due_checks(shared);
    if due.is_empty() {
        return;
    }

    let mut checks = JoinSet::new();
    for (pooled, check) in due {
        let shared = Arc::clone(shared);
        checks.spawn(async move {
            let result = perform(&shared, &pooled, check).await;
            settle(&shared, &pooled, check, result);
        });
    }
    while let Some(joined) = checks.join_next().await {
        if let Err(e) = joined {
            error!("Health check task failed: {}", e);
        }
    }
}

async fn perform(shared: &PoolShared, pooled: &PooledSession, check: Check) -> FaxResult<()> {
    let mut session = pooled.session.lock().await;
    match check {
        Check::Noop => session.noop().await,
        Check::Reopen => {
            if let Err(e) = session.quit().await {
                debug!("Session {} did not say goodbye before reopen: {}", pooled.id(), e);
            }
            *session = open_session(&shared.config).await?;
            Ok(())
        }
    }
}

fn settle(shared: &PoolShared, pooled: &PooledSession, check: Check, result: FaxResult<()>) {
    let now = Instant::now();
    let usable = {
        let mut meta = pooled.meta();
        meta.busy = false;
        match &result {
            Ok(()) => {
                meta.valid = true;
                meta.retry_at = None;
                meta.last_noop = Some(now);
                if check == Check::Reopen {
                    meta.last_reopen = Some(now);
                    meta.last_release = now;
                }
            }
            Err(_) => {
                meta.valid = false;
                meta.retry_at = Some(now + shared.config.reopen_backoff());
            }
        }
        meta.valid && !meta.working
    };

    match result {
        Ok(()) if check == Check::Reopen => info!("Reopened pooled session {}", pooled.id()),
        Ok(()) => debug!("Session {} answered noop", pooled.id()),
        Err(e) => log_background(&format!("Health check of session {}", pooled.id()), &e),
    }
    if usable {
        shared.available.notify_one();
    }
}
