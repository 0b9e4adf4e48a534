//! Status watcher service
//!
//! One `StatusWatcher` per application. It owns the shared socket every
//! server connects back to, one `HostWatcher` per server with at least
//! one listener, and the bounded pool that runs listener callbacks.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::config::WatcherConfig;
use crate::error::{FaxError, FaxResult};
use crate::protocol::Timezone;
use crate::session::SessionOptions;
use crate::watcher::dispatch::Dispatcher;
use crate::watcher::host::{HostWatcher, Routes, WatcherState};
use crate::watcher::listener::{EventMask, ListenerWrapper, StatusListener};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct Acceptor {
    port: u16,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    hosts: HashMap<String, HostWatcher>,
    acceptor: Option<Acceptor>,
    shut_down: bool,
}

struct WatcherInner {
    config: WatcherConfig,
    options: SessionOptions,
    routes: Routes,
    dispatcher: Dispatcher,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

/// Delivers server status events to registered listeners.
///
/// Created by the application and shut down explicitly with `shutdown`.
/// Cloning yields another handle to the same service.
#[derive(Clone)]
pub struct StatusWatcher {
    inner: Arc<WatcherInner>,
}

impl StatusWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        let options = SessionOptions {
            control_timeout: config.socket_timeout(),
            ..SessionOptions::default()
        };
        let dispatcher = Dispatcher::new(config.dispatch_workers);
        Self {
            inner: Arc::new(WatcherInner {
                config,
                options,
                routes: Routes::default(),
                dispatcher,
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `listener` for events from `host`.
    ///
    /// `type_mask` combines `TYPE_MODEM`, `TYPE_SEND`, `TYPE_RECEIVE` and
    /// `TYPE_JOB`; `event_mask` picks events within each type. When set,
    /// `id` limits delivery to events of that job id or modem device.
    /// Widening the selection for a host replaces its watcher, keeping
    /// the listeners already registered. If the replacement fails to
    /// load, the previous watcher is loaded again with its listeners.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_listener(
        &self,
        host: &str,
        port: u16,
        user: &str,
        timezone: Timezone,
        listener: Arc<dyn StatusListener>,
        type_mask: u32,
        event_mask: EventMask,
        id: Option<String>,
    ) -> FaxResult<()> {
        let mut wrapper = ListenerWrapper::new(listener, type_mask, event_mask, id)?;

        let mut registry = self.inner.registry.lock().await;
        if registry.shut_down {
            return Err(FaxError::InvalidArgument(
                "status watcher has been shut down".to_string(),
            ));
        }
        let acceptor_port = self.ensure_acceptor(&mut registry).await?;
        self.inner.dispatcher.attach(&mut wrapper);

        let (mut listeners, previous) = match registry.hosts.get(host) {
            Some(existing) if existing.covers(wrapper.type_mask(), wrapper.event_mask()) => {
                existing.add(wrapper);
                debug!("Added listener to existing watcher for {}", host);
                return Ok(());
            }
            Some(_) => {
                let mut old = registry.hosts.remove(host).ok_or_else(|| {
                    FaxError::InvalidArgument(format!("no watcher for {}", host))
                })?;
                let carried = old.take_listeners();
                let login = old.login();
                info!(
                    "Replacing watcher for {} to widen its selection ({} listeners carried over)",
                    host,
                    carried.len()
                );
                old.stop(&self.inner.routes, self.inner.config.socket_timeout())
                    .await;
                (carried.clone(), Some((login, carried)))
            }
            None => (Vec::new(), None),
        };
        listeners.push(wrapper);

        let loaded = self
            .load_watcher(acceptor_port, host, port, user, timezone, listeners)
            .await;
        match loaded {
            Ok(watcher) => {
                registry.hosts.insert(host.to_string(), watcher);
                Ok(())
            }
            Err(e) => {
                error!("Failed to watch {}:{}: {}", host, port, e);
                if let Some(((old_port, old_user, old_timezone), carried)) = previous {
                    let count = carried.len();
                    let restored = self
                        .load_watcher(acceptor_port, host, old_port, &old_user, old_timezone, carried)
                        .await;
                    match restored {
                        Ok(watcher) => {
                            info!("Restored watcher for {} with its {} listeners", host, count);
                            registry.hosts.insert(host.to_string(), watcher);
                        }
                        Err(restore) => error!(
                            "Could not restore watcher for {}; {} listeners no longer receive events: {}",
                            host, count, restore
                        ),
                    }
                }
                Err(e)
            }
        }
    }

    /// Unregister `listener` from `host`. The host's watcher stops with
    /// its last listener. Returns whether the listener was registered.
    pub async fn remove_listener(&self, host: &str, listener: &Arc<dyn StatusListener>) -> bool {
        let mut registry = self.inner.registry.lock().await;
        let Some(remaining) = registry.hosts.get(host).and_then(|w| w.remove(listener)) else {
            return false;
        };
        if remaining == 0 {
            if let Some(mut watcher) = registry.hosts.remove(host) {
                watcher
                    .stop(&self.inner.routes, self.inner.config.socket_timeout())
                    .await;
            }
        }
        true
    }

    /// Stop every watcher and close the shared socket. Later
    /// registrations fail.
    pub async fn shutdown(&self) {
        let mut registry = self.inner.registry.lock().await;
        if registry.shut_down {
            return;
        }
        registry.shut_down = true;

        let hosts: Vec<_> = registry.hosts.drain().collect();
        for (_, mut watcher) in hosts {
            watcher
                .stop(&self.inner.routes, self.inner.config.socket_timeout())
                .await;
        }

        if let Some(acceptor) = registry.acceptor.take() {
            let _ = acceptor.shutdown.send(true);
            if let Err(e) = acceptor.handle.await {
                warn!("Status acceptor ended abnormally: {}", e);
            }
        }
        self.inner.dispatcher.close();
        info!("Status watcher shut down");
    }

    /// Port of the shared socket, once opened.
    pub async fn local_port(&self) -> Option<u16> {
        self.inner
            .registry
            .lock()
            .await
            .acceptor
            .as_ref()
            .map(|a| a.port)
    }

    pub async fn state(&self, host: &str) -> Option<WatcherState> {
        self.inner.registry.lock().await.hosts.get(host).map(|w| w.state())
    }

    pub async fn listener_count(&self, host: &str) -> usize {
        self.inner
            .registry
            .lock()
            .await
            .hosts
            .get(host)
            .map_or(0, |w| w.listener_count())
    }

    /// Create a watcher for `listeners` and load it. A watcher that fails
    /// to load is stopped before the error is returned.
    #[allow(clippy::too_many_arguments)]
    async fn load_watcher(
        &self,
        acceptor_port: u16,
        host: &str,
        port: u16,
        user: &str,
        timezone: Timezone,
        listeners: Vec<ListenerWrapper>,
    ) -> FaxResult<HostWatcher> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut watcher = HostWatcher::new(id, host, port, user, timezone, listeners);
        match watcher
            .load(
                acceptor_port,
                self.inner.options,
                &self.inner.routes,
                &self.inner.dispatcher,
            )
            .await
        {
            Ok(()) => Ok(watcher),
            Err(e) => {
                watcher
                    .stop(&self.inner.routes, self.inner.config.socket_timeout())
                    .await;
                Err(e)
            }
        }
    }

    async fn ensure_acceptor(&self, registry: &mut Registry) -> FaxResult<u16> {
        if let Some(acceptor) = &registry.acceptor {
            return Ok(acceptor.port);
        }

        let address = self.inner.config.listen_socket();
        let listener = TcpListener::bind(&address).await?;
        let port = listener.local_addr()?.port();
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(accept_loop(listener, Arc::clone(&self.inner.routes), rx));
        info!("Status acceptor listening on {} (port {})", address, port);

        registry.acceptor = Some(Acceptor {
            port,
            shutdown,
            handle,
        });
        Ok(port)
    }
}

/// Hand each inbound connection to the watcher whose server it comes from.
async fn accept_loop(listener: TcpListener, routes: Routes, mut shutdown: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let inbox = routes
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .values()
                    .find(|route| route.peers.contains(&peer.ip()))
                    .map(|route| route.inbox.clone());
                match inbox {
                    Some(inbox) => {
                        debug!("Event connection from {}", peer);
                        if inbox.try_send(stream).is_err() {
                            warn!("Dropping event connection from {}: watcher is not reading", peer);
                        }
                    }
                    None => warn!("Dropping event connection from unknown peer {}", peer),
                }
            }
            Err(e) => {
                if *shutdown.borrow() {
                    break;
                }
                error!("Status acceptor failed to accept: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("Status acceptor stopped");
}
