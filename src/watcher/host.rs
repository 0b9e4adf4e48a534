//! Per-host watcher
//!
//! Owns the trigger session to one server and the task reading the event
//! stream that server pushes back. Lifecycle: `Created` until `load`
//! succeeds, then `Loaded`, and `Stopped` once the last listener is gone
//! or the service shuts down.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{FaxError, FaxResult};
use crate::protocol::Timezone;
use crate::session::{ProtocolSession, SessionOptions};
use crate::watcher::dispatch::Dispatcher;
use crate::watcher::events::StatusEvent;
use crate::watcher::listener::{EventMask, ListenerWrapper, StatusListener};

/// Where the accept loop delivers a host's inbound event connections.
pub(crate) struct Route {
    pub peers: Vec<IpAddr>,
    pub inbox: mpsc::Sender<TcpStream>,
}

pub(crate) type Routes = Arc<RwLock<HashMap<u64, Route>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Created,
    Loaded,
    Stopped,
}

pub(crate) struct HostWatcher {
    id: u64,
    host: String,
    port: u16,
    user: String,
    timezone: Timezone,
    type_mask: u32,
    event_mask: EventMask,
    listeners: Arc<RwLock<Vec<ListenerWrapper>>>,
    state: WatcherState,
    trigger: Option<ProtocolSession>,
    stop_tx: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
}

impl HostWatcher {
    pub fn new(
        id: u64,
        host: &str,
        port: u16,
        user: &str,
        timezone: Timezone,
        listeners: Vec<ListenerWrapper>,
    ) -> Self {
        let (type_mask, event_mask) = cumulative_masks(&listeners);
        let (stop_tx, _) = watch::channel(false);
        Self {
            id,
            host: host.to_string(),
            port,
            user: user.to_string(),
            timezone,
            type_mask,
            event_mask,
            listeners: Arc::new(RwLock::new(listeners)),
            state: WatcherState::Created,
            trigger: None,
            stop_tx,
            reader: None,
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    /// Port, user and timezone the trigger session logs in with.
    pub fn login(&self) -> (u16, String, Timezone) {
        (self.port, self.user.clone(), self.timezone)
    }

    /// True when a listener with these masks needs no new trigger.
    pub fn covers(&self, type_mask: u32, event_mask: EventMask) -> bool {
        (self.type_mask | type_mask) == self.type_mask
            && self.event_mask.union(event_mask) == self.event_mask
    }

    pub fn add(&self, wrapper: ListenerWrapper) {
        self.write_listeners().push(wrapper);
    }

    /// Remove `listener`; returns how many listeners remain.
    pub fn remove(&self, listener: &Arc<dyn StatusListener>) -> Option<usize> {
        let mut listeners = self.write_listeners();
        let before = listeners.len();
        listeners.retain(|wrapper| !wrapper.is(listener));
        (listeners.len() != before).then_some(listeners.len())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn take_listeners(&self) -> Vec<ListenerWrapper> {
        std::mem::take(&mut *self.write_listeners())
    }

    /// Open the trigger session and ask the server to send events to the
    /// shared acceptor listening on `acceptor_port`.
    pub async fn load(
        &mut self,
        acceptor_port: u16,
        options: SessionOptions,
        routes: &Routes,
        dispatcher: &Dispatcher,
    ) -> FaxResult<()> {
        let mut session = ProtocolSession::open(&self.host, self.port, options).await?;
        session.authenticate(&self.user, None).await?;
        session.tzone(self.timezone).await?;

        let local_ip = match session.local_addr() {
            SocketAddr::V4(addr) => *addr.ip(),
            SocketAddr::V6(_) => {
                return Err(FaxError::InvalidArgument(
                    "status events need an IPv4 control connection".to_string(),
                ));
            }
        };

        let mut peers = vec![session.peer_addr().ip()];
        if let Ok(resolved) = tokio::net::lookup_host((self.host.as_str(), self.port)).await {
            peers.extend(resolved.map(|addr| addr.ip()));
        }
        peers.sort();
        peers.dedup();

        let (inbox_tx, inbox_rx) = mpsc::channel(4);
        routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(self.id, Route { peers, inbox: inbox_tx });

        self.reader = Some(tokio::spawn(read_loop(
            self.host.clone(),
            inbox_rx,
            self.stop_tx.subscribe(),
            Arc::clone(&self.listeners),
            dispatcher.clone(),
        )));

        session
            .set_data_port(SocketAddrV4::new(local_ip, acceptor_port))
            .await?;
        let spec = self.event_mask.trigger_spec(self.type_mask);
        session.site_trigger(&spec).await?;

        info!("Watching {}:{} for status events ({})", self.host, self.port, spec);
        self.trigger = Some(session);
        self.state = WatcherState::Loaded;
        Ok(())
    }

    /// Close the trigger session and the event stream.
    pub async fn stop(&mut self, routes: &Routes, quit_timeout: Duration) {
        if self.state == WatcherState::Stopped {
            return;
        }
        self.state = WatcherState::Stopped;

        routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
        let _ = self.stop_tx.send(true);

        if let Some(mut session) = self.trigger.take() {
            match timeout(quit_timeout, session.quit()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Trigger session to {} ended uncleanly: {}", self.host, e),
                Err(_) => debug!("Trigger session to {} did not answer quit", self.host),
            }
        }
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                warn!("Event reader for {} ended abnormally: {}", self.host, e);
            }
        }
        info!("Stopped watching {}:{}", self.host, self.port);
    }

    fn write_listeners(&self) -> std::sync::RwLockWriteGuard<'_, Vec<ListenerWrapper>> {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Union of the selections of `listeners`.
pub(crate) fn cumulative_masks(listeners: &[ListenerWrapper]) -> (u32, EventMask) {
    listeners
        .iter()
        .fold((0, EventMask::default()), |(types, events), wrapper| {
            (
                types | wrapper.type_mask(),
                events.union(wrapper.event_mask()),
            )
        })
}

async fn read_loop(
    host: String,
    mut inbox: mpsc::Receiver<TcpStream>,
    mut stop: watch::Receiver<bool>,
    listeners: Arc<RwLock<Vec<ListenerWrapper>>>,
    dispatcher: Dispatcher,
) {
    loop {
        let stream = tokio::select! {
            _ = stop.changed() => break,
            stream = inbox.recv() => match stream {
                Some(stream) => stream,
                None => break,
            },
        };
        read_events(&host, stream, &mut stop, &listeners, &dispatcher).await;
        if *stop.borrow() {
            break;
        }
    }
    debug!("Event reader for {} finished", host);
}

async fn read_events(
    host: &str,
    stream: TcpStream,
    stop: &mut watch::Receiver<bool>,
    listeners: &RwLock<Vec<ListenerWrapper>>,
    dispatcher: &Dispatcher,
) {
    debug!("Event stream from {} opened", host);
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = stop.changed() => {
                debug!("Closing event stream from {}", host);
                return;
            }
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => {
                if *stop.borrow() {
                    debug!("Event stream from {} closed", host);
                } else {
                    warn!("Event stream from {} closed by the server", host);
                }
                return;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match StatusEvent::parse(line) {
                    Ok(event) => dispatcher.dispatch(listeners, Arc::new(event)),
                    Err(e) => warn!("Ignoring status line from {}: {}", host, e),
                }
            }
            Err(e) => {
                if *stop.borrow() {
                    debug!("Event stream from {} ended during shutdown: {}", host, e);
                } else {
                    error!("Event stream from {} failed: {}", host, e);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::events::{EventType, TYPE_JOB, TYPE_MODEM, TYPE_SEND};

    struct Ignore;

    impl StatusListener for Ignore {
        fn on_event(&self, _event: &StatusEvent) {}
    }

    fn wrapper(type_mask: u32, mask: EventMask) -> ListenerWrapper {
        ListenerWrapper::new(Arc::new(Ignore), type_mask, mask, None).unwrap()
    }

    #[test]
    fn covers_only_subsets_of_the_cumulative_selection() {
        let job_only = EventMask::default().with(EventType::Job, 0x0003);
        let watcher = HostWatcher::new(
            1,
            "fax",
            4559,
            "fax",
            Timezone::Local,
            vec![wrapper(TYPE_JOB, job_only), wrapper(TYPE_MODEM, EventMask::all())],
        );

        assert_eq!(watcher.state(), WatcherState::Created);
        assert!(watcher.covers(TYPE_JOB, EventMask::default().with(EventType::Job, 0x0001)));
        assert!(watcher.covers(TYPE_MODEM, EventMask::all().restrict(TYPE_MODEM)));
        assert!(!watcher.covers(TYPE_JOB, EventMask::default().with(EventType::Job, 0x0004)));
        assert!(!watcher.covers(TYPE_SEND, EventMask::default()));
    }

    #[test]
    fn remove_reports_remaining_listeners() {
        let first = wrapper(TYPE_JOB, EventMask::all());
        let listener = Arc::clone(first.listener());
        let watcher = HostWatcher::new(
            1,
            "fax",
            4559,
            "fax",
            Timezone::Local,
            vec![first, wrapper(TYPE_JOB, EventMask::all())],
        );

        assert_eq!(watcher.remove(&listener), Some(1));
        assert_eq!(watcher.remove(&listener), None);
        assert_eq!(watcher.take_listeners().len(), 1);
        assert_eq!(watcher.listener_count(), 0);
    }
}
