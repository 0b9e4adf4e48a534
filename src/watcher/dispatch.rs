//! Listener fan-out
//!
//! Every attached listener has its own bounded queue and a delivery task
//! draining it in order. Callbacks run on the blocking thread pool, at most
//! `dispatch_workers` at a time across all hosts; a listener occupies at
//! most one of those slots. Dispatching never waits: when a listener's
//! queue is full the event is dropped for that listener only.

use log::{debug, error, trace, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use tokio::sync::{Semaphore, mpsc};

use crate::watcher::events::StatusEvent;
use crate::watcher::listener::{ListenerWrapper, StatusListener};

/// Events queued per listener before new ones are dropped.
const MAILBOX_CAPACITY: usize = 64;

#[derive(Clone)]
pub(crate) struct Dispatcher {
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Give `wrapper` a queue and a delivery task unless it has one. The
    /// task ends once every copy of the wrapper is gone.
    pub fn attach(&self, wrapper: &mut ListenerWrapper) {
        if wrapper.mailbox().is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        tokio::spawn(deliver(
            Arc::clone(wrapper.listener()),
            rx,
            Arc::clone(&self.permits),
        ));
        wrapper.set_mailbox(tx);
    }

    /// Queue `event` for every listener that wants it.
    pub fn dispatch(&self, listeners: &RwLock<Vec<ListenerWrapper>>, event: Arc<StatusEvent>) {
        let listeners = listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut queued = 0;
        for wrapper in listeners.iter().filter(|wrapper| wrapper.accepts(&event)) {
            let Some(mailbox) = wrapper.mailbox() else {
                continue;
            };
            match mailbox.try_send(Arc::clone(&event)) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Status listener is falling behind; dropped {}", event.code)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        trace!("Queued {} for {} listener(s)", event.code, queued);
    }

    pub fn close(&self) {
        self.permits.close();
    }
}

async fn deliver(
    listener: Arc<dyn StatusListener>,
    mut mailbox: mpsc::Receiver<Arc<StatusEvent>>,
    permits: Arc<Semaphore>,
) {
    while let Some(event) = mailbox.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let listener = Arc::clone(&listener);
        let code = event.code;
        let delivered = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)))
        })
        .await;
        match delivered {
            Ok(Ok(())) => {}
            Ok(Err(_)) => error!("Status listener panicked while handling {}", code),
            Err(e) => error!("Status listener task failed on {}: {}", code, e),
        }
    }
    debug!("Status listener detached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::events::TYPE_ALL;
    use crate::watcher::listener::EventMask;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    struct Panics;

    impl StatusListener for Panics {
        fn on_event(&self, _event: &StatusEvent) {
            panic!("listener failure");
        }
    }

    #[derive(Default)]
    struct Records(Mutex<Vec<String>>);

    impl StatusListener for Records {
        fn on_event(&self, event: &StatusEvent) {
            self.0.lock().unwrap().push(event.code.name().to_string());
        }
    }

    struct Sleeps(Duration);

    impl StatusListener for Sleeps {
        fn on_event(&self, _event: &StatusEvent) {
            std::thread::sleep(self.0);
        }
    }

    fn attached(dispatcher: &Dispatcher, listener: Arc<dyn StatusListener>) -> ListenerWrapper {
        let mut wrapper = ListenerWrapper::new(listener, TYPE_ALL, EventMask::all(), None).unwrap();
        dispatcher.attach(&mut wrapper);
        wrapper
    }

    async fn wait_for(records: &Records, count: usize) {
        for _ in 0..200 {
            if records.0.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    const LINES: [&str; 3] = [
        "1 MODEM_READY MODEM ttyS0",
        "2 MODEM_BUSY MODEM ttyS0",
        "3 MODEM_READY MODEM ttyS0",
    ];

    #[tokio::test]
    async fn a_panicking_listener_does_not_stop_the_others() {
        let dispatcher = Dispatcher::new(1);
        let records = Arc::new(Records::default());
        let listeners = RwLock::new(vec![
            attached(&dispatcher, Arc::new(Panics)),
            attached(&dispatcher, records.clone()),
        ]);

        for line in &LINES[..2] {
            let event = Arc::new(StatusEvent::parse(line).unwrap());
            dispatcher.dispatch(&listeners, event);
        }

        wait_for(&records, 2).await;
        assert_eq!(*records.0.lock().unwrap(), vec!["MODEM_READY", "MODEM_BUSY"]);
    }

    #[tokio::test]
    async fn a_slow_listener_does_not_hold_up_dispatch_or_others() {
        let dispatcher = Dispatcher::new(2);
        let records = Arc::new(Records::default());
        let listeners = RwLock::new(vec![
            attached(&dispatcher, Arc::new(Sleeps(Duration::from_millis(500)))),
            attached(&dispatcher, records.clone()),
        ]);

        let started = Instant::now();
        for line in LINES {
            let event = Arc::new(StatusEvent::parse(line).unwrap());
            dispatcher.dispatch(&listeners, event);
        }
        assert!(started.elapsed() < Duration::from_millis(100));

        wait_for(&records, 3).await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(
            *records.0.lock().unwrap(),
            vec!["MODEM_READY", "MODEM_BUSY", "MODEM_READY"]
        );
    }

    #[tokio::test]
    async fn unattached_listeners_are_skipped() {
        let dispatcher = Dispatcher::new(1);
        let records = Arc::new(Records::default());
        let listeners = RwLock::new(vec![
            ListenerWrapper::new(records.clone(), TYPE_ALL, EventMask::all(), None).unwrap(),
        ]);

        let event = Arc::new(StatusEvent::parse(LINES[0]).unwrap());
        dispatcher.dispatch(&listeners, event);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(records.0.lock().unwrap().is_empty());
    }
}
