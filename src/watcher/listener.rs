//! Status listeners
//!
//! Listener registration data: which event types and which events of each
//! type a listener wants, plus an optional job id or modem filter.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{FaxError, FaxResult};
use crate::watcher::events::{EventType, StatusEvent, TYPE_ALL};

/// Receives status events, one at a time and in arrival order. Called on
/// the blocking thread pool; a slow or panicking listener does not hold
/// up the others.
pub trait StatusListener: Send + Sync {
    fn on_event(&self, event: &StatusEvent);
}

/// Per-type event masks. Bit `n` of a type's mask selects the type's
/// `n`-th event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask {
    pub modem: u16,
    pub send: u16,
    pub receive: u16,
    pub job: u16,
}

impl EventMask {
    pub fn all() -> Self {
        Self {
            modem: EventType::Modem.all_events(),
            send: EventType::Send.all_events(),
            receive: EventType::Receive.all_events(),
            job: EventType::Job.all_events(),
        }
    }

    pub fn get(&self, kind: EventType) -> u16 {
        match kind {
            EventType::Modem => self.modem,
            EventType::Send => self.send,
            EventType::Receive => self.receive,
            EventType::Job => self.job,
        }
    }

    pub fn with(mut self, kind: EventType, bits: u16) -> Self {
        match kind {
            EventType::Modem => self.modem = bits,
            EventType::Send => self.send = bits,
            EventType::Receive => self.receive = bits,
            EventType::Job => self.job = bits,
        }
        self
    }

    pub fn union(self, other: EventMask) -> Self {
        Self {
            modem: self.modem | other.modem,
            send: self.send | other.send,
            receive: self.receive | other.receive,
            job: self.job | other.job,
        }
    }

    /// Only the masks of types selected by `type_mask`.
    pub fn restrict(self, type_mask: u32) -> Self {
        EventType::ALL
            .into_iter()
            .fold(EventMask::default(), |mask, kind| {
                if type_mask & kind.mask() != 0 {
                    mask.with(kind, self.get(kind))
                } else {
                    mask
                }
            })
    }

    /// Trigger specification for the server, one `<class><hex mask>`
    /// group per selected type, e.g. `J0fff`.
    pub fn trigger_spec(&self, type_mask: u32) -> String {
        [EventType::Job, EventType::Send, EventType::Receive, EventType::Modem]
            .into_iter()
            .filter(|kind| type_mask & kind.mask() != 0)
            .map(|kind| format!("{}{:04x}", kind.trigger_class(), self.get(kind)))
            .collect()
    }
}

/// A type mask may only combine the four known type bits.
pub fn validate_type_mask(type_mask: u32) -> FaxResult<()> {
    if type_mask & !TYPE_ALL != 0 {
        return Err(FaxError::InvalidArgument(format!(
            "invalid status type mask {:#x}",
            type_mask
        )));
    }
    Ok(())
}

/// A registered listener with its selection.
#[derive(Clone)]
pub struct ListenerWrapper {
    listener: Arc<dyn StatusListener>,
    type_mask: u32,
    event_mask: EventMask,
    /// Job id or modem device this listener is limited to.
    id: Option<String>,
    /// Queue feeding this listener's delivery worker, once attached.
    mailbox: Option<mpsc::Sender<Arc<StatusEvent>>>,
}

impl ListenerWrapper {
    pub fn new(
        listener: Arc<dyn StatusListener>,
        type_mask: u32,
        event_mask: EventMask,
        id: Option<String>,
    ) -> FaxResult<Self> {
        validate_type_mask(type_mask)?;
        Ok(Self {
            listener,
            type_mask,
            event_mask: event_mask.restrict(type_mask),
            id,
            mailbox: None,
        })
    }

    pub fn listener(&self) -> &Arc<dyn StatusListener> {
        &self.listener
    }

    pub fn type_mask(&self) -> u32 {
        self.type_mask
    }

    pub fn event_mask(&self) -> EventMask {
        self.event_mask
    }

    pub(crate) fn mailbox(&self) -> Option<&mpsc::Sender<Arc<StatusEvent>>> {
        self.mailbox.as_ref()
    }

    pub(crate) fn set_mailbox(&mut self, mailbox: mpsc::Sender<Arc<StatusEvent>>) {
        self.mailbox = Some(mailbox);
    }

    pub fn is(&self, listener: &Arc<dyn StatusListener>) -> bool {
        Arc::ptr_eq(&self.listener, listener)
    }

    /// Whether `event` is selected by this registration.
    pub fn accepts(&self, event: &StatusEvent) -> bool {
        let kind = event.kind();
        if self.type_mask & kind.mask() == 0 {
            return false;
        }
        if self.event_mask.get(kind) & event.code.bit() == 0 {
            return false;
        }
        match self.id.as_deref() {
            None => true,
            Some(id) => {
                event.job_id().map(|job| job.to_string()).as_deref() == Some(id)
                    || event.device() == Some(id)
            }
        }
    }
}

impl fmt::Debug for ListenerWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerWrapper")
            .field("type_mask", &self.type_mask)
            .field("event_mask", &self.event_mask)
            .field("id", &self.id)
            .field("attached", &self.mailbox.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::events::{TYPE_JOB, TYPE_MODEM, TYPE_SEND};

    struct Ignore;

    impl StatusListener for Ignore {
        fn on_event(&self, _event: &StatusEvent) {}
    }

    fn wrapper(type_mask: u32, mask: EventMask, id: Option<&str>) -> ListenerWrapper {
        ListenerWrapper::new(Arc::new(Ignore), type_mask, mask, id.map(str::to_string)).unwrap()
    }

    #[test]
    fn type_mask_validation() {
        assert!(validate_type_mask(0).is_ok());
        assert!(validate_type_mask(TYPE_ALL).is_ok());
        assert!(validate_type_mask(0x10).is_err());
        assert!(ListenerWrapper::new(Arc::new(Ignore), 0x20, EventMask::all(), None).is_err());
    }

    #[test]
    fn trigger_spec_lists_selected_types() {
        let mask = EventMask::default().with(EventType::Job, 0x0fff);
        assert_eq!(mask.trigger_spec(TYPE_JOB), "J0fff");
        let all = EventMask::all();
        assert_eq!(all.trigger_spec(TYPE_JOB | TYPE_MODEM), "JffffM03ff");
    }

    #[test]
    fn accepts_by_type_event_and_id() {
        let event = StatusEvent::parse("1 JOB_CREATE JOB 42 (DEST 1 PRI 1 COM 1)").unwrap();
        assert!(wrapper(TYPE_JOB, EventMask::all(), None).accepts(&event));
        assert!(!wrapper(TYPE_SEND, EventMask::all(), None).accepts(&event));
        let only_ready = EventMask::default().with(EventType::Job, 1 << 2);
        assert!(!wrapper(TYPE_JOB, only_ready, None).accepts(&event));
        assert!(wrapper(TYPE_JOB, EventMask::all(), Some("42")).accepts(&event));
        assert!(!wrapper(TYPE_JOB, EventMask::all(), Some("43")).accepts(&event));
    }

    #[test]
    fn restrict_drops_unselected_types() {
        let mask = EventMask::all().restrict(TYPE_SEND);
        assert_eq!(mask.job, 0);
        assert_eq!(mask.send, EventType::Send.all_events());
    }
}
