//! Status events
//!
//! Parses the event lines a server pushes over a trigger connection:
//!
//! ```text
//! <server-time> <event> <TYPE> <detail...>[: description]
//! 123 JOB_CREATE JOB 42 (DEST 5551234 PRI 127 COM 7): queued
//! 130 SEND_PAGE SEND 42 (DEST 5551234 PRI 127 COM 7) <pages=1 docs=1 time=0:12>
//! 140 RECV_END RECEIVE ttyS0 (COM 9) TSI "+1 555 0100" <pages=2 time=1:03>
//! 150 MODEM_READY MODEM ttyS0
//! ```
//!
//! `<event>` is either the event name or its numeric code.

use chrono::{DateTime, Local};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use crate::error::{FaxError, FaxResult};

pub const TYPE_MODEM: u32 = 0x1;
pub const TYPE_SEND: u32 = 0x2;
pub const TYPE_RECEIVE: u32 = 0x4;
pub const TYPE_JOB: u32 = 0x8;
pub const TYPE_ALL: u32 = TYPE_MODEM | TYPE_SEND | TYPE_RECEIVE | TYPE_JOB;

const JOB_EVENTS: &[&str] = &[
    "JOB_CREATE",
    "JOB_SUSPEND",
    "JOB_READY",
    "JOB_SLEEP",
    "JOB_DEAD",
    "JOB_PROCESS",
    "JOB_REAP",
    "JOB_ACTIVE",
    "JOB_REJECT",
    "JOB_KILL",
    "JOB_BLOCKED",
    "JOB_DELAYED",
    "JOB_ALTERED",
    "JOB_TIMEDOUT",
    "JOB_PREP_BEGIN",
    "JOB_PREP_END",
];

const SEND_EVENTS: &[&str] = &[
    "SEND_BEGIN",
    "SEND_CALL",
    "SEND_CONNECTED",
    "SEND_PAGE",
    "SEND_DOC",
    "SEND_POLLRCVD",
    "SEND_POLLDONE",
    "SEND_END",
    "SEND_REFORMAT",
    "SEND_REQUEUE",
    "SEND_DONE",
];

const RECEIVE_EVENTS: &[&str] = &["RECV_BEGIN", "RECV_START", "RECV_PAGE", "RECV_DOC", "RECV_END"];

const MODEM_EVENTS: &[&str] = &[
    "MODEM_ASSIGN",
    "MODEM_RELEASE",
    "MODEM_DOWN",
    "MODEM_READY",
    "MODEM_BUSY",
    "MODEM_WEDGED",
    "MODEM_INUSE",
    "MODEM_DATA",
    "MODEM_VOICE",
    "MODEM_CID",
];

/// Kind of status event, one per trigger class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Modem,
    Send,
    Receive,
    Job,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::Modem,
        EventType::Send,
        EventType::Receive,
        EventType::Job,
    ];

    /// Bit of this type in a type mask.
    pub fn mask(self) -> u32 {
        match self {
            EventType::Modem => TYPE_MODEM,
            EventType::Send => TYPE_SEND,
            EventType::Receive => TYPE_RECEIVE,
            EventType::Job => TYPE_JOB,
        }
    }

    /// Class letter used in a trigger specification.
    pub fn trigger_class(self) -> char {
        match self {
            EventType::Modem => 'M',
            EventType::Send => 'S',
            EventType::Receive => 'R',
            EventType::Job => 'J',
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventType::Modem => "MODEM",
            EventType::Send => "SEND",
            EventType::Receive => "RECEIVE",
            EventType::Job => "JOB",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        EventType::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(name))
    }

    /// Names of this type's events, in bit order.
    pub fn event_names(self) -> &'static [&'static str] {
        match self {
            EventType::Modem => MODEM_EVENTS,
            EventType::Send => SEND_EVENTS,
            EventType::Receive => RECEIVE_EVENTS,
            EventType::Job => JOB_EVENTS,
        }
    }

    /// Event mask selecting every event of this type.
    pub fn all_events(self) -> u16 {
        let n = self.event_names().len();
        if n >= 16 { u16::MAX } else { (1u16 << n) - 1 }
    }

    /// First numeric event code of this type.
    fn code_base(self) -> u32 {
        match self {
            EventType::Job => 0x00,
            EventType::Send => 0x10,
            EventType::Receive => 0x20,
            EventType::Modem => 0x30,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One event, identified by type and position within the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventCode {
    kind: EventType,
    index: u8,
}

impl EventCode {
    pub fn kind(&self) -> EventType {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.event_names()[usize::from(self.index)]
    }

    /// Bit of this event in its type's event mask.
    pub fn bit(&self) -> u16 {
        1u16 << self.index
    }

    /// Numeric code as sent on the wire.
    pub fn number(&self) -> u32 {
        self.kind.code_base() + u32::from(self.index)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        EventType::ALL.into_iter().find_map(|kind| {
            kind.event_names()
                .iter()
                .position(|n| n.eq_ignore_ascii_case(name))
                .map(|index| EventCode {
                    kind,
                    index: index as u8,
                })
        })
    }

    pub fn from_number(number: u32) -> Option<Self> {
        EventType::ALL.into_iter().find_map(|kind| {
            let index = number.checked_sub(kind.code_base())?;
            (index < kind.event_names().len() as u32).then_some(EventCode {
                kind,
                index: index as u8,
            })
        })
    }

    /// Name, decimal, or `0x`-prefixed hex code.
    fn parse(token: &str) -> Option<Self> {
        if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
            return u32::from_str_radix(hex, 16).ok().and_then(Self::from_number);
        }
        match token.parse::<u32>() {
            Ok(number) => Self::from_number(number),
            Err(_) => Self::from_name(token),
        }
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type-specific part of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDetail {
    Job {
        job_id: u64,
        destination: Option<String>,
        priority: Option<String>,
    },
    Send {
        job_id: u64,
        destination: Option<String>,
        priority: Option<String>,
        pages: Option<u32>,
        documents: Option<u32>,
        duration: Option<String>,
    },
    Receive {
        device: String,
        sender: Option<String>,
        pages: Option<u32>,
        duration: Option<String>,
    },
    Modem {
        device: String,
    },
}

/// A parsed status event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub code: EventCode,
    /// When this client read the line.
    pub received_at: DateTime<Local>,
    /// Seconds since the epoch, as stamped by the server.
    pub server_time: i64,
    pub comm_id: Option<String>,
    pub description: Option<String>,
    pub detail: EventDetail,
}

impl StatusEvent {
    pub fn kind(&self) -> EventType {
        self.code.kind()
    }

    pub fn job_id(&self) -> Option<u64> {
        match &self.detail {
            EventDetail::Job { job_id, .. } | EventDetail::Send { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    pub fn destination(&self) -> Option<&str> {
        match &self.detail {
            EventDetail::Job { destination, .. } | EventDetail::Send { destination, .. } => {
                destination.as_deref()
            }
            _ => None,
        }
    }

    pub fn priority(&self) -> Option<&str> {
        match &self.detail {
            EventDetail::Job { priority, .. } | EventDetail::Send { priority, .. } => {
                priority.as_deref()
            }
            _ => None,
        }
    }

    pub fn device(&self) -> Option<&str> {
        match &self.detail {
            EventDetail::Receive { device, .. } | EventDetail::Modem { device } => Some(device),
            _ => None,
        }
    }

    /// Parse one event line.
    pub fn parse(line: &str) -> FaxResult<Self> {
        let line = line.trim();
        let (head, description) = split_description(line);

        let mut rest = head.trim();
        let server_time = take_field(&mut rest)
            .and_then(|t| t.parse::<i64>().ok())
            .ok_or_else(|| FaxError::mangled(line))?;
        let code = take_field(&mut rest)
            .and_then(EventCode::parse)
            .ok_or_else(|| FaxError::mangled(line))?;
        let kind = take_field(&mut rest)
            .and_then(EventType::from_name)
            .ok_or_else(|| FaxError::mangled(line))?;
        if kind != code.kind() {
            return Err(FaxError::mangled(line));
        }

        let params = parenthesized(rest);
        let comm_id = params.get("COM").cloned();
        let counts = angle_params(rest);
        let first = rest.split_whitespace().next().map(str::to_string);

        let detail = match kind {
            EventType::Job => EventDetail::Job {
                job_id: parse_job(first.as_deref(), line)?,
                destination: params.get("DEST").cloned(),
                priority: params.get("PRI").cloned(),
            },
            EventType::Send => EventDetail::Send {
                job_id: parse_job(first.as_deref(), line)?,
                destination: params.get("DEST").cloned(),
                priority: params.get("PRI").cloned(),
                pages: counts.get("pages").and_then(|v| v.parse().ok()),
                documents: counts.get("docs").and_then(|v| v.parse().ok()),
                duration: counts.get("time").cloned(),
            },
            EventType::Receive => EventDetail::Receive {
                device: first.ok_or_else(|| FaxError::mangled(line))?,
                sender: tsi(rest),
                pages: counts.get("pages").and_then(|v| v.parse().ok()),
                duration: counts.get("time").cloned(),
            },
            EventType::Modem => EventDetail::Modem {
                device: first.ok_or_else(|| FaxError::mangled(line))?,
            },
        };

        Ok(StatusEvent {
            code,
            received_at: Local::now(),
            server_time,
            comm_id,
            description,
            detail,
        })
    }
}

/// Split off the next whitespace-delimited field.
fn take_field<'a>(text: &mut &'a str) -> Option<&'a str> {
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
    let (field, remainder) = trimmed.split_at(end);
    *text = remainder.trim_start();
    Some(field)
}

fn parse_job(token: Option<&str>, line: &str) -> FaxResult<u64> {
    token
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| FaxError::mangled(line))
}

/// Split at the first `:` outside quotes, parentheses and angle brackets.
fn split_description(line: &str) -> (&str, Option<String>) {
    let mut depth = 0i32;
    let mut quoted = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '(' | '<' if !quoted => depth += 1,
            ')' | '>' if !quoted => depth -= 1,
            ':' if !quoted && depth <= 0 => {
                let description = line[i + 1..].trim();
                let description = (!description.is_empty()).then(|| description.to_string());
                return (&line[..i], description);
            }
            _ => {}
        }
    }
    (line, None)
}

fn paren_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(([^)]*)\)").expect("static regex"))
}

fn angle_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([^>]*)>").expect("static regex"))
}

fn tsi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"TSI\s+"([^"]*)""#).expect("static regex"))
}

/// `(KEY value KEY value ...)` pairs.
fn parenthesized(text: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    if let Some(caps) = paren_regex().captures(text) {
        let mut tokens = caps[1].split_whitespace();
        while let (Some(key), Some(value)) = (tokens.next(), tokens.next()) {
            pairs.insert(key.to_ascii_uppercase(), value.to_string());
        }
    }
    pairs
}

/// `<key=value key=value ...>` pairs.
fn angle_params(text: &str) -> HashMap<String, String> {
    angle_regex()
        .captures(text)
        .map(|caps| {
            caps[1]
                .split_whitespace()
                .filter_map(|kv| kv.split_once('='))
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn tsi(text: &str) -> Option<String> {
    tsi_regex().captures(text).map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_create_line() {
        let event =
            StatusEvent::parse("123 JOB_CREATE JOB 42 (DEST 5551234 PRI 127 COM 7): queued").unwrap();
        assert_eq!(event.server_time, 123);
        assert_eq!(event.code.name(), "JOB_CREATE");
        assert_eq!(event.kind(), EventType::Job);
        assert_eq!(event.job_id(), Some(42));
        assert_eq!(event.destination(), Some("5551234"));
        assert_eq!(event.priority(), Some("127"));
        assert_eq!(event.comm_id.as_deref(), Some("7"));
        assert_eq!(event.description.as_deref(), Some("queued"));
    }

    #[test]
    fn numeric_event_codes() {
        let event = StatusEvent::parse("99 0x13 SEND 8 (DEST 100 PRI 1 COM 3)").unwrap();
        assert_eq!(event.code.name(), "SEND_PAGE");
        assert_eq!(event.code.bit(), 1 << 3);

        let event = StatusEvent::parse("99 50 MODEM ttyS1").unwrap();
        assert_eq!(event.code.name(), "MODEM_DOWN");
        assert_eq!(event.device(), Some("ttyS1"));
    }

    #[test]
    fn send_counts() {
        let event = StatusEvent::parse(
            "130 SEND_DONE SEND 42 (DEST 5551234 PRI 127 COM 7) <pages=3 docs=1 time=0:42>: done",
        )
        .unwrap();
        match event.detail {
            EventDetail::Send {
                job_id,
                pages,
                documents,
                ref duration,
                ..
            } => {
                assert_eq!(job_id, 42);
                assert_eq!(pages, Some(3));
                assert_eq!(documents, Some(1));
                assert_eq!(duration.as_deref(), Some("0:42"));
            }
            other => panic!("unexpected detail {:?}", other),
        }
        assert_eq!(event.description.as_deref(), Some("done"));
    }

    #[test]
    fn receive_keeps_colons_inside_the_sender() {
        let event = StatusEvent::parse(
            r#"140 RECV_END RECEIVE ttyS0 (COM 9) TSI "HQ: front desk" <pages=2 time=1:03>"#,
        )
        .unwrap();
        assert_eq!(event.device(), Some("ttyS0"));
        assert_eq!(event.comm_id.as_deref(), Some("9"));
        assert_eq!(event.description, None);
        match event.detail {
            EventDetail::Receive { sender, pages, .. } => {
                assert_eq!(sender.as_deref(), Some("HQ: front desk"));
                assert_eq!(pages, Some(2));
            }
            other => panic!("unexpected detail {:?}", other),
        }
    }

    #[test]
    fn rejects_mismatched_or_broken_lines() {
        assert!(StatusEvent::parse("123 JOB_CREATE MODEM ttyS0").is_err());
        assert!(StatusEvent::parse("abc JOB_CREATE JOB 1").is_err());
        assert!(StatusEvent::parse("123 NO_SUCH JOB 1").is_err());
        assert!(StatusEvent::parse("123 JOB_CREATE JOB x").is_err());
        assert!(StatusEvent::parse("").is_err());
    }

    #[test]
    fn masks_cover_every_event() {
        assert_eq!(EventType::Job.all_events(), 0xffff);
        assert_eq!(EventType::Receive.all_events(), 0x1f);
        assert_eq!(EventCode::from_name("JOB_PREP_END").unwrap().bit(), 0x8000);
    }
}
