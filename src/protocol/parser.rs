//! Reply text parsing
//!
//! Extracts structured values (addresses, paths, job ids, numbers, times)
//! from reply text. Every failure is reported as a mangled-response
//! protocol error carrying the offending text.

use chrono::NaiveDateTime;
use regex::Regex;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::OnceLock;

use crate::error::{FaxError, FaxResult};

/// Parse the three-digit code at the start of a reply line.
pub fn parse_code(line: &str) -> Option<u16> {
    let head = line.get(..3)?;
    if !head.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    head.parse().ok()
}

fn tuple_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d{1,3}),\s*(\d{1,3}),\s*(\d{1,3}),\s*(\d{1,3}),\s*(\d{1,3}),\s*(\d{1,3})")
            .expect("static regex")
    })
}

/// Parse an `a1,a2,a3,a4,p1,p2` tuple, e.g. from
/// `227 Entering Passive Mode (127,0,0,1,19,137)`.
pub fn parse_host_port(text: &str) -> FaxResult<SocketAddr> {
    let caps = tuple_regex()
        .captures(text)
        .ok_or_else(|| FaxError::mangled(text))?;

    let mut nums = [0u8; 6];
    for (i, slot) in nums.iter_mut().enumerate() {
        *slot = caps[i + 1]
            .parse::<u8>()
            .map_err(|_| FaxError::mangled(text))?;
    }

    let ip = Ipv4Addr::new(nums[0], nums[1], nums[2], nums[3]);
    let port = u16::from(nums[4]) * 256 + u16::from(nums[5]);
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Format the argument of a `port` command for the given address.
pub fn format_host_port(addr: &SocketAddrV4) -> String {
    let o = addr.ip().octets();
    let port = addr.port();
    format!(
        "{},{},{},{},{},{}",
        o[0],
        o[1],
        o[2],
        o[3],
        port / 256,
        port % 256
    )
}

/// Parse the quoted path of a `257` reply. Doubled quotes inside the
/// path stand for one quote.
pub fn parse_quoted_path(text: &str) -> FaxResult<String> {
    let start = text.find('"').ok_or_else(|| FaxError::mangled(text))?;
    let mut path = String::new();
    let mut chars = text[start + 1..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                path.push('"');
                continue;
            }
            return Ok(path);
        }
        path.push(c);
    }
    Err(FaxError::mangled(text))
}

fn trim_token(token: &str) -> &str {
    token.trim_matches(|c: char| !c.is_ascii_alphanumeric())
}

/// Parse the job id following a `jobid:` token, as in
/// `200 New job created: jobid: 15 groupid: 15.`
pub fn parse_job_id(text: &str) -> FaxResult<u64> {
    let mut tokens = text.split_whitespace();
    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case("jobid:") {
            return tokens
                .next()
                .map(trim_token)
                .and_then(|id| id.parse().ok())
                .ok_or_else(|| FaxError::mangled(text));
        }
    }
    Err(FaxError::mangled(text))
}

/// Parse the job id of a `jsubm` reply: the third whitespace token, as in
/// `200 Job 15 submitted.`
pub fn parse_submitted_job_id(text: &str) -> FaxResult<u64> {
    text.split_whitespace()
        .nth(2)
        .map(trim_token)
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| FaxError::mangled(text))
}

/// Parse the server-assigned name from a `stou`/`stot` preliminary reply,
/// as in `150 FILE: /tmp/doc12.ps (Opening new data connection).`
pub fn parse_file_name(text: &str) -> FaxResult<String> {
    let mut tokens = text.split_whitespace();
    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case("FILE:") {
            return tokens
                .next()
                .map(|name| name.trim_end_matches([';', ',', '.']).to_string())
                .filter(|name| !name.is_empty())
                .ok_or_else(|| FaxError::mangled(text));
        }
    }
    Err(FaxError::mangled(text))
}

/// Parse the first unsigned integer token after the reply code, as in
/// `213 1234` or `213 Idle timeout set to 900.`
pub fn parse_first_number(text: &str) -> FaxResult<u64> {
    text.split_whitespace()
        .skip(1)
        .map(trim_token)
        .find_map(|token| token.parse::<u64>().ok())
        .ok_or_else(|| FaxError::mangled(text))
}

/// Parse an `mdtm` reply, `213 YYYYMMDDHHMMSS[.sss]`.
pub fn parse_mdtm(text: &str) -> FaxResult<NaiveDateTime> {
    let stamp = text
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| FaxError::mangled(text))?;
    let whole = stamp.split('.').next().unwrap_or(stamp);
    NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S").map_err(|_| FaxError::mangled(text))
}

/// Second whitespace token of a document line, as in `PS docq/doc12.ps`.
pub fn document_path(line: &str) -> Option<&str> {
    line.split_whitespace().nth(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn parses_passive_tuple() {
        let addr = parse_host_port("227 Entering Passive Mode (127,0,0,1,19,137)").unwrap();
        assert_eq!(addr, "127.0.0.1:5001".parse().unwrap());
    }

    #[test]
    fn rejects_out_of_range_octet() {
        assert!(parse_host_port("227 (300,0,0,1,1,1)").is_err());
        assert!(parse_host_port("227 nothing here").is_err());
    }

    #[test]
    fn formats_port_argument() {
        let addr: SocketAddrV4 = "10.0.0.7:5001".parse().unwrap();
        assert_eq!(format_host_port(&addr), "10,0,0,7,19,137");
    }

    #[test]
    fn quoted_path_with_escaped_quote() {
        assert_eq!(parse_quoted_path("257 \"/var/spool\" is current").unwrap(), "/var/spool");
        assert_eq!(parse_quoted_path("257 \"a\"\"b\"").unwrap(), "a\"b");
        assert!(parse_quoted_path("257 no quotes").is_err());
    }

    #[test]
    fn job_ids() {
        assert_eq!(
            parse_job_id("200 New job created: jobid: 15 groupid: 15.").unwrap(),
            15
        );
        assert_eq!(parse_submitted_job_id("200 Job 42 submitted.").unwrap(), 42);
        assert!(parse_submitted_job_id("200 submitted").is_err());
    }

    #[test]
    fn file_names_and_numbers() {
        assert_eq!(
            parse_file_name("150 FILE: /tmp/doc12.ps (Opening new data connection).").unwrap(),
            "/tmp/doc12.ps"
        );
        assert_eq!(parse_first_number("213 1234").unwrap(), 1234);
        assert_eq!(parse_first_number("213 Idle timeout set to 900.").unwrap(), 900);
        assert!(parse_first_number("213 none").is_err());
    }

    #[test]
    fn modification_time() {
        let when = parse_mdtm("213 20260131235958").unwrap();
        assert_eq!((when.year(), when.month(), when.day()), (2026, 1, 31));
        assert_eq!((when.hour(), when.minute(), when.second()), (23, 59, 58));
    }
}
