//! Reply handling
//!
//! Reply codes used by the fax protocol and the parsed `Response` type.

pub const CONNECT_WARNING: u16 = 130;
pub const DATA_OPENING: u16 = 150;
pub const OK: u16 = 200;
pub const NOT_IMPLEMENTED_SUPERFLUOUS: u16 = 202;
pub const PARAMETER: u16 = 213;
pub const JOB_WAIT_DONE: u16 = 216;
pub const READY: u16 = 220;
pub const GOODBYE: u16 = 221;
pub const TRANSFER_COMPLETE: u16 = 226;
pub const PASSIVE: u16 = 227;
pub const LOGIN_SUCCESS: u16 = 230;
pub const FILE_ACTION_OK: u16 = 250;
pub const PATH_CREATED: u16 = 257;
pub const PASSWORD_REQUIRED: u16 = 331;
pub const PENDING_FURTHER_INFO: u16 = 350;
pub const FILE_NOT_FOUND: u16 = 550;

/// A complete reply, single- or multi-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    /// Every line of the reply, without line terminators.
    pub lines: Vec<String>,
}

impl Response {
    /// Full reply text, lines joined with `\n`.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Text after the code on the final line.
    pub fn message(&self) -> &str {
        self.lines
            .last()
            .map(|line| strip_code(line))
            .unwrap_or_default()
    }

    /// Every line with its `NNN-` / `NNN ` prefix removed.
    pub fn body_lines(&self) -> Vec<&str> {
        self.lines.iter().map(|line| strip_code(line)).collect()
    }

    /// Continuation lines only (those written as `NNN-text`).
    pub fn continuation_lines(&self) -> Vec<&str> {
        if self.lines.len() < 2 {
            return Vec::new();
        }
        self.lines[..self.lines.len() - 1]
            .iter()
            .map(|line| strip_code(line))
            .collect()
    }

    pub fn is_multiline(&self) -> bool {
        self.lines.len() > 1
    }

    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }
}

/// Removes a leading three-digit code and its separator.
fn strip_code(line: &str) -> &str {
    let bytes = line.as_bytes();
    if bytes.len() >= 3 && bytes[..3].iter().all(u8::is_ascii_digit) {
        if bytes.len() == 3 {
            return "";
        }
        if bytes[3] == b'-' || bytes[3] == b' ' {
            return &line[4..];
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_and_message() {
        let resp = Response {
            code: 213,
            lines: vec!["213-first".into(), "213-second".into(), "213 End".into()],
        };
        assert_eq!(resp.message(), "End");
        assert_eq!(resp.body_lines(), vec!["first", "second", "End"]);
        assert_eq!(resp.continuation_lines(), vec!["first", "second"]);
        assert_eq!(resp.text(), "213-first\n213-second\n213 End");
    }
}
