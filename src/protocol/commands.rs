//! Module `commands`
//!
//! Defines the control-channel verbs the client issues and the
//! transfer-parameter enums negotiated with `type`, `mode` and `tzone`.

use serde::Deserialize;
use std::fmt;

/// A control-channel verb. The wire form is the lowercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    User,
    Pass,
    Admin,
    Quit,
    Noop,
    Pwd,
    Cwd,
    Cdup,
    Type,
    Mode,
    Idle,
    Tzone,
    Size,
    Mdtm,
    Rnfr,
    Rnto,
    Dele,
    List,
    Nlst,
    Retr,
    Stor,
    Stou,
    Stot,
    Pasv,
    Port,
    Site,
    Jnew,
    Job,
    Jparm,
    Jsubm,
    Jsusp,
    Jkill,
    Jintr,
    Jdele,
    Jwait,
    Jrest,
    Jobfmt,
    Mdmfmt,
    Rcvfmt,
    Filefmt,
}

impl Command {
    pub fn wire_name(self) -> &'static str {
        match self {
            Command::User => "user",
            Command::Pass => "pass",
            Command::Admin => "admin",
            Command::Quit => "quit",
            Command::Noop => "noop",
            Command::Pwd => "pwd",
            Command::Cwd => "cwd",
            Command::Cdup => "cdup",
            Command::Type => "type",
            Command::Mode => "mode",
            Command::Idle => "idle",
            Command::Tzone => "tzone",
            Command::Size => "size",
            Command::Mdtm => "mdtm",
            Command::Rnfr => "rnfr",
            Command::Rnto => "rnto",
            Command::Dele => "dele",
            Command::List => "list",
            Command::Nlst => "nlst",
            Command::Retr => "retr",
            Command::Stor => "stor",
            Command::Stou => "stou",
            Command::Stot => "stot",
            Command::Pasv => "pasv",
            Command::Port => "port",
            Command::Site => "site",
            Command::Jnew => "jnew",
            Command::Job => "job",
            Command::Jparm => "jparm",
            Command::Jsubm => "jsubm",
            Command::Jsusp => "jsusp",
            Command::Jkill => "jkill",
            Command::Jintr => "jintr",
            Command::Jdele => "jdele",
            Command::Jwait => "jwait",
            Command::Jrest => "jrest",
            Command::Jobfmt => "jobfmt",
            Command::Mdmfmt => "mdmfmt",
            Command::Rcvfmt => "rcvfmt",
            Command::Filefmt => "filefmt",
        }
    }

    /// Commands whose `550` reply means "no such file" rather than a
    /// generic protocol failure.
    pub fn reports_not_found(self) -> bool {
        matches!(
            self,
            Command::Size
                | Command::Mdtm
                | Command::List
                | Command::Retr
                | Command::Nlst
                | Command::Rnfr
        )
    }

    /// Arguments of these commands are never written to the log.
    pub fn is_secret(self) -> bool {
        matches!(self, Command::Pass | Command::Admin)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Byte-level interpretation of transferred data (`type` command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferType {
    #[default]
    Ascii,
    Ebcdic,
    Image,
    Local,
}

impl TransferType {
    pub fn code(self) -> char {
        match self {
            TransferType::Ascii => 'A',
            TransferType::Ebcdic => 'E',
            TransferType::Image => 'I',
            TransferType::Local => 'L',
        }
    }
}

/// Framing applied to the data connection (`mode` command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    #[default]
    Stream,
    Block,
    Compressed,
    Zlib,
}

impl TransferMode {
    pub fn code(self) -> char {
        match self {
            TransferMode::Stream => 'S',
            TransferMode::Block => 'B',
            TransferMode::Compressed => 'C',
            TransferMode::Zlib => 'Z',
        }
    }

    pub fn is_supported(self) -> bool {
        matches!(self, TransferMode::Stream | TransferMode::Zlib)
    }
}

/// Time zone the server uses when formatting times for this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timezone {
    Gmt,
    #[default]
    Local,
}

impl Timezone {
    pub fn wire_name(self) -> &'static str {
        match self {
            Timezone::Gmt => "gmt",
            Timezone::Local => "local",
        }
    }
}

/// Character encoding of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Utf8,
    Latin1,
}

impl Charset {
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Charset::Utf8 => text.as_bytes().to_vec(),
            Charset::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_applies_to_path_commands() {
        assert!(Command::Size.reports_not_found());
        assert!(Command::Rnfr.reports_not_found());
        assert!(!Command::Dele.reports_not_found());
        assert!(!Command::Jparm.reports_not_found());
    }

    #[test]
    fn latin1_round_trips_high_bytes() {
        let bytes = [b'a', 0xe9, b'z'];
        let text = Charset::Latin1.decode(&bytes);
        assert_eq!(text, "aéz");
        assert_eq!(Charset::Latin1.encode(&text), bytes.to_vec());
    }

    #[test]
    fn defaults_match_a_fresh_connection() {
        assert_eq!(TransferType::default(), TransferType::Ascii);
        assert_eq!(TransferMode::default(), TransferMode::Stream);
    }
}
