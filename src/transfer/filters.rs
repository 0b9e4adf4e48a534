//! Data stream filters
//!
//! The transfer type filter translates line endings for ASCII transfers;
//! the transfer mode filter inflates or deflates `Zlib` streams. Inbound
//! data runs mode-then-type, outbound data runs type-then-mode. Both
//! filters keep state across chunk boundaries.

use flate2::Compression;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use std::io::Write;

use crate::error::{FaxError, FaxResult};
use crate::protocol::{TransferMode, TransferType};

/// Line terminator used by local files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn native() -> Self {
        if cfg!(windows) {
            LineEnding::CrLf
        } else {
            LineEnding::Lf
        }
    }
}

impl Default for LineEnding {
    fn default() -> Self {
        Self::native()
    }
}

/// Turns every `\n` not already preceded by `\r` into `\r\n`.
#[derive(Debug, Default)]
struct CrlfExpander {
    prev_cr: bool,
}

impl CrlfExpander {
    fn push(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            if b == b'\n' && !self.prev_cr {
                out.push(b'\r');
            }
            out.push(b);
            self.prev_cr = b == b'\r';
        }
    }
}

/// Turns `\r\n` into `\n`. A trailing `\r` is held until the next chunk.
#[derive(Debug, Default)]
struct CrlfCollapser {
    pending_cr: bool,
}

impl CrlfCollapser {
    fn push(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            if self.pending_cr {
                self.pending_cr = false;
                if b == b'\n' {
                    out.push(b'\n');
                    continue;
                }
                out.push(b'\r');
            }
            if b == b'\r' {
                self.pending_cr = true;
            } else {
                out.push(b);
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        if std::mem::take(&mut self.pending_cr) {
            out.push(b'\r');
        }
    }
}

/// Wire-to-local ASCII translation.
#[derive(Debug)]
enum AsciiDecoder {
    ToLf(CrlfCollapser),
    ToCrLf(CrlfExpander),
}

impl AsciiDecoder {
    fn new(local: LineEnding) -> Self {
        match local {
            LineEnding::Lf => AsciiDecoder::ToLf(CrlfCollapser::default()),
            LineEnding::CrLf => AsciiDecoder::ToCrLf(CrlfExpander::default()),
        }
    }

    fn push(&mut self, input: &[u8], out: &mut Vec<u8>) {
        match self {
            AsciiDecoder::ToLf(c) => c.push(input, out),
            AsciiDecoder::ToCrLf(e) => e.push(input, out),
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        if let AsciiDecoder::ToLf(c) = self {
            c.finish(out);
        }
    }
}

fn zlib_error(e: std::io::Error) -> FaxError {
    FaxError::TransferFailed(format!("zlib stream: {}", e))
}

fn check_mode(mode: TransferMode) -> FaxResult<()> {
    if mode.is_supported() {
        Ok(())
    } else {
        Err(FaxError::UnsupportedMode(mode.code()))
    }
}

/// Filter chain for bytes arriving from the data connection.
pub struct InboundFilter {
    inflate: Option<ZlibDecoder<Vec<u8>>>,
    ascii: Option<AsciiDecoder>,
}

impl InboundFilter {
    pub fn new(ty: TransferType, mode: TransferMode, local: LineEnding) -> FaxResult<Self> {
        check_mode(mode)?;
        Ok(Self {
            inflate: (mode == TransferMode::Zlib).then(|| ZlibDecoder::new(Vec::new())),
            ascii: (ty == TransferType::Ascii).then(|| AsciiDecoder::new(local)),
        })
    }

    /// Filter one chunk read from the wire.
    pub fn push(&mut self, chunk: &[u8]) -> FaxResult<Vec<u8>> {
        let raw = match self.inflate.as_mut() {
            Some(z) => {
                z.write_all(chunk).map_err(zlib_error)?;
                std::mem::take(z.get_mut())
            }
            None => chunk.to_vec(),
        };
        Ok(self.translate(&raw))
    }

    /// Flush whatever the filters still hold once the wire reached EOF.
    pub fn finish(&mut self) -> FaxResult<Vec<u8>> {
        let raw = match self.inflate.as_mut() {
            Some(z) => {
                z.try_finish().map_err(zlib_error)?;
                std::mem::take(z.get_mut())
            }
            None => Vec::new(),
        };
        let mut out = self.translate(&raw);
        if let Some(ascii) = self.ascii.as_mut() {
            ascii.finish(&mut out);
        }
        Ok(out)
    }

    fn translate(&mut self, raw: &[u8]) -> Vec<u8> {
        match self.ascii.as_mut() {
            Some(ascii) => {
                let mut out = Vec::with_capacity(raw.len() + raw.len() / 16);
                ascii.push(raw, &mut out);
                out
            }
            None => raw.to_vec(),
        }
    }
}

/// Filter chain for bytes headed to the data connection.
pub struct OutboundFilter {
    ascii: Option<CrlfExpander>,
    deflate: Option<ZlibEncoder<Vec<u8>>>,
}

impl OutboundFilter {
    pub fn new(ty: TransferType, mode: TransferMode) -> FaxResult<Self> {
        check_mode(mode)?;
        Ok(Self {
            ascii: (ty == TransferType::Ascii).then(CrlfExpander::default),
            deflate: (mode == TransferMode::Zlib)
                .then(|| ZlibEncoder::new(Vec::new(), Compression::default())),
        })
    }

    /// Filter one chunk read from the local source.
    pub fn push(&mut self, chunk: &[u8]) -> FaxResult<Vec<u8>> {
        let text = match self.ascii.as_mut() {
            Some(e) => {
                let mut out = Vec::with_capacity(chunk.len() + chunk.len() / 16);
                e.push(chunk, &mut out);
                out
            }
            None => chunk.to_vec(),
        };
        match self.deflate.as_mut() {
            Some(z) => {
                z.write_all(&text).map_err(zlib_error)?;
                Ok(std::mem::take(z.get_mut()))
            }
            None => Ok(text),
        }
    }

    /// Remaining wire bytes once the local source is exhausted.
    pub fn finish(&mut self) -> FaxResult<Vec<u8>> {
        match self.deflate.as_mut() {
            Some(z) => {
                z.try_finish().map_err(zlib_error)?;
                Ok(std::mem::take(z.get_mut()))
            }
            None => Ok(Vec::new()),
        }
    }
}
