//! Control-channel codec
//!
//! Writes `verb arg1 arg2\r\n` commands and reads single- and multi-line
//! numeric replies. Every read and write is bounded by the control
//! timeout. There is no retry at this layer.

use log::trace;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{FaxError, FaxResult};
use crate::protocol::commands::{Charset, Command};
use crate::protocol::parser::parse_code;
use crate::protocol::responses::{FILE_NOT_FOUND, Response};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct WireCodec {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    timeout: Duration,
    charset: Charset,
}

impl WireCodec {
    pub fn new<R, W>(reader: R, writer: W, timeout: Duration, charset: Charset) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: BufReader::new(Box::new(reader) as BoxedReader),
            writer: Box::new(writer),
            timeout,
            charset,
        }
    }

    pub fn from_tcp(stream: TcpStream, timeout: Duration, charset: Charset) -> Self {
        let (rd, wr) = stream.into_split();
        Self::new(rd, wr, timeout, charset)
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn set_charset(&mut self, charset: Charset) {
        self.charset = charset;
    }

    /// Write one command line and flush it.
    pub async fn send_command(&mut self, command: Command, args: &[&str]) -> FaxResult<()> {
        let mut line = String::from(command.wire_name());
        for arg in args.iter().filter(|a| !a.is_empty()) {
            line.push(' ');
            line.push_str(arg);
        }

        if command.is_secret() {
            trace!(">>> {} ****", command);
        } else {
            trace!(">>> {}", line);
        }

        line.push_str("\r\n");
        let bytes = self.charset.encode(&line);
        let limit = self.timeout;
        let writer = &mut self.writer;
        let write = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        match timeout(limit, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(FaxError::Timeout(format!("write after {:?}", limit))),
        }
    }

    /// Read one line, without its terminator. End of stream is a
    /// transport error.
    async fn read_line(&mut self) -> FaxResult<String> {
        let mut buf = Vec::new();
        let reader = &mut self.reader;
        let limit = self.timeout;
        let n = match timeout(limit, reader.read_until(b'\n', &mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Err(FaxError::Timeout(format!("read after {:?}", limit))),
        };
        if n == 0 {
            return Err(FaxError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the control connection",
            )));
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(self.charset.decode(&buf))
    }

    /// Read a complete reply.
    ///
    /// Multi-line replies carry `-` in the fourth column on every line but
    /// the last, which repeats the code followed by a space:
    /// ```text
    /// 213-first
    /// 213-second
    /// 213 End
    /// ```
    /// Empty lines are skipped.
    pub async fn read_response(&mut self) -> FaxResult<Response> {
        let first = loop {
            let line = self.read_line().await?;
            if !line.is_empty() {
                break line;
            }
        };

        let code = parse_code(&first).ok_or_else(|| FaxError::mangled(first.clone()))?;
        let multi = first.len() >= 4 && first.as_bytes()[3] == b'-';
        let mut lines = vec![first];

        if multi {
            let code_str = code.to_string();
            let terminator = format!("{} ", code_str);
            loop {
                let line = self.read_line().await?;
                if line.is_empty() {
                    continue;
                }
                let done = line.starts_with(&terminator) || line == code_str;
                lines.push(line);
                if done {
                    break;
                }
            }
        }

        let resp = Response { code, lines };
        trace!("<<< {}", resp.text());
        Ok(resp)
    }

    /// Send a command and return whatever reply comes back.
    pub async fn execute(&mut self, command: Command, args: &[&str]) -> FaxResult<Response> {
        self.send_command(command, args).await?;
        self.read_response().await
    }

    /// Send a command and require one of the `accepted` codes.
    pub async fn expect(
        &mut self,
        command: Command,
        args: &[&str],
        accepted: &[u16],
    ) -> FaxResult<Response> {
        let resp = self.execute(command, args).await?;
        check(command, resp, accepted)
    }

    /// Read the next reply and require one of the `accepted` codes.
    pub async fn expect_next(&mut self, command: Command, accepted: &[u16]) -> FaxResult<Response> {
        let resp = self.read_response().await?;
        check(command, resp, accepted)
    }
}

/// Validate a reply code against the accepted set for `command`.
pub fn check(command: Command, resp: Response, accepted: &[u16]) -> FaxResult<Response> {
    if accepted.contains(&resp.code) {
        return Ok(resp);
    }
    if resp.code == FILE_NOT_FOUND && command.reports_not_found() {
        return Err(FaxError::NotFound(resp.text()));
    }
    Err(FaxError::unexpected(resp.code, resp.text()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    fn codec_over(input: &'static [u8]) -> WireCodec {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            server.write_all(input).await.unwrap();
            server.shutdown().await.unwrap();
            // keep our end alive so client writes do not fail
            let mut sink = Vec::new();
            let _ = server.read_to_end(&mut sink).await;
        });
        let (rd, wr) = tokio::io::split(client);
        WireCodec::new(rd, wr, Duration::from_secs(2), Charset::Utf8)
    }

    #[tokio::test]
    async fn multi_line_reply_is_accumulated() {
        let mut codec = codec_over(b"213-PS docq/doc1.ps\r\n213-TIFF docq/doc2.tif\r\n213 End of documents.\r\n");
        let resp = codec.read_response().await.unwrap();
        assert_eq!(resp.code, 213);
        assert_eq!(resp.lines.len(), 3);
        assert!(resp.text().contains("docq/doc2.tif"));
    }

    #[tokio::test]
    async fn empty_lines_are_skipped() {
        let mut codec = codec_over(b"\r\n\r\n200 OK\r\n");
        let resp = codec.read_response().await.unwrap();
        assert_eq!(resp.code, 200);
        assert_eq!(resp.lines, vec!["200 OK".to_string()]);
    }

    #[tokio::test]
    async fn continuation_with_other_code_does_not_terminate() {
        let mut codec = codec_over(b"220-hello\r\n221 not yet\r\n220 done\r\n");
        let resp = codec.read_response().await.unwrap();
        assert_eq!(resp.code, 220);
        assert_eq!(resp.lines.len(), 3);
    }

    #[tokio::test]
    async fn garbage_reply_is_a_protocol_error() {
        let mut codec = codec_over(b"hello there\r\n");
        let err = codec.read_response().await.unwrap_err();
        assert!(matches!(err, FaxError::Protocol { code: None, .. }));
    }

    #[tokio::test]
    async fn closed_stream_is_a_transport_error() {
        let mut codec = codec_over(b"");
        let err = codec.read_response().await.unwrap_err();
        assert!(matches!(err, FaxError::Transport(_)));
    }

    #[test]
    fn not_found_only_for_path_commands() {
        let resp = Response {
            code: 550,
            lines: vec!["550 No such file".into()],
        };
        assert!(matches!(
            check(Command::Size, resp.clone(), &[213]),
            Err(FaxError::NotFound(msg)) if msg.contains("550 No such file")
        ));
        assert!(matches!(
            check(Command::Jparm, resp, &[213]),
            Err(FaxError::Protocol { code: Some(550), .. })
        ));
    }
}
