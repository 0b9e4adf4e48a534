//! Module `state`
//!
//! Defines `ProtocolSession`, one control connection to a fax server,
//! along with the per-session options and the connection lifecycle.

use log::{debug, info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{FaxError, FaxResult};
use crate::protocol::responses::{CONNECT_WARNING, GOODBYE, READY};
use crate::protocol::{Charset, Command, TransferMode, TransferType, WireCodec};
use crate::transfer::{LineEnding, PassiveDescriptor, TransferListener};

/// Settings a session is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Bound on every control-channel read and write.
    pub control_timeout: Duration,
    /// Bound on establishing a data connection.
    pub data_timeout: Duration,
    /// Use passive data connections instead of active ones.
    pub passive: bool,
    pub charset: Charset,
    /// Line ending ASCII transfers translate to and from.
    pub line_ending: LineEnding,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            control_timeout: Duration::from_secs(10),
            data_timeout: Duration::from_secs(30),
            passive: true,
            charset: Charset::Utf8,
            line_ending: LineEnding::native(),
        }
    }
}

/// A control connection to a fax server.
///
/// Every command takes `&mut self`, so a session never has more than one
/// exchange in flight. Share it through
/// `Arc<tokio::sync::Mutex<ProtocolSession>>` when several tasks need it.
pub struct ProtocolSession {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) options: SessionOptions,
    pub(crate) codec: WireCodec,
    pub(crate) local_addr: SocketAddr,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) transfer_type: TransferType,
    pub(crate) transfer_mode: TransferMode,
    pub(crate) passive_cache: Option<PassiveDescriptor>,
    pub(crate) current_job: Option<u64>,
    pub(crate) transfer_listeners: Vec<Arc<dyn TransferListener>>,
}

impl ProtocolSession {
    /// Connect to `host:port` and consume the greeting.
    ///
    /// Any number of `130` warning replies may precede the `220` greeting.
    pub async fn open(host: &str, port: u16, options: SessionOptions) -> FaxResult<Self> {
        let stream = match timeout(options.control_timeout, TcpStream::connect((host, port))).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(FaxError::Timeout(format!(
                    "connect to {}:{} after {:?}",
                    host, port, options.control_timeout
                )));
            }
        };
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let mut codec = WireCodec::from_tcp(stream, options.control_timeout, options.charset);

        loop {
            let greeting = codec.read_response().await?;
            match greeting.code {
                CONNECT_WARNING => debug!("{}:{} warns: {}", host, port, greeting.message()),
                READY => break,
                code => return Err(FaxError::unexpected(code, greeting.text())),
            }
        }

        info!("Connected to fax server {}:{}", host, port);
        Ok(Self {
            host: host.to_string(),
            port,
            options,
            codec,
            local_addr,
            peer_addr,
            // RFC 959 defaults until told otherwise
            transfer_type: TransferType::default(),
            transfer_mode: TransferMode::default(),
            passive_cache: None,
            current_job: None,
            transfer_listeners: Vec::new(),
        })
    }

    /// Say goodbye to the server. The session is unusable afterwards.
    pub async fn quit(&mut self) -> FaxResult<()> {
        self.codec.expect(Command::Quit, &[], &[GOODBYE]).await?;
        debug!("Closed session to {}:{}", self.host, self.port);
        Ok(())
    }

    /// `quit` and drop the connection.
    pub async fn close(mut self) -> FaxResult<()> {
        self.quit().await
    }

    // --------------------
    // Getter methods
    // --------------------

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Local address of the control connection; active data listeners
    /// bind to the same interface.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the server end of the control connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    pub fn transfer_mode(&self) -> TransferMode {
        self.transfer_mode
    }

    pub fn is_passive(&self) -> bool {
        self.options.passive
    }

    /// The passive endpoint kept from the last `pasv`, if any.
    pub fn passive_cache(&self) -> Option<PassiveDescriptor> {
        self.passive_cache
    }

    /// Job the server applies `jparm` and friends to. `None` is the
    /// server's default job.
    pub fn current_job(&self) -> Option<u64> {
        self.current_job
    }

    // --------------------
    // Setter methods
    // --------------------

    pub fn set_passive(&mut self, passive: bool) {
        self.options.passive = passive;
    }

    pub fn set_line_ending(&mut self, line_ending: LineEnding) {
        self.options.line_ending = line_ending;
    }

    pub fn set_charset(&mut self, charset: Charset) {
        self.options.charset = charset;
        self.codec.set_charset(charset);
    }

    pub fn set_control_timeout(&mut self, control_timeout: Duration) {
        self.options.control_timeout = control_timeout;
        self.codec.set_timeout(control_timeout);
    }

    pub fn set_data_timeout(&mut self, data_timeout: Duration) {
        self.options.data_timeout = data_timeout;
    }

    pub fn add_transfer_listener(&mut self, listener: Arc<dyn TransferListener>) {
        self.transfer_listeners.push(listener);
    }

    pub fn remove_transfer_listener(&mut self, listener: &Arc<dyn TransferListener>) {
        self.transfer_listeners
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }
}
