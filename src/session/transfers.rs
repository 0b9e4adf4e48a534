//! Session data transfers
//!
//! `retr`, `stor`, `stou`, `stot`, `list` and `nlst`. Each transfer runs
//! its data channel concurrently with the control exchange and waits for
//! both before returning.

use log::debug;
use std::net::{SocketAddr, SocketAddrV4};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::error::handlers::log_suppressed;
use crate::error::{FaxError, FaxResult};
use crate::protocol::parser::{format_host_port, parse_file_name, parse_host_port};
use crate::protocol::responses::{DATA_OPENING, OK, PASSIVE, TRANSFER_COMPLETE};
use crate::protocol::{Command, Response};
use crate::session::ProtocolSession;
use crate::transfer::{CancelHandle, DataChannel, DataEndpoint, PassiveDescriptor};

/// Some servers answer `125` instead of `150` when the data connection is
/// already open.
const DATA_ALREADY_OPEN: u16 = 125;

impl ProtocolSession {
    /// Passive endpoint of the server.
    ///
    /// Reuses the address from the last `pasv` until a transfer attempt
    /// clears it; only then is a fresh `pasv` sent.
    pub async fn pasv(&mut self) -> FaxResult<SocketAddr> {
        if let Some(cached) = self.passive_cache {
            debug!("Reusing passive endpoint {}", cached.address);
            return Ok(cached.address);
        }
        let resp = self.codec.expect(Command::Pasv, &[], &[PASSIVE]).await?;
        let address = parse_host_port(&resp.text())?;
        self.passive_cache = Some(PassiveDescriptor::new(address));
        Ok(address)
    }

    /// Tell the server where to connect for the next transfer.
    pub async fn set_data_port(&mut self, address: SocketAddrV4) -> FaxResult<()> {
        let arg = format_host_port(&address);
        self.codec.expect(Command::Port, &[&arg], &[OK]).await?;
        Ok(())
    }

    /// Download `path` into `sink`. Returns the bytes written to `sink`.
    pub async fn get<W>(&mut self, path: &str, sink: &mut W) -> FaxResult<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let (_, bytes) = self.transfer_in(Command::Retr, &[path], sink).await?;
        Ok(bytes)
    }

    /// Upload `source` as `path`. Returns the bytes read from `source`.
    pub async fn put<R>(&mut self, source: &mut R, path: &str) -> FaxResult<u64>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let (_, bytes) = self.transfer_out(Command::Stor, &[path], source).await?;
        Ok(bytes)
    }

    /// Upload `source` under a name the server picks, returned on success.
    pub async fn put_unique<R>(&mut self, source: &mut R) -> FaxResult<String>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let (opening, _) = self.transfer_out(Command::Stou, &[], source).await?;
        parse_file_name(&opening.text())
    }

    /// Like `put_unique`, but the server removes the file once no job
    /// refers to it.
    pub async fn put_temporary<R>(&mut self, source: &mut R) -> FaxResult<String>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let (opening, _) = self.transfer_out(Command::Stot, &[], source).await?;
        parse_file_name(&opening.text())
    }

    /// Long listing of `path`, or of the current directory.
    pub async fn list(&mut self, path: Option<&str>) -> FaxResult<Vec<String>> {
        self.listing(Command::List, path).await
    }

    /// Names only.
    pub async fn nlst(&mut self, path: Option<&str>) -> FaxResult<Vec<String>> {
        self.listing(Command::Nlst, path).await
    }

    async fn listing(&mut self, command: Command, path: Option<&str>) -> FaxResult<Vec<String>> {
        let mut raw = Vec::new();
        let args = path.map(|p| vec![p]).unwrap_or_default();
        self.transfer_in(command, &args, &mut raw).await?;
        Ok(self
            .options
            .charset
            .decode(&raw)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn open_endpoint(&mut self) -> FaxResult<DataEndpoint> {
        if self.options.passive {
            return Ok(DataEndpoint::Passive(self.pasv().await?));
        }

        let ip = match self.local_addr {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => {
                return Err(FaxError::InvalidArgument(
                    "active transfers need an IPv4 control connection".to_string(),
                ));
            }
        };
        let listener = TcpListener::bind(SocketAddrV4::new(ip, 0)).await?;
        let bound = match listener.local_addr()? {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => SocketAddrV4::new(ip, 0),
        };
        self.set_data_port(bound).await?;
        Ok(DataEndpoint::Active(listener))
    }

    fn data_channel(&self, endpoint: DataEndpoint) -> DataChannel {
        DataChannel::new(endpoint, self.transfer_type, self.transfer_mode)
            .with_line_ending(self.options.line_ending)
            .with_timeout(self.options.data_timeout)
            .with_listeners(self.transfer_listeners.clone())
    }

    async fn transfer_in<W>(
        &mut self,
        command: Command,
        args: &[&str],
        sink: &mut W,
    ) -> FaxResult<(Response, u64)>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let endpoint = match self.open_endpoint().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.passive_cache = None;
                return Err(e);
            }
        };
        let channel = self.data_channel(endpoint);
        let cancel = channel.cancel_handle();
        let (done_tx, done_rx) = oneshot::channel();

        let data = async move {
            let result = channel.receive(sink).await;
            let _ = done_tx.send(());
            result
        };
        let control = self.control_exchange(command, args, cancel, done_rx);
        let (control, data) = tokio::join!(control, data);
        self.passive_cache = None;
        settle(command, control, data)
    }

    async fn transfer_out<R>(
        &mut self,
        command: Command,
        args: &[&str],
        source: &mut R,
    ) -> FaxResult<(Response, u64)>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let endpoint = match self.open_endpoint().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.passive_cache = None;
                return Err(e);
            }
        };
        let channel = self.data_channel(endpoint);
        let cancel = channel.cancel_handle();
        let (done_tx, done_rx) = oneshot::channel();

        let data = async move {
            let result = channel.send(source).await;
            let _ = done_tx.send(());
            result
        };
        let control = self.control_exchange(command, args, cancel, done_rx);
        let (control, data) = tokio::join!(control, data);
        self.passive_cache = None;
        settle(command, control, data)
    }

    /// The control half of a transfer: the preliminary reply, then the
    /// completion reply once the data half has finished. Any failure
    /// cancels the data half.
    async fn control_exchange(
        &mut self,
        command: Command,
        args: &[&str],
        cancel: CancelHandle,
        data_done: oneshot::Receiver<()>,
    ) -> FaxResult<Response> {
        let codec = &mut self.codec;
        let exchange = async {
            let opening = codec
                .expect(command, args, &[DATA_ALREADY_OPEN, DATA_OPENING])
                .await?;
            let _ = data_done.await;
            codec.expect_next(command, &[TRANSFER_COMPLETE]).await?;
            Ok::<_, FaxError>(opening)
        };
        let result = exchange.await;
        if result.is_err() {
            cancel.cancel();
        }
        result
    }
}

/// Combine the two halves of a transfer. A control failure wins; data
/// errors that follow it are only logged.
fn settle(
    command: Command,
    control: FaxResult<Response>,
    data: FaxResult<u64>,
) -> FaxResult<(Response, u64)> {
    match (control, data) {
        (Ok(opening), Ok(bytes)) => Ok((opening, bytes)),
        (Err(e), Ok(_)) => Err(e),
        (Err(e), Err(data_err)) => {
            log_suppressed(command.wire_name(), &data_err);
            Err(e)
        }
        (Ok(_), Err(e)) => Err(e),
    }
}
