//! Module `data_channel`
//!
//! Moves bytes between a local sink/source and the secondary data
//! connection of a single transfer. The channel is driven concurrently
//! with the control exchange that triggers it (`retr`, `stor`, ...), and
//! its socket is closed on every exit path: completion, error, or
//! cancellation.

use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::error::{FaxError, FaxResult};
use crate::protocol::{TransferMode, TransferType};
use crate::transfer::filters::{InboundFilter, LineEnding, OutboundFilter};
use crate::transfer::modes::DataEndpoint;
use crate::transfer::results::{TransferDirection, TransferEvent, TransferListener};

/// Progress is reported each time this many bytes accumulated.
pub const PROGRESS_THRESHOLD: u64 = 1024;

/// Default bound on waiting for the data connection.
pub const DEFAULT_DATA_TIMEOUT: Duration = Duration::from_secs(30);

const BUFFER_SIZE: usize = 8192;

// Data connection failures never poison the control connection.
fn data_error(e: std::io::Error) -> FaxError {
    FaxError::TransferFailed(e.to_string())
}

/// One-shot, idempotent cancellation shared between a transfer and
/// whoever may need to stop it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl CancelHandle {
    /// Request cancellation. Returns true only for the call that actually
    /// flipped the flag.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A single data transfer.
pub struct DataChannel {
    endpoint: DataEndpoint,
    transfer_type: TransferType,
    transfer_mode: TransferMode,
    line_ending: LineEnding,
    connect_timeout: Duration,
    cancel: CancelHandle,
    transferred: Arc<AtomicU64>,
    listeners: Vec<Arc<dyn TransferListener>>,
}

impl DataChannel {
    pub fn new(endpoint: DataEndpoint, transfer_type: TransferType, transfer_mode: TransferMode) -> Self {
        Self {
            endpoint,
            transfer_type,
            transfer_mode,
            line_ending: LineEnding::native(),
            connect_timeout: DEFAULT_DATA_TIMEOUT,
            cancel: CancelHandle::default(),
            transferred: Arc::new(AtomicU64::new(0)),
            listeners: Vec::new(),
        }
    }

    pub fn with_line_ending(mut self, line_ending: LineEnding) -> Self {
        self.line_ending = line_ending;
        self
    }

    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_listeners(mut self, listeners: Vec<Arc<dyn TransferListener>>) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Bytes moved so far, counted on the local side of the filters.
    pub fn bytes_transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Copy everything the server sends into `sink`.
    pub async fn receive<W>(self, sink: &mut W) -> FaxResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.run(TransferDirection::Get, self.receive_inner(sink)).await
    }

    /// Copy `source` to the server until it is exhausted.
    pub async fn send<R>(self, source: &mut R) -> FaxResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.run(TransferDirection::Put, self.send_inner(source)).await
    }

    async fn run<F>(&self, direction: TransferDirection, copy: F) -> FaxResult<u64>
    where
        F: std::future::Future<Output = FaxResult<u64>>,
    {
        self.emit(TransferEvent::Started { direction });

        // Dropping `copy` drops the socket, which unblocks the peer.
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FaxError::Cancelled),
            r = copy => r,
        };

        let bytes = self.bytes_transferred();
        match &result {
            Ok(bytes) => {
                debug!("Data transfer ({}) completed: {} bytes", direction, bytes);
                self.emit(TransferEvent::Completed { direction, bytes: *bytes });
            }
            Err(FaxError::Cancelled) => {
                info!("Data transfer ({}) cancelled after {} bytes", direction, bytes);
                self.emit(TransferEvent::Cancelled { direction, bytes });
            }
            Err(e) => {
                if !self.cancel.is_cancelled() {
                    warn!("Data transfer ({}) failed after {} bytes: {}", direction, bytes, e);
                }
                self.emit(TransferEvent::Failed {
                    direction,
                    bytes,
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    async fn connect(&self) -> FaxResult<TcpStream> {
        match &self.endpoint {
            DataEndpoint::Active(listener) => {
                match timeout(self.connect_timeout, listener.accept()).await {
                    Ok(Ok((stream, peer))) => {
                        debug!("Accepted data connection from {}", peer);
                        Ok(stream)
                    }
                    Ok(Err(e)) => Err(FaxError::TransferFailed(format!("accept failed: {}", e))),
                    Err(_) => Err(FaxError::TransferFailed(format!(
                        "no data connection within {:?}",
                        self.connect_timeout
                    ))),
                }
            }
            DataEndpoint::Passive(addr) => {
                match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => {
                        debug!("Opened data connection to {}", addr);
                        Ok(stream)
                    }
                    Ok(Err(e)) => Err(FaxError::TransferFailed(format!(
                        "connect to {} failed: {}",
                        addr, e
                    ))),
                    Err(_) => Err(FaxError::TransferFailed(format!(
                        "connect to {} timed out after {:?}",
                        addr, self.connect_timeout
                    ))),
                }
            }
        }
    }

    async fn receive_inner<W>(&self, sink: &mut W) -> FaxResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut filter = InboundFilter::new(self.transfer_type, self.transfer_mode, self.line_ending)?;
        let mut stream = self.connect().await?;
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut progress = Progress::new(TransferDirection::Get);

        loop {
            let n = stream.read(&mut buffer).await.map_err(data_error)?;
            if self.cancel.is_cancelled() {
                return Err(FaxError::Cancelled);
            }
            if n == 0 {
                break;
            }
            let out = filter.push(&buffer[..n])?;
            sink.write_all(&out).await.map_err(data_error)?;
            self.advance(&mut progress, out.len());
        }

        let tail = filter.finish()?;
        sink.write_all(&tail).await.map_err(data_error)?;
        sink.flush().await.map_err(data_error)?;
        self.advance(&mut progress, tail.len());
        Ok(self.bytes_transferred())
    }

    async fn send_inner<R>(&self, source: &mut R) -> FaxResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut filter = OutboundFilter::new(self.transfer_type, self.transfer_mode)?;
        let mut stream = self.connect().await?;
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut progress = Progress::new(TransferDirection::Put);

        loop {
            let n = source.read(&mut buffer).await.map_err(data_error)?;
            if self.cancel.is_cancelled() {
                return Err(FaxError::Cancelled);
            }
            if n == 0 {
                break;
            }
            let wire = filter.push(&buffer[..n])?;
            stream.write_all(&wire).await.map_err(data_error)?;
            self.advance(&mut progress, n);
        }

        let tail = filter.finish()?;
        stream.write_all(&tail).await.map_err(data_error)?;
        stream.flush().await.map_err(data_error)?;
        // EOF on the data connection marks the end of the file.
        stream.shutdown().await.map_err(data_error)?;
        Ok(self.bytes_transferred())
    }

    fn advance(&self, progress: &mut Progress, n: usize) {
        let total = self.transferred.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
        if let Some(event) = progress.update(n as u64, total) {
            self.emit(event);
        }
    }

    fn emit(&self, event: TransferEvent) {
        for listener in &self.listeners {
            listener.on_transfer_event(&event);
        }
    }
}

/// Tracks bytes since the last progress report.
struct Progress {
    direction: TransferDirection,
    since_report: u64,
}

impl Progress {
    fn new(direction: TransferDirection) -> Self {
        Self {
            direction,
            since_report: 0,
        }
    }

    fn update(&mut self, n: u64, total: u64) -> Option<TransferEvent> {
        self.since_report += n;
        if self.since_report >= PROGRESS_THRESHOLD {
            self.since_report = 0;
            Some(TransferEvent::Progress {
                direction: self.direction,
                bytes: total,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TransferEvent>>);

    impl TransferListener for Recorder {
        fn on_transfer_event(&self, event: &TransferEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn cancel_is_idempotent() {
        let handle = CancelHandle::default();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn passive_receive_reports_progress() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = server.accept().await.unwrap();
            s.write_all(&[7u8; 3000]).await.unwrap();
        });

        let recorder = Arc::new(Recorder::default());
        let channel = DataChannel::new(DataEndpoint::Passive(addr), TransferType::Image, TransferMode::Stream)
            .with_listeners(vec![recorder.clone() as Arc<dyn TransferListener>]);
        let mut sink = Vec::new();
        let n = channel.receive(&mut sink).await.unwrap();

        assert_eq!(n, 3000);
        assert_eq!(sink.len(), 3000);
        let events = recorder.0.lock().unwrap();
        assert!(matches!(events.first(), Some(TransferEvent::Started { .. })));
        assert!(events.iter().any(|e| matches!(e, TransferEvent::Progress { .. })));
        assert!(matches!(
            events.last(),
            Some(TransferEvent::Completed { bytes: 3000, .. })
        ));
    }

    #[tokio::test]
    async fn active_accept_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let channel = DataChannel::new(DataEndpoint::Active(listener), TransferType::Image, TransferMode::Stream)
            .with_timeout(Duration::from_millis(50));
        let mut sink = Vec::new();
        let err = channel.receive(&mut sink).await.unwrap_err();
        assert!(matches!(err, FaxError::TransferFailed(_)));
    }

    #[tokio::test]
    async fn cancel_unblocks_pending_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let channel = DataChannel::new(DataEndpoint::Active(listener), TransferType::Image, TransferMode::Stream);
        let handle = channel.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
            handle.cancel();
        });
        let mut sink = Vec::new();
        let started = std::time::Instant::now();
        let err = channel.receive(&mut sink).await.unwrap_err();
        assert!(matches!(err, FaxError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
