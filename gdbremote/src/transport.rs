/// Connection to the debug-monitor stub
///
/// Owns the single byte stream, performs framing and acks, and provides
/// the sequence lock that serializes request/response exchanges. The write
/// half has its own lock so the interrupt byte can go out while another
/// task is blocked waiting for a stop reply.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, MutexGuard};

use crate::codec::{self, Frame, PacketDecoder};

const HISTORY_CAPACITY: usize = 512;
const INTERRUPT_BYTE: u8 = 0x03;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("Connection closed")]
    Disconnected,
    #[error("Timed out waiting for a response")]
    Timeout,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Connection to {url} refused after {attempts} attempts")]
    Refused { url: String, attempts: u32 },
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Unexpected process state after connecting: {0}")]
    UnexpectedState(String),
    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InterruptError {
    #[error("Timed out waiting for the target to stop")]
    Timeout,
    #[error("Not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, TransportError>;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send + 'a>>;

/// Opens the byte stream for a connection URL.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, url: &'a str) -> ConnectFuture<'a>;
}

/// `connect://host:port` over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn parse_url(url: &str) -> Option<(String, u16)> {
        let pattern = Regex::new(r"^(?:connect://)?(?P<host>\[[^\]]+\]|[^:/]+):(?P<port>\d+)$").ok()?;
        let caps = pattern.captures(url)?;
        let host = caps["host"].trim_start_matches('[').trim_end_matches(']').to_string();
        let port = caps["port"].parse().ok()?;
        Some((host, port))
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, url: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            let (host, port) = Self::parse_url(url).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("unsupported url {}", url))
            })?;
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Where the current continue-class packet is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Stopped,
    /// Handed to the event loop, not yet written.
    Queued,
    /// On the wire; a stop reply is outstanding.
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub direction: Direction,
    pub payload: String,
}

pub(crate) struct PacketReader {
    half: ReadHalf<BoxedStream>,
    decoder: PacketDecoder,
}

/// Exclusive hold on the request/response sequence.
pub struct Sequence<'a> {
    transport: &'a Transport,
    reader: MutexGuard<'a, Option<PacketReader>>,
}

impl Sequence<'_> {
    pub async fn send(&mut self, payload: &str) -> Result<()> {
        if self.reader.is_none() {
            return Err(TransportError::NotConnected);
        }
        self.transport.write_packet(payload).await
    }

    /// Next packet from the stub. `None` waits until the connection closes.
    pub async fn read(&mut self, timeout: Option<Duration>) -> Result<String> {
        let transport = self.transport;
        let reader = self.reader.as_mut().ok_or(TransportError::NotConnected)?;
        transport.read_packet(reader, timeout).await
    }

    pub async fn exchange(&mut self, payload: &str, timeout: Duration) -> Result<String> {
        self.send(payload).await?;
        self.read(Some(timeout)).await
    }

    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.transport.write_raw(bytes).await
    }
}

pub struct Transport {
    reader: tokio::sync::Mutex<Option<PacketReader>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    state: Mutex<ConnectionState>,
    no_ack: AtomicBool,
    run_phase: watch::Sender<RunPhase>,
    last_sent: Mutex<Vec<u8>>,
    stop_seq: watch::Sender<u64>,
    closed: watch::Sender<bool>,
    history: Mutex<VecDeque<HistoryEntry>>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        let (stop_seq, _) = watch::channel(0);
        let (closed, _) = watch::channel(true);
        let (run_phase, _) = watch::channel(RunPhase::Stopped);
        Self {
            reader: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            no_ack: AtomicBool::new(false),
            run_phase,
            last_sent: Mutex::new(Vec::new()),
            stop_seq,
            closed,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    /// Try `connector` up to `retry_budget` times, sleeping `retry_interval`
    /// between attempts.
    pub async fn connect(
        &self,
        connector: &dyn Connector,
        url: &str,
        retry_budget: u32,
        retry_interval: Duration,
    ) -> std::result::Result<(), ConnectError> {
        let budget = retry_budget.max(1);
        self.set_state(ConnectionState::Connecting);

        let mut attempts = 0;
        loop {
            attempts += 1;
            match connector.connect(url).await {
                Ok(stream) => {
                    log::debug!("Connected to {} after {} attempt(s)", url, attempts);
                    self.attach_stream(stream).await;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(ConnectError::InvalidUrl(url.to_string()));
                }
                Err(e) => {
                    log::debug!("Connect attempt {} to {} failed: {}", attempts, url, e);
                    if attempts >= budget {
                        self.set_state(ConnectionState::Disconnected);
                        return Err(ConnectError::Refused { url: url.to_string(), attempts });
                    }
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    }

    /// Adopt an already-open stream as the connection.
    pub async fn attach_stream(&self, stream: BoxedStream) {
        let (read_half, write_half) = tokio::io::split(stream);
        *self.reader.lock().await = Some(PacketReader { half: read_half, decoder: PacketDecoder::new() });
        *self.writer.lock().await = Some(write_half);
        self.no_ack.store(false, Ordering::SeqCst);
        self.run_phase.send_replace(RunPhase::Stopped);
        self.set_state(ConnectionState::Connected);
        self.closed.send_replace(false);
    }

    /// Initial ack exchange, then try to switch to no-ack mode.
    pub async fn handshake(&self, timeout: Duration) -> std::result::Result<(), ConnectError> {
        let result = async {
            let mut seq = self.lock_sequence().await;
            seq.send_raw(b"+").await?;
            let response = seq.exchange(&codec::Packet::StartNoAckMode.to_string(), timeout).await?;
            if codec::is_ok(&response) {
                self.no_ack.store(true, Ordering::SeqCst);
                log::debug!("Switched to no-ack mode");
            }
            Ok::<_, TransportError>(())
        }
        .await;

        if let Err(e) = result {
            log::error!("Handshake failed: {}", e);
            self.disconnect().await;
            return Err(ConnectError::HandshakeFailed(e.to_string()));
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        log::debug!("Disconnecting");
        self.mark_disconnected();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }

    /// Send the out-of-band interrupt and wait for the resulting stop.
    ///
    /// A continue that is still queued is waited for first so the interrupt
    /// never overtakes it. Returns `Ok(false)` when nothing was running.
    pub async fn send_interrupt(&self, timeout: Duration) -> std::result::Result<bool, InterruptError> {
        if !self.is_connected() {
            return Err(InterruptError::NotConnected);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let mut stops = self.stop_seq.subscribe();
        let mut phase = self.run_phase.subscribe();
        let current = match tokio::time::timeout_at(deadline, phase.wait_for(|p| *p != RunPhase::Queued)).await {
            Ok(Ok(current)) => *current,
            Ok(Err(_)) => return Err(InterruptError::NotConnected),
            Err(_) => return Err(InterruptError::Timeout),
        };
        match current {
            RunPhase::Running => {}
            // The continue came back on its own while we waited.
            _ if stops.has_changed().unwrap_or(false) => return Ok(true),
            _ => return Ok(false),
        }

        log::debug!("SEND: interrupt");
        self.record(Direction::Send, "\\x03");
        if self.write_raw(&[INTERRUPT_BYTE]).await.is_err() {
            return Err(InterruptError::NotConnected);
        }

        match tokio::time::timeout_at(deadline, stops.changed()).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => Err(InterruptError::NotConnected),
            Err(_) => Err(InterruptError::Timeout),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.state.lock().unwrap() == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// True from the moment a continue is queued until its stop reply.
    pub fn is_running(&self) -> bool {
        *self.run_phase.borrow() != RunPhase::Stopped
    }

    pub fn run_phase(&self) -> RunPhase {
        *self.run_phase.borrow()
    }

    pub fn is_no_ack(&self) -> bool {
        self.no_ack.load(Ordering::SeqCst)
    }

    pub(crate) fn set_no_ack(&self, no_ack: bool) {
        self.no_ack.store(no_ack, Ordering::SeqCst);
    }

    pub(crate) fn set_run_phase(&self, phase: RunPhase) {
        self.run_phase.send_replace(phase);
    }

    /// Record that a stop reply arrived for the in-flight continue.
    pub(crate) fn mark_stopped(&self) {
        self.mark_stopped_into(RunPhase::Stopped);
    }

    /// Like `mark_stopped`, but leave the phase at `next` for a continue
    /// that is reissued straight away.
    pub(crate) fn mark_stopped_into(&self, next: RunPhase) {
        self.run_phase.send_replace(next);
        self.stop_seq.send_modify(|seq| *seq += 1);
    }

    /// Watch that flips to `true` when the connection goes away.
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub async fn lock_sequence(&self) -> Sequence<'_> {
        Sequence { transport: self, reader: self.reader.lock().await }
    }

    pub fn try_lock_sequence(&self) -> Option<Sequence<'_>> {
        self.reader.try_lock().ok().map(|reader| Sequence { transport: self, reader })
    }

    pub fn packet_history(&self) -> Vec<HistoryEntry> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    pub async fn dump_packet_history(&self, path: &Path) -> io::Result<()> {
        let mut text = String::new();
        for entry in self.packet_history() {
            let direction = match entry.direction {
                Direction::Send => "send",
                Direction::Recv => "read",
            };
            text.push_str(&format!("{} packet: {}\n", direction, entry.payload));
        }
        tokio::fs::write(path, text).await
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn mark_disconnected(&self) {
        self.set_state(ConnectionState::Disconnected);
        self.run_phase.send_replace(RunPhase::Stopped);
        self.closed.send_replace(true);
    }

    fn record(&self, direction: Direction, payload: &str) {
        let mut history = self.history.lock().unwrap();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(HistoryEntry { direction, payload: payload.to_string() });
    }

    async fn write_packet(&self, payload: &str) -> Result<()> {
        let frame = codec::frame_packet(payload);
        log::debug!("SEND: {}", payload);
        self.record(Direction::Send, payload);
        *self.last_sent.lock().unwrap() = frame.clone();
        self.write_raw(&frame).await
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let half = writer.as_mut().ok_or(TransportError::NotConnected)?;
        let written = async {
            half.write_all(bytes).await?;
            half.flush().await
        }
        .await;
        if let Err(e) = written {
            log::error!("Write to stub failed: {}", e);
            drop(writer);
            self.mark_disconnected();
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_packet(&self, reader: &mut PacketReader, timeout: Option<Duration>) -> Result<String> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut closed = self.closed.subscribe();
        let mut chunk = [0u8; 1024];

        loop {
            while let Some(frame) = reader.decoder.next_frame() {
                match frame {
                    Ok(Frame::Ack) | Ok(Frame::Interrupt) => {}
                    Ok(Frame::Nack) => {
                        log::debug!("RECV: nack, resending last packet");
                        let last = self.last_sent.lock().unwrap().clone();
                        if !last.is_empty() {
                            self.write_raw(&last).await?;
                        }
                    }
                    Ok(Frame::Packet(payload)) => {
                        if !self.is_no_ack() {
                            self.write_raw(b"+").await?;
                        }
                        log::debug!("RECV: {}", payload);
                        self.record(Direction::Recv, &payload);
                        return Ok(payload);
                    }
                    Ok(Frame::Notification(payload)) => {
                        log::debug!("RECV notification: {}", payload);
                    }
                    Err(e) => {
                        log::warn!("Dropping bad frame: {}", e);
                        if !self.is_no_ack() {
                            self.write_raw(b"-").await?;
                        }
                    }
                }
            }

            let n = match deadline {
                Some(deadline) => tokio::select! {
                    r = tokio::time::timeout_at(deadline, reader.half.read(&mut chunk)) => {
                        r.map_err(|_| TransportError::Timeout)??
                    }
                    _ = closed.wait_for(|closed| *closed) => return Err(TransportError::Disconnected),
                },
                None => tokio::select! {
                    r = reader.half.read(&mut chunk) => r?,
                    _ = closed.wait_for(|closed| *closed) => return Err(TransportError::Disconnected),
                },
            };

            if n == 0 {
                log::debug!("RECV: connection closed by stub");
                self.mark_disconnected();
                return Err(TransportError::Disconnected);
            }
            reader.decoder.push(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    struct RefusingConnector {
        attempts: AtomicU32,
    }

    impl Connector for RefusingConnector {
        fn connect<'a>(&'a self, _url: &'a str) -> ConnectFuture<'a> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")) })
        }
    }

    #[test]
    fn test_parse_url() {
        assert_eq!(TcpConnector::parse_url("connect://localhost:1234"), Some(("localhost".into(), 1234)));
        assert_eq!(TcpConnector::parse_url("127.0.0.1:99"), Some(("127.0.0.1".into(), 99)));
        assert_eq!(TcpConnector::parse_url("connect://[::1]:7"), Some(("::1".into(), 7)));
        assert_eq!(TcpConnector::parse_url("connect://nohost"), None);
    }

    #[tokio::test]
    async fn test_connect_exhausts_budget() {
        let transport = Transport::new();
        let connector = RefusingConnector { attempts: AtomicU32::new(0) };
        let err = transport
            .connect(&connector, "connect://localhost:1", 4, Duration::from_millis(1))
            .await
            .unwrap_err();
        match err {
            ConnectError::Refused { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("Expected refused, got {:?}", other),
        }
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_enables_no_ack() {
        let stream = tokio_test::io::Builder::new()
            .write(b"+")
            .write(b"$QStartNoAckMode#b0")
            .read(b"+$OK#9a")
            .write(b"+")
            .build();
        let transport = Transport::new();
        transport.attach_stream(Box::new(stream)).await;
        transport.handshake(Duration::from_secs(1)).await.unwrap();
        assert!(transport.is_no_ack());
        assert_eq!(transport.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_handshake_failure_disconnects() {
        let stream = tokio_test::io::Builder::new()
            .write(b"+")
            .write(b"$QStartNoAckMode#b0")
            .build();
        let transport = Transport::new();
        transport.attach_stream(Box::new(stream)).await;
        let err = transport.handshake(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ConnectError::HandshakeFailed(_)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_resends_on_nack() {
        let stream = tokio_test::io::Builder::new()
            .write(b"$?#3f")
            .read(b"-")
            .write(b"$?#3f")
            .read(b"$T05#b9")
            .build();
        let transport = Transport::new();
        transport.attach_stream(Box::new(stream)).await;
        transport.set_no_ack(true);
        let mut seq = transport.lock_sequence().await;
        let reply = seq.exchange("?", Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, "T05");
    }

    #[tokio::test]
    async fn test_interrupt_when_idle_is_noop() {
        let (client, _stub) = tokio::io::duplex(64);
        let transport = Transport::new();
        transport.attach_stream(Box::new(client)).await;
        assert_eq!(transport.send_interrupt(Duration::from_millis(10)).await, Ok(false));
    }

    #[tokio::test]
    async fn test_interrupt_times_out_without_stop() {
        let (client, mut stub) = tokio::io::duplex(64);
        let transport = Arc::new(Transport::new());
        transport.attach_stream(Box::new(client)).await;
        transport.set_run_phase(RunPhase::Running);

        let result = transport.send_interrupt(Duration::from_millis(20)).await;
        assert_eq!(result, Err(InterruptError::Timeout));

        let mut byte = [0u8; 1];
        stub.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte[0], INTERRUPT_BYTE);
    }

    #[tokio::test]
    async fn test_interrupt_waits_for_queued_continue() {
        let (client, mut stub) = tokio::io::duplex(64);
        let transport = Arc::new(Transport::new());
        transport.attach_stream(Box::new(client)).await;
        transport.set_run_phase(RunPhase::Queued);
        assert!(transport.is_running());

        let interrupting = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.send_interrupt(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!interrupting.is_finished());

        // the continue goes out, then the interrupt, then the stop reply
        transport.set_run_phase(RunPhase::Running);
        let mut byte = [0u8; 1];
        stub.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte[0], INTERRUPT_BYTE);
        transport.mark_stopped();

        assert_eq!(interrupting.await.unwrap(), Ok(true));
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_queued_continue_that_stops_needs_no_interrupt() {
        let (client, _stub) = tokio::io::duplex(64);
        let transport = Arc::new(Transport::new());
        transport.attach_stream(Box::new(client)).await;
        transport.set_run_phase(RunPhase::Queued);

        let interrupting = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.send_interrupt(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.mark_stopped();

        assert_eq!(interrupting.await.unwrap(), Ok(true));
        assert!(transport.packet_history().is_empty());
    }

    #[tokio::test]
    async fn test_history_is_recorded() {
        let stream = tokio_test::io::Builder::new()
            .write(b"$qC#b4")
            .read(b"$QC1234#5e")
            .build();
        let transport = Transport::new();
        transport.attach_stream(Box::new(stream)).await;
        transport.set_no_ack(true);
        transport.lock_sequence().await.exchange("qC", Duration::from_secs(1)).await.unwrap();

        let history = transport.packet_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].direction, Direction::Send);
        assert_eq!(history[1].payload, "QC1234");
    }
}
