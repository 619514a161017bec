/// Request/response engine over the stub connection
///
/// One typed method per remote capability. Every method builds a packet
/// with the codec, sends it under the sequence lock, and decodes the reply
/// into `Ok`, a stub-reported error, "unsupported", or "not connected".
/// Capability probes are cached until the next reset.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::codec::{self, Packet, ResponseKind};
use crate::transport::{InterruptError, RunPhase, Transport, TransportError};
use crate::types::{
    Addr, HostInfo, LazyBool, MemoryPermissions, Pid, RegisterInfo, StoppointKind, ThreadId, VContSupport,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Stub reported error 0x{0:02x}")]
    Reported(u8),
    #[error("Packet not supported by the stub")]
    Unsupported,
    #[error("Not connected")]
    NotConnected,
    #[error("Unexpected response: {0:?}")]
    Malformed(String),
    #[error("Packet sequence busy")]
    Busy,
    #[error("Timed out waiting for a response")]
    Timeout,
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
}

impl From<TransportError> for RemoteError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => RemoteError::Timeout,
            TransportError::NotConnected | TransportError::Disconnected | TransportError::Io(_) => {
                RemoteError::NotConnected
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Map a reply that should be `OK`.
fn expect_ok(response: &str) -> Result<()> {
    match codec::classify(response) {
        ResponseKind::Ok => Ok(()),
        ResponseKind::Error(code) => Err(RemoteError::Reported(code)),
        ResponseKind::Unsupported => Err(RemoteError::Unsupported),
        ResponseKind::Normal => Err(RemoteError::Malformed(response.to_string())),
    }
}

/// Map a reply that should carry data.
fn expect_normal(response: String) -> Result<String> {
    match codec::classify(&response) {
        ResponseKind::Normal => Ok(response),
        ResponseKind::Error(code) => Err(RemoteError::Reported(code)),
        ResponseKind::Unsupported => Err(RemoteError::Unsupported),
        ResponseKind::Ok => Err(RemoteError::Malformed(response)),
    }
}

fn parse_key_values(response: &str) -> impl Iterator<Item = (&str, &str)> {
    response
        .split(';')
        .filter_map(|pair| pair.split_once(':'))
}

pub(crate) fn parse_register_info(regnum: u32, response: &str) -> Result<RegisterInfo> {
    let mut info = RegisterInfo { regnum, ..Default::default() };
    let mut saw_name = false;
    for (key, value) in parse_key_values(response) {
        let number = |v: &str| v.parse::<u32>().map_err(|_| RemoteError::Malformed(response.to_string()));
        match key {
            "name" => {
                info.name = value.to_string();
                saw_name = true;
            }
            "alt-name" => info.alt_name = Some(value.to_string()),
            "bitsize" => info.bitsize = number(value)?,
            "offset" => info.offset = number(value)?,
            "encoding" => info.encoding = Some(value.to_string()),
            "format" => info.format = Some(value.to_string()),
            "set" => info.set = Some(value.to_string()),
            "gcc" => info.gcc = Some(number(value)?),
            "dwarf" => info.dwarf = Some(number(value)?),
            "generic" => info.generic = Some(value.to_string()),
            _ => {}
        }
    }
    if !saw_name {
        return Err(RemoteError::Malformed(response.to_string()));
    }
    Ok(info)
}

pub(crate) fn parse_host_info(response: &str) -> HostInfo {
    let mut info = HostInfo::default();
    for (key, value) in parse_key_values(response) {
        match key {
            "cputype" => info.cputype = value.parse().ok(),
            "cpusubtype" => info.cpusubtype = value.parse().ok(),
            "ostype" => info.ostype = Some(value.to_string()),
            "vendor" => info.vendor = Some(value.to_string()),
            "endian" => info.endian = Some(value.to_string()),
            "ptrsize" => info.ptrsize = value.parse().ok(),
            "triple" => {
                info.triple = codec::decode_hex(value)
                    .ok()
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            }
            "hostname" => {
                info.hostname = codec::decode_hex(value)
                    .ok()
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            }
            _ => {}
        }
    }
    info
}

#[derive(Debug, Default)]
struct Capabilities {
    /// `None` until a `Z` reply settles it.
    stoppoints: [Option<bool>; 5],
    vcont: Option<VContSupport>,
    alloc: LazyBool,
    host_info: Option<HostInfo>,
}

pub struct GdbRemoteClient {
    transport: Arc<Transport>,
    packet_timeout: Duration,
    max_memory_chunk: usize,
    caps: Mutex<Capabilities>,
    general_thread: Mutex<Option<ThreadId>>,
    pending_signal: Mutex<Option<u8>>,
    thread_suffix: AtomicBool,
    threads_in_stop_reply: AtomicBool,
}

impl GdbRemoteClient {
    pub fn new(transport: Arc<Transport>, packet_timeout: Duration, max_memory_chunk: usize) -> Self {
        Self {
            transport,
            packet_timeout,
            max_memory_chunk: max_memory_chunk.max(1),
            caps: Mutex::new(Capabilities::default()),
            general_thread: Mutex::new(None),
            pending_signal: Mutex::new(None),
            thread_suffix: AtomicBool::new(false),
            threads_in_stop_reply: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn max_memory_chunk(&self) -> usize {
        self.max_memory_chunk
    }

    /// Send one packet and wait for its reply.
    pub async fn send_packet_and_wait_for_response(&self, payload: &str, timeout: Duration) -> Result<String> {
        if !self.transport.is_connected() {
            return Err(RemoteError::NotConnected);
        }
        if self.transport.is_running() {
            return Err(RemoteError::InvalidState("target is running"));
        }
        let mut seq = self.transport.lock_sequence().await;
        Ok(seq.exchange(payload, timeout).await?)
    }

    async fn request(&self, packet: Packet) -> Result<String> {
        self.send_packet_and_wait_for_response(&codec::format_packet(&packet), self.packet_timeout).await
    }

    /// Forget everything learned from the previous stub.
    pub fn reset_discoverable_settings(&self) {
        *self.caps.lock().unwrap() = Capabilities::default();
        *self.general_thread.lock().unwrap() = None;
        *self.pending_signal.lock().unwrap() = None;
        self.thread_suffix.store(false, Ordering::SeqCst);
        self.threads_in_stop_reply.store(false, Ordering::SeqCst);
    }

    pub async fn set_thread_suffix_supported(&self) -> bool {
        let supported = matches!(self.request(Packet::ThreadSuffixSupported).await, Ok(r) if codec::is_ok(&r));
        self.thread_suffix.store(supported, Ordering::SeqCst);
        supported
    }

    pub fn thread_suffix_supported(&self) -> bool {
        self.thread_suffix.load(Ordering::SeqCst)
    }

    pub async fn enable_list_threads_in_stop_reply(&self) -> bool {
        let enabled = matches!(self.request(Packet::ListThreadsInStopReply).await, Ok(r) if codec::is_ok(&r));
        self.threads_in_stop_reply.store(enabled, Ordering::SeqCst);
        enabled
    }

    /// Whether stop replies carry a `threads:` roster.
    pub fn threads_in_stop_reply(&self) -> bool {
        self.threads_in_stop_reply.load(Ordering::SeqCst)
    }

    /// `qHostInfo`, cached after the first successful query.
    pub async fn host_info(&self) -> Result<HostInfo> {
        let cached = self.caps.lock().unwrap().host_info.clone();
        if let Some(info) = cached {
            return Ok(info);
        }
        let response = expect_normal(self.request(Packet::HostInfo).await?)?;
        let info = parse_host_info(&response);
        self.caps.lock().unwrap().host_info = Some(info.clone());
        Ok(info)
    }

    pub fn cached_host_info(&self) -> Option<HostInfo> {
        self.caps.lock().unwrap().host_info.clone()
    }

    /// `vCont?`, probed once.
    pub async fn vcont_support(&self) -> VContSupport {
        let cached = self.caps.lock().unwrap().vcont;
        if let Some(support) = cached {
            return support;
        }
        let support = match self.request(Packet::VContQuery).await {
            Ok(response) => VContSupport::parse(&response),
            Err(e) => {
                log::debug!("vCont? failed: {}", e);
                VContSupport::default()
            }
        };
        self.caps.lock().unwrap().vcont = Some(support);
        support
    }

    /// Process id from `qC`. Accepts `QC<hex>` or a bare hex id.
    pub async fn current_process_id(&self) -> Result<Option<Pid>> {
        let response = match self.request(Packet::CurrentProcess).await {
            Ok(r) => r,
            Err(RemoteError::Unsupported) => return Ok(None),
            Err(e) => return Err(e),
        };
        match codec::classify(&response) {
            ResponseKind::Normal => {
                let digits = response.strip_prefix("QC").unwrap_or(&response);
                Ok(u64::from_str_radix(digits, 16).ok().filter(|pid| *pid != 0))
            }
            _ => Ok(None),
        }
    }

    /// Thread selected with `Hg`, if any.
    pub fn global_thread_id(&self) -> Option<ThreadId> {
        *self.general_thread.lock().unwrap()
    }

    pub async fn set_current_thread(&self, tid: ThreadId) -> Result<()> {
        if self.global_thread_id() == Some(tid) {
            return Ok(());
        }
        expect_ok(&self.request(Packet::SetGeneralThread(Some(tid))).await?)?;
        *self.general_thread.lock().unwrap() = Some(tid);
        Ok(())
    }

    /// `Hc`; `None` selects all threads.
    pub async fn set_current_thread_for_run(&self, tid: Option<ThreadId>) -> Result<()> {
        expect_ok(&self.request(Packet::SetContinueThread(tid)).await?)
    }

    /// Read up to the configured chunk size. Callers loop.
    pub async fn read_memory(&self, addr: Addr, len: usize) -> Result<Vec<u8>> {
        let len = len.min(self.max_memory_chunk);
        let response = expect_normal(self.request(Packet::ReadMemory { addr, len }).await?)?;
        if response.len() % 2 != 0 || !response.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RemoteError::Malformed(response));
        }
        let mut bytes = vec![0u8; len];
        let decoded = codec::decode_hex_into(&response, &mut bytes, codec::FILL_BYTE);
        bytes.truncate(decoded);
        Ok(bytes)
    }

    /// Write up to the configured chunk size; returns how many bytes went out.
    pub async fn write_memory(&self, addr: Addr, data: &[u8]) -> Result<usize> {
        let len = data.len().min(self.max_memory_chunk);
        let packet = Packet::WriteMemory { addr, data: data[..len].to_vec() };
        expect_ok(&self.request(packet).await?)?;
        Ok(len)
    }

    /// Optimistic until a `Z` reply says otherwise.
    pub fn query_stoppoint_support(&self, kind: StoppointKind) -> bool {
        self.caps.lock().unwrap().stoppoints[kind.index()].unwrap_or(true)
    }

    pub async fn send_stoppoint_packet(&self, kind: StoppointKind, set: bool, addr: Addr, size: usize) -> Result<()> {
        if !self.query_stoppoint_support(kind) {
            return Err(RemoteError::Unsupported);
        }
        let packet = if set {
            Packet::InsertStoppoint { kind, addr, size }
        } else {
            Packet::RemoveStoppoint { kind, addr, size }
        };
        let response = self.request(packet).await?;
        let result = expect_ok(&response);
        match &result {
            Ok(()) => self.caps.lock().unwrap().stoppoints[kind.index()] = Some(true),
            Err(RemoteError::Unsupported) => {
                log::debug!("Stub does not support Z{}", kind.code());
                self.caps.lock().unwrap().stoppoints[kind.index()] = Some(false);
            }
            Err(_) => {}
        }
        result
    }

    pub fn alloc_support(&self) -> LazyBool {
        self.caps.lock().unwrap().alloc
    }

    /// `_M`; `None` on failure or when the stub lacks the packet.
    pub async fn allocate_memory(&self, size: u64, permissions: MemoryPermissions) -> Option<Addr> {
        if self.alloc_support() == LazyBool::No {
            return None;
        }
        let response = match self.request(Packet::AllocateMemory { size, permissions }).await {
            Ok(r) => r,
            Err(e) => {
                log::debug!("_M failed: {}", e);
                return None;
            }
        };
        match codec::classify(&response) {
            ResponseKind::Unsupported => {
                self.caps.lock().unwrap().alloc = LazyBool::No;
                None
            }
            ResponseKind::Normal => match u64::from_str_radix(&response, 16) {
                Ok(addr) => {
                    self.caps.lock().unwrap().alloc = LazyBool::Yes;
                    Some(addr)
                }
                Err(_) => None,
            },
            _ => None,
        }
    }

    pub async fn deallocate_memory(&self, addr: Addr) -> bool {
        if self.alloc_support() == LazyBool::No {
            return false;
        }
        match self.request(Packet::DeallocateMemory(addr)).await {
            Ok(response) if codec::is_ok(&response) => {
                self.caps.lock().unwrap().alloc = LazyBool::Yes;
                true
            }
            Ok(response) if codec::is_unsupported(&response) => {
                self.caps.lock().unwrap().alloc = LazyBool::No;
                false
            }
            _ => false,
        }
    }

    /// `qfThreadInfo`/`qsThreadInfo`. Fails with [`RemoteError::Busy`] when
    /// a continue is queued or in flight, or another exchange owns the sequence.
    pub async fn get_current_thread_ids(&self, out: &mut Vec<ThreadId>) -> Result<()> {
        out.clear();
        if self.transport.is_running() {
            return Err(RemoteError::Busy);
        }
        let mut seq = self.transport.try_lock_sequence().ok_or(RemoteError::Busy)?;
        let mut packet = Packet::ThreadInfoFirst;
        loop {
            let response = seq.exchange(&packet.to_string(), self.packet_timeout).await?;
            match codec::classify(&response) {
                ResponseKind::Normal if response.starts_with('m') => {
                    out.extend(response[1..].split(',').filter_map(ThreadId::parse_hex));
                }
                ResponseKind::Normal if response.starts_with('l') => return Ok(()),
                ResponseKind::Error(code) => return Err(RemoteError::Reported(code)),
                ResponseKind::Unsupported => return Err(RemoteError::Unsupported),
                _ => return Err(RemoteError::Malformed(response)),
            }
            packet = Packet::ThreadInfoNext;
        }
    }

    /// `?` status query.
    pub async fn query_stop_reason(&self) -> Result<String> {
        expect_normal(self.request(Packet::HaltReason).await?)
    }

    /// `None` once the stub runs out of registers.
    pub async fn query_register_info(&self, regnum: u32) -> Result<Option<RegisterInfo>> {
        let response = self.request(Packet::RegisterInfo(regnum)).await?;
        if !codec::is_normal(&response) {
            return Ok(None);
        }
        parse_register_info(regnum, &response).map(Some)
    }

    pub async fn set_stdio(&self, fd: u8, path: &str) -> Result<()> {
        expect_ok(&self.request(Packet::SetStdio { fd, path: path.to_string() }).await?)
    }

    pub async fn set_disable_aslr(&self, disable: bool) -> Result<()> {
        expect_ok(&self.request(Packet::DisableAslr(disable)).await?)
    }

    pub async fn set_working_dir(&self, dir: &str) -> Result<()> {
        expect_ok(&self.request(Packet::WorkingDir(dir.to_string())).await?)
    }

    pub async fn set_launch_arch(&self, arch: &str) -> Result<()> {
        expect_ok(&self.request(Packet::LaunchArch(arch.to_string())).await?)
    }

    pub async fn send_environment_entry(&self, entry: &str) -> Result<()> {
        expect_ok(&self.request(Packet::Environment(entry.to_string())).await?)
    }

    /// `A` packet, under its own timeout since the stub launches the
    /// inferior before replying.
    pub async fn send_arguments(&self, args: &[String], timeout: Duration) -> Result<()> {
        let packet = Packet::Arguments(args.to_vec()).to_string();
        expect_ok(&self.send_packet_and_wait_for_response(&packet, timeout).await?)
    }

    pub async fn launch_success(&self) -> Result<()> {
        let response = self.request(Packet::LaunchSuccess).await?;
        match codec::classify(&response) {
            ResponseKind::Ok => Ok(()),
            ResponseKind::Error(code) => Err(RemoteError::Reported(code)),
            ResponseKind::Unsupported => Err(RemoteError::Unsupported),
            ResponseKind::Normal => Err(RemoteError::Malformed(
                response.strip_prefix('E').unwrap_or(&response).to_string(),
            )),
        }
    }

    /// `D`. Best effort: `false` covers both a refusal and a dropped link.
    pub async fn detach(&self) -> bool {
        match self.request(Packet::Detach).await {
            Ok(response) => codec::is_ok(&response),
            Err(e) => {
                log::warn!("Detach packet failed: {}", e);
                false
            }
        }
    }

    /// `k`, returning the raw reply (`W..`/`X..` on success).
    pub async fn kill(&self) -> Result<String> {
        self.request(Packet::Kill).await
    }

    /// Deliver `signo` to a running target: interrupt it, then the continue
    /// in flight is reissued as `C<signo>`.
    pub async fn send_async_signal(&self, signo: u8, timeout: Duration) -> Result<()> {
        if !self.transport.is_running() {
            return Err(RemoteError::InvalidState("target is not running"));
        }
        *self.pending_signal.lock().unwrap() = Some(signo);
        match self.transport.send_interrupt(timeout).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.pending_signal.lock().unwrap().take();
                Err(match e {
                    InterruptError::Timeout => RemoteError::Timeout,
                    InterruptError::NotConnected => RemoteError::NotConnected,
                })
            }
        }
    }

    /// Send a continue-class packet and block until the target stops or
    /// exits. `O` packets received meanwhile go to `on_output`. Only the
    /// event loop calls this.
    pub async fn send_continue_packet_and_wait<F>(&self, payload: &str, mut on_output: F) -> Result<String>
    where
        F: FnMut(String),
    {
        let mut seq = self.transport.lock_sequence().await;
        let mut payload = payload.to_string();

        loop {
            if let Err(e) = seq.send(&payload).await {
                self.transport.mark_stopped();
                return Err(e.into());
            }
            self.transport.set_run_phase(RunPhase::Running);

            let response = loop {
                let response = match seq.read(None).await {
                    Ok(r) => r,
                    Err(e) => {
                        self.transport.mark_stopped();
                        return Err(e.into());
                    }
                };
                if response.len() > 1 && response.starts_with('O') && response != "OK" {
                    match codec::decode_hex(&response[1..]) {
                        Ok(bytes) => on_output(String::from_utf8_lossy(&bytes).into_owned()),
                        Err(e) => log::warn!("Bad console output packet: {}", e),
                    }
                    continue;
                }
                break response;
            };

            let pending = if response.starts_with('T') || response.starts_with('S') {
                self.pending_signal.lock().unwrap().take()
            } else {
                None
            };
            if let Some(signo) = pending {
                log::debug!("Re-continuing with async signal {}", signo);
                self.transport.mark_stopped_into(RunPhase::Queued);
                payload = Packet::Resume(crate::types::ResumeAction::ContinueWithSignal(signo)).to_string();
                continue;
            }
            self.transport.mark_stopped();
            return Ok(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    async fn client_over(stream: tokio_test::io::Mock) -> GdbRemoteClient {
        let transport = Arc::new(Transport::new());
        transport.attach_stream(Box::new(stream)).await;
        transport.set_no_ack(true);
        GdbRemoteClient::new(transport, Duration::from_secs(1), 512)
    }

    #[tokio::test]
    async fn test_read_memory_reports_stub_error() {
        let client = client_over(Builder::new().write(b"$m1000,10#bb").read(b"$E01#a6").build()).await;
        assert_eq!(client.read_memory(0x1000, 16).await, Err(RemoteError::Reported(1)));
    }

    #[tokio::test]
    async fn test_read_memory_short_reply() {
        let client = client_over(Builder::new().write(b"$m1000,10#bb").read(b"$1000#c1").build()).await;
        assert_eq!(client.read_memory(0x1000, 16).await.unwrap(), vec![0x10, 0x00]);
    }

    #[tokio::test]
    async fn test_read_memory_rejects_non_hex_reply() {
        let client = client_over(Builder::new().write(b"$m1000,10#bb").read(b"$zzzz#e8").build()).await;
        assert_eq!(client.read_memory(0x1000, 16).await, Err(RemoteError::Malformed("zzzz".into())));
    }

    #[tokio::test]
    async fn test_read_memory_rejects_odd_length_reply() {
        let client = client_over(Builder::new().write(b"$m1000,10#bb").read(b"$100#91").build()).await;
        assert_eq!(client.read_memory(0x1000, 16).await, Err(RemoteError::Malformed("100".into())));
    }

    #[tokio::test]
    async fn test_write_memory_is_capped() {
        let stream = Builder::new().write(b"$M20,2:dead#d5").read(b"$OK#9a").build();
        let transport = Arc::new(Transport::new());
        transport.attach_stream(Box::new(stream)).await;
        transport.set_no_ack(true);
        let client = GdbRemoteClient::new(transport, Duration::from_secs(1), 2);
        assert_eq!(client.write_memory(0x20, &[0xde, 0xad, 0xbe, 0xef]).await, Ok(2));
    }

    #[tokio::test]
    async fn test_stoppoint_support_is_cached() {
        let client = client_over(Builder::new().write(b"$Z1,400000,1#38").read(b"$#00").build()).await;
        assert!(client.query_stoppoint_support(StoppointKind::HardwareBreakpoint));
        assert_eq!(
            client.send_stoppoint_packet(StoppointKind::HardwareBreakpoint, true, 0x400000, 1).await,
            Err(RemoteError::Unsupported)
        );
        assert!(!client.query_stoppoint_support(StoppointKind::HardwareBreakpoint));
        // no second packet goes out
        assert_eq!(
            client.send_stoppoint_packet(StoppointKind::HardwareBreakpoint, true, 0x400000, 1).await,
            Err(RemoteError::Unsupported)
        );
    }

    #[tokio::test]
    async fn test_current_process_id_forms() {
        let client = client_over(
            Builder::new()
                .write(b"$qC#b4")
                .read(b"$QC1234#5e")
                .write(b"$qC#b4")
                .read(b"$1000#c1")
                .write(b"$qC#b4")
                .read(b"$#00")
                .build(),
        )
        .await;
        assert_eq!(client.current_process_id().await, Ok(Some(0x1234)));
        assert_eq!(client.current_process_id().await, Ok(Some(0x1000)));
        assert_eq!(client.current_process_id().await, Ok(None));
    }

    #[tokio::test]
    async fn test_thread_list_pages() {
        let client = client_over(
            Builder::new()
                .write(b"$qfThreadInfo#bb")
                .read(b"$m01,02#5c")
                .write(b"$qsThreadInfo#c8")
                .read(b"$l#6c")
                .build(),
        )
        .await;
        let mut threads = Vec::new();
        client.get_current_thread_ids(&mut threads).await.unwrap();
        assert_eq!(threads, vec![ThreadId(1), ThreadId(2)]);
    }

    #[tokio::test]
    async fn test_thread_selection() {
        let client = client_over(
            Builder::new()
                .write(b"$Hg1#e0")
                .read(b"$OK#9a")
                .write(b"$Hc-1#09")
                .read(b"$OK#9a")
                .build(),
        )
        .await;
        assert_eq!(client.global_thread_id(), None);
        client.set_current_thread(ThreadId(1)).await.unwrap();
        // cached, no second Hg
        client.set_current_thread(ThreadId(1)).await.unwrap();
        assert_eq!(client.global_thread_id(), Some(ThreadId(1)));
        client.set_current_thread_for_run(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_thread_list_busy_while_sequence_held() {
        let client = client_over(Builder::new().build()).await;
        let _held = client.transport().lock_sequence().await;
        let mut threads = vec![ThreadId(9)];
        assert_eq!(client.get_current_thread_ids(&mut threads).await, Err(RemoteError::Busy));
        assert!(threads.is_empty());
    }

    #[tokio::test]
    async fn test_allocate_memory_unsupported_latches() {
        let client = client_over(Builder::new().write(b"$_M100,rx#53").read(b"$#00").build()).await;
        assert_eq!(client.alloc_support(), LazyBool::Calculate);
        assert_eq!(client.allocate_memory(0x100, MemoryPermissions::READ_EXECUTE).await, None);
        assert_eq!(client.alloc_support(), LazyBool::No);
        assert_eq!(client.allocate_memory(0x100, MemoryPermissions::READ_EXECUTE).await, None);
    }

    #[tokio::test]
    async fn test_continue_collects_console_output() {
        // "hi\n" as an O packet, then a stop
        let client = client_over(
            Builder::new()
                .write(b"$c#63")
                .read(b"$O68690a#bd")
                .read(b"$T05#b9")
                .build(),
        )
        .await;
        let mut output = Vec::new();
        let reply = client.send_continue_packet_and_wait("c", |text| output.push(text)).await.unwrap();
        assert_eq!(reply, "T05");
        assert_eq!(output, vec!["hi\n".to_string()]);
        assert!(!client.transport().is_running());
    }

    #[tokio::test]
    async fn test_running_target_rejects_sync_requests() {
        let client = client_over(Builder::new().build()).await;
        client.transport().set_run_phase(RunPhase::Running);
        assert_eq!(
            client.read_memory(0, 4).await,
            Err(RemoteError::InvalidState("target is running"))
        );
    }

    #[test]
    fn test_parse_register_info() {
        let info = parse_register_info(
            16,
            "name:rip;alt-name:pc;bitsize:64;offset:128;encoding:uint;format:hex;set:General Purpose Registers;gcc:16;dwarf:16;generic:pc;",
        )
        .unwrap();
        assert_eq!(info.name, "rip");
        assert_eq!(info.alt_name.as_deref(), Some("pc"));
        assert_eq!(info.bitsize, 64);
        assert_eq!(info.generic.as_deref(), Some("pc"));
        assert!(parse_register_info(0, "bitsize:64;").is_err());
    }

    #[test]
    fn test_parse_host_info() {
        // triple "x86_64-pc-linux-gnu"
        let info = parse_host_info("cputype:16777223;cpusubtype:3;ostype:linux;endian:little;ptrsize:8;triple:7838365f36342d70632d6c696e75782d676e75;");
        assert_eq!(info.cputype, Some(16777223));
        assert_eq!(info.ptrsize, Some(8));
        assert_eq!(info.triple.as_deref(), Some("x86_64-pc-linux-gnu"));
        assert!(!info.is_big_endian());
    }
}
