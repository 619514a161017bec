/// Process controller
///
/// Drives the public state machine of one debugged process: connecting to a
/// stub (or spawning one), launch and attach, resume through the event
/// loop, halt, detach and destroy, plus breakpoint, watchpoint and memory
/// operations that ride on the client.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt, PtyMaster};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::client::{GdbRemoteClient, RemoteError};
use crate::codec::{self, Packet, PacketCursor};
use crate::config::ControllerConfig;
use crate::event_loop::{EventLoopHandle, LoopEvent};
use crate::host::ProcessHost;
use crate::state::{ProcessState, StateEvent, StateTracker};
use crate::stop_reply::{self, StopContext, StopDescription};
use crate::supervisor::{ExitCallback, PortAllocator, SpawnError, StubExit, StubSupervisor};
use crate::transport::{ConnectError, Connector, InterruptError, RunPhase, TcpConnector, Transport};
use crate::types::{
    Addr, BreakpointSite, HostInfo, LazyBool, MemoryPermissions, Pid, RegisterInfo, ResumeRequest, SiteKind,
    StoppointKind, ThreadId, VContSupport, Watchpoint,
};

const EVENT_LOOP_EXIT_TIMEOUT: Duration = Duration::from_secs(1);
const DEV_NULL: &str = "/dev/null";

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("No such executable: {0:?}")]
    NoObjectFile(PathBuf),
    #[error("Failed to start debug stub: {0}")]
    SpawnFailed(#[from] SpawnError),
    #[error("Failed to connect to debug stub: {0}")]
    HandshakeFailed(String),
    #[error("Launch rejected: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("Failed to start debug stub: {0}")]
    SpawnFailed(String),
    #[error("Failed to connect to debug stub: {0}")]
    HandshakeFailed(String),
    #[error("Invalid attach target")]
    InvalidTarget,
    #[error("Event loop is not running")]
    DeadEventLoop,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResumeError {
    #[error("Resume directives cannot be expressed with the packets this stub supports")]
    Unrepresentable,
    #[error("Cannot resume while {0}")]
    InvalidState(ProcessState),
    #[error("Event loop is not running")]
    DeadEventLoop,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HaltError {
    #[error("Target did not report a stop in time")]
    Unverified,
    #[error("Event loop is not running")]
    DeadEventLoop,
    #[error("Cannot halt while {0}")]
    InvalidState(ProcessState),
    #[error("Interrupt failed: {0}")]
    Interrupt(#[from] InterruptError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BreakpointError {
    #[error("Unable to set breakpoint at 0x{0:x}")]
    Generic(Addr),
    #[error("Failed to send stoppoint packet: {0}")]
    SendFailed(#[from] RemoteError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WatchpointError {
    #[error("Stub does not support this watchpoint kind")]
    Unsupported,
    #[error("Failed to send stoppoint packet: {0}")]
    SendFailed(RemoteError),
    #[error("Watchpoint must watch reads or writes")]
    Generic,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Failed to allocate {requested_size} bytes with permissions {permissions}")]
    AllocationFailed { requested_size: u64, permissions: MemoryPermissions },
    #[error("Failed to deallocate memory at 0x{addr:x}")]
    DeallocationFailed { addr: Addr },
    #[error("No memory was ever allocated")]
    NeverAllocated,
}

/// Everything `launch` needs besides the executable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSpec {
    /// Arguments after argv[0].
    pub args: Vec<String>,
    /// `NAME=value` entries.
    pub env: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub disable_stdio: bool,
    pub disable_aslr: bool,
    pub arch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    Pid(Pid),
    Name(String),
}

/// Stdio paths handed to the stub, indexed by fd. `None` everywhere means
/// the caller should provide a terminal.
pub fn resolve_stdio(spec: &LaunchSpec) -> [Option<PathBuf>; 3] {
    let dev_null = || Some(PathBuf::from(DEV_NULL));
    if spec.disable_stdio {
        return [dev_null(), dev_null(), dev_null()];
    }
    let streams = [spec.stdin.clone(), spec.stdout.clone(), spec.stderr.clone()];
    if streams.iter().all(Option::is_none) {
        return streams;
    }
    streams.map(|stream| stream.or_else(dev_null))
}

/// Pick the packet for `request`. `vCont` when every action kind is
/// advertised; a legacy packet only for a uniform request covering every
/// live thread.
pub fn build_resume_packet(
    request: &ResumeRequest,
    support: &VContSupport,
    live_threads: &[ThreadId],
) -> Result<Packet, ResumeError> {
    let actions = match request {
        ResumeRequest::All(action) => {
            return Ok(if support.supports(action.code()) {
                Packet::VContAll(*action)
            } else {
                Packet::Resume(*action)
            });
        }
        ResumeRequest::PerThread(actions) => actions,
    };

    let first = actions.first().ok_or(ResumeError::Unrepresentable)?.action;
    let uniform = actions.iter().all(|t| t.action == first);
    let covers_all = !live_threads.is_empty()
        && live_threads.iter().all(|tid| actions.iter().any(|t| t.tid == *tid));

    if actions.iter().all(|t| support.supports(t.action.code())) {
        if uniform && covers_all {
            return Ok(Packet::VContAll(first));
        }
        return Ok(Packet::VCont(actions.clone()));
    }
    if uniform && covers_all {
        return Ok(Packet::Resume(first));
    }
    Err(ResumeError::Unrepresentable)
}

fn open_pty() -> nix::Result<(PtyMaster, String)> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)?;
    grantpt(&master)?;
    unlockpt(&master)?;
    let slave = ptsname_r(&master)?;
    Ok((master, slave))
}

/// `W`/`X` exit code out of a kill reply.
fn exit_code_from_reply(reply: &str) -> Option<i32> {
    let mut cursor = PacketCursor::new(reply);
    match cursor.get_char()? {
        'W' | 'X' => cursor.get_hex_u8().map(i32::from),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct StopInfo {
    thread_ids: Vec<ThreadId>,
    last_stop_packet: Option<String>,
    last_stop: Option<StopDescription>,
}

#[derive(Debug, Clone, Default)]
struct RegisterLayout {
    registers: Vec<RegisterInfo>,
    pc_regnum: Option<u32>,
    big_endian: bool,
}

pub(crate) struct ControllerInner {
    config: ControllerConfig,
    host: Arc<dyn ProcessHost>,
    connector: Arc<dyn Connector>,
    transport: Arc<Transport>,
    pub(crate) client: Arc<GdbRemoteClient>,
    supervisor: StubSupervisor,
    pub(crate) state: Arc<StateTracker>,
    stop_info: Mutex<StopInfo>,
    pid: Mutex<Option<Pid>>,
    layout: Mutex<Option<RegisterLayout>>,
    event_loop: Mutex<Option<EventLoopHandle>>,
    pub(crate) shutting_down: AtomicBool,
    mmaps: Mutex<HashMap<Addr, u64>>,
    pty_master: Mutex<Option<PtyMaster>>,
}

impl ControllerInner {
    fn prepare_for_new_session(&self) {
        self.shutting_down.store(false, Ordering::SeqCst);
        *self.stop_info.lock().unwrap() = StopInfo::default();
        *self.pid.lock().unwrap() = None;
        self.mmaps.lock().unwrap().clear();
    }

    fn pid(&self) -> Option<Pid> {
        *self.pid.lock().unwrap()
    }

    fn thread_ids(&self) -> Vec<ThreadId> {
        self.stop_info.lock().unwrap().thread_ids.clone()
    }

    fn event_loop_alive(&self) -> bool {
        self.event_loop.lock().unwrap().as_ref().map_or(false, EventLoopHandle::is_alive)
    }

    /// Queue a continue-class packet. The transport counts as running from
    /// here on, so an interrupt issued before the loop writes it still lands.
    fn send_to_loop(&self, packet: String) -> bool {
        self.transport.set_run_phase(RunPhase::Queued);
        let sent = self
            .event_loop
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |handle| handle.send(LoopEvent::Continue(packet)));
        if !sent {
            self.transport.set_run_phase(RunPhase::Stopped);
        }
        sent
    }

    fn start_event_loop(self: &Arc<Self>) {
        let handle = EventLoopHandle::spawn(Arc::downgrade(self), self.transport.subscribe_closed());
        *self.event_loop.lock().unwrap() = Some(handle);
    }

    async fn stop_event_loop(&self) {
        let handle = self.event_loop.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.stop(EVENT_LOOP_EXIT_TIMEOUT).await;
            // Nothing drains the queue any more.
            self.transport.set_run_phase(RunPhase::Stopped);
        }
    }

    /// Connect, handshake, reset what the previous stub taught us, probe
    /// capabilities and start the event loop.
    async fn connect_to_debugserver(self: &Arc<Self>, url: &str) -> Result<(), ConnectError> {
        self.stop_event_loop().await;
        self.transport
            .connect(
                self.connector.as_ref(),
                url,
                self.config.connect_retry_budget,
                self.config.connect_retry_interval(),
            )
            .await?;
        self.transport.handshake(self.config.packet_timeout()).await?;

        self.client.reset_discoverable_settings();
        *self.layout.lock().unwrap() = None;
        self.client.set_thread_suffix_supported().await;
        self.client.enable_list_threads_in_stop_reply().await;
        if let Err(e) = self.client.host_info().await {
            log::debug!("qHostInfo unavailable: {}", e);
        }
        let vcont = self.client.vcont_support().await;
        log::debug!("vCont support: {:?}", vcont);

        self.start_event_loop();
        Ok(())
    }

    fn monitor_callback(self: &Arc<Self>) -> ExitCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |exit: StubExit| {
            let Some(inner) = weak.upgrade() else {
                log::debug!("Stub {} exited after its controller went away", exit.pid);
                return;
            };
            if inner.state.state().is_terminal() {
                return;
            }
            let reason = exit.describe();
            log::warn!("{}", reason);
            inner.state.set_exit_status(-1, Some(reason));
        })
    }

    /// Spawn a local stub and connect to it.
    async fn spawn_and_connect(
        self: &Arc<Self>,
        ports: &dyn PortAllocator,
        working_dir: Option<&Path>,
    ) -> Result<(), LaunchError> {
        let listen = format!("localhost:{}", ports.next_port());
        self.supervisor
            .spawn(&listen, &[], &HashMap::new(), working_dir, self.monitor_callback())?;
        self.connect_to_debugserver(&format!("connect://{}", listen))
            .await
            .map_err(|e| LaunchError::HandshakeFailed(e.to_string()))
    }

    async fn teardown_failed_session(&self, reason: &str) {
        log::error!("{}", reason);
        self.shutting_down.store(true, Ordering::SeqCst);
        self.supervisor.kill();
        self.stop_event_loop().await;
        self.transport.disconnect().await;
        self.pty_master.lock().unwrap().take();
        self.state.set_last_error(reason);
        self.state.set_state(ProcessState::Disconnected);
    }

    async fn set_up_stdio(&self, spec: &LaunchSpec) {
        let mut paths = resolve_stdio(spec);
        // A terminal only when nothing was redirected; a partial redirection
        // already sent the remaining streams to /dev/null.
        if !spec.disable_stdio && paths.iter().all(Option::is_none) {
            match open_pty() {
                Ok((master, slave)) => {
                    log::debug!("Inferior stdio on {}", slave);
                    let slave = PathBuf::from(slave);
                    paths = [Some(slave.clone()), Some(slave.clone()), Some(slave)];
                    *self.pty_master.lock().unwrap() = Some(master);
                }
                Err(e) => log::warn!("Failed to open a pseudo terminal: {}", e),
            }
        }
        for (fd, path) in paths.iter().enumerate() {
            if let Some(path) = path {
                if let Err(e) = self.client.set_stdio(fd as u8, &path.to_string_lossy()).await {
                    log::warn!("Failed to redirect fd {} to {:?}: {}", fd, path, e);
                }
            }
        }
    }

    async fn launch_inferior(&self, executable: &Path, spec: &LaunchSpec) -> Result<Pid, LaunchError> {
        self.set_up_stdio(spec).await;

        if spec.disable_aslr {
            if let Err(e) = self.client.set_disable_aslr(true).await {
                log::warn!("Failed to disable ASLR: {}", e);
            }
        }
        if let Some(arch) = &spec.arch {
            if let Err(e) = self.client.set_launch_arch(arch).await {
                log::warn!("Failed to set launch architecture {}: {}", arch, e);
            }
        }
        if let Some(dir) = &spec.working_dir {
            self.client
                .set_working_dir(&dir.to_string_lossy())
                .await
                .map_err(|e| LaunchError::Rejected(format!("working directory {:?}: {}", dir, e)))?;
        }
        for entry in &spec.env {
            if let Err(e) = self.client.send_environment_entry(entry).await {
                log::warn!("Stub rejected environment entry {:?}: {}", entry, e);
                break;
            }
        }

        let mut argv = vec![executable.to_string_lossy().into_owned()];
        argv.extend(spec.args.iter().cloned());
        self.client
            .send_arguments(&argv, self.config.launch_packet_timeout())
            .await
            .map_err(|e| LaunchError::Rejected(format!("'A' packet returned an error: {}", e)))?;

        match self.client.launch_success().await {
            Ok(()) => {}
            Err(RemoteError::Unsupported) => log::debug!("qLaunchSuccess unsupported"),
            Err(e) => return Err(LaunchError::Rejected(e.to_string())),
        }

        let pid = self
            .client
            .current_process_id()
            .await
            .ok()
            .flatten()
            .ok_or_else(|| LaunchError::Rejected("stub did not report a process id".into()))?;
        *self.pid.lock().unwrap() = Some(pid);

        let reply = self
            .client
            .query_stop_reason()
            .await
            .map_err(|e| LaunchError::Rejected(format!("status query failed: {}", e)))?;
        self.apply_stop_reply(&reply).await;

        let state = self.state.state();
        if !state.is_stopped() {
            return Err(LaunchError::Rejected(format!("process is {} after launch", state)));
        }
        Ok(pid)
    }

    /// Learn the pid and register layout once per connection.
    async fn ensure_layout(&self) {
        if self.pid().is_none() {
            if let Ok(Some(pid)) = self.client.current_process_id().await {
                *self.pid.lock().unwrap() = Some(pid);
            }
        }
        if self.layout.lock().unwrap().is_some() {
            return;
        }

        let mut registers = Vec::new();
        loop {
            match self.client.query_register_info(registers.len() as u32).await {
                Ok(Some(info)) => registers.push(info),
                Ok(None) => break,
                Err(e) => {
                    log::debug!("qRegisterInfo{:x} failed: {}", registers.len(), e);
                    break;
                }
            }
        }
        log::debug!("Harvested {} register descriptions", registers.len());
        self.host.locate_register_layout(false, &registers);

        let pc_regnum = registers
            .iter()
            .find(|r| r.generic.as_deref() == Some("pc"))
            .map(|r| r.regnum);
        let big_endian = self.client.cached_host_info().map_or(false, |h| h.is_big_endian());
        *self.layout.lock().unwrap() = Some(RegisterLayout { registers, pc_regnum, big_endian });
    }

    async fn fetch_thread_ids(&self) -> Option<Vec<ThreadId>> {
        let mut threads = Vec::new();
        match self.client.get_current_thread_ids(&mut threads).await {
            Ok(()) if !threads.is_empty() => Some(threads),
            Ok(()) => None,
            Err(e) => {
                log::debug!("Thread list unavailable: {}", e);
                None
            }
        }
    }

    /// Apply a stop reply: clear the thread cache, interpret, then publish.
    async fn apply_stop_reply(&self, reply: &str) {
        self.stop_info.lock().unwrap().thread_ids.clear();
        if !codec::is_error(reply) && !reply.starts_with(['W', 'X']) {
            self.ensure_layout().await;
        }

        let parsed = {
            let layout = self.layout.lock().unwrap().clone().unwrap_or_default();
            let ctx = StopContext { host: self.host.as_ref(), pc_regnum: layout.pc_regnum, big_endian: layout.big_endian };
            stop_reply::interpret(reply, &ctx)
        };

        let mut desc = match parsed {
            Ok(desc) => desc,
            Err(e) => {
                log::error!("Bad stop reply {:?}: {}", reply, e);
                self.state.set_invalid("lost connection");
                return;
            }
        };

        if desc.is_exit() {
            let status = desc.exit_status.unwrap_or(-1);
            let description = desc.description.clone();
            {
                let mut info = self.stop_info.lock().unwrap();
                info.thread_ids.clear();
                info.last_stop_packet = Some(reply.to_string());
                info.last_stop = Some(desc);
            }
            self.state.set_exit_status(status, description);
            return;
        }

        let roster = match desc.roster.clone().filter(|r| !r.is_empty()) {
            Some(roster) => roster,
            None => match self.fetch_thread_ids().await {
                Some(threads) => threads,
                None => desc.thread.into_iter().collect(),
            },
        };
        desc.roster = Some(roster.clone());
        if let Some(tid) = desc.thread {
            // Register and memory requests that follow act on the stop thread.
            if let Err(e) = self.client.set_current_thread(tid).await {
                log::debug!("Failed to select stop thread {}: {}", tid, e);
            }
        }
        {
            let mut info = self.stop_info.lock().unwrap();
            info.thread_ids = roster;
            info.last_stop_packet = Some(reply.to_string());
            info.last_stop = Some(desc);
        }
        self.state.set_state(ProcessState::Stopped);
    }

    /// Completion of an event-loop exchange.
    pub(crate) async fn apply_async_stop(&self, reply: &str, attaching: bool) {
        if attaching && codec::is_error(reply) {
            let reason = match codec::error_code(reply) {
                Some(code) => format!("failed to attach to process (error 0x{:02x})", code),
                None => format!("failed to attach to process: {}", reply),
            };
            self.stop_info.lock().unwrap().thread_ids.clear();
            self.state.set_exit_status(-1, Some(reason));
            return;
        }
        self.apply_stop_reply(reply).await;
    }
}

/// Public handle. Cheap to clone; clones drive the same process.
#[derive(Clone)]
pub struct ProcessController {
    inner: Arc<ControllerInner>,
}

impl ProcessController {
    pub fn new(config: ControllerConfig, host: Arc<dyn ProcessHost>) -> Self {
        Self::with_connector(config, host, Arc::new(TcpConnector))
    }

    pub fn with_connector(config: ControllerConfig, host: Arc<dyn ProcessHost>, connector: Arc<dyn Connector>) -> Self {
        let transport = Arc::new(Transport::new());
        let client = Arc::new(GdbRemoteClient::new(
            transport.clone(),
            config.packet_timeout(),
            config.max_memory_chunk,
        ));
        let supervisor = StubSupervisor::new(config.clone());
        Self {
            inner: Arc::new(ControllerInner {
                config,
                host,
                connector,
                transport,
                client,
                supervisor,
                state: Arc::new(StateTracker::new()),
                stop_info: Mutex::new(StopInfo::default()),
                pid: Mutex::new(None),
                layout: Mutex::new(None),
                event_loop: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                mmaps: Mutex::new(HashMap::new()),
                pty_master: Mutex::new(None),
            }),
        }
    }

    pub fn client(&self) -> &GdbRemoteClient {
        &self.inner.client
    }

    /// Connect to an already running stub. Adopts its process when it has
    /// one, otherwise stays `Connected` awaiting launch or attach.
    pub async fn connect_remote(&self, url: &str) -> Result<(), ConnectError> {
        let inner = &self.inner;
        inner.prepare_for_new_session();
        inner.state.set_state(ProcessState::Connecting);

        if let Err(e) = inner.connect_to_debugserver(url).await {
            inner.state.set_last_error(e.to_string());
            inner.state.set_state(ProcessState::Disconnected);
            return Err(e);
        }

        let pid = match inner.client.current_process_id().await {
            Ok(pid) => pid,
            Err(e) => {
                log::debug!("qC failed: {}", e);
                None
            }
        };
        let Some(pid) = pid else {
            inner.state.set_state(ProcessState::Connected);
            return Ok(());
        };

        log::info!("Stub is debugging process {}", pid);
        *inner.pid.lock().unwrap() = Some(pid);
        if let Some(threads) = inner.fetch_thread_ids().await {
            inner.stop_info.lock().unwrap().thread_ids = threads;
        }
        let reply = inner
            .client
            .query_stop_reason()
            .await
            .map_err(|e| ConnectError::HandshakeFailed(format!("status query failed: {}", e)))?;
        inner.apply_stop_reply(&reply).await;

        let state = inner.state.state();
        if !state.is_stopped() {
            return Err(ConnectError::UnexpectedState(state.to_string()));
        }
        Ok(())
    }

    /// Spawn a local stub, have it launch `executable`, and stop at entry.
    pub async fn launch(
        &self,
        executable: &Path,
        spec: &LaunchSpec,
        ports: &dyn PortAllocator,
    ) -> Result<Pid, LaunchError> {
        let inner = &self.inner;
        if !executable.exists() {
            return Err(LaunchError::NoObjectFile(executable.to_path_buf()));
        }
        inner.prepare_for_new_session();
        inner.state.set_state(ProcessState::Launching);

        let result = match inner.spawn_and_connect(ports, spec.working_dir.as_deref()).await {
            Ok(()) => inner.launch_inferior(executable, spec).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(pid) => {
                log::info!("Launched {:?} as process {}", executable, pid);
                Ok(pid)
            }
            Err(e) => {
                inner.teardown_failed_session(&e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Attach to a pid or process name. Completes asynchronously: the
    /// state stays `Attaching` until the stub reports the first stop.
    pub async fn attach(
        &self,
        target: AttachTarget,
        wait_for_launch: bool,
        ports: &dyn PortAllocator,
    ) -> Result<(), AttachError> {
        let inner = &self.inner;
        let packet = match target {
            AttachTarget::Pid(0) => return Err(AttachError::InvalidTarget),
            AttachTarget::Pid(pid) => Packet::AttachPid(pid),
            AttachTarget::Name(name) if name.is_empty() => return Err(AttachError::InvalidTarget),
            AttachTarget::Name(name) if wait_for_launch => Packet::AttachWait(name),
            AttachTarget::Name(name) => Packet::AttachName(name),
        };

        inner.prepare_for_new_session();
        if !inner.transport.is_connected() {
            inner.state.set_state(ProcessState::Connecting);
            if let Err(e) = inner.spawn_and_connect(ports, None).await {
                inner.supervisor.kill();
                inner.transport.disconnect().await;
                let reason = e.to_string();
                inner.state.set_exit_status(-1, Some(reason.clone()));
                return Err(match e {
                    LaunchError::HandshakeFailed(msg) => AttachError::HandshakeFailed(msg),
                    _ => AttachError::SpawnFailed(reason),
                });
            }
        }

        inner.state.set_state(ProcessState::Attaching);
        if !inner.send_to_loop(packet.to_string()) {
            return Err(AttachError::DeadEventLoop);
        }
        Ok(())
    }

    /// Resume the stopped process. Returns once the packet is queued.
    pub async fn resume(&self, request: ResumeRequest) -> Result<(), ResumeError> {
        let inner = &self.inner;
        let state = inner.state.state();
        if !state.is_stopped() {
            return Err(ResumeError::InvalidState(state));
        }
        if !inner.event_loop_alive() {
            return Err(ResumeError::DeadEventLoop);
        }

        let support = inner.client.vcont_support().await;
        let packet = build_resume_packet(&request, &support, &inner.thread_ids())?;
        if let Packet::Resume(_) = packet {
            if let Err(e) = inner.client.set_current_thread_for_run(None).await {
                log::warn!("Failed to select all threads for continue: {}", e);
            }
        }

        inner.state.set_state(ProcessState::Running);
        if !inner.send_to_loop(packet.to_string()) {
            inner.state.set_state(state);
            return Err(ResumeError::DeadEventLoop);
        }
        Ok(())
    }

    /// Stop a running process. With `catch_stop_event`, wait for the stop
    /// to be published.
    pub async fn halt(&self, discard_thread_plans: bool, catch_stop_event: bool) -> Result<(), HaltError> {
        let inner = &self.inner;
        let state = inner.state.state();
        if state.is_terminal() || matches!(state, ProcessState::Invalid | ProcessState::Disconnected) {
            return Err(HaltError::InvalidState(state));
        }
        if discard_thread_plans {
            inner.host.discard_thread_plans();
        }

        if state == ProcessState::Attaching {
            // The stub is still waiting for the target; dropping it is the halt.
            inner.transport.disconnect().await;
            return Ok(());
        }
        if !inner.event_loop_alive() {
            return Err(HaltError::DeadEventLoop);
        }

        let interrupted = match inner.transport.send_interrupt(inner.config.interrupt_timeout()).await {
            Ok(interrupted) => interrupted,
            Err(InterruptError::Timeout) if catch_stop_event => return Err(HaltError::Unverified),
            Err(e) => return Err(e.into()),
        };
        // Not interrupted and not about to publish a stop: nothing was running.
        if !interrupted && (!catch_stop_event || inner.state.state() != ProcessState::Running) {
            return Ok(());
        }
        if catch_stop_event {
            inner
                .state
                .wait_for(inner.config.halt_verify_timeout(), |s| s.is_stopped() || s.is_terminal())
                .await
                .ok_or(HaltError::Unverified)?;
        }
        Ok(())
    }

    /// Clear every managed breakpoint, then let the process go.
    pub async fn detach(&self) -> Result<(), RemoteError> {
        let inner = &self.inner;
        if inner.state.state().is_terminal() {
            return Err(RemoteError::InvalidState("process already exited or detached"));
        }
        inner.shutting_down.store(true, Ordering::SeqCst);

        if inner.transport.is_running() {
            if let Err(e) = inner.transport.send_interrupt(inner.config.interrupt_timeout()).await {
                log::warn!("Failed to stop the process before detaching: {}", e);
            }
        }
        for site in inner.host.breakpoint_sites() {
            if let Err(e) = self.disable_breakpoint(&site).await {
                log::warn!("Failed to clear breakpoint {} on detach: {}", site.id(), e);
            }
        }
        inner.host.discard_thread_plans();

        if inner.client.detach().await {
            // The stub exits by itself once the process is let go.
            inner.supervisor.invalidate();
        } else {
            log::warn!("Stub did not acknowledge detach");
            inner.supervisor.kill();
        }
        inner.stop_event_loop().await;
        inner.transport.disconnect().await;
        inner.stop_info.lock().unwrap().thread_ids.clear();
        inner.state.set_state(ProcessState::Detached);
        Ok(())
    }

    /// Kill the process and tear everything down. Returns the exit status.
    pub async fn destroy(&self) -> i32 {
        let inner = &self.inner;
        inner.shutting_down.store(true, Ordering::SeqCst);
        let abort = Signal::SIGABRT as i32;
        let mut exit_status = abort;

        if inner.transport.is_connected() && inner.state.state() != ProcessState::Attaching {
            if inner.transport.is_running() {
                if let Err(e) = inner.transport.send_interrupt(inner.config.interrupt_timeout()).await {
                    log::warn!("Failed to interrupt before kill: {}", e);
                }
            }
            match inner.client.kill().await {
                Ok(reply) => match exit_code_from_reply(&reply) {
                    Some(code) => exit_status = code,
                    None => log::warn!("Unexpected reply to kill: {:?}", reply),
                },
                Err(e) => log::warn!("Kill packet failed: {}", e),
            }
        }

        inner.stop_event_loop().await;
        inner.transport.disconnect().await;
        inner.supervisor.kill();
        inner.stop_info.lock().unwrap().thread_ids.clear();
        if inner.state.exit_status().is_none() {
            inner.state.set_exit_status(exit_status, None);
        }
        inner.state.exit_status().unwrap_or(abort)
    }

    /// Deliver `signo` to the running process.
    pub async fn signal(&self, signo: u8) -> Result<(), RemoteError> {
        self.inner.client.send_async_signal(signo, self.inner.config.interrupt_timeout()).await
    }

    pub async fn enable_breakpoint(&self, site: &BreakpointSite) -> Result<(), BreakpointError> {
        if site.is_enabled() {
            return Ok(());
        }
        let client = &self.inner.client;
        let addr = site.load_address();
        let size = site.trap_opcode_size();

        if site.hardware_preferred() && client.query_stoppoint_support(StoppointKind::HardwareBreakpoint) {
            match client.send_stoppoint_packet(StoppointKind::HardwareBreakpoint, true, addr, size).await {
                Ok(()) => {
                    site.set_kind(SiteKind::Hardware);
                    site.set_enabled(true);
                    return Ok(());
                }
                Err(e) => log::debug!("Hardware breakpoint at 0x{:x} failed: {}", addr, e),
            }
        }

        if client.query_stoppoint_support(StoppointKind::SoftwareBreakpoint) {
            match client.send_stoppoint_packet(StoppointKind::SoftwareBreakpoint, true, addr, size).await {
                Ok(()) => {
                    site.set_kind(SiteKind::External);
                    site.set_enabled(true);
                    return Ok(());
                }
                Err(e) => log::debug!("Stub breakpoint at 0x{:x} failed: {}", addr, e),
            }
        }

        if self.inner.host.install_software_breakpoint(site) {
            site.set_kind(SiteKind::Software);
            site.set_enabled(true);
            return Ok(());
        }
        Err(BreakpointError::Generic(addr))
    }

    pub async fn disable_breakpoint(&self, site: &BreakpointSite) -> Result<(), BreakpointError> {
        if !site.is_enabled() {
            return Ok(());
        }
        let client = &self.inner.client;
        let addr = site.load_address();
        let size = site.trap_opcode_size();
        match site.kind() {
            Some(SiteKind::Hardware) => {
                client.send_stoppoint_packet(StoppointKind::HardwareBreakpoint, false, addr, size).await?
            }
            Some(SiteKind::External) => {
                client.send_stoppoint_packet(StoppointKind::SoftwareBreakpoint, false, addr, size).await?
            }
            Some(SiteKind::Software) | None => {
                if !self.inner.host.uninstall_software_breakpoint(site) {
                    return Err(BreakpointError::Generic(addr));
                }
            }
        }
        site.set_enabled(false);
        Ok(())
    }

    pub async fn enable_watchpoint(&self, watchpoint: &Watchpoint) -> Result<(), WatchpointError> {
        if watchpoint.is_enabled() {
            return Ok(());
        }
        let kind = watchpoint.stoppoint_kind().ok_or(WatchpointError::Generic)?;
        let client = &self.inner.client;
        if !client.query_stoppoint_support(kind) {
            return Err(WatchpointError::Unsupported);
        }
        match client
            .send_stoppoint_packet(kind, true, watchpoint.load_address(), watchpoint.byte_size())
            .await
        {
            Ok(()) => {
                watchpoint.set_enabled(true, true);
                Ok(())
            }
            Err(RemoteError::Unsupported) => Err(WatchpointError::Unsupported),
            Err(e) => Err(WatchpointError::SendFailed(e)),
        }
    }

    pub async fn disable_watchpoint(&self, watchpoint: &Watchpoint) -> Result<(), WatchpointError> {
        if !watchpoint.is_enabled() {
            return Ok(());
        }
        if !watchpoint.is_hardware() {
            watchpoint.set_enabled(false, false);
            return Ok(());
        }
        let kind = watchpoint.stoppoint_kind().ok_or(WatchpointError::Generic)?;
        match self
            .inner
            .client
            .send_stoppoint_packet(kind, false, watchpoint.load_address(), watchpoint.byte_size())
            .await
        {
            Ok(()) => {
                watchpoint.set_enabled(false, false);
                Ok(())
            }
            Err(RemoteError::Unsupported) => Err(WatchpointError::Unsupported),
            Err(e) => Err(WatchpointError::SendFailed(e)),
        }
    }

    /// Allocate inferior memory with `_M`, falling back to an inferior
    /// `mmap` once the stub is known not to support it.
    /// `_M` first; unless the stub has already proven it handles `_M`, a
    /// failed allocation falls back to an mmap call in the inferior.
    pub async fn allocate_memory(&self, size: u64, permissions: MemoryPermissions) -> Result<Addr, MemoryError> {
        let inner = &self.inner;
        let support = inner.client.alloc_support();
        if support != LazyBool::No {
            if let Some(addr) = inner.client.allocate_memory(size, permissions).await {
                return Ok(addr);
            }
        }
        if support != LazyBool::Yes {
            if let Some(addr) = inner.host.inferior_mmap(size, permissions) {
                inner.mmaps.lock().unwrap().insert(addr, size);
                return Ok(addr);
            }
        }
        Err(MemoryError::AllocationFailed { requested_size: size, permissions })
    }

    pub async fn deallocate_memory(&self, addr: Addr) -> Result<(), MemoryError> {
        let inner = &self.inner;
        let mapped = inner.mmaps.lock().unwrap().get(&addr).copied();
        if let Some(size) = mapped {
            if !inner.host.inferior_munmap(addr, size) {
                return Err(MemoryError::DeallocationFailed { addr });
            }
            inner.mmaps.lock().unwrap().remove(&addr);
            return Ok(());
        }
        match inner.client.alloc_support() {
            LazyBool::Calculate => Err(MemoryError::NeverAllocated),
            LazyBool::Yes => {
                if inner.client.deallocate_memory(addr).await {
                    Ok(())
                } else {
                    Err(MemoryError::DeallocationFailed { addr })
                }
            }
            LazyBool::No => Err(MemoryError::DeallocationFailed { addr }),
        }
    }

    /// Fill `buf` from inferior memory in chunks. Returns how many bytes
    /// were read; a failure on the first chunk is an error.
    pub async fn read_memory(&self, addr: Addr, buf: &mut [u8]) -> Result<usize, RemoteError> {
        let client = &self.inner.client;
        let mut done = 0;
        while done < buf.len() {
            let want = (buf.len() - done).min(client.max_memory_chunk());
            let bytes = match client.read_memory(addr + done as u64, want).await {
                Ok(bytes) => bytes,
                Err(e) if done == 0 => return Err(e),
                Err(e) => {
                    log::debug!("Short memory read at 0x{:x}: {}", addr + done as u64, e);
                    break;
                }
            };
            buf[done..done + bytes.len()].copy_from_slice(&bytes);
            done += bytes.len();
            if bytes.len() < want {
                break;
            }
        }
        Ok(done)
    }

    pub async fn write_memory(&self, addr: Addr, data: &[u8]) -> Result<usize, RemoteError> {
        let client = &self.inner.client;
        let mut done = 0;
        while done < data.len() {
            match client.write_memory(addr + done as u64, &data[done..]).await {
                Ok(written) => done += written,
                Err(e) if done == 0 => return Err(e),
                Err(e) => {
                    log::debug!("Short memory write at 0x{:x}: {}", addr + done as u64, e);
                    break;
                }
            }
        }
        Ok(done)
    }

    /// Threads as of the last stop.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.inner.thread_ids()
    }

    /// Re-enumerate threads from the stub.
    pub async fn update_thread_list(&self) -> Result<Vec<ThreadId>, RemoteError> {
        let mut threads = Vec::new();
        self.inner.client.get_current_thread_ids(&mut threads).await?;
        self.inner.stop_info.lock().unwrap().thread_ids = threads.clone();
        Ok(threads)
    }

    pub fn last_stop(&self) -> Option<StopDescription> {
        self.inner.stop_info.lock().unwrap().last_stop.clone()
    }

    pub fn last_stop_packet(&self) -> Option<String> {
        self.inner.stop_info.lock().unwrap().last_stop_packet.clone()
    }

    pub fn state(&self) -> ProcessState {
        self.inner.state.state()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateEvent> {
        self.inner.state.subscribe()
    }

    pub async fn wait_for_state(
        &self,
        timeout: Duration,
        pred: impl Fn(ProcessState) -> bool,
    ) -> Option<ProcessState> {
        self.inner.state.wait_for(timeout, pred).await
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.inner.state.exit_status()
    }

    pub fn exit_description(&self) -> Option<String> {
        self.inner.state.exit_description()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state.last_error()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.transport.is_connected() && self.state() != ProcessState::Exited
    }

    pub fn pid(&self) -> Option<Pid> {
        self.inner.pid()
    }

    pub fn host_info(&self) -> Option<HostInfo> {
        self.inner.client.cached_host_info()
    }

    pub fn registers(&self) -> Vec<RegisterInfo> {
        self.inner
            .layout
            .lock()
            .unwrap()
            .as_ref()
            .map(|layout| layout.registers.clone())
            .unwrap_or_default()
    }

    /// Master side of the launch terminal, if one was opened.
    /// Pid of the locally spawned stub, while it is supervised.
    pub fn stub_pid(&self) -> Option<u32> {
        self.inner.supervisor.pid()
    }

    pub fn take_pty_master(&self) -> Option<PtyMaster> {
        self.inner.pty_master.lock().unwrap().take()
    }

    pub fn console_output(&self, limit: Option<usize>) -> Vec<String> {
        self.inner.state.console_output(limit)
    }

    pub async fn dump_packet_history(&self, path: &Path) -> std::io::Result<()> {
        self.inner.transport.dump_packet_history(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResumeAction, ThreadAction};

    fn full_support() -> VContSupport {
        VContSupport::parse("vCont;c;C;s;S")
    }

    #[test]
    fn test_resume_all_prefers_vcont() {
        let packet = build_resume_packet(&ResumeRequest::All(ResumeAction::Continue), &full_support(), &[]).unwrap();
        assert_eq!(packet.to_string(), "vCont;c");
        let packet = build_resume_packet(
            &ResumeRequest::All(ResumeAction::StepWithSignal(5)),
            &VContSupport::parse("vCont;c;s"),
            &[],
        )
        .unwrap();
        assert_eq!(packet.to_string(), "S05");
    }

    #[test]
    fn test_per_thread_vcont() {
        let request = ResumeRequest::PerThread(vec![
            ThreadAction::new(ThreadId(1), ResumeAction::Step),
            ThreadAction::new(ThreadId(2), ResumeAction::Continue),
        ]);
        let packet = build_resume_packet(&request, &full_support(), &[ThreadId(1), ThreadId(2)]).unwrap();
        assert_eq!(packet.to_string(), "vCont;s:1;c:2");
    }

    #[test]
    fn test_uniform_request_collapses() {
        let request = ResumeRequest::PerThread(vec![
            ThreadAction::new(ThreadId(1), ResumeAction::Continue),
            ThreadAction::new(ThreadId(2), ResumeAction::Continue),
        ]);
        let live = [ThreadId(1), ThreadId(2)];
        assert_eq!(build_resume_packet(&request, &full_support(), &live).unwrap().to_string(), "vCont;c");
        assert_eq!(build_resume_packet(&request, &VContSupport::default(), &live).unwrap().to_string(), "c");
    }

    #[test]
    fn test_heterogeneous_without_support_is_unrepresentable() {
        let request = ResumeRequest::PerThread(vec![
            ThreadAction::new(ThreadId(1), ResumeAction::Continue),
            ThreadAction::new(ThreadId(2), ResumeAction::Step),
            ThreadAction::new(ThreadId(3), ResumeAction::ContinueWithSignal(5)),
        ]);
        let live = [ThreadId(1), ThreadId(2), ThreadId(3)];
        assert_eq!(
            build_resume_packet(&request, &VContSupport::parse("vCont;c;s;S"), &live),
            Err(ResumeError::Unrepresentable)
        );
    }

    #[test]
    fn test_uniform_subset_needs_vcont() {
        let request = ResumeRequest::PerThread(vec![ThreadAction::new(ThreadId(1), ResumeAction::Continue)]);
        assert_eq!(
            build_resume_packet(&request, &VContSupport::default(), &[ThreadId(1), ThreadId(2)]),
            Err(ResumeError::Unrepresentable)
        );
        assert_eq!(
            build_resume_packet(&ResumeRequest::PerThread(Vec::new()), &full_support(), &[]),
            Err(ResumeError::Unrepresentable)
        );
    }

    #[test]
    fn test_stdio_resolution() {
        let null = || Some(PathBuf::from(DEV_NULL));
        let out = || Some(PathBuf::from("/tmp/out"));

        assert_eq!(resolve_stdio(&LaunchSpec::default()), [None, None, None]);

        let disabled = LaunchSpec { disable_stdio: true, stdout: out(), ..Default::default() };
        assert_eq!(resolve_stdio(&disabled), [null(), null(), null()]);

        let partial = LaunchSpec { stdout: out(), ..Default::default() };
        assert_eq!(resolve_stdio(&partial), [null(), out(), null()]);
    }

    #[test]
    fn test_exit_code_from_kill_reply() {
        assert_eq!(exit_code_from_reply("W00"), Some(0));
        assert_eq!(exit_code_from_reply("X09"), Some(9));
        assert_eq!(exit_code_from_reply("OK"), None);
    }

    #[test]
    fn test_launch_spec_from_json() {
        let spec: LaunchSpec = serde_json::from_str(r#"{"args": ["-v"], "disable_aslr": true}"#).unwrap();
        assert_eq!(spec.args, vec!["-v".to_string()]);
        assert!(spec.disable_aslr);
        assert!(spec.env.is_empty());
    }
}
