/// Shared value types for the remote debugging client
///
/// Thread identifiers, stoppoint kinds, resume directives, register and
/// host descriptions, and the breakpoint/watchpoint objects the controller
/// toggles as a side effect of wire operations.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use serde::{Deserialize, Serialize};

use crate::stop_reply::StopReason;

/// Inferior process id as reported by the stub.
pub type Pid = u64;

/// Inferior address.
pub type Addr = u64;

/// Opaque wire thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Parse a hex thread id as it appears on the wire.
    pub fn parse_hex(text: &str) -> Option<Self> {
        if text.is_empty() {
            return None;
        }
        u64::from_str_radix(text, 16).ok().map(ThreadId)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// The `<type>` field of `Z`/`z` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoppointKind {
    SoftwareBreakpoint,
    HardwareBreakpoint,
    WriteWatchpoint,
    ReadWatchpoint,
    AccessWatchpoint,
}

impl StoppointKind {
    pub fn code(self) -> u8 {
        match self {
            StoppointKind::SoftwareBreakpoint => 0,
            StoppointKind::HardwareBreakpoint => 1,
            StoppointKind::WriteWatchpoint => 2,
            StoppointKind::ReadWatchpoint => 3,
            StoppointKind::AccessWatchpoint => 4,
        }
    }

    pub(crate) fn index(self) -> usize {
        self.code() as usize
    }
}

/// What a single thread should do when the process resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    Continue,
    Step,
    ContinueWithSignal(u8),
    StepWithSignal(u8),
}

impl ResumeAction {
    /// The action letter used by both `vCont` and the legacy packets.
    pub fn code(self) -> char {
        match self {
            ResumeAction::Continue => 'c',
            ResumeAction::Step => 's',
            ResumeAction::ContinueWithSignal(_) => 'C',
            ResumeAction::StepWithSignal(_) => 'S',
        }
    }
}

impl fmt::Display for ResumeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeAction::Continue | ResumeAction::Step => write!(f, "{}", self.code()),
            ResumeAction::ContinueWithSignal(sig) | ResumeAction::StepWithSignal(sig) => {
                write!(f, "{}{:02x}", self.code(), sig)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAction {
    pub tid: ThreadId,
    pub action: ResumeAction,
}

impl ThreadAction {
    pub fn new(tid: ThreadId, action: ResumeAction) -> Self {
        Self { tid, action }
    }
}

/// A resume request handed to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeRequest {
    /// One action applied to every thread in the process.
    All(ResumeAction),
    /// Individual directives per thread.
    PerThread(Vec<ThreadAction>),
}

/// Actions the stub advertised in its `vCont?` reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VContSupport {
    pub c: bool,
    pub upper_c: bool,
    pub s: bool,
    pub upper_s: bool,
}

impl VContSupport {
    /// Parse a `vCont;c;C;s;S` style reply.
    pub fn parse(response: &str) -> Self {
        let mut support = VContSupport::default();
        if let Some(actions) = response.strip_prefix("vCont") {
            for action in actions.split(';').filter(|a| !a.is_empty()) {
                match action {
                    "c" => support.c = true,
                    "C" => support.upper_c = true,
                    "s" => support.s = true,
                    "S" => support.upper_s = true,
                    _ => {}
                }
            }
        }
        support
    }

    pub fn supports(&self, code: char) -> bool {
        match code {
            'c' => self.c,
            'C' => self.upper_c,
            's' => self.s,
            'S' => self.upper_s,
            'a' => self.c && self.upper_c && self.s && self.upper_s,
            _ => false,
        }
    }
}

/// Tri-state capability flag: not probed yet, known supported, known unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LazyBool {
    #[default]
    Calculate,
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryPermissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl MemoryPermissions {
    pub const READ_WRITE: MemoryPermissions = MemoryPermissions { read: true, write: true, execute: false };
    pub const READ_EXECUTE: MemoryPermissions = MemoryPermissions { read: true, write: false, execute: true };
}

impl fmt::Display for MemoryPermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.read {
            f.write_str("r")?;
        }
        if self.write {
            f.write_str("w")?;
        }
        if self.execute {
            f.write_str("x")?;
        }
        Ok(())
    }
}

/// One entry of the `qRegisterInfo` table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegisterInfo {
    pub regnum: u32,
    pub name: String,
    pub alt_name: Option<String>,
    pub bitsize: u32,
    pub offset: u32,
    pub encoding: Option<String>,
    pub format: Option<String>,
    pub set: Option<String>,
    pub gcc: Option<u32>,
    pub dwarf: Option<u32>,
    pub generic: Option<String>,
}

/// Parsed `qHostInfo` reply.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostInfo {
    pub cputype: Option<u32>,
    pub cpusubtype: Option<u32>,
    pub ostype: Option<String>,
    pub vendor: Option<String>,
    pub endian: Option<String>,
    pub ptrsize: Option<u32>,
    pub triple: Option<String>,
    pub hostname: Option<String>,
}

impl HostInfo {
    pub fn is_big_endian(&self) -> bool {
        self.endian.as_deref() == Some("big")
    }
}

/// How an enabled breakpoint site was installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteKind {
    /// Trap opcode written into inferior memory by the host.
    Software,
    /// `Z1` hardware breakpoint held by the stub.
    Hardware,
    /// `Z0` software breakpoint managed by the stub.
    External,
}

#[derive(Debug, Default)]
struct SiteState {
    enabled: bool,
    kind: Option<SiteKind>,
}

/// A breakpoint location owned by the debugger core.
///
/// The controller only ever flips the enabled flag and the kind tag.
#[derive(Debug)]
pub struct BreakpointSite {
    id: u32,
    load_addr: Addr,
    trap_opcode_size: usize,
    hardware_preferred: bool,
    thread_filter: Option<Vec<ThreadId>>,
    state: Mutex<SiteState>,
}

impl BreakpointSite {
    pub fn new(id: u32, load_addr: Addr, trap_opcode_size: usize) -> Self {
        Self {
            id,
            load_addr,
            trap_opcode_size,
            hardware_preferred: false,
            thread_filter: None,
            state: Mutex::new(SiteState::default()),
        }
    }

    pub fn with_hardware_preferred(mut self, preferred: bool) -> Self {
        self.hardware_preferred = preferred;
        self
    }

    /// Restrict the site to the given threads.
    pub fn with_thread_filter(mut self, threads: Vec<ThreadId>) -> Self {
        self.thread_filter = Some(threads);
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn load_address(&self) -> Addr {
        self.load_addr
    }

    pub fn trap_opcode_size(&self) -> usize {
        self.trap_opcode_size
    }

    pub fn hardware_preferred(&self) -> bool {
        self.hardware_preferred
    }

    pub fn valid_for_thread(&self, tid: ThreadId) -> bool {
        match &self.thread_filter {
            Some(threads) => threads.contains(&tid),
            None => true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    pub fn kind(&self) -> Option<SiteKind> {
        self.state.lock().unwrap().kind
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().enabled = enabled;
    }

    pub fn set_kind(&self, kind: SiteKind) {
        self.state.lock().unwrap().kind = Some(kind);
    }
}

#[derive(Debug, Default)]
struct WatchState {
    enabled: bool,
    hardware: bool,
}

/// A data watchpoint owned by the debugger core.
#[derive(Debug)]
pub struct Watchpoint {
    id: u32,
    load_addr: Addr,
    byte_size: usize,
    watch_read: bool,
    watch_write: bool,
    state: Mutex<WatchState>,
}

impl Watchpoint {
    pub fn new(id: u32, load_addr: Addr, byte_size: usize, watch_read: bool, watch_write: bool) -> Self {
        Self {
            id,
            load_addr,
            byte_size,
            watch_read,
            watch_write,
            state: Mutex::new(WatchState::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn load_address(&self) -> Addr {
        self.load_addr
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn watches_read(&self) -> bool {
        self.watch_read
    }

    pub fn watches_write(&self) -> bool {
        self.watch_write
    }

    /// Stoppoint type derived from the read/write flags.
    pub fn stoppoint_kind(&self) -> Option<StoppointKind> {
        match (self.watch_read, self.watch_write) {
            (true, true) => Some(StoppointKind::AccessWatchpoint),
            (true, false) => Some(StoppointKind::ReadWatchpoint),
            (false, true) => Some(StoppointKind::WriteWatchpoint),
            (false, false) => None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    pub fn is_hardware(&self) -> bool {
        self.state.lock().unwrap().hardware
    }

    pub fn set_enabled(&self, enabled: bool, hardware: bool) {
        let mut state = self.state.lock().unwrap();
        state.enabled = enabled;
        state.hardware = enabled && hardware;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ThreadInfo {
    pub name: Option<String>,
    pub queue_addr: Option<Addr>,
    pub stop_reason: Option<StopReason>,
    pub expedited: BTreeMap<u32, Vec<u8>>,
}

/// Per-thread bookkeeping updated on every stop.
#[derive(Debug)]
pub struct RemoteThread {
    tid: ThreadId,
    info: Mutex<ThreadInfo>,
}

impl RemoteThread {
    pub fn new(tid: ThreadId) -> Self {
        Self { tid, info: Mutex::new(ThreadInfo::default()) }
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn info(&self) -> ThreadInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.info.lock().unwrap().stop_reason.clone()
    }

    pub fn set_stop_reason(&self, reason: Option<StopReason>) {
        self.info.lock().unwrap().stop_reason = reason;
    }

    pub fn set_name(&self, name: Option<String>) {
        self.info.lock().unwrap().name = name;
    }

    pub fn set_queue_addr(&self, addr: Option<Addr>) {
        self.info.lock().unwrap().queue_addr = addr;
    }

    pub fn set_expedited_registers(&self, registers: BTreeMap<u32, Vec<u8>>) {
        self.info.lock().unwrap().expedited = registers;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vcont_reply_parsing() {
        let support = VContSupport::parse("vCont;c;C;s");
        assert!(support.supports('c'));
        assert!(support.supports('C'));
        assert!(support.supports('s'));
        assert!(!support.supports('S'));
        assert!(!support.supports('a'));

        assert_eq!(VContSupport::parse(""), VContSupport::default());
    }

    #[test]
    fn test_resume_action_text() {
        assert_eq!(ResumeAction::Continue.to_string(), "c");
        assert_eq!(ResumeAction::StepWithSignal(0x1e).to_string(), "S1e");
    }

    #[test]
    fn test_watchpoint_kind_from_flags() {
        assert_eq!(Watchpoint::new(1, 0, 4, true, true).stoppoint_kind(), Some(StoppointKind::AccessWatchpoint));
        assert_eq!(Watchpoint::new(1, 0, 4, true, false).stoppoint_kind(), Some(StoppointKind::ReadWatchpoint));
        assert_eq!(Watchpoint::new(1, 0, 4, false, true).stoppoint_kind(), Some(StoppointKind::WriteWatchpoint));
        assert_eq!(Watchpoint::new(1, 0, 4, false, false).stoppoint_kind(), None);
    }

    #[test]
    fn test_permissions_display() {
        assert_eq!(MemoryPermissions::READ_WRITE.to_string(), "rw");
        assert_eq!(MemoryPermissions { read: true, write: true, execute: true }.to_string(), "rwx");
    }
}
