/// Collaborators the controller consumes but does not implement
///
/// Register layout, thread objects, breakpoint site lookup, and the
/// in-process fallbacks for breakpoints and memory allocation all belong to
/// the surrounding debugger. The controller reaches them only through
/// [`ProcessHost`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::types::{Addr, BreakpointSite, MemoryPermissions, RegisterInfo, RemoteThread, ThreadId};

/// Platform trap signal (SIGTRAP on every supported host).
pub const DEFAULT_TRAP_SIGNAL: u8 = 5;

pub trait ProcessHost: Send + Sync {
    /// Hand over the harvested register descriptions. `force` rebuilds an
    /// existing layout.
    fn locate_register_layout(&self, force: bool, registers: &[RegisterInfo]);

    fn get_or_create_thread(&self, tid: ThreadId) -> Arc<RemoteThread>;

    fn find_breakpoint_site_by_address(&self, pc: Addr) -> Option<Arc<BreakpointSite>>;

    /// Every site the controller manages, used to clear them on detach.
    fn breakpoint_sites(&self) -> Vec<Arc<BreakpointSite>>;

    fn current_platform_trap_signal(&self) -> u8 {
        DEFAULT_TRAP_SIGNAL
    }

    /// Allocate memory by calling `mmap` inside the inferior.
    fn inferior_mmap(&self, size: u64, permissions: MemoryPermissions) -> Option<Addr>;

    fn inferior_munmap(&self, addr: Addr, size: u64) -> bool;

    /// Write the trap opcode for `site` into inferior memory.
    fn install_software_breakpoint(&self, site: &BreakpointSite) -> bool;

    fn uninstall_software_breakpoint(&self, site: &BreakpointSite) -> bool;

    fn discard_thread_plans(&self) {}

    /// PC of a thread when the stop reply did not expedite it.
    fn thread_pc(&self, _tid: ThreadId) -> Option<Addr> {
        None
    }
}

/// Thread table keyed by wire id, for hosts that have no richer thread model.
#[derive(Debug, Default)]
pub struct ThreadTable {
    threads: Mutex<HashMap<ThreadId, Arc<RemoteThread>>>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, tid: ThreadId) -> Arc<RemoteThread> {
        self.threads
            .lock()
            .unwrap()
            .entry(tid)
            .or_insert_with(|| Arc::new(RemoteThread::new(tid)))
            .clone()
    }

    pub fn get(&self, tid: ThreadId) -> Option<Arc<RemoteThread>> {
        self.threads.lock().unwrap().get(&tid).cloned()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host with no in-process fallbacks: only the thread table is real.
#[derive(Debug, Default)]
pub struct DetachedHost {
    threads: ThreadTable,
    registers: Mutex<Vec<RegisterInfo>>,
}

impl DetachedHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    pub fn registers(&self) -> Vec<RegisterInfo> {
        self.registers.lock().unwrap().clone()
    }
}

impl ProcessHost for DetachedHost {
    fn locate_register_layout(&self, force: bool, registers: &[RegisterInfo]) {
        let mut current = self.registers.lock().unwrap();
        if force || current.is_empty() {
            *current = registers.to_vec();
        }
    }

    fn get_or_create_thread(&self, tid: ThreadId) -> Arc<RemoteThread> {
        self.threads.get_or_create(tid)
    }

    fn find_breakpoint_site_by_address(&self, _pc: Addr) -> Option<Arc<BreakpointSite>> {
        None
    }

    fn breakpoint_sites(&self) -> Vec<Arc<BreakpointSite>> {
        Vec::new()
    }

    fn inferior_mmap(&self, _size: u64, _permissions: MemoryPermissions) -> Option<Addr> {
        None
    }

    fn inferior_munmap(&self, _addr: Addr, _size: u64) -> bool {
        false
    }

    fn install_software_breakpoint(&self, _site: &BreakpointSite) -> bool {
        false
    }

    fn uninstall_software_breakpoint(&self, _site: &BreakpointSite) -> bool {
        false
    }
}
