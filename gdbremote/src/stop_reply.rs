/// Stop-reply interpretation
///
/// Turns one `T`/`S`/`W`/`X` packet into a [`StopDescription`] and assigns
/// the resulting stop reason to the originating thread.

use std::collections::BTreeMap;
use serde::Serialize;
use thiserror::Error;

use crate::codec::{decode_hex, PacketCursor};
use crate::host::ProcessHost;
use crate::types::{Addr, ThreadId};

const MAX_EXCEPTION_DATA: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StopParseError {
    #[error("Truncated stop reply: {0:?}")]
    Truncated(String),
    #[error("Unknown stop reply kind {0:?}")]
    UnknownKind(char),
}

/// Leading-byte classification, decided once during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopKind {
    Signal,
    Exited,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionPayload {
    pub exc_type: u32,
    pub data: Vec<u64>,
}

/// Why a particular thread stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StopReason {
    Trace,
    Breakpoint { site_id: u32 },
    Watchpoint,
    Exception { description: String, payload: Option<ExceptionPayload> },
    Signal(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopDescription {
    pub kind: StopKind,
    pub signal: u8,
    /// Exit code for `W`, terminating signal for `X`.
    pub exit_status: Option<i32>,
    pub thread: Option<ThreadId>,
    pub expedited: BTreeMap<ThreadId, BTreeMap<u32, Vec<u8>>>,
    pub reason_tag: Option<String>,
    pub exception: Option<ExceptionPayload>,
    pub description: Option<String>,
    pub roster: Option<Vec<ThreadId>>,
    pub thread_name: Option<String>,
    pub queue_addr: Option<Addr>,
    /// Final reason assigned to the originating thread.
    pub stop_reason: Option<StopReason>,
}

impl StopDescription {
    fn new(kind: StopKind) -> Self {
        Self {
            kind,
            signal: 0,
            exit_status: None,
            thread: None,
            expedited: BTreeMap::new(),
            reason_tag: None,
            exception: None,
            description: None,
            roster: None,
            thread_name: None,
            queue_addr: None,
            stop_reason: None,
        }
    }

    pub fn is_exit(&self) -> bool {
        self.kind == StopKind::Exited
    }
}

/// What the interpreter needs beyond the packet itself.
pub struct StopContext<'a> {
    pub host: &'a dyn ProcessHost,
    /// Register number tagged `generic:pc`.
    pub pc_regnum: Option<u32>,
    pub big_endian: bool,
}

fn truncated(packet: &str) -> StopParseError {
    StopParseError::Truncated(packet.to_string())
}

fn register_value(bytes: &[u8], big_endian: bool) -> Option<u64> {
    let len = bytes.len();
    if len == 0 || len > 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    if big_endian {
        buf[8 - len..].copy_from_slice(bytes);
        Some(u64::from_be_bytes(buf))
    } else {
        buf[..len].copy_from_slice(bytes);
        Some(u64::from_le_bytes(buf))
    }
}

pub fn interpret(packet: &str, ctx: &StopContext<'_>) -> Result<StopDescription, StopParseError> {
    let mut cursor = PacketCursor::new(packet);
    let kind = cursor.get_char().ok_or_else(|| truncated(packet))?;

    match kind {
        'W' | 'X' => {
            let value = cursor.get_hex_u8().ok_or_else(|| truncated(packet))?;
            let mut desc = StopDescription::new(StopKind::Exited);
            desc.exit_status = Some(value as i32);
            if kind == 'X' {
                desc.signal = value;
                desc.description = Some(format!("terminated with signal {}", value));
            }
            return Ok(desc);
        }
        'T' | 'S' => {}
        other => return Err(StopParseError::UnknownKind(other)),
    }

    let mut desc = StopDescription::new(StopKind::Signal);
    desc.signal = cursor.get_hex_u8().ok_or_else(|| truncated(packet))?;

    let mut exc_type = 0u32;
    let mut exc_data = Vec::new();
    let mut registers = BTreeMap::new();

    while let Some((name, value)) = cursor.name_colon_value() {
        match name {
            "metype" => exc_type = u32::from_str_radix(value, 16).map_err(|_| truncated(packet))?,
            "mecount" => {}
            "medata" => {
                let word = u64::from_str_radix(value, 16).map_err(|_| truncated(packet))?;
                if exc_data.len() < MAX_EXCEPTION_DATA {
                    exc_data.push(word);
                }
            }
            "thread" => match ThreadId::parse_hex(value) {
                Some(tid) => desc.thread = Some(tid),
                None => log::warn!("Ignoring malformed thread id {:?}", value),
            },
            "threads" => {
                desc.roster = Some(value.split(',').filter_map(ThreadId::parse_hex).collect());
            }
            "hexname" => {
                let bytes = decode_hex(value).map_err(|_| truncated(packet))?;
                desc.thread_name = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            "name" => desc.thread_name = Some(value.to_string()),
            "qaddr" => desc.queue_addr = u64::from_str_radix(value, 16).ok(),
            "reason" => desc.reason_tag = Some(value.to_string()),
            "description" => {
                let bytes = decode_hex(value).map_err(|_| truncated(packet))?;
                desc.description = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            _ if name.len() == 2 => match u8::from_str_radix(name, 16) {
                Ok(regnum) => {
                    let bytes = decode_hex(value).map_err(|_| truncated(packet))?;
                    registers.insert(regnum as u32, bytes);
                }
                Err(_) => log::debug!("Skipping malformed register number {:?}", name),
            },
            _ => log::trace!("Ignoring stop reply key {}", name),
        }
    }
    if !cursor.is_empty() {
        return Err(truncated(packet));
    }

    if exc_type != 0 {
        desc.exception = Some(ExceptionPayload { exc_type, data: exc_data });
    }

    if let Some(tid) = desc.thread {
        let thread = ctx.host.get_or_create_thread(tid);
        let pc = ctx
            .pc_regnum
            .and_then(|regnum| registers.get(&regnum))
            .and_then(|bytes| register_value(bytes, ctx.big_endian))
            .or_else(|| ctx.host.thread_pc(tid));

        desc.stop_reason = stop_reason_for(&desc, tid, pc, ctx);

        thread.set_name(desc.thread_name.clone());
        thread.set_queue_addr(desc.queue_addr);
        thread.set_expedited_registers(registers.clone());
        thread.set_stop_reason(desc.stop_reason.clone());
        desc.expedited.insert(tid, registers);

        if let Some(roster) = &desc.roster {
            for other in roster.iter().filter(|other| **other != tid) {
                ctx.host.get_or_create_thread(*other).set_stop_reason(None);
            }
        }
    }

    Ok(desc)
}

fn breakpoint_or_trace(tid: ThreadId, pc: Option<Addr>, ctx: &StopContext<'_>) -> StopReason {
    pc.and_then(|pc| ctx.host.find_breakpoint_site_by_address(pc))
        .filter(|site| site.valid_for_thread(tid))
        .map(|site| StopReason::Breakpoint { site_id: site.id() })
        .unwrap_or(StopReason::Trace)
}

fn stop_reason_for(desc: &StopDescription, tid: ThreadId, pc: Option<Addr>, ctx: &StopContext<'_>) -> Option<StopReason> {
    if let Some(payload) = &desc.exception {
        return Some(StopReason::Exception {
            description: desc.description.clone().unwrap_or_default(),
            payload: Some(payload.clone()),
        });
    }

    let by_tag = match desc.reason_tag.as_deref() {
        Some("trace") => Some(Some(StopReason::Trace)),
        Some("breakpoint") => Some(Some(breakpoint_or_trace(tid, pc, ctx))),
        Some("watchpoint") => Some(Some(StopReason::Watchpoint)),
        Some("exception") => Some(Some(StopReason::Exception {
            description: desc.description.clone().unwrap_or_default(),
            payload: None,
        })),
        Some("signal") if desc.signal != 0 => Some(Some(StopReason::Signal(desc.signal))),
        Some("none") => Some(None),
        // "trap" and unrecognized tags use the signal below
        _ => None,
    };
    if let Some(reason) = by_tag {
        return reason;
    }

    let by_signal = if desc.signal == ctx.host.current_platform_trap_signal() {
        Some(breakpoint_or_trace(tid, pc, ctx))
    } else if desc.signal != 0 {
        Some(StopReason::Signal(desc.signal))
    } else {
        None
    };

    match (by_signal, &desc.description) {
        (None, Some(text)) => Some(StopReason::Exception { description: text.clone(), payload: None }),
        (reason, _) => reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::host::ThreadTable;
    use crate::types::{BreakpointSite, MemoryPermissions, RegisterInfo, RemoteThread};

    #[derive(Default)]
    struct SiteHost {
        threads: ThreadTable,
        sites: Vec<Arc<BreakpointSite>>,
    }

    impl ProcessHost for SiteHost {
        fn locate_register_layout(&self, _force: bool, _registers: &[RegisterInfo]) {}

        fn get_or_create_thread(&self, tid: ThreadId) -> Arc<RemoteThread> {
            self.threads.get_or_create(tid)
        }

        fn find_breakpoint_site_by_address(&self, pc: Addr) -> Option<Arc<BreakpointSite>> {
            self.sites.iter().find(|s| s.load_address() == pc).cloned()
        }

        fn breakpoint_sites(&self) -> Vec<Arc<BreakpointSite>> {
            self.sites.clone()
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

    fn context(host: &SiteHost) -> StopContext<'_> {
        StopContext { host, pc_regnum: Some(0x10), big_endian: false }
    }

    #[test]
    fn test_signal_stop_with_thread() {
        let host = SiteHost::default();
        let desc = interpret("T05thread:01;", &context(&host)).unwrap();
        assert_eq!(desc.kind, StopKind::Signal);
        assert_eq!(desc.signal, 5);
        assert_eq!(desc.thread, Some(ThreadId(1)));
        // no site under an unknown pc
        assert_eq!(desc.stop_reason, Some(StopReason::Trace));
        assert_eq!(host.threads.get(ThreadId(1)).unwrap().stop_reason(), Some(StopReason::Trace));
    }

    #[test]
    fn test_exit_reply() {
        let host = SiteHost::default();
        let desc = interpret("W00", &context(&host)).unwrap();
        assert!(desc.is_exit());
        assert_eq!(desc.exit_status, Some(0));

        let killed = interpret("X09", &context(&host)).unwrap();
        assert!(killed.is_exit());
        assert_eq!(killed.signal, 9);
    }

    #[test]
    fn test_threads_roster_skips_malformed_entries() {
        let host = SiteHost::default();
        let desc = interpret("T00thread:2;threads:1,2,zz,a;", &context(&host)).unwrap();
        assert_eq!(desc.roster, Some(vec![ThreadId(1), ThreadId(2), ThreadId(0xa)]));
    }

    #[test]
    fn test_breakpoint_reason_without_site_degrades_to_trace() {
        let host = SiteHost {
            sites: vec![Arc::new(BreakpointSite::new(3, 0x5000, 1))],
            ..Default::default()
        };
        // pc register 0x10 little-endian = 0x4000
        let desc = interpret("T05thread:1;10:0040000000000000;reason:breakpoint;", &context(&host)).unwrap();
        assert_eq!(desc.stop_reason, Some(StopReason::Trace));
    }

    #[test]
    fn test_breakpoint_reason_with_matching_site() {
        let host = SiteHost {
            sites: vec![Arc::new(BreakpointSite::new(3, 0x4000, 1))],
            ..Default::default()
        };
        let desc = interpret("T05thread:1;10:0040000000000000;reason:breakpoint;", &context(&host)).unwrap();
        assert_eq!(desc.stop_reason, Some(StopReason::Breakpoint { site_id: 3 }));
        assert_eq!(desc.expedited[&ThreadId(1)][&0x10], vec![0x00, 0x40, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_site_for_other_thread_is_trace() {
        let host = SiteHost {
            sites: vec![Arc::new(BreakpointSite::new(3, 0x4000, 1).with_thread_filter(vec![ThreadId(9)]))],
            ..Default::default()
        };
        let desc = interpret("T05thread:1;10:0040000000000000;", &context(&host)).unwrap();
        assert_eq!(desc.stop_reason, Some(StopReason::Trace));
    }

    #[test]
    fn test_signal_zero_clears_prior_reason() {
        let host = SiteHost::default();
        interpret("T0bthread:1;", &context(&host)).unwrap();
        assert_eq!(host.threads.get(ThreadId(1)).unwrap().stop_reason(), Some(StopReason::Signal(11)));

        let desc = interpret("T00thread:1;", &context(&host)).unwrap();
        assert_eq!(desc.stop_reason, None);
        assert_eq!(host.threads.get(ThreadId(1)).unwrap().stop_reason(), None);
    }

    #[test]
    fn test_exception_payload_wins() {
        let host = SiteHost::default();
        let desc = interpret(
            "T11thread:4;metype:6;mecount:2;medata:1;medata:2a;reason:breakpoint;",
            &context(&host),
        )
        .unwrap();
        assert_eq!(
            desc.stop_reason,
            Some(StopReason::Exception {
                description: String::new(),
                payload: Some(ExceptionPayload { exc_type: 6, data: vec![1, 0x2a] }),
            })
        );
    }

    #[test]
    fn test_description_alone_becomes_exception() {
        let host = SiteHost::default();
        // "oops"
        let desc = interpret("T00thread:1;description:6f6f7073;", &context(&host)).unwrap();
        assert_eq!(
            desc.stop_reason,
            Some(StopReason::Exception { description: "oops".into(), payload: None })
        );
    }

    #[test]
    fn test_names_and_queue() {
        let host = SiteHost::default();
        let desc = interpret("T02thread:3;hexname:776f726b6572;qaddr:7fff0010;", &context(&host)).unwrap();
        assert_eq!(desc.thread_name.as_deref(), Some("worker"));
        assert_eq!(desc.queue_addr, Some(0x7fff0010));
        assert_eq!(desc.stop_reason, Some(StopReason::Signal(2)));
        let info = host.threads.get(ThreadId(3)).unwrap().info();
        assert_eq!(info.name.as_deref(), Some("worker"));
    }

    #[test]
    fn test_parse_errors() {
        let host = SiteHost::default();
        assert_eq!(interpret("Q05", &context(&host)), Err(StopParseError::UnknownKind('Q')));
        assert!(matches!(interpret("T0", &context(&host)), Err(StopParseError::Truncated(_))));
        assert!(matches!(interpret("", &context(&host)), Err(StopParseError::Truncated(_))));
        assert!(matches!(
            interpret("T05thread:1;hexname:abc;", &context(&host)),
            Err(StopParseError::Truncated(_))
        ));
        assert!(matches!(interpret("T05dangling", &context(&host)), Err(StopParseError::Truncated(_))));
    }
}
