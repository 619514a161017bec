/// Wire codec for the GDB remote serial protocol
///
/// Hex helpers, `$payload#cs` framing with run-length expansion, a cursor
/// over stop-reply bodies, the fixed request shapes, and classification of
/// stub responses.

use std::fmt;
use thiserror::Error;

use crate::types::{Addr, MemoryPermissions, ResumeAction, StoppointKind, ThreadAction, ThreadId};

/// Fill byte for destination bytes a short hex reply could not supply.
pub const FILL_BYTE: u8 = 0xdd;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed hex: {0:?}")]
    MalformedHex(String),
    #[error("Bad packet checksum: expected {expected:02x}, computed {actual:02x}")]
    BadChecksum { expected: u8, actual: u8 },
    #[error("Malformed packet frame: {0}")]
    MalformedFrame(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub fn decode_hex(text: &str) -> Result<Vec<u8>> {
    let raw = text.as_bytes();
    if raw.len() % 2 != 0 {
        return Err(CodecError::MalformedHex(text.to_string()));
    }
    raw.chunks(2)
        .map(|pair| match (hex_value(pair[0]), hex_value(pair[1])) {
            (Some(hi), Some(lo)) => Ok(hi << 4 | lo),
            _ => Err(CodecError::MalformedHex(text.to_string())),
        })
        .collect()
}

/// Decode hex into `dst`, filling whatever the text could not supply with
/// `fill`. Returns how many bytes were actually decoded; never writes past
/// `dst.len()`.
pub fn decode_hex_into(text: &str, dst: &mut [u8], fill: u8) -> usize {
    let raw = text.as_bytes();
    let mut decoded = 0;
    while decoded < dst.len() {
        let at = decoded * 2;
        if at + 1 >= raw.len() {
            break;
        }
        match (hex_value(raw[at]), hex_value(raw[at + 1])) {
            (Some(hi), Some(lo)) => dst[decoded] = hi << 4 | lo,
            _ => break,
        }
        decoded += 1;
    }
    for slot in &mut dst[decoded..] {
        *slot = fill;
    }
    decoded
}

/// Modulo-256 sum of the payload bytes.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Frame a payload as `$payload#cs`.
pub fn frame_packet(payload: &str) -> Vec<u8> {
    format!("${}#{:02x}", payload, checksum(payload.as_bytes())).into_bytes()
}

/// Undo `}` escaping and `*` run-length encoding.
fn expand_payload(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'}' if i + 1 < raw.len() => {
                out.push(raw[i + 1] ^ 0x20);
                i += 2;
            }
            b'*' if i + 1 < raw.len() => {
                if let Some(&last) = out.last() {
                    let repeat = raw[i + 1].saturating_sub(29) as usize;
                    out.extend(std::iter::repeat(last).take(repeat));
                }
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

/// One unit pulled off the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Nack,
    /// Out-of-band `0x03`.
    Interrupt,
    Packet(String),
    /// `%payload#cs` notification.
    Notification(String),
}

/// Incremental splitter for the incoming byte stream.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buf: Vec<u8>,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let first = *self.buf.first()?;
            match first {
                b'+' | b'-' | 0x03 => {
                    self.buf.remove(0);
                    return Some(Ok(match first {
                        b'+' => Frame::Ack,
                        b'-' => Frame::Nack,
                        _ => Frame::Interrupt,
                    }));
                }
                b'$' | b'%' => {
                    let hash = self.buf.iter().position(|&b| b == b'#')?;
                    if self.buf.len() < hash + 3 {
                        return None;
                    }
                    let frame: Vec<u8> = self.buf.drain(..hash + 3).collect();
                    return Some(decode_frame(&frame));
                }
                other => {
                    log::trace!("Discarding stray byte 0x{:02x}", other);
                    self.buf.remove(0);
                }
            }
        }
    }
}

fn decode_frame(frame: &[u8]) -> Result<Frame> {
    let hash = frame.len() - 3;
    let body = &frame[1..hash];
    let expected = match (hex_value(frame[hash + 1]), hex_value(frame[hash + 2])) {
        (Some(hi), Some(lo)) => hi << 4 | lo,
        _ => {
            return Err(CodecError::MalformedFrame(
                String::from_utf8_lossy(frame).into_owned(),
            ))
        }
    };
    let actual = checksum(body);
    if expected != actual {
        return Err(CodecError::BadChecksum { expected, actual });
    }
    let payload = String::from_utf8_lossy(&expand_payload(body)).into_owned();
    Ok(if frame[0] == b'%' {
        Frame::Notification(payload)
    } else {
        Frame::Packet(payload)
    })
}

/// Read position over a response or stop-reply body.
#[derive(Debug, Clone)]
pub struct PacketCursor<'a> {
    data: &'a str,
    pos: usize,
}

impl<'a> PacketCursor<'a> {
    pub fn new(data: &'a str) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> &'a str {
        &self.data[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn get_char(&mut self) -> Option<char> {
        let c = self.remaining().chars().next()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    /// Exactly two hex digits.
    pub fn get_hex_u8(&mut self) -> Option<u8> {
        let raw = self.remaining().as_bytes();
        if raw.len() < 2 {
            return None;
        }
        let value = hex_value(raw[0])? << 4 | hex_value(raw[1])?;
        self.pos += 2;
        Some(value)
    }

    /// Consume one `name:value;` unit. The trailing `;` may be missing on
    /// the last pair. Nothing is consumed when no pair is available.
    pub fn name_colon_value(&mut self) -> Option<(&'a str, &'a str)> {
        let rest = self.remaining();
        let colon = rest.find(':')?;
        let name = &rest[..colon];
        if name.contains(';') {
            return None;
        }
        let after = &rest[colon + 1..];
        let (value, consumed) = match after.find(';') {
            Some(semi) => (&after[..semi], colon + 1 + semi + 1),
            None => (after, rest.len()),
        };
        self.pos += consumed;
        Some((name, value))
    }
}

/// Requests with a fixed wire shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    HaltReason,
    ReadMemory { addr: Addr, len: usize },
    WriteMemory { addr: Addr, data: Vec<u8> },
    InsertStoppoint { kind: StoppointKind, addr: Addr, size: usize },
    RemoveStoppoint { kind: StoppointKind, addr: Addr, size: usize },
    VCont(Vec<ThreadAction>),
    VContAll(ResumeAction),
    VContQuery,
    Resume(ResumeAction),
    SetGeneralThread(Option<ThreadId>),
    SetContinueThread(Option<ThreadId>),
    RegisterInfo(u32),
    AttachPid(u64),
    AttachName(String),
    AttachWait(String),
    Arguments(Vec<String>),
    CurrentProcess,
    ThreadInfoFirst,
    ThreadInfoNext,
    HostInfo,
    StartNoAckMode,
    ThreadSuffixSupported,
    ListThreadsInStopReply,
    LaunchSuccess,
    Environment(String),
    SetStdio { fd: u8, path: String },
    DisableAslr(bool),
    WorkingDir(String),
    LaunchArch(String),
    AllocateMemory { size: u64, permissions: MemoryPermissions },
    DeallocateMemory(Addr),
    Kill,
    Detach,
}

fn thread_selector(tid: &Option<ThreadId>) -> String {
    match tid {
        Some(tid) => tid.to_string(),
        None => "-1".to_string(),
    }
}

/// Environment entries holding framing characters go hex-encoded.
fn needs_hex_environment(entry: &str) -> bool {
    entry.bytes().any(|b| matches!(b, b'$' | b'#' | b'*' | b'}') || (!b.is_ascii_graphic() && b != b' '))
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::HaltReason => f.write_str("?"),
            Packet::ReadMemory { addr, len } => write!(f, "m{:x},{:x}", addr, len),
            Packet::WriteMemory { addr, data } => {
                write!(f, "M{:x},{:x}:{}", addr, data.len(), encode_hex(data))
            }
            Packet::InsertStoppoint { kind, addr, size } => {
                write!(f, "Z{},{:x},{:x}", kind.code(), addr, size)
            }
            Packet::RemoveStoppoint { kind, addr, size } => {
                write!(f, "z{},{:x},{:x}", kind.code(), addr, size)
            }
            Packet::VCont(actions) => {
                f.write_str("vCont")?;
                for ThreadAction { tid, action } in actions {
                    write!(f, ";{}:{}", action, tid)?;
                }
                Ok(())
            }
            Packet::VContAll(action) => write!(f, "vCont;{}", action),
            Packet::VContQuery => f.write_str("vCont?"),
            Packet::Resume(action) => write!(f, "{}", action),
            Packet::SetGeneralThread(tid) => write!(f, "Hg{}", thread_selector(tid)),
            Packet::SetContinueThread(tid) => write!(f, "Hc{}", thread_selector(tid)),
            Packet::RegisterInfo(n) => write!(f, "qRegisterInfo{:x}", n),
            Packet::AttachPid(pid) => write!(f, "vAttach;{:x}", pid),
            Packet::AttachName(name) => write!(f, "vAttachName;{}", encode_hex(name.as_bytes())),
            Packet::AttachWait(name) => write!(f, "vAttachWait;{}", encode_hex(name.as_bytes())),
            Packet::Arguments(args) => {
                f.write_str("A")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{},{},{}", arg.len() * 2, i, encode_hex(arg.as_bytes()))?;
                }
                Ok(())
            }
            Packet::CurrentProcess => f.write_str("qC"),
            Packet::ThreadInfoFirst => f.write_str("qfThreadInfo"),
            Packet::ThreadInfoNext => f.write_str("qsThreadInfo"),
            Packet::HostInfo => f.write_str("qHostInfo"),
            Packet::StartNoAckMode => f.write_str("QStartNoAckMode"),
            Packet::ThreadSuffixSupported => f.write_str("QThreadSuffixSupported"),
            Packet::ListThreadsInStopReply => f.write_str("QListThreadsInStopReply"),
            Packet::LaunchSuccess => f.write_str("qLaunchSuccess"),
            Packet::Environment(entry) => {
                if needs_hex_environment(entry) {
                    write!(f, "QEnvironmentHexEncoded:{}", encode_hex(entry.as_bytes()))
                } else {
                    write!(f, "QEnvironment:{}", entry)
                }
            }
            Packet::SetStdio { fd, path } => {
                let name = match fd {
                    0 => "STDIN",
                    1 => "STDOUT",
                    _ => "STDERR",
                };
                write!(f, "QSet{}:{}", name, encode_hex(path.as_bytes()))
            }
            Packet::DisableAslr(disable) => write!(f, "QSetDisableASLR:{}", u8::from(*disable)),
            Packet::WorkingDir(dir) => write!(f, "QSetWorkingDir:{}", encode_hex(dir.as_bytes())),
            Packet::LaunchArch(arch) => write!(f, "QLaunchArch:{}", arch),
            Packet::AllocateMemory { size, permissions } => write!(f, "_M{:x},{}", size, permissions),
            Packet::DeallocateMemory(addr) => write!(f, "_m{:x}", addr),
            Packet::Kill => f.write_str("k"),
            Packet::Detach => f.write_str("D"),
        }
    }
}

pub fn format_packet(packet: &Packet) -> String {
    packet.to_string()
}

/// Coarse shape of a stub response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Ok,
    Error(u8),
    Unsupported,
    Normal,
}

pub fn classify(response: &str) -> ResponseKind {
    if response.is_empty() {
        ResponseKind::Unsupported
    } else if response == "OK" {
        ResponseKind::Ok
    } else if let Some(code) = error_code(response) {
        ResponseKind::Error(code)
    } else {
        ResponseKind::Normal
    }
}

pub fn is_ok(response: &str) -> bool {
    classify(response) == ResponseKind::Ok
}

pub fn is_error(response: &str) -> bool {
    matches!(classify(response), ResponseKind::Error(_))
}

pub fn is_unsupported(response: &str) -> bool {
    classify(response) == ResponseKind::Unsupported
}

pub fn is_normal(response: &str) -> bool {
    classify(response) == ResponseKind::Normal
}

/// `Exx` error code, if the response is exactly an error reply.
pub fn error_code(response: &str) -> Option<u8> {
    let raw = response.as_bytes();
    if raw.len() != 3 || raw[0] != b'E' {
        return None;
    }
    Some(hex_value(raw[1])? << 4 | hex_value(raw[2])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let bytes = [0x00u8, 0x7f, 0xdd, 0xff, 0x10];
        assert_eq!(encode_hex(&bytes), "007fddff10");
        assert_eq!(decode_hex(&encode_hex(&bytes)).unwrap(), bytes);
        assert_eq!(decode_hex("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_decode_hex_rejects_odd_and_non_hex() {
        assert!(matches!(decode_hex("abc"), Err(CodecError::MalformedHex(_))));
        assert!(matches!(decode_hex("zz"), Err(CodecError::MalformedHex(_))));
    }

    #[test]
    fn test_decode_hex_into_fills_short_reads() {
        let mut dst = [0u8; 4];
        let n = decode_hex_into("0102", &mut dst, FILL_BYTE);
        assert_eq!(n, 2);
        assert_eq!(dst, [0x01, 0x02, 0xdd, 0xdd]);

        let mut small = [0u8; 1];
        assert_eq!(decode_hex_into("aabbcc", &mut small, FILL_BYTE), 1);
        assert_eq!(small, [0xaa]);
    }

    #[test]
    fn test_frame_and_decode() {
        assert_eq!(frame_packet("OK"), b"$OK#9a".to_vec());

        let mut decoder = PacketDecoder::new();
        decoder.push(b"+$OK#9a$T05");
        assert_eq!(decoder.next_frame(), Some(Ok(Frame::Ack)));
        assert_eq!(decoder.next_frame(), Some(Ok(Frame::Packet("OK".into()))));
        assert_eq!(decoder.next_frame(), None);

        decoder.push(b"#b9\x03");
        assert_eq!(decoder.next_frame(), Some(Ok(Frame::Packet("T05".into()))));
        assert_eq!(decoder.next_frame(), Some(Ok(Frame::Interrupt)));
    }

    #[test]
    fn test_decode_bad_checksum() {
        let mut decoder = PacketDecoder::new();
        decoder.push(b"$OK#00");
        assert_eq!(
            decoder.next_frame(),
            Some(Err(CodecError::BadChecksum { expected: 0x00, actual: 0x9a }))
        );
    }

    #[test]
    fn test_run_length_expansion() {
        // '0' repeated: "0* " is '0' plus 3 more copies
        assert_eq!(expand_payload(b"0* "), b"0000".to_vec());
        assert_eq!(expand_payload(b"}\x03"), vec![0x23]);
    }

    #[test]
    fn test_name_colon_value() {
        let mut cursor = PacketCursor::new("thread:1f;name:main;reason:trace");
        assert_eq!(cursor.name_colon_value(), Some(("thread", "1f")));
        assert_eq!(cursor.name_colon_value(), Some(("name", "main")));
        assert_eq!(cursor.name_colon_value(), Some(("reason", "trace")));
        assert_eq!(cursor.name_colon_value(), None);
        assert!(cursor.is_empty());

        let mut broken = PacketCursor::new("garbage;");
        assert_eq!(broken.name_colon_value(), None);
        assert_eq!(broken.remaining(), "garbage;");
    }

    #[test]
    fn test_packet_shapes() {
        assert_eq!(Packet::ReadMemory { addr: 0x1000, len: 16 }.to_string(), "m1000,10");
        assert_eq!(
            Packet::WriteMemory { addr: 0x20, data: vec![0xde, 0xad] }.to_string(),
            "M20,2:dead"
        );
        assert_eq!(
            Packet::InsertStoppoint { kind: StoppointKind::HardwareBreakpoint, addr: 0x400000, size: 1 }.to_string(),
            "Z1,400000,1"
        );
        assert_eq!(
            Packet::VCont(vec![
                ThreadAction::new(ThreadId(1), ResumeAction::Continue),
                ThreadAction::new(ThreadId(2), ResumeAction::StepWithSignal(5)),
            ])
            .to_string(),
            "vCont;c:1;S05:2"
        );
        assert_eq!(Packet::AttachPid(0x1234).to_string(), "vAttach;1234");
        assert_eq!(Packet::AttachWait("ls".into()).to_string(), "vAttachWait;6c73");
        assert_eq!(
            Packet::Arguments(vec!["/bin/ls".into(), "-l".into()]).to_string(),
            "A14,0,2f62696e2f6c73,4,1,2d6c"
        );
        assert_eq!(Packet::SetContinueThread(None).to_string(), "Hc-1");
        assert_eq!(Packet::RegisterInfo(26).to_string(), "qRegisterInfo1a");
        assert_eq!(
            Packet::AllocateMemory { size: 0x100, permissions: MemoryPermissions::READ_EXECUTE }.to_string(),
            "_M100,rx"
        );
        assert_eq!(Packet::Environment("HOME=/root".into()).to_string(), "QEnvironment:HOME=/root");
        assert_eq!(Packet::Environment("A=$x".into()).to_string(), "QEnvironmentHexEncoded:413d2478");
    }

    #[test]
    fn test_response_classification() {
        assert!(is_ok("OK"));
        assert!(is_error("E01"));
        assert_eq!(error_code("E1f"), Some(0x1f));
        assert!(is_unsupported(""));
        assert!(is_normal("T05thread:1;"));
        // a long hex payload that happens to start with E is data
        assert!(is_normal("E0112"));
    }
}
