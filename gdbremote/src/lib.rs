/// GDB remote serial protocol client
///
/// Talks to a debug stub (debugserver, gdbserver, lldb-server) over the
/// remote serial protocol and drives one inferior process through it:
/// connect or spawn the stub, launch or attach, resume and halt, stop
/// reply interpretation, breakpoints, watchpoints and memory.

pub mod client;
pub mod codec;
pub mod config;
pub mod controller;
mod event_loop;
pub mod host;
pub mod state;
pub mod stop_reply;
pub mod supervisor;
pub mod transport;
pub mod types;

pub use client::{GdbRemoteClient, RemoteError};
pub use config::{ConfigError, ControllerConfig};
pub use controller::{
    build_resume_packet, resolve_stdio, AttachError, AttachTarget, BreakpointError, HaltError, LaunchError,
    LaunchSpec, MemoryError, ProcessController, ResumeError, WatchpointError,
};
pub use host::{DetachedHost, ProcessHost, ThreadTable};
pub use state::{ProcessState, StateEvent, StateTracker};
pub use stop_reply::{StopDescription, StopKind, StopParseError, StopReason};
pub use supervisor::{FixedPortAllocator, PortAllocator, RandomPortAllocator, SpawnError, StubSupervisor};
pub use transport::{ConnectError, Connector, InterruptError, RunPhase, TcpConnector, Transport};
pub use types::*;
