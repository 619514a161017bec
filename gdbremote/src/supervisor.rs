/// Stub process supervision
///
/// Locates and spawns the debug stub, watches it with a background task,
/// and reports its death to the owner after a grace period. The record is
/// generation-stamped so a monitor for an older stub never reports against
/// a newer one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use rand::Rng;
use thiserror::Error;
use tokio::process::Command;

use crate::config::ControllerConfig;

/// Lowest port handed out by [`RandomPortAllocator`].
const MIN_STUB_PORT: u16 = 11000;

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Debug stub not found (set {0} to its path)")]
    BinaryNotFound(String),
    #[error("Failed to spawn {path:?}: {source}")]
    OsSpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Source of listening ports for freshly spawned stubs.
pub trait PortAllocator: Send + Sync {
    fn next_port(&self) -> u16;
}

#[derive(Debug, Default)]
pub struct RandomPortAllocator;

impl PortAllocator for RandomPortAllocator {
    fn next_port(&self) -> u16 {
        rand::thread_rng().gen_range(MIN_STUB_PORT..u16::MAX)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedPortAllocator(pub u16);

impl PortAllocator for FixedPortAllocator {
    fn next_port(&self) -> u16 {
        self.0
    }
}

/// How a supervised stub went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubExit {
    pub pid: u32,
    pub exited: bool,
    pub signal: Option<i32>,
    pub status: Option<i32>,
}

impl StubExit {
    /// Human readable cause, as stored for the exit description.
    pub fn describe(&self) -> String {
        match self.signal {
            Some(signo) => {
                let name = Signal::try_from(signo)
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|_| signo.to_string());
                format!("debugserver died with signal {}", name)
            }
            None => format!("debugserver died with an exit status of 0x{:08x}", self.status.unwrap_or(-1)),
        }
    }
}

pub type ExitCallback = Arc<dyn Fn(StubExit) + Send + Sync>;

#[derive(Debug)]
struct SupervisionRecord {
    pid: u32,
    generation: u64,
}

/// Cached stub location shared by every supervisor in the process.
static STUB_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);

pub struct StubSupervisor {
    config: ControllerConfig,
    record: Arc<Mutex<Option<SupervisionRecord>>>,
    generation: AtomicU64,
}

impl StubSupervisor {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            record: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    /// Pid of the stub currently supervised, if any.
    pub fn pid(&self) -> Option<u32> {
        self.record.lock().unwrap().as_ref().map(|r| r.pid)
    }

    /// Environment override, then the cached location, then a stub sitting
    /// next to the running executable.
    pub fn locate_stub_binary(&self) -> Result<PathBuf, SpawnError> {
        if let Ok(path) = std::env::var(&self.config.stub_path_env) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
            log::warn!("{} points at missing file {:?}", self.config.stub_path_env, path);
        }

        let mut cached = STUB_PATH.lock().unwrap();
        if let Some(path) = cached.as_ref() {
            return Ok(path.clone());
        }

        let candidate = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&self.config.stub_basename)))
            .filter(|path| path.exists());
        match candidate {
            Some(path) => {
                *cached = Some(path.clone());
                Ok(path)
            }
            None => Err(SpawnError::BinaryNotFound(self.config.stub_path_env.clone())),
        }
    }

    fn stub_arguments(&self, url: &str, extra_args: &[String]) -> Vec<String> {
        let mut args = vec![url.to_string(), "--native-regs".to_string(), "--setsid".to_string()];
        if let Ok(file) = std::env::var(&self.config.stub_log_file_env) {
            if !file.is_empty() {
                args.push(format!("--log-file={}", file));
            }
        }
        if let Ok(flags) = std::env::var(&self.config.stub_log_flags_env) {
            if !flags.is_empty() {
                args.push(format!("--log-flags={}", flags));
            }
        }
        args.extend(extra_args.iter().cloned());
        args
    }

    /// Spawn the stub listening on `url` and start monitoring it.
    /// `on_exit` fires once, only if this stub is still the supervised one
    /// after the grace period.
    pub fn spawn(
        &self,
        url: &str,
        extra_args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&Path>,
        on_exit: ExitCallback,
    ) -> Result<u32, SpawnError> {
        let path = self.locate_stub_binary()?;
        let args = self.stub_arguments(url, extra_args);
        log::info!("Launching {:?} {}", path, args.join(" "));

        let mut command = Command::new(&path);
        command
            .args(&args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|source| SpawnError::OsSpawnFailed { path: path.clone(), source })?;
        let pid = child.id().unwrap_or(0);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.record.lock().unwrap() = Some(SupervisionRecord { pid, generation });

        let record: Weak<Mutex<Option<SupervisionRecord>>> = Arc::downgrade(&self.record);
        let grace = self.config.stub_exit_grace();
        tokio::spawn(async move {
            let status = child.wait().await;
            let exit = match status {
                Ok(status) => {
                    use std::os::unix::process::ExitStatusExt;
                    StubExit { pid, exited: status.code().is_some(), signal: status.signal(), status: status.code() }
                }
                Err(e) => {
                    log::warn!("Lost track of stub {}: {}", pid, e);
                    StubExit { pid, exited: false, signal: None, status: None }
                }
            };
            log::debug!("Stub {} exited: {:?}", pid, exit);

            let still_current = |record: &Weak<Mutex<Option<SupervisionRecord>>>| {
                record.upgrade().map_or(false, |r| {
                    r.lock().unwrap().as_ref().map_or(false, |r| r.pid == pid && r.generation == generation)
                })
            };
            if !still_current(&record) {
                return;
            }
            // Let the connection notice the close first.
            tokio::time::sleep(grace).await;
            if !still_current(&record) {
                return;
            }
            if let Some(record) = record.upgrade() {
                record.lock().unwrap().take();
            }
            on_exit(exit);
        });

        Ok(pid)
    }

    /// Interrupt the stub (SIGINT) and stop supervising it.
    pub fn kill(&self) {
        if let Some(record) = self.record.lock().unwrap().take() {
            log::debug!("Sending SIGINT to stub {}", record.pid);
            if let Err(e) = signal::kill(NixPid::from_raw(record.pid as i32), Signal::SIGINT) {
                log::debug!("Stub {} already gone: {}", record.pid, e);
            }
        }
    }

    /// Stop supervising without signalling the stub.
    pub fn invalidate(&self) {
        self.record.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_descriptions() {
        let signalled = StubExit { pid: 1, exited: false, signal: Some(9), status: None };
        assert_eq!(signalled.describe(), "debugserver died with signal SIGKILL");
        let exited = StubExit { pid: 1, exited: true, signal: None, status: Some(1) };
        assert_eq!(exited.describe(), "debugserver died with an exit status of 0x00000001");
    }

    #[test]
    fn test_random_ports_stay_in_range() {
        let ports = RandomPortAllocator;
        for _ in 0..100 {
            assert!(ports.next_port() >= MIN_STUB_PORT);
        }
        assert_eq!(FixedPortAllocator(4321).next_port(), 4321);
    }

    #[test]
    fn test_missing_stub_is_reported() {
        let config = ControllerConfig {
            stub_path_env: "RSPDBG_TEST_NO_SUCH_STUB".to_string(),
            stub_basename: "no-such-debugserver-binary".to_string(),
            ..Default::default()
        };
        let supervisor = StubSupervisor::new(config);
        // a cached path from another test would mask the lookup
        if STUB_PATH.lock().unwrap().is_none() {
            assert!(matches!(supervisor.locate_stub_binary(), Err(SpawnError::BinaryNotFound(_))));
        }
    }

    #[test]
    fn test_log_settings_become_arguments() {
        let config = ControllerConfig {
            stub_log_file_env: "RSPDBG_TEST_LOG_FILE".to_string(),
            stub_log_flags_env: "RSPDBG_TEST_LOG_FLAGS".to_string(),
            ..Default::default()
        };
        std::env::set_var("RSPDBG_TEST_LOG_FILE", "/tmp/stub.log");
        let supervisor = StubSupervisor::new(config);
        let args = supervisor.stub_arguments("localhost:12000", &["--attach=42".to_string()]);
        assert_eq!(&args[..3], &["localhost:12000", "--native-regs", "--setsid"]);
        assert!(args.contains(&"--log-file=/tmp/stub.log".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--attach=42"));
    }

    /// A supervisor whose "stub" is a shell that exits at once, because
    /// the listen url is not a script it can open.
    fn short_lived_stub(env_name: &str, grace_ms: u64) -> StubSupervisor {
        std::env::set_var(env_name, "/bin/sh");
        StubSupervisor::new(ControllerConfig {
            stub_path_env: env_name.to_string(),
            stub_exit_grace_ms: grace_ms,
            ..Default::default()
        })
    }

    fn recorder() -> (Arc<Mutex<Vec<StubExit>>>, ExitCallback) {
        let exits = Arc::new(Mutex::new(Vec::new()));
        let sink = exits.clone();
        (exits, Arc::new(move |exit: StubExit| sink.lock().unwrap().push(exit)))
    }

    async fn wait_for_exits(exits: &Mutex<Vec<StubExit>>, count: usize) {
        for _ in 0..300 {
            if exits.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_stub_death_reported_after_grace() {
        let supervisor = short_lived_stub("RSPDBG_TEST_STUB_GRACE", 300);
        let (exits, on_exit) = recorder();
        let pid = supervisor.spawn("localhost:1", &[], &HashMap::new(), None, on_exit).unwrap();
        assert_eq!(supervisor.pid(), Some(pid));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(exits.lock().unwrap().is_empty());

        wait_for_exits(&exits, 1).await;
        let exits = exits.lock().unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].pid, pid);
        assert!(exits[0].exited);
        assert_eq!(exits[0].signal, None);
        assert!(exits[0].status.is_some());
        assert_eq!(supervisor.pid(), None);
    }

    #[tokio::test]
    async fn test_replaced_stub_death_is_ignored() {
        let supervisor = short_lived_stub("RSPDBG_TEST_STUB_REPLACED", 50);
        let (first_exits, first) = recorder();
        let (second_exits, second) = recorder();
        supervisor.spawn("localhost:1", &[], &HashMap::new(), None, first).unwrap();
        let pid = supervisor.spawn("localhost:2", &[], &HashMap::new(), None, second).unwrap();

        wait_for_exits(&second_exits, 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(first_exits.lock().unwrap().is_empty());
        assert_eq!(second_exits.lock().unwrap().len(), 1);
        assert_eq!(second_exits.lock().unwrap()[0].pid, pid);
    }

    #[tokio::test]
    async fn test_invalidated_stub_death_is_ignored() {
        let supervisor = short_lived_stub("RSPDBG_TEST_STUB_INVALIDATED", 50);
        let (exits, on_exit) = recorder();
        supervisor.spawn("localhost:1", &[], &HashMap::new(), None, on_exit).unwrap();
        supervisor.invalidate();
        assert_eq!(supervisor.pid(), None);

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        assert!(exits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kill_without_stub_is_harmless() {
        let supervisor = StubSupervisor::new(ControllerConfig::default());
        supervisor.kill();
        assert_eq!(supervisor.pid(), None);
    }
}
