/// Public process state tracking
///
/// Holds the single authoritative [`ProcessState`], the exit status and
/// last error, inferior console output, and fans state changes out to
/// subscribers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

const MAX_CONSOLE_LINES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Disconnected,
    Connecting,
    Connected,
    Attaching,
    Launching,
    Running,
    Stopped,
    Crashed,
    Suspended,
    Exited,
    Detached,
    /// Connection lost or no longer trustworthy.
    Invalid,
}

impl ProcessState {
    /// No way back out of these.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Exited | ProcessState::Detached)
    }

    pub fn is_stopped(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Crashed | ProcessState::Suspended)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Disconnected => "disconnected",
            ProcessState::Connecting => "connecting",
            ProcessState::Connected => "connected",
            ProcessState::Attaching => "attaching",
            ProcessState::Launching => "launching",
            ProcessState::Running => "running",
            ProcessState::Stopped => "stopped",
            ProcessState::Crashed => "crashed",
            ProcessState::Suspended => "suspended",
            ProcessState::Exited => "exited",
            ProcessState::Detached => "detached",
            ProcessState::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

/// One published transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateEvent {
    pub state: ProcessState,
    pub exit_status: Option<i32>,
    pub description: Option<String>,
}

#[derive(Debug)]
struct StateInner {
    state: ProcessState,
    exit_status: Option<i32>,
    exit_description: Option<String>,
    last_error: Option<String>,
}

pub struct StateTracker {
    inner: Mutex<StateInner>,
    watch: watch::Sender<ProcessState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StateEvent>>>,
    console: Mutex<VecDeque<String>>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        let (watch, _) = watch::channel(ProcessState::Disconnected);
        Self {
            inner: Mutex::new(StateInner {
                state: ProcessState::Disconnected,
                exit_status: None,
                exit_description: None,
                last_error: None,
            }),
            watch,
            subscribers: Mutex::new(Vec::new()),
            console: Mutex::new(VecDeque::new()),
        }
    }

    pub fn state(&self) -> ProcessState {
        self.inner.lock().unwrap().state
    }

    /// Move to `state`. Refused (returns `false`) once a terminal state has
    /// been reached.
    pub fn set_state(&self, state: ProcessState) -> bool {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                log::debug!("Ignoring {} -> {}: state is terminal", inner.state, state);
                return false;
            }
            if inner.state == state {
                return true;
            }
            log::debug!("STATE: {} -> {}", inner.state, state);
            inner.state = state;
            StateEvent { state, exit_status: None, description: None }
        };
        self.publish(event);
        true
    }

    /// Record the exit status and publish `Exited`. Only the first exit wins.
    pub fn set_exit_status(&self, status: i32, description: Option<String>) -> bool {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                return false;
            }
            log::debug!("STATE: {} -> exited (status {}, {:?})", inner.state, status, description);
            inner.state = ProcessState::Exited;
            inner.exit_status = Some(status);
            inner.exit_description = description.clone();
            StateEvent { state: ProcessState::Exited, exit_status: Some(status), description }
        };
        self.publish(event);
        true
    }

    /// Publish `Invalid` with `reason` kept as the last error.
    pub fn set_invalid(&self, reason: &str) -> bool {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                return false;
            }
            log::warn!("STATE: {} -> invalid ({})", inner.state, reason);
            inner.state = ProcessState::Invalid;
            inner.last_error = Some(reason.to_string());
            StateEvent { state: ProcessState::Invalid, exit_status: None, description: Some(reason.to_string()) }
        };
        self.publish(event);
        true
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.inner.lock().unwrap().exit_status
    }

    pub fn exit_description(&self) -> Option<String> {
        self.inner.lock().unwrap().exit_description.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().unwrap().last_error.clone()
    }

    pub fn set_last_error(&self, error: impl Into<String>) {
        self.inner.lock().unwrap().last_error = Some(error.into());
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn watch(&self) -> watch::Receiver<ProcessState> {
        self.watch.subscribe()
    }

    /// Wait until `pred` holds, up to `timeout`.
    pub async fn wait_for(&self, timeout: Duration, pred: impl Fn(ProcessState) -> bool) -> Option<ProcessState> {
        let mut rx = self.watch();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|state| pred(*state))).await;
        match waited {
            Ok(Ok(state)) => Some(*state),
            _ => None,
        }
    }

    pub fn append_console_output(&self, text: String) {
        let mut console = self.console.lock().unwrap();
        if console.len() == MAX_CONSOLE_LINES {
            console.pop_front();
        }
        console.push_back(text);
    }

    /// Most recent output first when `limit` is given.
    pub fn console_output(&self, limit: Option<usize>) -> Vec<String> {
        let console = self.console.lock().unwrap();
        match limit {
            Some(limit) => console.iter().rev().take(limit).cloned().collect(),
            None => console.iter().cloned().collect(),
        }
    }

    fn publish(&self, event: StateEvent) {
        self.watch.send_replace(event.state);
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_stick() {
        let tracker = StateTracker::new();
        assert!(tracker.set_state(ProcessState::Stopped));
        assert!(tracker.set_exit_status(0, None));
        assert!(!tracker.set_state(ProcessState::Running));
        assert!(!tracker.set_exit_status(3, None));
        assert!(!tracker.set_invalid("lost connection"));
        assert_eq!(tracker.state(), ProcessState::Exited);
        assert_eq!(tracker.exit_status(), Some(0));
    }

    #[test]
    fn test_invalid_is_recoverable() {
        let tracker = StateTracker::new();
        tracker.set_state(ProcessState::Running);
        tracker.set_invalid("lost connection");
        assert_eq!(tracker.last_error().as_deref(), Some("lost connection"));
        assert!(tracker.set_state(ProcessState::Connecting));
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let tracker = StateTracker::new();
        let mut rx = tracker.subscribe();
        tracker.set_state(ProcessState::Connected);
        tracker.set_state(ProcessState::Connected);
        tracker.set_exit_status(1, Some("done".into()));

        assert_eq!(rx.recv().await.unwrap().state, ProcessState::Connected);
        let exited = rx.recv().await.unwrap();
        assert_eq!(exited.state, ProcessState::Exited);
        assert_eq!(exited.exit_status, Some(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let tracker = StateTracker::new();
        assert_eq!(tracker.wait_for(Duration::from_millis(10), |s| s.is_stopped()).await, None);
        tracker.set_state(ProcessState::Stopped);
        assert_eq!(
            tracker.wait_for(Duration::from_millis(10), |s| s.is_stopped()).await,
            Some(ProcessState::Stopped)
        );
    }

    #[test]
    fn test_console_ring() {
        let tracker = StateTracker::new();
        for i in 0..(MAX_CONSOLE_LINES + 5) {
            tracker.append_console_output(format!("line {}", i));
        }
        let all = tracker.console_output(None);
        assert_eq!(all.len(), MAX_CONSOLE_LINES);
        assert_eq!(all[0], "line 5");
        assert_eq!(tracker.console_output(Some(1)), vec![format!("line {}", MAX_CONSOLE_LINES + 4)]);
    }
}
