/// Background task that owns every continue-class exchange
///
/// The controller hands a resume or attach packet to the loop and returns
/// immediately. The loop blocks on the reply, forwards console output, and
/// applies the stop through the controller. It holds only a weak reference
/// to the controller and never keeps it alive while waiting on the wire.

use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::controller::ControllerInner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoopEvent {
    /// Send this packet and wait for the stop it produces.
    Continue(String),
    ShouldExit,
}

pub(crate) struct EventLoopHandle {
    tx: mpsc::UnboundedSender<LoopEvent>,
    task: JoinHandle<()>,
}

impl EventLoopHandle {
    pub(crate) fn spawn(inner: Weak<ControllerInner>, closed: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(inner, rx, closed));
        Self { tx, task }
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.task.is_finished() && !self.tx.is_closed()
    }

    /// Queue `event`. `false` when the loop is gone.
    pub(crate) fn send(&self, event: LoopEvent) -> bool {
        self.is_alive() && self.tx.send(event).is_ok()
    }

    /// Ask the loop to exit, aborting it if it does not within `timeout`.
    pub(crate) async fn stop(self, timeout: Duration) {
        let _ = self.tx.send(LoopEvent::ShouldExit);
        let mut task = self.task;
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            log::debug!("Event loop did not exit in time, aborting it");
            task.abort();
        }
    }
}

async fn run(
    inner: Weak<ControllerInner>,
    mut rx: mpsc::UnboundedReceiver<LoopEvent>,
    mut closed: watch::Receiver<bool>,
) {
    log::debug!("Event loop started");
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = closed.wait_for(|closed| *closed) => {
                if let Some(ctrl) = inner.upgrade() {
                    if !ctrl.shutting_down.load(Ordering::SeqCst) {
                        ctrl.state.set_invalid("lost connection");
                    }
                }
                break;
            }
        };

        let packet = match event {
            Some(LoopEvent::Continue(packet)) => packet,
            Some(LoopEvent::ShouldExit) | None => break,
        };

        let (client, state) = match inner.upgrade() {
            Some(ctrl) => (ctrl.client.clone(), ctrl.state.clone()),
            None => break,
        };
        let attaching = packet.starts_with("vAttach");

        let result = client
            .send_continue_packet_and_wait(&packet, |text| state.append_console_output(text))
            .await;

        let Some(ctrl) = inner.upgrade() else { break };
        match result {
            Ok(response) => ctrl.apply_async_stop(&response, attaching).await,
            Err(e) => {
                if ctrl.shutting_down.load(Ordering::SeqCst) {
                    log::debug!("Continue ended during shutdown: {}", e);
                } else {
                    log::error!("Continue packet {:?} failed: {}", packet, e);
                    ctrl.state.set_invalid("lost connection");
                }
                break;
            }
        }
    }
    log::debug!("Event loop exited");
}
