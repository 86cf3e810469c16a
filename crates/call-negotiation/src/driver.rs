use std::future;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tracing::{debug, info, warn};

use crate::controller::CallController;
use crate::error::CallError;
use crate::media::Interrupt;
use crate::negotiation::{CallEvent, NegotiationState};
use crate::signal::InboundSignal;
use crate::types::{CallId, PeerId, Role};

/// Point-in-time view of the controller, for callers outside the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub state: NegotiationState,
    pub role: Role,
    pub call_id: Option<CallId>,
    pub remote: Option<PeerId>,
}

enum Command {
    StartCall {
        remote: PeerId,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    EndCall {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Snapshot {
        reply: oneshot::Sender<CallSnapshot>,
    },
    Shutdown,
}

/// Application-side handle to a running [`CallDriver`].
#[derive(Clone)]
pub struct CallHandle {
    local: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    interrupt: Interrupt,
    events: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub async fn start_call(&self, remote: impl Into<PeerId>) -> Result<CallId, CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StartCall {
            remote: remote.into(),
            reply,
        })?;
        rx.await.map_err(|_| CallError::DriverStopped)?
    }

    /// Aborts any media operation in flight before the hangup is queued, so
    /// this does not wait behind a stuck negotiation step.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.interrupt.raise();
        let (reply, rx) = oneshot::channel();
        self.send(Command::EndCall { reply })?;
        rx.await.map_err(|_| CallError::DriverStopped)?
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| CallError::DriverStopped)
    }

    /// Hang up anything live and stop the driver task.
    pub fn shutdown(&self) {
        self.interrupt.raise();
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<(), CallError> {
        self.commands
            .send(command)
            .map_err(|_| CallError::DriverStopped)
    }
}

/// Runs a controller on one task, serializing application commands, inbound
/// signaling, media events and the glare timer.
pub struct CallDriver;

impl CallDriver {
    pub fn spawn(
        mut controller: CallController,
    ) -> Result<(CallHandle, JoinHandle<()>), CallError> {
        let media = controller
            .take_media_events()
            .ok_or(CallError::DriverStopped)?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = CallHandle {
            local: controller.local_peer().clone(),
            commands: commands_tx,
            interrupt: controller.interrupt(),
            events: controller.event_sender(),
        };
        let task = tokio::spawn(run(controller, commands_rx, media));
        Ok((handle, task))
    }
}

async fn run(
    mut controller: CallController,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut media: mpsc::UnboundedReceiver<crate::media::TaggedMediaEvent>,
) {
    let signal = controller.signal();
    let local = controller.local_peer().clone();
    info!(target = "call::driver", peer = %local, "call driver started");

    loop {
        let deadline = controller.glare_deadline();
        let glare = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(Command::StartCall { remote, reply }) => {
                    let result = controller.start_call(remote).await;
                    let _ = reply.send(result);
                }
                Some(Command::EndCall { reply }) => {
                    let result = controller.end_call().await;
                    let _ = reply.send(result);
                }
                Some(Command::Snapshot { reply }) => {
                    let _ = reply.send(CallSnapshot {
                        state: controller.state(),
                        role: controller.role(),
                        call_id: controller.call_id().cloned(),
                        remote: controller.remote().cloned(),
                    });
                }
                Some(Command::Shutdown) | None => {
                    if let Err(err) = controller.end_call().await {
                        debug!(target = "call::driver", error = %err, "hangup during shutdown failed");
                    }
                    break;
                }
            },
            _ = glare => {
                if let Err(err) = controller.on_glare_timeout().await {
                    warn!(target = "call::driver", peer = %local, error = %err, "offer could not be sent");
                }
            }
            event = media.recv() => {
                let Some(event) = event else { continue };
                if let Err(err) = controller.on_media_event(event).await {
                    warn!(target = "call::driver", peer = %local, error = %err, "media event failed the call");
                }
            }
            inbound = signal.recv() => match inbound {
                Some(InboundSignal { from, message }) => {
                    let kind = message.kind();
                    match controller.on_inbound_message(from.clone(), message).await {
                        Ok(disposition) => debug!(
                            target = "call::driver",
                            peer = %local,
                            remote = %from,
                            kind,
                            ?disposition,
                            "signal processed"
                        ),
                        Err(err) => warn!(
                            target = "call::driver",
                            peer = %local,
                            remote = %from,
                            kind,
                            error = %err,
                            "signal failed the call"
                        ),
                    }
                }
                None => {
                    info!(target = "call::driver", peer = %local, "signal channel closed");
                    if let Err(err) = controller.end_call().await {
                        debug!(target = "call::driver", error = %err, "hangup after channel close failed");
                    }
                    break;
                }
            },
        }
    }

    info!(target = "call::driver", peer = %local, "call driver stopped");
}
