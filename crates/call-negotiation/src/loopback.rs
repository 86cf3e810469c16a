use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::trace;

use crate::error::SignalError;
use crate::signal::{InboundSignal, SignalChannel, SignalMessage};
use crate::types::PeerId;

/// In-memory signal channel connecting exactly two peers.
///
/// Tests hold outbound traffic to reorder it and inject copies to duplicate it.
pub struct LoopbackSignalChannel {
    local: PeerId,
    remote: PeerId,
    peer_tx: mpsc::UnboundedSender<InboundSignal>,
    self_tx: mpsc::UnboundedSender<InboundSignal>,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<InboundSignal>>,
    held: Mutex<Option<Vec<InboundSignal>>>,
    sent: Mutex<Vec<(PeerId, SignalMessage)>>,
}

impl LoopbackSignalChannel {
    pub fn pair(a: impl Into<PeerId>, b: impl Into<PeerId>) -> (Self, Self) {
        let a = a.into();
        let b = b.into();
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let left = Self::new(a.clone(), b.clone(), b_tx.clone(), a_tx.clone(), a_rx);
        let right = Self::new(b, a, a_tx, b_tx, b_rx);
        (left, right)
    }

    fn new(
        local: PeerId,
        remote: PeerId,
        peer_tx: mpsc::UnboundedSender<InboundSignal>,
        self_tx: mpsc::UnboundedSender<InboundSignal>,
        inbox: mpsc::UnboundedReceiver<InboundSignal>,
    ) -> Self {
        Self {
            local,
            remote,
            peer_tx,
            self_tx,
            inbox: AsyncMutex::new(inbox),
            held: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    /// Stop delivering outbound messages until [`release`](Self::release).
    pub fn hold(&self) {
        let mut held = self.held.lock();
        if held.is_none() {
            *held = Some(Vec::new());
        }
    }

    /// Deliver everything held, in send order, and resume normal delivery.
    pub fn release(&self) {
        let held = self.held.lock().take().unwrap_or_default();
        for signal in held {
            let _ = self.peer_tx.send(signal);
        }
    }

    /// Remove held messages without delivering them.
    pub fn take_held(&self) -> Vec<SignalMessage> {
        match self.held.lock().as_mut() {
            Some(held) => held.drain(..).map(|signal| signal.message).collect(),
            None => Vec::new(),
        }
    }

    /// Place a message in this endpoint's own inbox as if `from` had sent it.
    pub fn inject(&self, from: PeerId, message: SignalMessage) {
        let _ = self.self_tx.send(InboundSignal { from, message });
    }

    /// Every message handed to `send`, held or not.
    pub fn sent(&self) -> Vec<(PeerId, SignalMessage)> {
        self.sent.lock().clone()
    }

    pub fn try_recv(&self) -> Option<InboundSignal> {
        self.inbox.try_lock().ok()?.try_recv().ok()
    }
}

#[async_trait]
impl SignalChannel for LoopbackSignalChannel {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    async fn send(&self, to: &PeerId, message: SignalMessage) -> Result<(), SignalError> {
        if to != &self.remote {
            return Err(SignalError::UnknownPeer(to.clone()));
        }
        trace!(
            target = "call::signal",
            from = %self.local,
            to = %to,
            kind = message.kind(),
            call_id = %message.call_id(),
            "loopback send"
        );
        self.sent.lock().push((to.clone(), message.clone()));
        let signal = InboundSignal {
            from: self.local.clone(),
            message,
        };
        if let Some(held) = self.held.lock().as_mut() {
            held.push(signal);
            return Ok(());
        }
        self.peer_tx
            .send(signal)
            .map_err(|_| SignalError::ChannelClosed)
    }

    async fn recv(&self) -> Option<InboundSignal> {
        let mut inbox = self.inbox.lock().await;
        inbox.recv().await
    }
}
