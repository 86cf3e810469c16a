use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SignalError;
use crate::types::{CallId, PeerId};

/// Messages exchanged with the remote side. Each one names the call attempt it
/// belongs to; delivery may be lost, duplicated or reordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Offer { call_id: CallId, sdp: String },
    Answer { call_id: CallId, sdp: String },
    Candidate { call_id: CallId, data: String },
    Hangup { call_id: CallId },
}

impl SignalMessage {
    pub fn call_id(&self) -> &CallId {
        match self {
            SignalMessage::Offer { call_id, .. }
            | SignalMessage::Answer { call_id, .. }
            | SignalMessage::Candidate { call_id, .. }
            | SignalMessage::Hangup { call_id } => call_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
            SignalMessage::Hangup { .. } => "hangup",
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, SignalError> {
        serde_json::to_value(self).map_err(|err| SignalError::Encode(err.to_string()))
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, SignalError> {
        Self::deserialize(value).map_err(|err| SignalError::Encode(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSignal {
    pub from: PeerId,
    pub message: SignalMessage,
}

/// Conduit to remote peers. Implementations neither retry nor reorder.
#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Identity this endpoint is known by on the channel.
    fn local_peer(&self) -> &PeerId;

    async fn send(&self, to: &PeerId, message: SignalMessage) -> Result<(), SignalError>;

    /// Next inbound message, or `None` once the channel is closed.
    async fn recv(&self) -> Option<InboundSignal>;
}
