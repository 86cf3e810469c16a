use crate::types::{CallId, PeerId};
use thiserror::Error;

/// Failures reported by the media capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("media resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("media session in invalid state: {0}")]
    InvalidState(String),
    #[error("negotiation error: {0}")]
    Negotiation(String),
    #[error("session description rejected: {0}")]
    DescriptionRejected(String),
    #[error("candidate rejected: {0}")]
    CandidateRejected(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("signal channel closed")]
    ChannelClosed,
    #[error("no route to peer {0}")]
    UnknownPeer(PeerId),
    #[error("signal encoding failed: {0}")]
    Encode(String),
    #[error("signal transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("call attempt {call_id} is already active")]
    AlreadyActive { call_id: CallId },
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error("operation interrupted by hangup")]
    Interrupted,
    #[error("remote peer id {0} equals the local id; offers cannot be ordered")]
    IdentityCollision(PeerId),
    #[error("call driver stopped")]
    DriverStopped,
}

impl CallError {
    /// Errors that end an attempt as `Failed` rather than `Closed`.
    pub fn is_failure(&self) -> bool {
        !matches!(self, CallError::Interrupted | CallError::AlreadyActive { .. })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}
