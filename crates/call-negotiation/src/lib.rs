//! Offer/answer negotiation for one-to-one voice calls.
//!
//! A [`CallController`] owns at most one live [`CallAttempt`] and feeds every
//! input (application commands, inbound signaling, media observer callbacks,
//! the glare timer) through a single transition function. Media and signaling
//! are reached through the [`MediaEngine`], [`LocalMedia`] and
//! [`SignalChannel`] traits so the state machine can run against mocks.

pub mod candidates;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod loopback;
pub mod media;
pub mod mock;
pub mod negotiation;
pub mod signal;
pub mod types;

pub use candidates::CandidateBuffer;
pub use config::CallConfig;
pub use controller::CallController;
pub use driver::{CallDriver, CallHandle, CallSnapshot};
pub use error::{CallError, ConfigError, MediaError, SignalError};
pub use loopback::LoopbackSignalChannel;
pub use media::{
    Interrupt, LocalMedia, MediaEngine, MediaEvent, MediaEventSink, MediaSession,
    TaggedMediaEvent,
};
pub use negotiation::{
    CallAttempt, CallEvent, Disposition, MAX_ALIASES, NegotiationEvent, NegotiationState,
    StaleReason,
};
pub use signal::{InboundSignal, SignalChannel, SignalMessage};
pub use types::{
    CallId, Candidate, ConnectivityState, LocalTrack, PeerId, Role, SdpKind, SessionDescription,
    TrackKind,
};
