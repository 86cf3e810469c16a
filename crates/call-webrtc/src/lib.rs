//! webrtc-rs media sessions and a WebSocket relay signal channel for
//! `call-negotiation`.

pub mod config;
pub mod engine;
pub mod error;
pub mod local_media;
pub mod websocket;

pub use config::WebRtcConfig;
pub use engine::{WebRtcMediaEngine, WebRtcSession};
pub use error::WebRtcError;
pub use local_media::WebRtcLocalMedia;
pub use websocket::{ClientMessage, ServerMessage, WebSocketSignalChannel, websocket_url};
