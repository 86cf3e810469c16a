use std::env;
use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;

pub const ICE_SERVERS_ENV: &str = "VOICECALL_ICE_SERVERS";
pub const DISABLE_STUN_ENV: &str = "VOICECALL_DISABLE_STUN";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Peer connection and signaling settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcConfig {
    /// STUN/TURN urls handed to every peer connection.
    pub ice_servers: Vec<String>,
    /// How long `WebSocketSignalChannel::connect` waits for the relay to accept the join.
    pub join_timeout: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            join_timeout: Duration::from_secs(10),
        }
    }
}

impl WebRtcConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// `VOICECALL_ICE_SERVERS` is a comma-separated url list. Without it,
    /// `VOICECALL_DISABLE_STUN` drops the default STUN server for host-only runs.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(servers) = lookup(ICE_SERVERS_ENV) {
            config.ice_servers = split_urls(&servers);
        } else if lookup(DISABLE_STUN_ENV).is_some_and(|value| is_truthy(&value)) {
            config.ice_servers.clear();
        }
        config
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect()
    }
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}
