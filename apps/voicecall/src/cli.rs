use std::path::PathBuf;
use std::time::Duration;

use call_negotiation::{CallConfig, ConfigError};
use call_webrtc::WebRtcConfig;
use clap::Parser;

use crate::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "voicecall", version, about = "One-to-one voice calls over WebRTC")]
pub struct Cli {
    /// Relay server that forwards signaling between peers (ws, wss, http or https).
    #[arg(long, env = "VOICECALL_SIGNALING_URL")]
    pub signaling_url: String,

    /// Identity to join the relay with.
    #[arg(long, env = "VOICECALL_PEER_ID")]
    pub peer_id: String,

    /// Peer to call right away. Without it the process waits for an inbound offer.
    #[arg(long, value_name = "PEER")]
    pub call: Option<String>,

    /// Overrides VOICECALL_GLARE_DELAY_MS.
    #[arg(long, value_name = "MS")]
    pub glare_delay_ms: Option<u64>,

    /// STUN/TURN url; repeat for several. Replaces the environment/default list.
    #[arg(long = "ice-server", value_name = "URL")]
    pub ice_servers: Vec<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn, env = "VOICECALL_LOG_LEVEL")]
    pub log_level: LogLevel,

    #[arg(long, value_name = "PATH", env = "VOICECALL_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            file: self.log_file.clone(),
        }
    }

    pub fn call_config(&self) -> Result<CallConfig, ConfigError> {
        let config = CallConfig::from_env()?;
        Ok(match self.glare_delay_ms {
            Some(ms) => config.with_glare_delay(Duration::from_millis(ms)),
            None => config,
        })
    }

    pub fn webrtc_config(&self) -> WebRtcConfig {
        let config = WebRtcConfig::from_env();
        if self.ice_servers.is_empty() {
            config
        } else {
            config.with_ice_servers(self.ice_servers.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_calling_invocation() {
        let cli = Cli::try_parse_from([
            "voicecall",
            "--signaling-url",
            "ws://relay.local:8080/rooms/a",
            "--peer-id",
            "alice",
            "--call",
            "bob",
            "--glare-delay-ms",
            "0",
            "--ice-server",
            "stun:a.example:3478",
            "--ice-server",
            "turn:b.example:3478",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.call.as_deref(), Some("bob"));
        assert_eq!(cli.log_level, LogLevel::Debug);
        assert_eq!(
            cli.webrtc_config().ice_servers,
            ["stun:a.example:3478", "turn:b.example:3478"]
        );
        assert_eq!(cli.glare_delay_ms, Some(0));
    }

    #[test]
    fn peer_id_is_required() {
        assert!(Cli::try_parse_from(["voicecall", "--signaling-url", "ws://relay.local"]).is_err());
    }
}
