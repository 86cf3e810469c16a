use call_negotiation::MediaError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum WebRtcError {
    #[error("webrtc setup failed: {0}")]
    Setup(#[from] webrtc::Error),
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("signaling server rejected join: {0}")]
    JoinRejected(String),
    #[error("timed out waiting for signaling join")]
    JoinTimeout,
    #[error("signaling connection closed")]
    ChannelClosed,
}

/// Which media session operation a webrtc error came from.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Stage {
    Track,
    Negotiate,
    Describe,
    Candidate,
}

pub(crate) fn media_error(stage: Stage, err: webrtc::Error) -> MediaError {
    if matches!(err, webrtc::Error::ErrConnectionClosed) {
        return MediaError::InvalidState(err.to_string());
    }
    match stage {
        Stage::Track | Stage::Negotiate => MediaError::Negotiation(err.to_string()),
        Stage::Describe => MediaError::DescriptionRejected(err.to_string()),
        Stage::Candidate => MediaError::CandidateRejected(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_connection_is_invalid_state_at_every_stage() {
        for stage in [Stage::Track, Stage::Negotiate, Stage::Describe, Stage::Candidate] {
            assert!(matches!(
                media_error(stage, webrtc::Error::ErrConnectionClosed),
                MediaError::InvalidState(_)
            ));
        }
    }

    #[test]
    fn stage_decides_the_failure_kind() {
        assert!(matches!(
            media_error(Stage::Describe, webrtc::Error::ErrNoRemoteDescription),
            MediaError::DescriptionRejected(_)
        ));
        assert!(matches!(
            media_error(Stage::Candidate, webrtc::Error::ErrNoRemoteDescription),
            MediaError::CandidateRejected(_)
        ));
    }
}
