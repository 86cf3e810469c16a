use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use call_negotiation::{
    CallId, ConnectivityState, LocalTrack, MediaEngine, MediaError, MediaEvent, MediaEventSink,
    MediaSession, SdpKind, SessionDescription, TrackKind,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as CodecRegistry;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::config::WebRtcConfig;
use crate::error::{Stage, WebRtcError, media_error};

fn build_api() -> Result<API, webrtc::Error> {
    let mut codecs = CodecRegistry::default();
    codecs.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut codecs)?;
    Ok(APIBuilder::new()
        .with_media_engine(codecs)
        .with_interceptor_registry(registry)
        .build())
}

/// Builds one `RTCPeerConnection` per call attempt.
pub struct WebRtcMediaEngine {
    api: Arc<API>,
    config: WebRtcConfig,
}

impl WebRtcMediaEngine {
    pub fn new(config: WebRtcConfig) -> Result<Self, WebRtcError> {
        Ok(Self {
            api: Arc::new(build_api()?),
            config,
        })
    }
}

#[async_trait]
impl MediaEngine for WebRtcMediaEngine {
    async fn create(
        &self,
        call_id: &CallId,
        sink: MediaEventSink,
    ) -> Result<Box<dyn MediaSession>, MediaError> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.config.rtc_ice_servers(),
            ..Default::default()
        };
        let peer_connection = self
            .api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|err| MediaError::ResourceExhausted(err.to_string()))?;
        let peer_connection = Arc::new(peer_connection);
        install_observers(&peer_connection, sink);
        debug!(target = "call::webrtc", call_id = %call_id, "peer connection created");
        Ok(Box::new(WebRtcSession {
            call_id: call_id.clone(),
            peer_connection,
            closed: AtomicBool::new(false),
            rtcp_readers: Mutex::new(Vec::new()),
        }))
    }
}

fn install_observers(peer_connection: &Arc<RTCPeerConnection>, sink: MediaEventSink) {
    let candidate_sink = sink.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // None marks the end of gathering
        if let Some(candidate) = candidate {
            match candidate
                .to_json()
                .map_err(|err| err.to_string())
                .and_then(|init| serde_json::to_string(&init).map_err(|err| err.to_string()))
            {
                Ok(data) => candidate_sink.emit(MediaEvent::LocalCandidate(data)),
                Err(err) => warn!(
                    target = "call::webrtc",
                    call_id = %candidate_sink.call_id(),
                    error = %err,
                    "could not encode local candidate"
                ),
            }
        }
        Box::pin(async {})
    }));

    let track_sink = sink.clone();
    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            track_sink.emit(MediaEvent::RemoteTrack(kind));
            Box::pin(async {})
        },
    ));

    peer_connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            trace!(
                target = "call::webrtc",
                call_id = %sink.call_id(),
                ?state,
                "peer connection state"
            );
            if let Some(state) = connectivity(state) {
                sink.emit(MediaEvent::Connectivity(state));
            }
            Box::pin(async {})
        },
    ));
}

/// `Closed` is left out: it only follows our own `close`.
fn connectivity(state: RTCPeerConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCPeerConnectionState::Connecting => Some(ConnectivityState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectivityState::Failed),
        _ => None,
    }
}

pub struct WebRtcSession {
    call_id: CallId,
    peer_connection: Arc<RTCPeerConnection>,
    closed: AtomicBool,
    rtcp_readers: Mutex<Vec<JoinHandle<()>>>,
}

impl WebRtcSession {
    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::InvalidState("peer connection closed".into()));
        }
        Ok(())
    }

    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
        let parsed = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        };
        parsed.map_err(|err| MediaError::DescriptionRejected(err.to_string()))
    }
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn add_local_track(&self, track: LocalTrack) -> Result<(), MediaError> {
        self.ensure_open()?;
        let Some(sample_track) = track.handle::<Arc<TrackLocalStaticSample>>() else {
            return Err(MediaError::InvalidState(format!(
                "track {} is not a webrtc sample track",
                track.id()
            )));
        };
        let local: Arc<dyn TrackLocal + Send + Sync> = sample_track.clone();
        let sender = self
            .peer_connection
            .add_track(local)
            .await
            .map_err(|err| media_error(Stage::Track, err))?;

        // interceptors only run while someone reads RTCP
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        self.rtcp_readers.lock().push(reader);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.ensure_open()?;
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|err| media_error(Stage::Negotiate, err))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.ensure_open()?;
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|err| media_error(Stage::Negotiate, err))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.ensure_open()?;
        let description = Self::to_rtc(description)?;
        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|err| media_error(Stage::Describe, err))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.ensure_open()?;
        let description = Self::to_rtc(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|err| media_error(Stage::Describe, err))
    }

    async fn rollback_local_description(&self) -> Result<(), MediaError> {
        self.ensure_open()?;
        let Some(mut pending) = self.peer_connection.pending_local_description().await else {
            return Err(MediaError::InvalidState("no pending local offer".into()));
        };
        pending.sdp_type = RTCSdpType::Rollback;
        self.peer_connection
            .set_local_description(pending)
            .await
            .map_err(|err| media_error(Stage::Negotiate, err))
    }

    async fn add_candidate(&self, data: &str) -> Result<(), MediaError> {
        self.ensure_open()?;
        let init: RTCIceCandidateInit = serde_json::from_str(data)
            .map_err(|err| MediaError::CandidateRejected(format!("malformed candidate: {err}")))?;
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|err| media_error(Stage::Candidate, err))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for reader in self.rtcp_readers.lock().drain(..) {
            reader.abort();
        }
        if let Err(err) = self.peer_connection.close().await {
            debug!(
                target = "call::webrtc",
                call_id = %self.call_id,
                error = %err,
                "peer connection close reported an error"
            );
        }
        debug!(target = "call::webrtc", call_id = %self.call_id, "peer connection closed");
    }
}

impl Drop for WebRtcSession {
    fn drop(&mut self) {
        for reader in self.rtcp_readers.get_mut().drain(..) {
            reader.abort();
        }
    }
}
