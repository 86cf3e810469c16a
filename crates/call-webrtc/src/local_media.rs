use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use call_negotiation::{LocalMedia, LocalTrack, MediaError, TrackKind};
use parking_lot::Mutex;
use tracing::debug;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Hands out one Opus sample track per call attempt. Capturing audio and
/// writing samples into [`active_track`](Self::active_track) is up to the
/// application.
pub struct WebRtcLocalMedia {
    stream_id: String,
    next_id: AtomicU64,
    active: Mutex<Option<(String, Arc<TrackLocalStaticSample>)>>,
}

impl WebRtcLocalMedia {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            next_id: AtomicU64::new(1),
            active: Mutex::new(None),
        }
    }

    pub fn active_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.active.lock().as_ref().map(|(_, track)| Arc::clone(track))
    }
}

impl Default for WebRtcLocalMedia {
    fn default() -> Self {
        Self::new("voicecall")
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48_000,
        channels: 2,
        ..Default::default()
    }
}

#[async_trait]
impl LocalMedia for WebRtcLocalMedia {
    async fn acquire_local_audio(&self) -> Result<LocalTrack, MediaError> {
        let id = format!("audio-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let track = Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            id.clone(),
            self.stream_id.clone(),
        ));
        *self.active.lock() = Some((id.clone(), Arc::clone(&track)));
        debug!(target = "call::webrtc", track = %id, "local audio track acquired");
        Ok(LocalTrack::new(id, TrackKind::Audio, track))
    }

    async fn release_local_audio(&self, track: LocalTrack) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|(id, _)| id == track.id()) {
            *active = None;
        }
        debug!(target = "call::webrtc", track = %track.id(), "local audio track released");
    }
}
