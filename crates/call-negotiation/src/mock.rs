//! Scriptable in-memory media capability for tests and demos.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::MediaError;
use crate::media::{LocalMedia, MediaEngine, MediaEventSink, MediaSession};
use crate::types::{CallId, LocalTrack, SdpKind, SessionDescription, TrackKind};

/// Operations on the mock engine that can be failed or stalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaOp {
    Create,
    AddTrack,
    CreateOffer,
    CreateAnswer,
    SetLocal,
    SetRemote,
    Rollback,
    AddCandidate,
}

/// Successful calls recorded per session, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCall {
    AddTrack(String),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    Rollback,
    AddCandidate(String),
    Close,
}

enum Injection {
    Fail(MediaError),
    Stall,
}

#[derive(Default)]
struct EngineState {
    sessions: Vec<CallId>,
    journals: HashMap<CallId, Vec<MediaCall>>,
    sinks: HashMap<CallId, MediaEventSink>,
    injections: HashMap<MediaOp, VecDeque<Injection>>,
}

impl EngineState {
    fn next_injection(&mut self, op: MediaOp) -> Option<Injection> {
        self.injections.get_mut(&op)?.pop_front()
    }
}

#[derive(Clone, Default)]
pub struct MockMediaEngine {
    state: Arc<Mutex<EngineState>>,
}

impl MockMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `op` on any session fails with `error`.
    pub fn fail_next(&self, op: MediaOp, error: MediaError) {
        self.state
            .lock()
            .injections
            .entry(op)
            .or_default()
            .push_back(Injection::Fail(error));
    }

    /// The next `op` on any session never completes.
    pub fn stall_next(&self, op: MediaOp) {
        self.state
            .lock()
            .injections
            .entry(op)
            .or_default()
            .push_back(Injection::Stall);
    }

    /// Call ids sessions were created for, oldest first.
    pub fn sessions(&self) -> Vec<CallId> {
        self.state.lock().sessions.clone()
    }

    pub fn journal(&self, call_id: &CallId) -> Vec<MediaCall> {
        self.state
            .lock()
            .journals
            .get(call_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn applied_candidates(&self, call_id: &CallId) -> Vec<String> {
        self.journal(call_id)
            .into_iter()
            .filter_map(|call| match call {
                MediaCall::AddCandidate(data) => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self, call_id: &CallId) -> bool {
        self.journal(call_id).contains(&MediaCall::Close)
    }

    /// The observer sink handed to the session created for `call_id`.
    pub fn sink(&self, call_id: &CallId) -> Option<MediaEventSink> {
        self.state.lock().sinks.get(call_id).cloned()
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create(
        &self,
        call_id: &CallId,
        sink: MediaEventSink,
    ) -> Result<Box<dyn MediaSession>, MediaError> {
        let injection = self.state.lock().next_injection(MediaOp::Create);
        match injection {
            Some(Injection::Fail(err)) => return Err(err),
            Some(Injection::Stall) => std::future::pending::<()>().await,
            None => {}
        }
        {
            let mut state = self.state.lock();
            state.sessions.push(call_id.clone());
            state.journals.insert(call_id.clone(), Vec::new());
            state.sinks.insert(call_id.clone(), sink);
        }
        Ok(Box::new(MockSession {
            call_id: call_id.clone(),
            engine: Arc::clone(&self.state),
            flags: Mutex::new(SessionFlags::default()),
        }))
    }
}

#[derive(Default)]
struct SessionFlags {
    closed: bool,
    local: Option<SdpKind>,
    remote: Option<SdpKind>,
}

struct MockSession {
    call_id: CallId,
    engine: Arc<Mutex<EngineState>>,
    flags: Mutex<SessionFlags>,
}

impl MockSession {
    async fn run<T, F>(&self, op: MediaOp, call: MediaCall, apply: F) -> Result<T, MediaError>
    where
        F: FnOnce(&mut SessionFlags) -> Result<T, MediaError>,
    {
        let injection = self.engine.lock().next_injection(op);
        match injection {
            Some(Injection::Fail(err)) => return Err(err),
            Some(Injection::Stall) => std::future::pending::<()>().await,
            None => {}
        }
        let result = {
            let mut flags = self.flags.lock();
            if flags.closed {
                Err(MediaError::InvalidState("session closed".into()))
            } else {
                apply(&mut flags)
            }
        };
        if result.is_ok() {
            self.record(call);
        }
        result
    }

    fn record(&self, call: MediaCall) {
        if let Some(journal) = self.engine.lock().journals.get_mut(&self.call_id) {
            journal.push(call);
        }
    }
}

#[async_trait]
impl MediaSession for MockSession {
    async fn add_local_track(&self, track: LocalTrack) -> Result<(), MediaError> {
        let call = MediaCall::AddTrack(track.id().to_string());
        self.run(MediaOp::AddTrack, call, |_| Ok(())).await
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let sdp = format!("offer:{}", self.call_id);
        self.run(MediaOp::CreateOffer, MediaCall::CreateOffer, move |_| {
            Ok(SessionDescription::offer(sdp))
        })
        .await
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let sdp = format!("answer:{}", self.call_id);
        self.run(MediaOp::CreateAnswer, MediaCall::CreateAnswer, move |flags| {
            if flags.remote != Some(SdpKind::Offer) {
                return Err(MediaError::Negotiation("no remote offer to answer".into()));
            }
            Ok(SessionDescription::answer(sdp))
        })
        .await
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let kind = description.kind;
        self.run(MediaOp::SetLocal, MediaCall::SetLocal(kind), move |flags| {
            if kind == SdpKind::Answer && flags.remote != Some(SdpKind::Offer) {
                return Err(MediaError::DescriptionRejected(
                    "answer without a remote offer".into(),
                ));
            }
            flags.local = Some(kind);
            Ok(())
        })
        .await
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let kind = description.kind;
        self.run(MediaOp::SetRemote, MediaCall::SetRemote(kind), move |flags| {
            match (kind, flags.local) {
                (SdpKind::Answer, local) if local != Some(SdpKind::Offer) => {
                    return Err(MediaError::DescriptionRejected(
                        "answer without a local offer".into(),
                    ));
                }
                (SdpKind::Offer, Some(SdpKind::Offer)) => {
                    return Err(MediaError::InvalidState(
                        "local offer pending; roll back first".into(),
                    ));
                }
                _ => {}
            }
            flags.remote = Some(kind);
            Ok(())
        })
        .await
    }

    async fn rollback_local_description(&self) -> Result<(), MediaError> {
        self.run(MediaOp::Rollback, MediaCall::Rollback, |flags| {
            if flags.local != Some(SdpKind::Offer) {
                return Err(MediaError::InvalidState("no local offer to roll back".into()));
            }
            flags.local = None;
            Ok(())
        })
        .await
    }

    async fn add_candidate(&self, data: &str) -> Result<(), MediaError> {
        let call = MediaCall::AddCandidate(data.to_string());
        self.run(MediaOp::AddCandidate, call, |flags| {
            if flags.remote.is_none() {
                return Err(MediaError::Negotiation(
                    "candidate before remote description".into(),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn close(&self) {
        let newly_closed = {
            let mut flags = self.flags.lock();
            !std::mem::replace(&mut flags.closed, true)
        };
        if newly_closed {
            self.record(MediaCall::Close);
        }
    }
}

#[derive(Default)]
struct LocalMediaState {
    acquired: usize,
    released: usize,
    failure: Option<MediaError>,
}

/// Counts acquire/release pairs; tracks carry no media.
#[derive(Clone, Default)]
pub struct MockLocalMedia {
    state: Arc<Mutex<LocalMediaState>>,
}

impl MockLocalMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: MediaError) {
        self.state.lock().failure = Some(error);
    }

    pub fn acquired(&self) -> usize {
        self.state.lock().acquired
    }

    pub fn released(&self) -> usize {
        self.state.lock().released
    }

    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.acquired - state.released
    }
}

#[async_trait]
impl LocalMedia for MockLocalMedia {
    async fn acquire_local_audio(&self) -> Result<LocalTrack, MediaError> {
        let mut state = self.state.lock();
        if let Some(err) = state.failure.take() {
            return Err(err);
        }
        state.acquired += 1;
        Ok(LocalTrack::new(
            format!("mic-{}", state.acquired),
            TrackKind::Audio,
            (),
        ))
    }

    async fn release_local_audio(&self, _track: LocalTrack) {
        self.state.lock().released += 1;
    }
}
