use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::candidates::CandidateBuffer;
use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{
    Interrupt, LocalMedia, MediaEngine, MediaEvent, MediaEventSink, MediaSession,
    TaggedMediaEvent,
};
use crate::negotiation::{
    CallAttempt, CallEvent, Disposition, Effects, NegotiationEvent, NegotiationState, StaleReason,
};
use crate::signal::{SignalChannel, SignalMessage};
use crate::types::{Candidate, CallId, PeerId, Role};

enum Route {
    Dispatch,
    Open,
    Busy,
    Buffer,
    Stale(StaleReason),
}

/// Owns the single live call attempt of one endpoint and routes every input
/// to it.
pub struct CallController {
    config: CallConfig,
    local: PeerId,
    engine: Arc<dyn MediaEngine>,
    local_media: Arc<dyn LocalMedia>,
    signal: Arc<dyn SignalChannel>,
    attempt: Option<CallAttempt>,
    candidates: CandidateBuffer,
    tombstones: VecDeque<CallId>,
    glare_deadline: Option<(CallId, Instant)>,
    interrupt: Interrupt,
    media_tx: mpsc::UnboundedSender<TaggedMediaEvent>,
    media_rx: Option<mpsc::UnboundedReceiver<TaggedMediaEvent>>,
    events: broadcast::Sender<CallEvent>,
}

impl CallController {
    pub fn new(
        config: CallConfig,
        engine: Arc<dyn MediaEngine>,
        local_media: Arc<dyn LocalMedia>,
        signal: Arc<dyn SignalChannel>,
    ) -> Self {
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            candidates: CandidateBuffer::new(config.max_buffered_candidates)
                .with_orphan_limit(config.max_orphan_calls),
            local: signal.local_peer().clone(),
            config,
            engine,
            local_media,
            signal,
            attempt: None,
            tombstones: VecDeque::new(),
            glare_deadline: None,
            interrupt: Interrupt::new(),
            media_tx,
            media_rx: Some(media_rx),
            events,
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<CallEvent> {
        self.events.clone()
    }

    pub(crate) fn signal(&self) -> Arc<dyn SignalChannel> {
        Arc::clone(&self.signal)
    }

    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Hands the media event stream to an external loop. Afterwards
    /// [`try_next_media_event`](Self::try_next_media_event) yields nothing.
    pub fn take_media_events(&mut self) -> Option<mpsc::UnboundedReceiver<TaggedMediaEvent>> {
        self.media_rx.take()
    }

    pub fn try_next_media_event(&mut self) -> Option<TaggedMediaEvent> {
        self.media_rx.as_mut()?.try_recv().ok()
    }

    pub fn state(&self) -> NegotiationState {
        self.attempt
            .as_ref()
            .map_or(NegotiationState::Idle, CallAttempt::state)
    }

    pub fn role(&self) -> Role {
        self.attempt
            .as_ref()
            .map_or(Role::Undetermined, CallAttempt::role)
    }

    pub fn call_id(&self) -> Option<&CallId> {
        self.attempt.as_ref().map(CallAttempt::id)
    }

    pub fn remote(&self) -> Option<&PeerId> {
        self.attempt.as_ref().map(CallAttempt::remote)
    }

    pub fn attempt(&self) -> Option<&CallAttempt> {
        self.attempt.as_ref()
    }

    /// When the pending glare check fires, if one is scheduled.
    pub fn glare_deadline(&self) -> Option<Instant> {
        self.glare_deadline.as_ref().map(|(_, at)| *at)
    }

    pub fn buffered_candidates(&self, call_id: &CallId) -> usize {
        self.candidates.len(call_id)
    }

    /// Call ids holding candidates that match no attempt.
    pub fn orphan_calls(&self) -> usize {
        self.candidates.orphan_count()
    }

    pub fn is_tombstoned(&self, call_id: &CallId) -> bool {
        self.tombstones.contains(call_id)
    }

    /// Begin a call to `remote`. The offer goes out once the glare delay
    /// passes without a competing offer.
    pub async fn start_call(&mut self, remote: PeerId) -> Result<CallId, CallError> {
        if let Some(attempt) = &self.attempt {
            return Err(CallError::AlreadyActive {
                call_id: attempt.id().clone(),
            });
        }

        let call_id = CallId::generate();
        info!(
            target = "call::controller",
            call_id = %call_id,
            remote = %remote,
            "starting call"
        );
        let session = self.create_session(&call_id).await?;
        self.attempt = Some(CallAttempt::new(call_id.clone(), remote, session));
        self.dispatch(NegotiationEvent::StartLocal).await?;

        if self.state() == NegotiationState::Offering {
            if self.config.glare_delay.is_zero() {
                self.dispatch(NegotiationEvent::GlareTimerExpired).await?;
            } else {
                self.glare_deadline =
                    Some((call_id.clone(), Instant::now() + self.config.glare_delay));
            }
        }
        Ok(call_id)
    }

    pub async fn on_glare_timeout(&mut self) -> Result<(), CallError> {
        let Some((call_id, _)) = self.glare_deadline.take() else {
            return Ok(());
        };
        let due = self
            .attempt
            .as_ref()
            .is_some_and(|a| a.id() == &call_id && a.state() == NegotiationState::Offering);
        if !due {
            return Ok(());
        }
        self.dispatch(NegotiationEvent::GlareTimerExpired)
            .await
            .map(|_| ())
    }

    /// Route one inbound signaling message. Errors mean the live attempt
    /// failed while handling it and has already been torn down.
    pub async fn on_inbound_message(
        &mut self,
        from: PeerId,
        message: SignalMessage,
    ) -> Result<Disposition, CallError> {
        let call_id = message.call_id().clone();
        if self.is_tombstoned(&call_id) {
            debug!(
                target = "call::controller",
                call_id = %call_id,
                kind = message.kind(),
                "message for finished attempt"
            );
            return Ok(Disposition::Stale(StaleReason::Terminated));
        }

        match self.route(&from, &message) {
            Route::Dispatch => self.dispatch(message.into()).await,
            Route::Open => {
                info!(
                    target = "call::controller",
                    call_id = %call_id,
                    remote = %from,
                    "incoming call"
                );
                let session = match self.create_session(&call_id).await {
                    Ok(session) => session,
                    Err(err) => {
                        self.send_hangup(&from, call_id).await;
                        return Err(err);
                    }
                };
                self.attempt = Some(CallAttempt::new(call_id, from, session));
                self.dispatch(message.into()).await
            }
            Route::Busy => {
                warn!(
                    target = "call::controller",
                    call_id = %call_id,
                    remote = %from,
                    active = ?self.call_id(),
                    "rejecting offer while another call is active"
                );
                self.send_hangup(&from, call_id).await;
                Ok(Disposition::Rejected)
            }
            Route::Buffer => {
                let SignalMessage::Candidate { call_id, data } = message else {
                    return Ok(Disposition::Stale(StaleReason::UnknownCall));
                };
                if self
                    .candidates
                    .append_orphan(&call_id, Candidate::new(call_id.clone(), data))
                {
                    Ok(Disposition::Buffered)
                } else {
                    Ok(Disposition::Stale(StaleReason::BufferFull))
                }
            }
            Route::Stale(reason) => {
                debug!(
                    target = "call::controller",
                    call_id = %call_id,
                    remote = %from,
                    kind = message.kind(),
                    ?reason,
                    "dropping stale message"
                );
                Ok(Disposition::Stale(reason))
            }
        }
    }

    pub async fn on_media_event(
        &mut self,
        event: TaggedMediaEvent,
    ) -> Result<Disposition, CallError> {
        let live = self
            .attempt
            .as_ref()
            .is_some_and(|a| a.owns(&event.call_id));
        if !live {
            debug!(
                target = "call::controller",
                call_id = %event.call_id,
                "media event for inactive attempt"
            );
            return Ok(Disposition::Stale(StaleReason::Terminated));
        }
        let event = match event.event {
            MediaEvent::LocalCandidate(data) => NegotiationEvent::LocalCandidate(data),
            MediaEvent::RemoteTrack(kind) => NegotiationEvent::RemoteTrack(kind),
            MediaEvent::Connectivity(state) => NegotiationEvent::Connectivity(state),
        };
        self.dispatch(event).await
    }

    /// Hang up the live attempt, telling the remote first. No-op when idle.
    pub async fn end_call(&mut self) -> Result<(), CallError> {
        let Some(attempt) = &self.attempt else {
            self.interrupt.clear();
            return Ok(());
        };
        let remote = attempt.remote().clone();
        let call_id = attempt.id().clone();
        self.send_hangup(&remote, call_id).await;
        let result = self.dispatch(NegotiationEvent::LocalHangup).await;
        self.interrupt.clear();
        result.map(|_| ())
    }

    fn route(&self, from: &PeerId, message: &SignalMessage) -> Route {
        let call_id = message.call_id();
        match &self.attempt {
            Some(attempt) if attempt.owns(call_id) => {
                if attempt.remote() == from {
                    Route::Dispatch
                } else {
                    Route::Stale(StaleReason::UnknownCall)
                }
            }
            Some(attempt) => match message {
                // glare from the same remote; the attempt decides
                SignalMessage::Offer { .. } if attempt.remote() == from => Route::Dispatch,
                SignalMessage::Offer { .. } => Route::Busy,
                SignalMessage::Candidate { .. } => Route::Buffer,
                SignalMessage::Answer { .. } | SignalMessage::Hangup { .. } => {
                    Route::Stale(StaleReason::UnknownCall)
                }
            },
            None => match message {
                SignalMessage::Offer { .. } => Route::Open,
                SignalMessage::Candidate { .. } => Route::Buffer,
                SignalMessage::Answer { .. } | SignalMessage::Hangup { .. } => {
                    Route::Stale(StaleReason::UnknownCall)
                }
            },
        }
    }

    async fn dispatch(&mut self, event: NegotiationEvent) -> Result<Disposition, CallError> {
        let Some(attempt) = self.attempt.as_mut() else {
            return Ok(Disposition::Stale(StaleReason::UnknownCall));
        };
        let mut fx = Effects {
            local: &self.local,
            signal: self.signal.as_ref(),
            local_media: self.local_media.as_ref(),
            candidates: &mut self.candidates,
            interrupt: &self.interrupt,
            events: &self.events,
        };
        let result = attempt.handle(event, &mut fx).await;
        self.settle();
        result
    }

    /// Clears timers that no longer apply and retires a finished attempt.
    fn settle(&mut self) {
        let Some(state) = self.attempt.as_ref().map(CallAttempt::state) else {
            return;
        };
        if state != NegotiationState::Offering {
            self.glare_deadline = None;
        }
        if !state.is_terminal() {
            return;
        }
        if let Some(attempt) = self.attempt.take() {
            for id in attempt.all_ids() {
                self.bury(id.clone());
            }
            self.candidates.discard_all();
            info!(
                target = "call::controller",
                call_id = %attempt.id(),
                state = %state,
                elapsed_ms = u64::try_from(attempt.created_at().elapsed().as_millis())
                    .unwrap_or(u64::MAX),
                "call attempt finished"
            );
        }
    }

    fn bury(&mut self, call_id: CallId) {
        if self.config.tombstone_capacity == 0 {
            return;
        }
        self.tombstones.push_back(call_id);
        while self.tombstones.len() > self.config.tombstone_capacity {
            self.tombstones.pop_front();
        }
    }

    async fn create_session(
        &self,
        call_id: &CallId,
    ) -> Result<Box<dyn MediaSession>, CallError> {
        let sink = MediaEventSink::new(call_id.clone(), self.media_tx.clone());
        match self.interrupt.guard(self.engine.create(call_id, sink)).await {
            Ok(session) => Ok(session),
            Err(err) => {
                warn!(
                    target = "call::controller",
                    call_id = %call_id,
                    error = %err,
                    "could not allocate media session"
                );
                let _ = self.events.send(CallEvent::Failed {
                    call_id: call_id.clone(),
                    error: err.clone(),
                });
                Err(err)
            }
        }
    }

    async fn send_hangup(&self, to: &PeerId, call_id: CallId) {
        if let Err(err) = self.signal.send(to, SignalMessage::Hangup { call_id }).await {
            debug!(
                target = "call::controller",
                remote = %to,
                error = %err,
                "best-effort hangup not delivered"
            );
        }
    }
}
