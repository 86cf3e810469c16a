use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::candidates::CandidateBuffer;
use crate::error::{CallError, MediaError};
use crate::media::{Interrupt, LocalMedia, MediaSession};
use crate::signal::{SignalChannel, SignalMessage};
use crate::types::{
    Candidate, CallId, ConnectivityState, LocalTrack, PeerId, Role, SdpKind, SessionDescription,
    TrackKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingAnswer,
    ReceivedOffer,
    Answering,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::AwaitingAnswer => "awaiting_answer",
            NegotiationState::ReceivedOffer => "received_offer",
            NegotiationState::Answering => "answering",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every input to a call attempt. All mutation goes through
/// [`CallAttempt::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    StartLocal,
    GlareTimerExpired,
    RemoteOffer {
        call_id: CallId,
        description: SessionDescription,
    },
    RemoteAnswer {
        call_id: CallId,
        description: SessionDescription,
    },
    RemoteCandidate(Candidate),
    RemoteHangup {
        call_id: CallId,
    },
    LocalHangup,
    LocalCandidate(String),
    RemoteTrack(TrackKind),
    Connectivity(ConnectivityState),
}

impl NegotiationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NegotiationEvent::StartLocal => "start_local",
            NegotiationEvent::GlareTimerExpired => "glare_timer_expired",
            NegotiationEvent::RemoteOffer { .. } => "remote_offer",
            NegotiationEvent::RemoteAnswer { .. } => "remote_answer",
            NegotiationEvent::RemoteCandidate(_) => "remote_candidate",
            NegotiationEvent::RemoteHangup { .. } => "remote_hangup",
            NegotiationEvent::LocalHangup => "local_hangup",
            NegotiationEvent::LocalCandidate(_) => "local_candidate",
            NegotiationEvent::RemoteTrack(_) => "remote_track",
            NegotiationEvent::Connectivity(_) => "connectivity",
        }
    }
}

impl From<SignalMessage> for NegotiationEvent {
    fn from(message: SignalMessage) -> Self {
        match message {
            SignalMessage::Offer { call_id, sdp } => NegotiationEvent::RemoteOffer {
                call_id,
                description: SessionDescription::offer(sdp),
            },
            SignalMessage::Answer { call_id, sdp } => NegotiationEvent::RemoteAnswer {
                call_id,
                description: SessionDescription::answer(sdp),
            },
            SignalMessage::Candidate { call_id, data } => {
                NegotiationEvent::RemoteCandidate(Candidate::new(call_id, data))
            }
            SignalMessage::Hangup { call_id } => NegotiationEvent::RemoteHangup { call_id },
        }
    }
}

/// What happened to one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Buffered,
    /// A competing offer lost the tie-break and was dropped.
    GlareIgnored,
    /// Busy: an offer that cannot be served while another attempt is live.
    Rejected,
    Stale(StaleReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    Terminated,
    UnknownCall,
    UnexpectedState,
    Duplicate,
    BufferFull,
    SessionClosed,
}

/// Notifications published to controller subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged {
        call_id: CallId,
        state: NegotiationState,
    },
    RoleDecided {
        call_id: CallId,
        role: Role,
    },
    RemoteTrack {
        call_id: CallId,
        kind: TrackKind,
    },
    Connectivity {
        call_id: CallId,
        state: ConnectivityState,
    },
    Failed {
        call_id: CallId,
        error: CallError,
    },
    Closed {
        call_id: CallId,
    },
}

impl CallEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            CallEvent::StateChanged { call_id, .. }
            | CallEvent::RoleDecided { call_id, .. }
            | CallEvent::RemoteTrack { call_id, .. }
            | CallEvent::Connectivity { call_id, .. }
            | CallEvent::Failed { call_id, .. }
            | CallEvent::Closed { call_id } => call_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallEvent::Failed { .. } | CallEvent::Closed { .. })
    }
}

/// Collaborators an attempt acts through while handling one event.
pub(crate) struct Effects<'a> {
    pub local: &'a PeerId,
    pub signal: &'a dyn SignalChannel,
    pub local_media: &'a dyn LocalMedia,
    pub candidates: &'a mut CandidateBuffer,
    pub interrupt: &'a Interrupt,
    pub events: &'a broadcast::Sender<CallEvent>,
}

impl Effects<'_> {
    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

/// Folded call ids kept per attempt; the oldest is forgotten first.
pub const MAX_ALIASES: usize = 16;

/// One negotiation lifecycle and the media session it owns.
pub struct CallAttempt {
    id: CallId,
    aliases: Vec<CallId>,
    remote: PeerId,
    role: Role,
    state: NegotiationState,
    created_at: Instant,
    session: Option<Box<dyn MediaSession>>,
    local_track: Option<LocalTrack>,
    local_description: Option<SdpKind>,
    remote_description: Option<SdpKind>,
    remote_tracks: HashSet<TrackKind>,
}

impl fmt::Debug for CallAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallAttempt")
            .field("id", &self.id)
            .field("aliases", &self.aliases)
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("has_session", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl CallAttempt {
    pub(crate) fn new(id: CallId, remote: PeerId, session: Box<dyn MediaSession>) -> Self {
        Self {
            id,
            aliases: Vec::new(),
            remote,
            role: Role::Undetermined,
            state: NegotiationState::Idle,
            created_at: Instant::now(),
            session: Some(session),
            local_track: None,
            local_description: None,
            remote_description: None,
            remote_tracks: HashSet::new(),
        }
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    /// Call ids folded into this attempt by glare resolution.
    pub fn aliases(&self) -> &[CallId] {
        &self.aliases
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn owns(&self, call_id: &CallId) -> bool {
        &self.id == call_id || self.aliases.contains(call_id)
    }

    pub(crate) fn all_ids(&self) -> impl Iterator<Item = &CallId> {
        self.aliases.iter().chain(std::iter::once(&self.id))
    }

    /// Single transition path. Errors have already torn the attempt down by
    /// the time they are returned.
    pub(crate) async fn handle(
        &mut self,
        event: NegotiationEvent,
        fx: &mut Effects<'_>,
    ) -> Result<Disposition, CallError> {
        if self.state.is_terminal() {
            debug!(
                target = "call::negotiation",
                call_id = %self.id,
                event = event.name(),
                "event for finished attempt"
            );
            return Ok(Disposition::Stale(StaleReason::Terminated));
        }

        let name = event.name();
        match self.step(event, fx).await {
            Ok(disposition) => {
                debug!(
                    target = "call::negotiation",
                    call_id = %self.id,
                    event = name,
                    state = %self.state,
                    ?disposition,
                    "event handled"
                );
                Ok(disposition)
            }
            Err(error) => {
                self.abort(&error, fx).await;
                Err(error)
            }
        }
    }

    async fn step(
        &mut self,
        event: NegotiationEvent,
        fx: &mut Effects<'_>,
    ) -> Result<Disposition, CallError> {
        match event {
            NegotiationEvent::StartLocal => self.start_local(fx).await,
            NegotiationEvent::GlareTimerExpired => self.commit_offer(fx).await,
            NegotiationEvent::RemoteOffer {
                call_id,
                description,
            } => self.receive_offer(call_id, description, fx).await,
            NegotiationEvent::RemoteAnswer {
                call_id,
                description,
            } => self.receive_answer(call_id, description, fx).await,
            NegotiationEvent::RemoteCandidate(candidate) => {
                self.receive_candidate(candidate, fx).await
            }
            NegotiationEvent::RemoteHangup { call_id } => {
                if !self.owns(&call_id) {
                    return Ok(Disposition::Stale(StaleReason::UnknownCall));
                }
                info!(
                    target = "call::negotiation",
                    call_id = %self.id,
                    remote = %self.remote,
                    "remote hung up"
                );
                self.close(fx).await;
                Ok(Disposition::Applied)
            }
            NegotiationEvent::LocalHangup => {
                info!(target = "call::negotiation", call_id = %self.id, "local hangup");
                self.close(fx).await;
                Ok(Disposition::Applied)
            }
            NegotiationEvent::LocalCandidate(data) => {
                let message = SignalMessage::Candidate {
                    call_id: self.id.clone(),
                    data,
                };
                if let Err(err) = fx.signal.send(&self.remote, message).await {
                    warn!(
                        target = "call::negotiation",
                        call_id = %self.id,
                        error = %err,
                        "failed to send local candidate"
                    );
                }
                Ok(Disposition::Applied)
            }
            NegotiationEvent::RemoteTrack(kind) => {
                if !self.remote_tracks.insert(kind) {
                    return Ok(Disposition::Stale(StaleReason::Duplicate));
                }
                fx.emit(CallEvent::RemoteTrack {
                    call_id: self.id.clone(),
                    kind,
                });
                Ok(Disposition::Applied)
            }
            NegotiationEvent::Connectivity(state) => {
                fx.emit(CallEvent::Connectivity {
                    call_id: self.id.clone(),
                    state,
                });
                if state.is_lost() {
                    info!(
                        target = "call::negotiation",
                        call_id = %self.id,
                        ?state,
                        "media connectivity lost; closing"
                    );
                    self.close(fx).await;
                }
                Ok(Disposition::Applied)
            }
        }
    }

    async fn start_local(&mut self, fx: &mut Effects<'_>) -> Result<Disposition, CallError> {
        if self.state != NegotiationState::Idle {
            return Ok(Disposition::Stale(StaleReason::UnexpectedState));
        }
        self.attach_local_audio(fx).await?;
        self.set_state(NegotiationState::Offering, fx);
        Ok(Disposition::Applied)
    }

    async fn commit_offer(&mut self, fx: &mut Effects<'_>) -> Result<Disposition, CallError> {
        if self.state != NegotiationState::Offering {
            return Ok(Disposition::Stale(StaleReason::UnexpectedState));
        }
        self.decide_role(Role::Initiator, fx);
        let offer = fx.interrupt.guard(self.session()?.create_offer()).await?;
        self.apply_local(offer.clone(), fx).await?;
        self.transmit(
            SignalMessage::Offer {
                call_id: self.id.clone(),
                sdp: offer.sdp,
            },
            fx,
        )
        .await?;
        self.set_state(NegotiationState::AwaitingAnswer, fx);
        Ok(Disposition::Applied)
    }

    async fn receive_offer(
        &mut self,
        call_id: CallId,
        description: SessionDescription,
        fx: &mut Effects<'_>,
    ) -> Result<Disposition, CallError> {
        match self.state {
            NegotiationState::Idle => {
                self.attach_local_audio(fx).await?;
                self.decide_role(Role::Responder, fx);
                self.answer(description, fx).await
            }
            NegotiationState::Offering => {
                if self.owns(&call_id) {
                    return Ok(Disposition::Stale(StaleReason::Duplicate));
                }
                info!(
                    target = "call::negotiation",
                    call_id = %self.id,
                    remote_call_id = %call_id,
                    "offer arrived before ours was sent; answering it"
                );
                self.adopt(call_id);
                self.decide_role(Role::Responder, fx);
                self.answer(description, fx).await
            }
            NegotiationState::AwaitingAnswer => {
                if self.owns(&call_id) {
                    return Ok(Disposition::Stale(StaleReason::Duplicate));
                }
                match fx.local.cmp(&self.remote) {
                    Ordering::Equal => Err(CallError::IdentityCollision(self.remote.clone())),
                    Ordering::Less => {
                        info!(
                            target = "call::negotiation",
                            call_id = %self.id,
                            remote_call_id = %call_id,
                            "dual offer; keeping local offer"
                        );
                        self.add_alias(call_id);
                        Ok(Disposition::GlareIgnored)
                    }
                    Ordering::Greater => {
                        info!(
                            target = "call::negotiation",
                            call_id = %self.id,
                            remote_call_id = %call_id,
                            "dual offer; rolling back local offer"
                        );
                        fx.interrupt
                            .guard(self.session()?.rollback_local_description())
                            .await?;
                        self.local_description = None;
                        self.adopt(call_id);
                        self.decide_role(Role::Responder, fx);
                        self.answer(description, fx).await
                    }
                }
            }
            _ => {
                if self.owns(&call_id) {
                    return Ok(Disposition::Stale(StaleReason::Duplicate));
                }
                // the remote's abandoned glare offer overtaken by its answer
                debug!(
                    target = "call::negotiation",
                    call_id = %self.id,
                    remote_call_id = %call_id,
                    state = %self.state,
                    "late competing offer from the same remote"
                );
                self.add_alias(call_id);
                Ok(Disposition::GlareIgnored)
            }
        }
    }

    async fn answer(
        &mut self,
        offer: SessionDescription,
        fx: &mut Effects<'_>,
    ) -> Result<Disposition, CallError> {
        self.apply_remote(offer, fx).await?;
        self.set_state(NegotiationState::ReceivedOffer, fx);
        self.apply_buffered(fx).await?;
        self.set_state(NegotiationState::Answering, fx);
        let answer = fx.interrupt.guard(self.session()?.create_answer()).await?;
        self.apply_local(answer.clone(), fx).await?;
        self.transmit(
            SignalMessage::Answer {
                call_id: self.id.clone(),
                sdp: answer.sdp,
            },
            fx,
        )
        .await?;
        self.set_state(NegotiationState::Connected, fx);
        Ok(Disposition::Applied)
    }

    async fn receive_answer(
        &mut self,
        call_id: CallId,
        description: SessionDescription,
        fx: &mut Effects<'_>,
    ) -> Result<Disposition, CallError> {
        if self.state != NegotiationState::AwaitingAnswer || call_id != self.id {
            let reason = if self.owns(&call_id) && self.state == NegotiationState::Connected {
                StaleReason::Duplicate
            } else {
                StaleReason::UnexpectedState
            };
            debug!(
                target = "call::negotiation",
                call_id = %self.id,
                answer_call_id = %call_id,
                state = %self.state,
                "ignoring stale answer"
            );
            return Ok(Disposition::Stale(reason));
        }
        self.apply_remote(description, fx).await?;
        self.apply_buffered(fx).await?;
        self.set_state(NegotiationState::Connected, fx);
        Ok(Disposition::Applied)
    }

    async fn receive_candidate(
        &mut self,
        candidate: Candidate,
        fx: &mut Effects<'_>,
    ) -> Result<Disposition, CallError> {
        if !self.owns(&candidate.call_id) {
            return Ok(Disposition::Stale(StaleReason::UnknownCall));
        }
        if self.remote_description.is_some() {
            return self.apply_candidate(candidate, fx).await;
        }
        if fx.candidates.append(&self.id, candidate) {
            Ok(Disposition::Buffered)
        } else {
            Ok(Disposition::Stale(StaleReason::BufferFull))
        }
    }

    async fn attach_local_audio(&mut self, fx: &mut Effects<'_>) -> Result<(), CallError> {
        if self.local_track.is_some() {
            return Ok(());
        }
        let track = fx
            .interrupt
            .guard(fx.local_media.acquire_local_audio())
            .await?;
        self.local_track = Some(track.clone());
        fx.interrupt
            .guard(self.session()?.add_local_track(track))
            .await
    }

    async fn apply_local(
        &mut self,
        description: SessionDescription,
        fx: &mut Effects<'_>,
    ) -> Result<(), CallError> {
        if let Some(applied) = self.local_description {
            return Err(MediaError::InvalidState(format!(
                "local {applied:?} description already applied"
            ))
            .into());
        }
        let kind = description.kind;
        fx.interrupt
            .guard(self.session()?.set_local_description(description))
            .await?;
        self.local_description = Some(kind);
        Ok(())
    }

    async fn apply_remote(
        &mut self,
        description: SessionDescription,
        fx: &mut Effects<'_>,
    ) -> Result<(), CallError> {
        if let Some(applied) = self.remote_description {
            return Err(MediaError::InvalidState(format!(
                "remote {applied:?} description already applied"
            ))
            .into());
        }
        let kind = description.kind;
        fx.interrupt
            .guard(self.session()?.set_remote_description(description))
            .await?;
        self.remote_description = Some(kind);
        Ok(())
    }

    async fn apply_buffered(&mut self, fx: &mut Effects<'_>) -> Result<(), CallError> {
        let mut pending = Vec::new();
        for id in self.aliases.iter().chain(std::iter::once(&self.id)) {
            pending.extend(fx.candidates.drain(id));
        }
        if !pending.is_empty() {
            debug!(
                target = "call::negotiation",
                call_id = %self.id,
                count = pending.len(),
                "applying buffered candidates"
            );
        }
        for candidate in pending {
            self.apply_candidate(candidate, fx).await?;
        }
        Ok(())
    }

    async fn apply_candidate(
        &mut self,
        candidate: Candidate,
        fx: &mut Effects<'_>,
    ) -> Result<Disposition, CallError> {
        match fx
            .interrupt
            .guard(self.session()?.add_candidate(&candidate.data))
            .await
        {
            Ok(()) => Ok(Disposition::Applied),
            Err(CallError::Media(MediaError::InvalidState(reason))) => {
                debug!(
                    target = "call::negotiation",
                    call_id = %self.id,
                    %reason,
                    "candidate ignored by closed session"
                );
                Ok(Disposition::Stale(StaleReason::SessionClosed))
            }
            Err(err) => Err(err),
        }
    }

    async fn transmit(&self, message: SignalMessage, fx: &mut Effects<'_>) -> Result<(), CallError> {
        fx.signal
            .send(&self.remote, message)
            .await
            .map_err(CallError::from)
    }

    fn session(&self) -> Result<&dyn MediaSession, CallError> {
        self.session
            .as_deref()
            .ok_or_else(|| MediaError::InvalidState("media session released".into()).into())
    }

    fn adopt(&mut self, call_id: CallId) {
        self.aliases.retain(|alias| alias != &call_id);
        let previous = std::mem::replace(&mut self.id, call_id);
        self.add_alias(previous);
    }

    fn add_alias(&mut self, call_id: CallId) {
        if self.owns(&call_id) {
            return;
        }
        if self.aliases.len() >= MAX_ALIASES {
            self.aliases.remove(0);
        }
        self.aliases.push(call_id);
    }

    fn decide_role(&mut self, role: Role, fx: &mut Effects<'_>) {
        if self.role == role {
            return;
        }
        self.role = role;
        info!(
            target = "call::negotiation",
            call_id = %self.id,
            remote = %self.remote,
            role = role.as_str(),
            "role decided"
        );
        fx.emit(CallEvent::RoleDecided {
            call_id: self.id.clone(),
            role,
        });
    }

    fn set_state(&mut self, state: NegotiationState, fx: &mut Effects<'_>) {
        debug!(
            target = "call::negotiation",
            call_id = %self.id,
            from = %self.state,
            to = %state,
            "state transition"
        );
        self.state = state;
        if !state.is_terminal() {
            fx.emit(CallEvent::StateChanged {
                call_id: self.id.clone(),
                state,
            });
        }
    }

    async fn close(&mut self, fx: &mut Effects<'_>) {
        self.release(fx).await;
        self.set_state(NegotiationState::Closed, fx);
        fx.emit(CallEvent::Closed {
            call_id: self.id.clone(),
        });
    }

    async fn abort(&mut self, error: &CallError, fx: &mut Effects<'_>) {
        self.release(fx).await;
        let hangup = SignalMessage::Hangup {
            call_id: self.id.clone(),
        };
        if let Err(err) = fx.signal.send(&self.remote, hangup).await {
            debug!(
                target = "call::negotiation",
                call_id = %self.id,
                error = %err,
                "could not notify remote of aborted attempt"
            );
        }
        if matches!(error, CallError::Interrupted) {
            info!(target = "call::negotiation", call_id = %self.id, "attempt interrupted");
            self.set_state(NegotiationState::Closed, fx);
            fx.emit(CallEvent::Closed {
                call_id: self.id.clone(),
            });
        } else {
            warn!(
                target = "call::negotiation",
                call_id = %self.id,
                remote = %self.remote,
                error = %error,
                "call attempt failed"
            );
            self.set_state(NegotiationState::Failed, fx);
            fx.emit(CallEvent::Failed {
                call_id: self.id.clone(),
                error: error.clone(),
            });
        }
    }

    async fn release(&mut self, fx: &mut Effects<'_>) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        if let Some(track) = self.local_track.take() {
            fx.local_media.release_local_audio(track).await;
        }
        for id in self.aliases.iter().chain(std::iter::once(&self.id)) {
            fx.candidates.discard(id);
        }
    }
}
