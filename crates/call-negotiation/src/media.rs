use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use crate::error::{CallError, MediaError};
use crate::types::{CallId, ConnectivityState, LocalTrack, SessionDescription, TrackKind};

/// Observer callbacks of a media session, flattened into one enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// A locally gathered connectivity candidate that must reach the remote.
    LocalCandidate(String),
    RemoteTrack(TrackKind),
    Connectivity(ConnectivityState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedMediaEvent {
    pub call_id: CallId,
    pub event: MediaEvent,
}

/// Handed to [`MediaEngine::create`]; every event it emits is tagged with the
/// call id the session was created for.
#[derive(Debug, Clone)]
pub struct MediaEventSink {
    call_id: CallId,
    tx: mpsc::UnboundedSender<TaggedMediaEvent>,
}

impl MediaEventSink {
    pub fn new(call_id: CallId, tx: mpsc::UnboundedSender<TaggedMediaEvent>) -> Self {
        Self { call_id, tx }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Events emitted after the controller is gone are dropped.
    pub fn emit(&self, event: MediaEvent) {
        let _ = self.tx.send(TaggedMediaEvent {
            call_id: self.call_id.clone(),
            event,
        });
    }
}

/// Allocates one media session per call attempt.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create(
        &self,
        call_id: &CallId,
        sink: MediaEventSink,
    ) -> Result<Box<dyn MediaSession>, MediaError>;
}

/// One peer connection. Never reused after `close`.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn add_local_track(&self, track: LocalTrack) -> Result<(), MediaError>;

    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), MediaError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;

    /// Discard a pending local offer so a remote offer can be applied.
    async fn rollback_local_description(&self) -> Result<(), MediaError>;

    /// Reports `InvalidState` once the session is closed.
    async fn add_candidate(&self, data: &str) -> Result<(), MediaError>;

    /// Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait LocalMedia: Send + Sync {
    async fn acquire_local_audio(&self) -> Result<LocalTrack, MediaError>;

    async fn release_local_audio(&self, track: LocalTrack);
}

/// Raised by a hangup to abort whatever media operation is in flight.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptInner>,
}

#[derive(Debug, Default)]
struct InterruptInner {
    raised: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.inner.raised.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Run `operation` unless the interrupt is raised first.
    pub async fn guard<F, T>(&self, operation: F) -> Result<T, CallError>
    where
        F: Future<Output = Result<T, MediaError>>,
    {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_raised() {
            return Err(CallError::Interrupted);
        }
        tokio::select! {
            biased;
            _ = &mut notified => Err(CallError::Interrupted),
            result = operation => result.map_err(CallError::from),
        }
    }
}
