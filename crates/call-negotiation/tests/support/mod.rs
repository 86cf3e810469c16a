#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use call_negotiation::mock::{MockLocalMedia, MockMediaEngine};
use call_negotiation::{
    CallConfig, CallController, CallError, CallEvent, CallId, Disposition, LoopbackSignalChannel,
    PeerId, SignalChannel, SignalMessage,
};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Offers go out immediately unless a test opts into a glare window.
pub fn immediate() -> CallConfig {
    CallConfig::default().with_glare_delay(Duration::ZERO)
}

pub struct Peer {
    pub id: PeerId,
    pub controller: CallController,
    pub channel: Arc<LoopbackSignalChannel>,
    pub engine: MockMediaEngine,
    pub media: MockLocalMedia,
    pub events: broadcast::Receiver<CallEvent>,
}

pub fn pair_with(a: &str, b: &str, config_a: CallConfig, config_b: CallConfig) -> (Peer, Peer) {
    init_tracing();
    let (left, right) = LoopbackSignalChannel::pair(a, b);
    (peer(left, config_a), peer(right, config_b))
}

pub fn pair(config: CallConfig) -> (Peer, Peer) {
    pair_with("alice", "bob", config.clone(), config)
}

fn peer(channel: LoopbackSignalChannel, config: CallConfig) -> Peer {
    let channel = Arc::new(channel);
    let engine = MockMediaEngine::new();
    let media = MockLocalMedia::new();
    let signal: Arc<dyn SignalChannel> = channel.clone();
    let controller =
        CallController::new(config, Arc::new(engine.clone()), Arc::new(media.clone()), signal);
    let events = controller.subscribe();
    Peer {
        id: channel.local_peer().clone(),
        controller,
        channel,
        engine,
        media,
        events,
    }
}

impl Peer {
    pub fn remote(&self) -> PeerId {
        self.channel.remote_peer().clone()
    }

    /// Process one message waiting in this peer's inbox.
    pub async fn deliver_next(&mut self) -> Option<Result<Disposition, CallError>> {
        let inbound = self.channel.try_recv()?;
        Some(
            self.controller
                .on_inbound_message(inbound.from, inbound.message)
                .await,
        )
    }

    pub async fn deliver_all(&mut self) -> Vec<Result<Disposition, CallError>> {
        let mut results = Vec::new();
        while let Some(result) = self.deliver_next().await {
            results.push(result);
        }
        results
    }

    /// Hand a message to the controller as if the remote had sent it.
    pub async fn receive(&mut self, message: SignalMessage) -> Result<Disposition, CallError> {
        let from = self.remote();
        self.controller.on_inbound_message(from, message).await
    }

    pub async fn pump_media(&mut self) {
        while let Some(event) = self.controller.try_next_media_event() {
            let _ = self.controller.on_media_event(event).await;
        }
    }

    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.channel
            .sent()
            .into_iter()
            .map(|(_, message)| message)
            .collect()
    }

    pub fn offers_sent(&self) -> usize {
        self.sent()
            .iter()
            .filter(|message| matches!(message, SignalMessage::Offer { .. }))
            .count()
    }

    pub fn call_id(&self) -> CallId {
        self.controller
            .call_id()
            .cloned()
            .expect("no live call attempt")
    }
}

/// Deliver messages back and forth until both inboxes are empty.
pub async fn exchange(a: &mut Peer, b: &mut Peer) {
    loop {
        let moved_a = a.deliver_all().await.len();
        let moved_b = b.deliver_all().await.len();
        a.pump_media().await;
        b.pump_media().await;
        if moved_a == 0 && moved_b == 0 {
            break;
        }
    }
}

pub fn candidate(call_id: &CallId, data: &str) -> SignalMessage {
    SignalMessage::Candidate {
        call_id: call_id.clone(),
        data: data.to_string(),
    }
}
