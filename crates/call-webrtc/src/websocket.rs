use std::time::Duration;

use async_trait::async_trait;
use call_negotiation::{InboundSignal, PeerId, SignalChannel, SignalError, SignalMessage};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::WebRtcError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join { peer_id: String },
    Signal { to_peer: String, signal: Value },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    JoinSuccess {
        peer_id: String,
        #[serde(default)]
        peers: Vec<String>,
    },
    JoinError {
        reason: String,
    },
    PeerJoined {
        peer_id: String,
    },
    PeerLeft {
        peer_id: String,
    },
    Signal {
        from_peer: String,
        signal: Value,
    },
    Pong,
    Error {
        message: String,
    },
    #[serde(other)]
    Other,
}

/// Signal channel over a relay server that forwards JSON envelopes between
/// peers joined to the same room.
pub struct WebSocketSignalChannel {
    local: PeerId,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<InboundSignal>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketSignalChannel {
    pub async fn connect(
        signaling_url: &str,
        peer_id: PeerId,
        join_timeout: Duration,
    ) -> Result<Self, WebRtcError> {
        let url = websocket_url(signaling_url)?;
        let (stream, _) = connect_async(url.as_str()).await?;
        debug!(target = "call::signal", url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundSignal>();
        let (join_tx, join_rx) = oneshot::channel::<Result<(), String>>();

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(target = "call::signal", error = %err, "dropping unencodable message");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut join_tx = Some(join_tx);
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(target = "call::signal", "signaling websocket closed: {err}");
                            }
                            _ => warn!(target = "call::signal", "signaling websocket error: {err}"),
                        }
                        break;
                    }
                };
                trace!(target = "call::signal", len = text.len(), "ws_in");
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => handle_server_message(message, &inbound_tx, &mut join_tx),
                    Err(err) => {
                        debug!(target = "call::signal", error = %err, "unparseable server message")
                    }
                }
            }
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        let channel = Self {
            local: peer_id,
            send_tx,
            inbound: AsyncMutex::new(inbound_rx),
            tasks: Mutex::new(vec![writer, reader, heartbeat]),
        };

        channel
            .send_tx
            .send(ClientMessage::Join {
                peer_id: channel.local.to_string(),
            })
            .map_err(|_| WebRtcError::ChannelClosed)?;

        match tokio::time::timeout(join_timeout, join_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(target = "call::signal", peer = %channel.local, "joined signaling room");
                Ok(channel)
            }
            Ok(Ok(Err(reason))) => Err(WebRtcError::JoinRejected(reason)),
            Ok(Err(_)) => Err(WebRtcError::ChannelClosed),
            Err(_) => Err(WebRtcError::JoinTimeout),
        }
    }
}

fn handle_server_message(
    message: ServerMessage,
    inbound: &mpsc::UnboundedSender<InboundSignal>,
    join: &mut Option<oneshot::Sender<Result<(), String>>>,
) {
    match message {
        ServerMessage::JoinSuccess { peer_id, peers } => {
            debug!(target = "call::signal", %peer_id, ?peers, "join accepted");
            if let Some(tx) = join.take() {
                let _ = tx.send(Ok(()));
            }
        }
        ServerMessage::JoinError { reason } => {
            if let Some(tx) = join.take() {
                let _ = tx.send(Err(reason));
            } else {
                warn!(target = "call::signal", %reason, "late join error");
            }
        }
        ServerMessage::Signal { from_peer, signal } => match SignalMessage::from_value(&signal) {
            Ok(message) => {
                let _ = inbound.send(InboundSignal {
                    from: PeerId::from(from_peer),
                    message,
                });
            }
            Err(err) => warn!(
                target = "call::signal",
                from = %from_peer,
                error = %err,
                "ignoring malformed signal"
            ),
        },
        ServerMessage::PeerJoined { peer_id } => {
            debug!(target = "call::signal", %peer_id, "peer joined room")
        }
        ServerMessage::PeerLeft { peer_id } => {
            debug!(target = "call::signal", %peer_id, "peer left room")
        }
        ServerMessage::Pong => trace!(target = "call::signal", "pong"),
        ServerMessage::Error { message } => {
            warn!(target = "call::signal", %message, "signaling server error")
        }
        ServerMessage::Other => trace!(target = "call::signal", "unhandled server message"),
    }
}

#[async_trait]
impl SignalChannel for WebSocketSignalChannel {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    async fn send(&self, to: &PeerId, message: SignalMessage) -> Result<(), SignalError> {
        let signal = message.to_value()?;
        trace!(
            target = "call::signal",
            to = %to,
            kind = message.kind(),
            call_id = %message.call_id(),
            "ws_out"
        );
        self.send_tx
            .send(ClientMessage::Signal {
                to_peer: to.to_string(),
                signal,
            })
            .map_err(|_| SignalError::ChannelClosed)
    }

    async fn recv(&self) -> Option<InboundSignal> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await
    }
}

impl Drop for WebSocketSignalChannel {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Accepts ws/wss urls as-is and maps http/https onto them.
pub fn websocket_url(signaling_url: &str) -> Result<Url, WebRtcError> {
    let invalid = |reason: String| WebRtcError::InvalidUrl {
        url: signaling_url.to_string(),
        reason,
    };
    let mut url = Url::parse(signaling_url).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch to websocket scheme".into()))?;
    url.set_fragment(None);
    Ok(url)
}
