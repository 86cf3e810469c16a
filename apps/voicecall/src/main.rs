mod cli;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use call_negotiation::{CallController, CallDriver, CallEvent, PeerId, SignalChannel};
use call_webrtc::{WebRtcLocalMedia, WebRtcMediaEngine, WebSocketSignalChannel};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.log_config()).context("failed to initialise logging")?;

    let call_config = cli.call_config()?;
    let webrtc_config = cli.webrtc_config();

    let channel = WebSocketSignalChannel::connect(
        &cli.signaling_url,
        PeerId::new(cli.peer_id.clone()),
        webrtc_config.join_timeout,
    )
    .await
    .with_context(|| format!("failed to join signaling relay at {}", cli.signaling_url))?;
    let signal: Arc<dyn SignalChannel> = Arc::new(channel);

    let engine = WebRtcMediaEngine::new(webrtc_config)?;
    let controller = CallController::new(
        call_config,
        Arc::new(engine),
        Arc::new(WebRtcLocalMedia::default()),
        signal,
    );
    let (handle, mut driver) = CallDriver::spawn(controller)?;
    let mut events = handle.subscribe();
    info!(target = "voicecall", peer = %handle.local_peer(), "ready");

    if let Some(remote) = cli.call.as_deref() {
        let call_id = handle.start_call(remote).await?;
        info!(target = "voicecall", %call_id, %remote, "calling");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(target = "voicecall", "interrupted, hanging up");
                if let Err(err) = handle.end_call().await {
                    warn!(target = "voicecall", error = %err, "hangup failed");
                }
                break;
            }
            result = &mut driver => {
                if let Err(err) = result {
                    warn!(target = "voicecall", error = %err, "call driver panicked");
                }
                info!(target = "voicecall", "signaling closed");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    report(&event);
                    if terminal && cli.call.is_some() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target = "voicecall", skipped, "call events lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown();
    let _ = driver.await;
    Ok(())
}

fn report(event: &CallEvent) {
    match event {
        CallEvent::StateChanged { call_id, state } => {
            info!(target = "voicecall", %call_id, %state, "call state");
        }
        CallEvent::RoleDecided { call_id, role } => {
            info!(target = "voicecall", %call_id, role = role.as_str(), "role decided");
        }
        CallEvent::RemoteTrack { call_id, kind } => {
            info!(target = "voicecall", %call_id, ?kind, "remote media arrived");
        }
        CallEvent::Connectivity { call_id, state } => {
            info!(target = "voicecall", %call_id, ?state, "connectivity");
        }
        CallEvent::Failed { call_id, error } => {
            warn!(target = "voicecall", %call_id, %error, "call failed");
        }
        CallEvent::Closed { call_id } => {
            info!(target = "voicecall", %call_id, "call closed");
        }
    }
}
