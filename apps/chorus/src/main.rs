mod cli;
mod error;
mod logging;
mod relay;

use std::sync::Arc;

use anyhow::Result;
use chorus_core::rtc::RemoteAudio;
use chorus_core::{MeshCoordinator, MeshEvent, MeshHandle, WebRtcBackend};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::cli::Cli;
use crate::error::CliError;
use crate::relay::WsRelay;

enum Exit {
    /// The user asked to leave (Ctrl-C or end of stdin).
    Requested,
    /// The coordinator stopped on its own, e.g. the relay went away.
    MeshStopped,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).map_err(|err| CliError::Logging(err.to_string()))?;

    let name = cli.display_name()?;
    let settings = cli.ice.to_settings()?;
    let url = relay::derive_websocket_url(&cli.signaling_url).map_err(|err| {
        CliError::InvalidSignalingUrl {
            url: cli.signaling_url.clone(),
            reason: err.to_string(),
        }
    })?;

    let backend = Arc::new(WebRtcBackend::new(settings).map_err(CliError::Media)?);
    let (relay, inbound) = WsRelay::connect(&url).await.map_err(CliError::Relay)?;
    tracing::info!(url = %url, name = %name, "connected to signaling relay");

    let (coordinator, mailbox, mut events) = MeshCoordinator::new(name, backend, relay);
    let handle = coordinator.handle();
    let mut mesh = tokio::spawn(coordinator.run(mailbox, inbound));

    let exit = event_loop(&handle, &mut events, &mut mesh).await?;
    if let Exit::Requested = exit {
        if let Err(err) = handle.shutdown().await {
            tracing::debug!(error = %err, "coordinator already stopped");
        }
        mesh.await?;
    }
    while let Ok(event) = events.try_recv() {
        print_event(event);
    }
    Ok(())
}

async fn event_loop(
    handle: &MeshHandle,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<MeshEvent<RemoteAudio>>,
    mesh: &mut JoinHandle<()>,
) -> Result<Exit> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(event),
            line = stdin.next_line() => match line? {
                Some(line) => {
                    let text = line.trim();
                    if !text.is_empty() {
                        handle.chat(text).map_err(CliError::Mesh)?;
                    }
                }
                None => return Ok(Exit::Requested),
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                return Ok(Exit::Requested);
            }
            joined = &mut *mesh => {
                joined?;
                return Ok(Exit::MeshStopped);
            }
        }
    }
}

fn print_event(event: MeshEvent<RemoteAudio>) {
    match event {
        MeshEvent::Joined(participant) => {
            println!("* joined as {} ({})", participant.display_name, participant.id);
        }
        MeshEvent::PeerConnected(participant) => {
            println!("+ {} connected", participant.display_name);
        }
        MeshEvent::PeerDisconnected(id) => println!("- {id} left"),
        MeshEvent::RemoteTrackReady {
            participant,
            stream,
        } => {
            println!(
                "~ receiving audio from {} ({})",
                participant.display_name,
                stream.codec().capability.mime_type
            );
        }
        MeshEvent::Chat { sender_name, text } => println!("{sender_name}: {text}"),
        MeshEvent::MediaUnavailable(reason) => {
            println!("! microphone unavailable, staying out of the call: {reason}");
        }
        MeshEvent::RelayDisconnected(reason) => {
            println!("! signaling relay disconnected: {reason}");
        }
    }
}
