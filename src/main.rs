use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use url::Url;

use roomcall::config::Config;
use roomcall::media::mock::MockMediaEngine;
use roomcall::{CallClient, CallEvent, CallState};

/// Signaling smoke client: joins a room, negotiates with whoever else is
/// there and prints call events until the call ends or Ctrl-C.
#[derive(Debug, Parser)]
#[command(name = "roomcall", version)]
struct Args {
    /// Room to join.
    room: String,

    /// Room server base URL (overrides ROOMCALL_ROOM_SERVER).
    #[arg(long)]
    room_server: Option<Url>,

    /// TURN credential endpoint (overrides ROOMCALL_TURN_URL).
    #[arg(long)]
    turn_url: Option<Url>,

    /// Skip relay discovery entirely.
    #[arg(long)]
    no_turn: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(room_server) = args.room_server {
        config.room_server_url = room_server;
    }
    if args.no_turn {
        config.turn_url = None;
    } else if let Some(turn_url) = args.turn_url {
        config.turn_url = Some(turn_url);
    }

    let media = Arc::new(MockMediaEngine::new());
    let (client, mut events) = CallClient::new(&config, media)?;
    client.connect(&args.room)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                client.disconnect();
            }
            event = events.recv() => match event {
                Some(CallEvent::StateChanged(state)) => {
                    println!("state: {state:?}");
                    if state == CallState::Disconnected {
                        break;
                    }
                }
                Some(CallEvent::Error(err)) => {
                    eprintln!("error: {err}");
                }
                None => break,
            },
        }
    }
    Ok(())
}
