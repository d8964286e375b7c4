//! Main Entrypoint for the Realtime CLI
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and command line.
//! 2. Initializing logging.
//! 3. Opening the realtime session and subscribing to its events.
//! 4. Bridging stdin lines to outbound messages until EOF, Ctrl+C, or a
//!    permanent session failure.

use anyhow::{Context, bail};
use clap::Parser;
use mediagen_cli::{Args, token_source};
use mediagen_realtime::{Config, ConnectionState, EventKind, Session, SessionEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env_with_endpoint(args.endpoint.clone())
        .context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(args.log_level.unwrap_or(config.log_level))
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(
        endpoint = %config.session.endpoint,
        retry_limit = config.session.retry.limit,
        "Configuration loaded. Connecting..."
    );

    // --- 3. Open the Session ---
    let tokens = token_source(&mut config);
    let session = Session::with_websocket(config.session, tokens);
    let mut states = session.state_changes();

    session
        .connect(args.query.as_deref())
        .await
        .context("Failed to open realtime session")?;

    // connect() clears subscribers, so these go in afterwards.
    session.on(EventKind::Data, |event: &SessionEvent| {
        if let SessionEvent::Data(value) = event {
            println!("{}", value);
        }
    });
    session.on(EventKind::Error, |event: &SessionEvent| {
        if let SessionEvent::Error(e) = event {
            warn!(error = %e, "Realtime session error");
        }
    });
    session.on(EventKind::Open, |_: &SessionEvent| {
        info!("Realtime session reconnected");
    });
    info!("Connected. Type messages, one per line.");

    // --- 4. Bridge stdin ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if !line.trim().is_empty() => {
                    if let Err(e) = session.send(line) {
                        warn!(error = %e, "Message not sent");
                    }
                }
                Some(_) => {}
                None => {
                    info!("stdin closed.");
                    break;
                }
            },
            state = states.recv() => {
                if let Ok(ConnectionState::Failed) = state {
                    session.disconnect();
                    bail!("Realtime session failed permanently");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal. Shutting down gracefully...");
                break;
            },
        }
    }

    session.disconnect();
    info!("Realtime session closed.");
    Ok(())
}
