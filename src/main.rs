//! voteterm-daemon: Host-side daemon for a fingerprint voting terminal
//!
//! The daemon owns the serial link to the scanner firmware and provides:
//! - Line classification for scanner status reports
//! - Explicit state machine for the voting session
//! - IPC server for operator frontend communication
//!
//! Scope:
//! - Serial polling, enrollment hand-off, and vote casting
//! - Status snapshots and pushed session events over IPC
//! - NO vote tallying, voter persistence, or scanner-side logic

mod config;
mod events;
mod ipc;
mod lifecycle;
mod link;
mod session;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::events::SessionEvent;
use crate::ipc::Server;
use crate::link::{command_channel, PeripheralLink};
use crate::session::SessionMachine;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "voteterm-daemon starting"
    );

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(port = %config.port_path, ?config.socket_path, "configuration loaded");

    // Create channels for inter-component communication
    // Link thread -> session controller
    let (line_tx, line_rx) = mpsc::channel(32);
    // IPC server -> session controller
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    // Session controller -> IPC server and subscribed clients
    let (event_tx, _event_rx) = broadcast::channel::<SessionEvent>(64);
    // Outbound write queue, drained by the link thread
    let (outbound, outbound_rx) = command_channel();

    // Create the session controller
    let mut machine = SessionMachine::new(
        event_tx.clone(),
        outbound,
        config.choices.clone(),
        config.enroll_timeout,
    );

    // Open the scanner link (reads on a dedicated thread)
    let mut link = PeripheralLink::open(&config, line_tx, outbound_rx)
        .context("is the scanner plugged in?")?;
    link.start()?;

    // Create IPC server
    let server = Server::new(
        &config.socket_path,
        config.choices.clone(),
        cmd_tx,
        event_tx.clone(),
    )?;

    // Mirror session events into the status snapshot
    let mut status_event_rx = event_tx.subscribe();
    let server_for_events = &server;

    info!("daemon initialized, entering main loop");

    // Main event loop
    tokio::select! {
        // Run the session controller (processes scanner lines and operator commands)
        _ = machine.run(line_rx, cmd_rx) => {
            info!("session controller exited");
        }

        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        // Fold session events into the IPC status snapshot
        _ = async {
            loop {
                match status_event_rx.recv().await {
                    Ok(event) => server_for_events.apply_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "status event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        } => {
            info!("status event handler exited");
        }

        // Wait for shutdown signal
        result = lifecycle::wait_for_shutdown() => {
            match result {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => error!(?e, "signal handler error"),
            }
        }
    }

    // Cleanup
    info!("shutting down...");

    link.stop();
    server.shutdown().await;

    info!("voteterm-daemon stopped");

    Ok(())
}
