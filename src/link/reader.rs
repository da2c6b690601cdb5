//! Serial link to the scanner microcontroller.
//!
//! The port is blocking I/O, so it lives on a dedicated thread. Inbound
//! bytes are framed on `\n`, decoded, trimmed, and handed to the session
//! controller over a tokio channel. Outbound operator commands reach the
//! same thread through a queue drained between reads, keeping the port
//! under a single owner.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver as StdReceiver, Sender as StdSender, TryRecvError};
use std::sync::Arc;
use std::thread;

use serialport::SerialPort;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;

/// Events sent from the link thread to the session controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One decoded, trimmed, non-empty line from the scanner.
    Line(String),
    /// The port hit end of stream or a hard I/O error; the reader
    /// thread has stopped.
    Disconnected,
}

/// Errors that can occur on the peripheral link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("link thread is already running")]
    AlreadyRunning,

    #[error("failed to spawn link thread: {0}")]
    ThreadSpawn(String),
}

/// Sending half of the outbound command queue.
///
/// Appends the newline terminator, so the exact wire bytes are already
/// observable at the channel boundary.
#[derive(Clone)]
pub struct CommandSender {
    tx: StdSender<String>,
}

impl CommandSender {
    /// Queue one text command for the scanner.
    pub fn send_line(&self, text: &str) {
        debug!(command = text, "command queued");
        if self.tx.send(format!("{text}\n")).is_err() {
            warn!("link thread gone, command dropped");
        }
    }
}

/// Create the outbound command queue shared between the session
/// controller and the link thread.
pub fn command_channel() -> (CommandSender, StdReceiver<String>) {
    let (tx, rx) = std::sync::mpsc::channel();
    (CommandSender { tx }, rx)
}

/// Owns the serial port and the reader thread servicing it.
pub struct PeripheralLink {
    port: Option<Box<dyn SerialPort>>,
    port_name: String,
    line_tx: mpsc::Sender<LinkEvent>,
    cmd_rx: Option<StdReceiver<String>>,
    running: Arc<AtomicBool>,
}

impl PeripheralLink {
    /// Open the configured serial port. Failure here is fatal for the
    /// daemon: there is nothing to do without the scanner.
    pub fn open(
        config: &Config,
        line_tx: mpsc::Sender<LinkEvent>,
        cmd_rx: StdReceiver<String>,
    ) -> Result<Self, LinkError> {
        let port = serialport::new(&config.port_path, config.baud_rate)
            .timeout(config.poll_interval)
            .open()
            .map_err(|source| LinkError::Open {
                port: config.port_path.clone(),
                source,
            })?;

        info!(
            port = %config.port_path,
            baud = config.baud_rate,
            "serial port opened"
        );

        Ok(Self {
            port: Some(port),
            port_name: config.port_path.clone(),
            line_tx,
            cmd_rx: Some(cmd_rx),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start the reader thread. The thread runs until [`stop`] is
    /// called or the port fails.
    ///
    /// [`stop`]: PeripheralLink::stop
    pub fn start(&mut self) -> Result<(), LinkError> {
        let (port, cmd_rx) = match (self.port.take(), self.cmd_rx.take()) {
            (Some(port), Some(cmd_rx)) => (port, cmd_rx),
            _ => return Err(LinkError::AlreadyRunning),
        };

        self.running.store(true, Ordering::SeqCst);

        let line_tx = self.line_tx.clone();
        let running = Arc::clone(&self.running);
        let port_name = self.port_name.clone();

        thread::Builder::new()
            .name("peripheral-link".to_string())
            .spawn(move || {
                info!(port = %port_name, "link thread started");
                run_link_loop(port, cmd_rx, line_tx, &running);
                running.store(false, Ordering::SeqCst);
                info!("link thread stopped");
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                LinkError::ThreadSpawn(e.to_string())
            })?;

        Ok(())
    }

    /// Stop the reader thread. It exits within one poll interval and
    /// dropping the port handle closes the device.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Service the port: write queued commands, read and frame lines.
fn run_link_loop(
    mut port: Box<dyn SerialPort>,
    cmd_rx: StdReceiver<String>,
    line_tx: mpsc::Sender<LinkEvent>,
    running: &AtomicBool,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];

    while running.load(Ordering::SeqCst) {
        // Queued commands go out first so a write never waits on a
        // quiet line.
        loop {
            match cmd_rx.try_recv() {
                Ok(command) => {
                    let result = port
                        .write_all(command.as_bytes())
                        .and_then(|()| port.flush());
                    match result {
                        Ok(()) => debug!(command = command.trim_end(), "command written"),
                        Err(e) => error!(?e, "write to scanner failed"),
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        match port.read(&mut chunk) {
            Ok(0) => {
                warn!("serial port returned end of stream");
                let _ = line_tx.blocking_send(LinkEvent::Disconnected);
                return;
            }
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                if !drain_lines(&mut pending, &line_tx) {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!(?e, "serial read failed");
                let _ = line_tx.blocking_send(LinkEvent::Disconnected);
                return;
            }
        }
    }
}

/// Longest partial line held while waiting for its `\n`. The firmware's
/// status lines are well under this; anything longer is line noise.
const MAX_PARTIAL_LINE: usize = 4096;

/// Split complete lines out of the byte accumulator and forward them.
///
/// Undecodable and empty lines are dropped; polling continues. Returns
/// false once the controller side of the channel is gone.
fn drain_lines(pending: &mut Vec<u8>, line_tx: &mpsc::Sender<LinkEvent>) -> bool {
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = pending.drain(..=pos).collect();
        match std::str::from_utf8(&raw[..raw.len() - 1]) {
            Ok(text) => {
                let line = text.trim();
                if line.is_empty() {
                    continue;
                }
                debug!(line, "line received");
                if line_tx
                    .blocking_send(LinkEvent::Line(line.to_string()))
                    .is_err()
                {
                    warn!("failed to send line - channel closed?");
                    return false;
                }
            }
            Err(_) => debug!("skipping undecodable line"),
        }
    }
    if pending.len() > MAX_PARTIAL_LINE {
        warn!(len = pending.len(), "discarding oversize partial line");
        pending.clear();
    }
    true
}
