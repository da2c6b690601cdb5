//! Unix domain socket server for IPC
//!
//! Provides request-response communication and push notifications for
//! session events to subscribed clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::SessionEvent;
use crate::session::{CommandOutcome, OperatorAction, OperatorCommand};

use super::protocol::{Notification, Phase, Request, Response, TerminalStatus};

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
    /// Channel for forwarding operator commands to the session controller
    cmd_tx: mpsc::Sender<OperatorCommand>,
    /// Source of session events for subscribed clients
    event_tx: broadcast::Sender<SessionEvent>,
}

/// Shared server state
struct ServerState {
    status: TerminalStatus,
    start_time: std::time::Instant,
}

impl Server {
    /// Create a new IPC server
    pub fn new(
        socket_path: &Path,
        choices: Vec<String>,
        cmd_tx: mpsc::Sender<OperatorCommand>,
        event_tx: broadcast::Sender<SessionEvent>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path)
            .context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        // The daemon only builds the server once the link is open.
        let status = TerminalStatus {
            choices,
            link_connected: true,
            ..TerminalStatus::default()
        };

        let state = Arc::new(RwLock::new(ServerState {
            status,
            start_time: std::time::Instant::now(),
        }));

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            state,
            shutdown_tx,
            cmd_tx,
            event_tx,
        })
    }

    /// Fold a session event into the status snapshot.
    pub async fn apply_event(&self, event: &SessionEvent) {
        self.state.write().await.status.apply(event);
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref()
            .context("server not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let state = Arc::clone(&self.state);
                    let cmd_tx = self.cmd_tx.clone();
                    let events = self.event_tx.subscribe();
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, state, cmd_tx, events) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    async fn handle_client(
        stream: UnixStream,
        state: Arc<RwLock<ServerState>>,
        cmd_tx: mpsc::Sender<OperatorCommand>,
        events: broadcast::Receiver<SessionEvent>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        // All frames leave through a single writer task so responses
        // and pushed notifications never interleave mid-frame.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        let mut forwarder = None;
        let result =
            Self::serve_client(&mut reader, &state, &cmd_tx, &out_tx, events, &mut forwarder)
                .await;

        drop(out_tx);
        if let Some(task) = forwarder {
            task.abort();
            let _ = task.await;
        }
        let _ = writer_task.await;
        result
    }

    /// Request-response loop for one client.
    async fn serve_client(
        reader: &mut OwnedReadHalf,
        state: &Arc<RwLock<ServerState>>,
        cmd_tx: &mpsc::Sender<OperatorCommand>,
        out_tx: &mpsc::Sender<Vec<u8>>,
        events: broadcast::Receiver<SessionEvent>,
        forwarder: &mut Option<JoinHandle<()>>,
    ) -> Result<()> {
        let mut events = Some(events);
        let mut len_buf = [0u8; 4];

        loop {
            // Read message length (4-byte little-endian)
            match reader.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len > 1024 * 1024 {
                warn!(len, "message too large, disconnecting");
                return Ok(());
            }

            // Read message body
            let mut msg_buf = vec![0u8; len];
            reader.read_exact(&mut msg_buf).await?;

            // Parse request
            let request: Request = serde_json::from_slice(&msg_buf)
                .context("failed to parse request")?;

            debug!(?request, "received request");

            // Process request
            let (response, subscribe) = Self::process_request(request, state, cmd_tx).await;
            if subscribe {
                if let Some(events) = events.take() {
                    *forwarder = Some(tokio::spawn(Self::forward_events(events, out_tx.clone())));
                    debug!("client subscribed to notifications");
                }
            }

            // Send response
            if out_tx.send(encode_frame(&response)?).await.is_err() {
                return Ok(());
            }
        }
    }

    /// Push session events to one subscribed client.
    async fn forward_events(
        mut events: broadcast::Receiver<SessionEvent>,
        out: mpsc::Sender<Vec<u8>>,
    ) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let frame = match encode_frame(&Notification { event }) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(?e, "failed to encode notification");
                            continue;
                        }
                    };
                    if out.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "client fell behind, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Process a request and return a response
    /// Returns (Response, should_subscribe)
    async fn process_request(
        request: Request,
        state: &Arc<RwLock<ServerState>>,
        cmd_tx: &mpsc::Sender<OperatorCommand>,
    ) -> (Response, bool) {
        match request {
            Request::Ping => (Response::Pong, false),

            Request::GetStatus => {
                let mut state = state.write().await;
                state.status.uptime_secs = state.start_time.elapsed().as_secs();
                (Response::Status(state.status.clone()), false)
            }

            Request::SubmitName { name } => {
                let response = Self::dispatch(cmd_tx, OperatorAction::SubmitName { name }).await;
                if matches!(response, Response::Ack) {
                    // The controller emits no event for this hop, so
                    // the snapshot keeps up here. The sentinel may land
                    // before this write, so only advance from the open
                    // prompt.
                    let mut state = state.write().await;
                    if state.status.phase == Phase::EnrollmentPrompt {
                        state.status.phase = Phase::EnrollmentPending;
                    }
                }
                (response, false)
            }

            Request::CastVote { choice } => (
                Self::dispatch(cmd_tx, OperatorAction::CastVote { choice }).await,
                false,
            ),

            Request::CancelEnrollment => (
                Self::dispatch(cmd_tx, OperatorAction::CancelEnrollment).await,
                false,
            ),

            Request::Subscribe => (Response::Subscribed, true),
        }
    }

    /// Forward one operator action to the session controller and wait
    /// for its verdict.
    async fn dispatch(cmd_tx: &mpsc::Sender<OperatorCommand>, action: OperatorAction) -> Response {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = OperatorCommand {
            action,
            reply: reply_tx,
        };
        if cmd_tx.send(command).await.is_err() {
            return Response::Error {
                code: "unavailable".to_string(),
                message: "session controller is not running".to_string(),
            };
        }
        match reply_rx.await {
            Ok(CommandOutcome::Accepted) => Response::Ack,
            Ok(CommandOutcome::Rejected { code, message }) => Response::Error {
                code: code.to_string(),
                message,
            },
            Err(_) => Response::Error {
                code: "unavailable".to_string(),
                message: "session controller dropped the command".to_string(),
            },
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

/// Encode a length-prefixed JSON frame.
fn encode_frame<T: serde::Serialize>(msg: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(msg)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}
