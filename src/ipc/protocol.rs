//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use serde::{Deserialize, Serialize};

use crate::events::{EnrollmentClose, SessionEvent};

/// Operator-visible phase of the voting session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Waiting for the next scan outcome
    Idle,
    /// The enrollment name prompt is open
    EnrollmentPrompt,
    /// A name was submitted, the scanner has yet to arm
    EnrollmentPending,
    /// A voter matched, vote controls are revealed
    MatchFound,
    /// A scan outcome was consumed, waiting for the scanner to re-arm
    AwaitingScan,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Idle
    }
}

impl Phase {
    fn is_waiting(&self) -> bool {
        matches!(self, Phase::MatchFound | Phase::AwaitingScan)
    }
}

/// Requests from an operator frontend to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Request the current terminal status
    GetStatus,

    /// Submit the enrollee's name from the open prompt
    SubmitName { name: String },

    /// Cast a vote for one of the configured choices
    CastVote { choice: String },

    /// Dismiss the enrollment flow
    CancelEnrollment,

    /// Ping to check connectivity
    Ping,

    /// Subscribe to session event notifications
    Subscribe,
}

/// Responses from the daemon to an operator frontend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current terminal status
    Status(TerminalStatus),

    /// The command was applied
    Ack,

    /// Pong response to ping
    Pong,

    /// Subscription confirmed
    Subscribed,

    /// Error response
    Error { code: String, message: String },
}

/// Push frame sent to subscribed clients. The event sits under its own
/// key so a frame can never be mistaken for a tagged response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub event: SessionEvent,
}

/// Full terminal status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalStatus {
    /// Daemon version
    pub version: String,

    /// Current session phase
    pub phase: Phase,

    /// Latest status line, exactly as a frontend should display it
    pub status_line: String,

    /// Id of the most recently matched voter
    pub voter_id: Option<String>,

    /// Whether vote controls should be shown
    pub vote_controls: bool,

    /// The configured ballot
    pub choices: Vec<String>,

    /// Whether the peripheral link is up
    pub link_connected: bool,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl Default for TerminalStatus {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            phase: Phase::default(),
            status_line: "Welcome to Voting".to_string(),
            voter_id: None,
            vote_controls: false,
            choices: Vec::new(),
            link_connected: false,
            uptime_secs: 0,
        }
    }
}

impl TerminalStatus {
    /// Fold one session event into the snapshot.
    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::StatusChanged { text } => self.status_line = text.clone(),
            SessionEvent::EnrollmentStarted => self.phase = Phase::EnrollmentPrompt,
            SessionEvent::EnrollmentClosed { reason } => match reason {
                EnrollmentClose::Registered => self.phase = Phase::AwaitingScan,
                EnrollmentClose::Cancelled | EnrollmentClose::TimedOut => self.phase = Phase::Idle,
                // A match lands right after and sets the phase itself.
                EnrollmentClose::Superseded => {}
            },
            SessionEvent::VoterMatched { voter_id } => {
                self.voter_id = Some(voter_id.clone());
                self.vote_controls = true;
                self.phase = Phase::MatchFound;
            }
            SessionEvent::AlreadyVoted => self.phase = Phase::AwaitingScan,
            SessionEvent::MatchFailed | SessionEvent::ScannerReady => {
                // An open enrollment prompt is not disturbed.
                if self.phase.is_waiting() {
                    self.phase = Phase::Idle;
                }
            }
            SessionEvent::VoteCast { .. } => {
                self.vote_controls = false;
                self.phase = Phase::AwaitingScan;
            }
            SessionEvent::LinkLost => self.link_connected = false,
        }
    }
}
