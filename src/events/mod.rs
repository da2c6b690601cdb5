//! Events emitted by the session controller.
//!
//! Everything the operator surface needs to render (status text,
//! prompt open/close, match results, vote confirmations) travels as
//! one of these broadcast events. The IPC layer forwards them verbatim
//! to subscribed clients and folds them into its status snapshot.

use serde::{Deserialize, Serialize};

/// Why an open enrollment prompt was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentClose {
    /// The scanner armed for the registration scan; enrollment is
    /// proceeding on the device.
    Registered,
    /// The operator dismissed the prompt.
    Cancelled,
    /// The scanner never armed within the configured bound.
    TimedOut,
    /// A scan outcome took over the session while the prompt was open.
    Superseded,
}

/// Events emitted by the session controller during a voting session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The status display text changed (a raw scanner line, or a
    /// formatted summary such as `Voter Found! ID: 42`).
    StatusChanged { text: String },

    /// An unknown fingerprint was detected; the name prompt opened.
    EnrollmentStarted,

    /// The name prompt closed.
    EnrollmentClosed { reason: EnrollmentClose },

    /// A fingerprint matched; vote controls are revealed.
    VoterMatched { voter_id: String },

    /// The matched voter already has a vote on record.
    AlreadyVoted,

    /// Fingerprint lookup failed; the voter may rescan.
    MatchFailed,

    /// The scanner is armed for the next scan.
    ScannerReady,

    /// A vote was sent to the scanner; controls are hidden. The
    /// confirmation is optimistic, no acknowledgment is awaited.
    VoteCast { choice: String },

    /// The serial link went away; the reader thread has stopped.
    LinkLost,
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::StatusChanged { text } => write!(f, "STATUS_CHANGED ({})", text),
            SessionEvent::EnrollmentStarted => write!(f, "ENROLLMENT_STARTED"),
            SessionEvent::EnrollmentClosed { reason } => {
                write!(f, "ENROLLMENT_CLOSED ({:?})", reason)
            }
            SessionEvent::VoterMatched { voter_id } => {
                write!(f, "VOTER_MATCHED (id {})", voter_id)
            }
            SessionEvent::AlreadyVoted => write!(f, "ALREADY_VOTED"),
            SessionEvent::MatchFailed => write!(f, "MATCH_FAILED"),
            SessionEvent::ScannerReady => write!(f, "SCANNER_READY"),
            SessionEvent::VoteCast { choice } => write!(f, "VOTE_CAST ({})", choice),
            SessionEvent::LinkLost => write!(f, "LINK_LOST"),
        }
    }
}
