//! Inbound line vocabulary of the scanner firmware.
//!
//! The scanner reports everything as free-text status lines. The host
//! recognizes a small fixed set of phrases by substring containment:
//! a line matches if it contains the phrase anywhere, even inside a
//! longer message. This looseness is part of the wire contract and must
//! not be tightened: the firmware emits no delimiters or tags.
//!
//! Matching is order-sensitive and first match wins, in the order the
//! rows appear in [`classify`].

/// Status phrases emitted by the scanner firmware.
pub mod phrase {
    /// An unknown fingerprint was scanned and the firmware entered
    /// enrollment mode; the host must supply a name.
    pub const NEW_VOTER: &str = "New Voter Detected";
    /// A fingerprint matched; the line's last token is the voter id.
    pub const VOTER_FOUND: &str = "Voter Found: ID";
    /// The matched voter has a vote on record already.
    pub const ALREADY_VOTED: &str = "You have already voted!";
    /// Lookup failed; the voter may retry.
    pub const NOT_FOUND: &str = "Fingerprint not found in database.";
    /// The firmware is idle and armed for the next scan.
    pub const SCANNER_IDLE: &str = "Place your finger on the scanner...";
    /// Common prefix of both ready prompts the firmware uses
    /// (`Place your finger...` during enrollment, the full
    /// [`SCANNER_IDLE`] line otherwise). The enrollment wait accepts
    /// either form.
    pub const ENROLL_READY: &str = "Place your finger";
}

/// What a single inbound line means to the session controller.
///
/// `Unrecognized` is not an error: such lines are informational and are
/// displayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// [`phrase::NEW_VOTER`]: begin the enrollment flow.
    NewVoter,
    /// [`phrase::VOTER_FOUND`] with the extracted trailing id token.
    VoterFound { voter_id: String },
    /// [`phrase::ALREADY_VOTED`].
    AlreadyVoted,
    /// [`phrase::NOT_FOUND`]: clears the wait for a fresh scan.
    NotFound,
    /// [`phrase::SCANNER_IDLE`]: clears the wait for a fresh scan.
    ScannerIdle,
    /// None of the above.
    Unrecognized,
}

/// Classify one decoded, whitespace-trimmed line.
pub fn classify(line: &str) -> Classification {
    if line.contains(phrase::NEW_VOTER) {
        Classification::NewVoter
    } else if line.contains(phrase::VOTER_FOUND) {
        Classification::VoterFound {
            voter_id: trailing_token(line).to_string(),
        }
    } else if line.contains(phrase::ALREADY_VOTED) {
        Classification::AlreadyVoted
    } else if line.contains(phrase::NOT_FOUND) {
        Classification::NotFound
    } else if line.contains(phrase::SCANNER_IDLE) {
        Classification::ScannerIdle
    } else {
        Classification::Unrecognized
    }
}

/// Whether a line completes the enrollment wait.
///
/// Checked instead of [`classify`] while the controller is waiting for
/// the scanner to arm after a name was sent.
pub fn is_enroll_ready(line: &str) -> bool {
    line.contains(phrase::ENROLL_READY)
}

/// The voter id is the last whitespace-delimited token of the whole
/// line. A line with no token beyond the phrase yields the literal
/// `ID`; the firmware always appends the numeric id in practice.
fn trailing_token(line: &str) -> &str {
    line.split_whitespace().last().unwrap_or_default()
}
