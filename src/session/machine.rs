//! Core session controller implementation.
//!
//! Handles transitions between Idle, EnrollmentPrompt,
//! EnrollmentPending, MatchFound, and AwaitingScan based on classified
//! scanner lines and operator commands.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{EnrollmentClose, SessionEvent};
use crate::link::{classify, is_enroll_ready, Classification, CommandSender, LinkEvent};

/// The five possible states of a voting session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Armed: the next scan outcome is acted upon
    Idle,
    /// Name prompt open, nothing submitted yet
    EnrollmentPrompt,
    /// Name sent; waiting for the scanner to arm the registration scan
    EnrollmentPending,
    /// Voter matched, vote controls revealed
    MatchFound,
    /// A terminal outcome was consumed; repeated status lines are
    /// ignored until the scanner re-arms
    AwaitingScan,
}

impl SessionState {
    /// True while a terminal scan outcome is held. Further lines
    /// reporting the same event must not re-trigger actions until the
    /// scanner re-arms or the lookup explicitly fails.
    pub fn is_waiting(&self) -> bool {
        matches!(self, SessionState::MatchFound | SessionState::AwaitingScan)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::EnrollmentPrompt => write!(f, "EnrollmentPrompt"),
            SessionState::EnrollmentPending => write!(f, "EnrollmentPending"),
            SessionState::MatchFound => write!(f, "MatchFound"),
            SessionState::AwaitingScan => write!(f, "AwaitingScan"),
        }
    }
}

/// Operator actions forwarded from the IPC surface.
#[derive(Debug, Clone)]
pub enum OperatorAction {
    /// Submit the enrollee's name from the open prompt.
    SubmitName { name: String },
    /// Cast a vote for one of the configured choices.
    CastVote { choice: String },
    /// Dismiss the enrollment flow.
    CancelEnrollment,
}

/// One operator action together with its reply slot.
#[derive(Debug)]
pub struct OperatorCommand {
    pub action: OperatorAction,
    pub reply: oneshot::Sender<CommandOutcome>,
}

/// How the controller disposed of an operator action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The action was applied; any peripheral write already happened.
    Accepted,
    /// The action was refused; nothing was written. The message is
    /// suitable for showing to the operator.
    Rejected {
        code: &'static str,
        message: String,
    },
}

impl CommandOutcome {
    fn rejected(code: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }
}

/// The session controller that manages the voting flow.
pub struct SessionMachine {
    /// Current state
    state: SessionState,
    /// Vote controls stay revealed from a match until a vote is cast,
    /// even across flag resets
    controls_visible: bool,
    /// Deadline of the enrollment wait, while EnrollmentPending
    sentinel_deadline: Option<Instant>,
    /// Bound on the enrollment wait
    enroll_timeout: Duration,
    /// The configured ballot
    choices: Vec<String>,
    /// Outbound command queue to the scanner
    outbound: CommandSender,
    /// Channel for emitting session events
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionMachine {
    /// Create a new session controller.
    pub fn new(
        event_tx: broadcast::Sender<SessionEvent>,
        outbound: CommandSender,
        choices: Vec<String>,
        enroll_timeout: Duration,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            controls_visible: false,
            sentinel_deadline: None,
            enroll_timeout,
            choices,
            outbound,
            event_tx,
        }
    }

    /// Get the current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the vote controls are currently revealed
    pub fn vote_controls_visible(&self) -> bool {
        self.controls_visible
    }

    /// Run the controller, processing link events and operator
    /// commands until both channels close.
    pub async fn run(
        &mut self,
        mut link_rx: mpsc::Receiver<LinkEvent>,
        mut cmd_rx: mpsc::Receiver<OperatorCommand>,
    ) {
        info!(state = %self.state, "session controller started");

        loop {
            tokio::select! {
                event = link_rx.recv() => match event {
                    Some(event) => self.handle_link_event(event),
                    None => break,
                },
                command = cmd_rx.recv() => match command {
                    Some(command) => {
                        let outcome = self.handle_action(&command.action);
                        let _ = command.reply.send(outcome);
                    }
                    None => break,
                },
                () = wait_deadline(self.sentinel_deadline) => {
                    self.handle_enrollment_timeout();
                }
            }
        }

        info!("session controller stopped");
    }

    /// Handle one event from the link thread.
    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Line(line) => self.handle_line(&line),
            LinkEvent::Disconnected => {
                warn!("peripheral link lost");
                self.emit(SessionEvent::LinkLost);
            }
        }
    }

    /// Classify one decoded scanner line and apply its action.
    fn handle_line(&mut self, line: &str) {
        // The enrollment wait inspects lines only for the ready
        // sentinel; nothing else is classified until it resolves.
        if self.state == SessionState::EnrollmentPending {
            if is_enroll_ready(line) {
                self.finish_enrollment();
            } else {
                debug!(line, "ignored while waiting for scanner");
            }
            return;
        }

        // The status display always shows the latest line before any
        // classification; formatted texts overwrite it below.
        self.emit(SessionEvent::StatusChanged {
            text: line.to_string(),
        });

        match classify(line) {
            Classification::NewVoter => self.handle_new_voter(),
            Classification::VoterFound { voter_id } => self.handle_voter_found(voter_id),
            Classification::AlreadyVoted => self.handle_already_voted(),
            Classification::NotFound => {
                self.emit(SessionEvent::MatchFailed);
                self.clear_waiting();
            }
            Classification::ScannerIdle => {
                self.emit(SessionEvent::ScannerReady);
                self.clear_waiting();
            }
            Classification::Unrecognized => {}
        }
    }

    /// Begin the enrollment flow, unless a scan outcome is already
    /// being held or a prompt is open.
    fn handle_new_voter(&mut self) {
        if self.state != SessionState::Idle {
            debug!(state = %self.state, "enrollment suppressed, session busy");
            return;
        }
        self.emit(SessionEvent::EnrollmentStarted);
        self.set_state(SessionState::EnrollmentPrompt);
    }

    /// A match fires unconditionally, even while one is already held;
    /// the id and the controls are simply refreshed.
    fn handle_voter_found(&mut self, voter_id: String) {
        self.close_prompt_if_open(EnrollmentClose::Superseded);
        self.emit(SessionEvent::StatusChanged {
            text: format!("Voter Found! ID: {voter_id}"),
        });
        self.controls_visible = true;
        self.emit(SessionEvent::VoterMatched { voter_id });
        self.set_state(SessionState::MatchFound);
    }

    fn handle_already_voted(&mut self) {
        self.close_prompt_if_open(EnrollmentClose::Superseded);
        self.emit(SessionEvent::AlreadyVoted);
        self.set_state(SessionState::AwaitingScan);
    }

    /// Rows that re-arm the flow return any waiting state to Idle. An
    /// open name prompt stays open; the poll keeps running under it.
    fn clear_waiting(&mut self) {
        if self.state.is_waiting() {
            self.set_state(SessionState::Idle);
        }
    }

    fn close_prompt_if_open(&mut self, reason: EnrollmentClose) {
        if self.state == SessionState::EnrollmentPrompt {
            self.emit(SessionEvent::EnrollmentClosed { reason });
        }
    }

    /// The scanner armed for the registration scan: tell the operator,
    /// close the prompt, and hold until the next scan cycle.
    fn finish_enrollment(&mut self) {
        self.sentinel_deadline = None;
        self.emit(SessionEvent::EnrollmentClosed {
            reason: EnrollmentClose::Registered,
        });
        self.set_state(SessionState::AwaitingScan);
    }

    /// The scanner never armed within the bound: give the floor back
    /// to the operator instead of hanging.
    fn handle_enrollment_timeout(&mut self) {
        warn!(timeout = ?self.enroll_timeout, "scanner never armed for enrollment");
        self.sentinel_deadline = None;
        self.emit(SessionEvent::EnrollmentClosed {
            reason: EnrollmentClose::TimedOut,
        });
        self.set_state(SessionState::Idle);
    }

    /// Validate and apply one operator action.
    fn handle_action(&mut self, action: &OperatorAction) -> CommandOutcome {
        match action {
            OperatorAction::SubmitName { name } => self.submit_name(name),
            OperatorAction::CastVote { choice } => self.cast_vote(choice),
            OperatorAction::CancelEnrollment => self.cancel_enrollment(),
        }
    }

    fn submit_name(&mut self, name: &str) -> CommandOutcome {
        if self.state != SessionState::EnrollmentPrompt {
            return CommandOutcome::rejected("no_enrollment", "No enrollment is in progress.");
        }
        // Only the exactly-empty name is refused; whitespace-only
        // names go to the scanner unchanged.
        if name.is_empty() {
            return CommandOutcome::rejected("empty_name", "Please enter a name.");
        }
        // A control character would split the name into multiple wire
        // frames; the scanner reads one command per line.
        if name.chars().any(char::is_control) {
            return CommandOutcome::rejected(
                "invalid_name",
                "Names cannot contain control characters.",
            );
        }

        self.outbound.send_line(name);
        self.emit(SessionEvent::StatusChanged {
            text: format!("Registered as: {name}"),
        });
        self.sentinel_deadline = Some(Instant::now() + self.enroll_timeout);
        self.set_state(SessionState::EnrollmentPending);
        CommandOutcome::Accepted
    }

    fn cast_vote(&mut self, choice: &str) -> CommandOutcome {
        if matches!(
            self.state,
            SessionState::EnrollmentPrompt | SessionState::EnrollmentPending
        ) {
            // A choice token written now would reach the scanner as
            // the enrollee's name.
            return CommandOutcome::rejected(
                "enrollment_active",
                "Finish or cancel enrollment before voting.",
            );
        }
        if !self.controls_visible {
            return CommandOutcome::rejected("no_match", "No matched voter is active.");
        }
        if !self.choices.iter().any(|c| c == choice) {
            return CommandOutcome::rejected(
                "unknown_choice",
                format!("\"{choice}\" is not on the ballot."),
            );
        }

        self.outbound.send_line(choice);
        self.controls_visible = false;
        self.emit(SessionEvent::VoteCast {
            choice: choice.to_string(),
        });
        self.set_state(SessionState::AwaitingScan);
        CommandOutcome::Accepted
    }

    fn cancel_enrollment(&mut self) -> CommandOutcome {
        match self.state {
            SessionState::EnrollmentPrompt | SessionState::EnrollmentPending => {
                self.sentinel_deadline = None;
                self.emit(SessionEvent::EnrollmentClosed {
                    reason: EnrollmentClose::Cancelled,
                });
                self.set_state(SessionState::Idle);
                CommandOutcome::Accepted
            }
            _ => CommandOutcome::rejected("no_enrollment", "No enrollment is in progress."),
        }
    }

    /// Perform a state transition
    fn set_state(&mut self, new_state: SessionState) {
        if new_state == self.state {
            return;
        }
        info!(from = %self.state, to = %new_state, "session state transition");
        self.state = new_state;
    }

    /// Emit a session event to whoever is listening
    fn emit(&self, event: SessionEvent) {
        debug!(?event, "emitting session event");
        let _ = self.event_tx.send(event);
    }
}

/// Resolves at the enrollment deadline; pends forever without one.
async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::command_channel;
    use std::sync::mpsc::Receiver as StdReceiver;

    const IDLE_PROMPT: &str = "Place your finger on the scanner...";

    fn create_machine() -> (
        SessionMachine,
        broadcast::Receiver<SessionEvent>,
        StdReceiver<String>,
    ) {
        let (tx, rx) = broadcast::channel(32);
        let (commands, cmd_rx) = command_channel();
        let machine = SessionMachine::new(
            tx,
            commands,
            vec!["A".to_string(), "B".to_string()],
            Duration::from_secs(30),
        );
        (machine, rx, cmd_rx)
    }

    fn drain_events(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn submit_name(machine: &mut SessionMachine, name: &str) -> CommandOutcome {
        machine.handle_action(&OperatorAction::SubmitName {
            name: name.to_string(),
        })
    }

    fn cast_vote(machine: &mut SessionMachine, choice: &str) -> CommandOutcome {
        machine.handle_action(&OperatorAction::CastVote {
            choice: choice.to_string(),
        })
    }

    #[test]
    fn test_initial_state() {
        let (machine, _, _) = create_machine();
        assert_eq!(machine.state(), SessionState::Idle);
        assert!(!machine.state().is_waiting());
        assert!(!machine.vote_controls_visible());
    }

    #[test]
    fn test_voter_found_extracts_id_and_sets_waiting() {
        let (mut machine, mut rx, _) = create_machine();

        machine.handle_line("Voter Found: ID 42");

        assert_eq!(machine.state(), SessionState::MatchFound);
        assert!(machine.state().is_waiting());
        assert!(machine.vote_controls_visible());

        let events = drain_events(&mut rx);
        assert!(events.contains(&SessionEvent::VoterMatched {
            voter_id: "42".to_string()
        }));
        assert!(events.contains(&SessionEvent::StatusChanged {
            text: "Voter Found! ID: 42".to_string()
        }));
    }

    #[test]
    fn test_voter_found_with_leading_text() {
        let (mut machine, mut rx, _) = create_machine();

        machine.handle_line("scan ok Voter Found: ID 7");

        let events = drain_events(&mut rx);
        assert!(events.contains(&SessionEvent::VoterMatched {
            voter_id: "7".to_string()
        }));
    }

    #[test]
    fn test_already_voted_warns_without_revealing_controls() {
        let (mut machine, mut rx, _) = create_machine();

        machine.handle_line("You have already voted!");

        assert_eq!(machine.state(), SessionState::AwaitingScan);
        assert!(machine.state().is_waiting());
        assert!(!machine.vote_controls_visible());

        let events = drain_events(&mut rx);
        assert!(events.contains(&SessionEvent::AlreadyVoted));
        assert!(!events
            .iter()
            .any(|e| matches!(e, SessionEvent::VoterMatched { .. })));
    }

    #[test]
    fn test_not_found_clears_waiting() {
        let (mut machine, _, _) = create_machine();

        machine.handle_line("You have already voted!");
        assert!(machine.state().is_waiting());

        machine.handle_line("Fingerprint not found in database.");
        assert_eq!(machine.state(), SessionState::Idle);
    }

    #[test]
    fn test_idle_prompt_clears_waiting_from_match() {
        let (mut machine, _, _) = create_machine();

        machine.handle_line("Voter Found: ID 3");
        assert!(machine.state().is_waiting());

        machine.handle_line(IDLE_PROMPT);
        assert_eq!(machine.state(), SessionState::Idle);
        // The controls stay revealed until a vote is cast.
        assert!(machine.vote_controls_visible());
    }

    #[test]
    fn test_new_voter_only_fires_when_idle() {
        let (mut machine, mut rx, _) = create_machine();

        machine.handle_line("You have already voted!");
        drain_events(&mut rx);

        machine.handle_line("New Voter Detected");
        assert_eq!(machine.state(), SessionState::AwaitingScan);

        let events = drain_events(&mut rx);
        assert!(!events.contains(&SessionEvent::EnrollmentStarted));
        // The line itself is still displayed.
        assert!(events.contains(&SessionEvent::StatusChanged {
            text: "New Voter Detected".to_string()
        }));
    }

    #[test]
    fn test_repeated_new_voter_opens_one_prompt() {
        let (mut machine, mut rx, _) = create_machine();

        machine.handle_line("New Voter Detected");
        machine.handle_line("New Voter Detected");

        assert_eq!(machine.state(), SessionState::EnrollmentPrompt);
        let started = drain_events(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::EnrollmentStarted))
            .count();
        assert_eq!(started, 1);
    }

    #[test]
    fn test_scenario_idle_prompt_then_new_voter() {
        let (mut machine, mut rx, _) = create_machine();

        machine.handle_line(IDLE_PROMPT);
        machine.handle_line("New Voter Detected");

        assert_eq!(machine.state(), SessionState::EnrollmentPrompt);
        assert!(drain_events(&mut rx).contains(&SessionEvent::EnrollmentStarted));
    }

    #[test]
    fn test_scenario_enrollment_roundtrip() {
        let (mut machine, mut rx, outbound) = create_machine();

        machine.handle_line("New Voter Detected");
        assert_eq!(submit_name(&mut machine, "Alice"), CommandOutcome::Accepted);

        assert_eq!(outbound.try_recv().unwrap(), "Alice\n");
        assert_eq!(machine.state(), SessionState::EnrollmentPending);
        assert!(drain_events(&mut rx).contains(&SessionEvent::StatusChanged {
            text: "Registered as: Alice".to_string()
        }));

        machine.handle_line(IDLE_PROMPT);

        assert_eq!(machine.state(), SessionState::AwaitingScan);
        assert!(machine.state().is_waiting());
        assert!(drain_events(&mut rx).contains(&SessionEvent::EnrollmentClosed {
            reason: EnrollmentClose::Registered
        }));
    }

    #[test]
    fn test_enrollment_accepts_short_ready_prompt() {
        let (mut machine, mut rx, _) = create_machine();

        machine.handle_line("New Voter Detected");
        submit_name(&mut machine, "Bob");
        machine.handle_line("Place your finger...");

        assert_eq!(machine.state(), SessionState::AwaitingScan);
        assert!(drain_events(&mut rx).contains(&SessionEvent::EnrollmentClosed {
            reason: EnrollmentClose::Registered
        }));
    }

    #[test]
    fn test_scenario_cast_vote() {
        let (mut machine, mut rx, outbound) = create_machine();

        machine.handle_line("Voter Found: ID 42");
        assert_eq!(cast_vote(&mut machine, "B"), CommandOutcome::Accepted);

        assert_eq!(outbound.try_recv().unwrap(), "B\n");
        assert!(!machine.vote_controls_visible());
        assert_eq!(machine.state(), SessionState::AwaitingScan);
        assert!(drain_events(&mut rx).contains(&SessionEvent::VoteCast {
            choice: "B".to_string()
        }));
    }

    #[test]
    fn test_unmatched_lines_only_update_status() {
        let (mut machine, mut rx, _) = create_machine();

        machine.handle_line("Booting sensor v2.1");
        machine.handle_line("Contrast ok");

        assert_eq!(machine.state(), SessionState::Idle);
        assert_eq!(
            drain_events(&mut rx),
            vec![
                SessionEvent::StatusChanged {
                    text: "Booting sensor v2.1".to_string()
                },
                SessionEvent::StatusChanged {
                    text: "Contrast ok".to_string()
                },
            ]
        );

        // Waiting state is just as inert for unknown lines.
        machine.handle_line("You have already voted!");
        drain_events(&mut rx);
        machine.handle_line("Sensor idle");
        assert_eq!(machine.state(), SessionState::AwaitingScan);
    }

    #[test]
    fn test_empty_name_rejected_without_write() {
        let (mut machine, _, outbound) = create_machine();

        machine.handle_line("New Voter Detected");
        let outcome = submit_name(&mut machine, "");

        assert!(matches!(
            outcome,
            CommandOutcome::Rejected {
                code: "empty_name",
                ..
            }
        ));
        assert!(outbound.try_recv().is_err());
        assert_eq!(machine.state(), SessionState::EnrollmentPrompt);
    }

    #[test]
    fn test_name_with_newline_rejected_without_write() {
        let (mut machine, _, outbound) = create_machine();

        machine.handle_line("New Voter Detected");
        let outcome = submit_name(&mut machine, "Al\nB");

        assert!(matches!(
            outcome,
            CommandOutcome::Rejected {
                code: "invalid_name",
                ..
            }
        ));
        assert!(outbound.try_recv().is_err());
        assert_eq!(machine.state(), SessionState::EnrollmentPrompt);
    }

    #[test]
    fn test_whitespace_name_goes_through_unchanged() {
        let (mut machine, _, outbound) = create_machine();

        machine.handle_line("New Voter Detected");
        assert_eq!(submit_name(&mut machine, "  "), CommandOutcome::Accepted);
        assert_eq!(outbound.try_recv().unwrap(), "  \n");
    }

    #[test]
    fn test_name_rejected_outside_enrollment() {
        let (mut machine, _, outbound) = create_machine();

        let outcome = submit_name(&mut machine, "Alice");

        assert!(matches!(
            outcome,
            CommandOutcome::Rejected {
                code: "no_enrollment",
                ..
            }
        ));
        assert!(outbound.try_recv().is_err());
    }

    #[test]
    fn test_lines_bypass_classifier_during_sentinel_wait() {
        let (mut machine, mut rx, _) = create_machine();

        machine.handle_line("New Voter Detected");
        submit_name(&mut machine, "Alice");
        drain_events(&mut rx);

        machine.handle_line("Voter Found: ID 9");

        assert_eq!(machine.state(), SessionState::EnrollmentPending);
        assert!(!machine.vote_controls_visible());
        assert!(drain_events(&mut rx).is_empty());
    }

    #[test]
    fn test_enrollment_timeout_returns_to_idle() {
        let (mut machine, mut rx, _) = create_machine();

        machine.handle_line("New Voter Detected");
        submit_name(&mut machine, "Alice");
        drain_events(&mut rx);

        machine.handle_enrollment_timeout();

        assert_eq!(machine.state(), SessionState::Idle);
        assert!(drain_events(&mut rx).contains(&SessionEvent::EnrollmentClosed {
            reason: EnrollmentClose::TimedOut
        }));
    }

    #[test]
    fn test_cancel_closes_prompt_and_wait() {
        let (mut machine, mut rx, outbound) = create_machine();

        machine.handle_line("New Voter Detected");
        assert_eq!(
            machine.handle_action(&OperatorAction::CancelEnrollment),
            CommandOutcome::Accepted
        );
        assert_eq!(machine.state(), SessionState::Idle);
        assert!(drain_events(&mut rx).contains(&SessionEvent::EnrollmentClosed {
            reason: EnrollmentClose::Cancelled
        }));

        // Cancelling is also valid after the name went out.
        machine.handle_line("New Voter Detected");
        submit_name(&mut machine, "Alice");
        assert_eq!(outbound.try_recv().unwrap(), "Alice\n");
        assert_eq!(
            machine.handle_action(&OperatorAction::CancelEnrollment),
            CommandOutcome::Accepted
        );
        assert_eq!(machine.state(), SessionState::Idle);
        assert!(outbound.try_recv().is_err());

        // Nothing left to cancel.
        assert!(matches!(
            machine.handle_action(&OperatorAction::CancelEnrollment),
            CommandOutcome::Rejected {
                code: "no_enrollment",
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_choice_rejected() {
        let (mut machine, _, outbound) = create_machine();

        machine.handle_line("Voter Found: ID 42");
        outbound.try_recv().ok();

        let outcome = cast_vote(&mut machine, "C");

        assert!(matches!(
            outcome,
            CommandOutcome::Rejected {
                code: "unknown_choice",
                ..
            }
        ));
        assert!(outbound.try_recv().is_err());
        assert!(machine.vote_controls_visible());
    }

    #[test]
    fn test_vote_rejected_without_match() {
        let (mut machine, _, outbound) = create_machine();

        let outcome = cast_vote(&mut machine, "A");

        assert!(matches!(
            outcome,
            CommandOutcome::Rejected { code: "no_match", .. }
        ));
        assert!(outbound.try_recv().is_err());
    }

    #[test]
    fn test_vote_rejected_during_enrollment() {
        let (mut machine, _, outbound) = create_machine();

        // Controls stay revealed across the flag reset, then a fresh
        // enrollment begins.
        machine.handle_line("Voter Found: ID 42");
        machine.handle_line(IDLE_PROMPT);
        machine.handle_line("New Voter Detected");
        assert!(machine.vote_controls_visible());

        let outcome = cast_vote(&mut machine, "A");

        assert!(matches!(
            outcome,
            CommandOutcome::Rejected {
                code: "enrollment_active",
                ..
            }
        ));
        assert!(outbound.try_recv().is_err());
    }

    #[test]
    fn test_repeated_match_refreshes_id() {
        let (mut machine, mut rx, _) = create_machine();

        machine.handle_line("Voter Found: ID 42");
        machine.handle_line("Voter Found: ID 7");

        assert_eq!(machine.state(), SessionState::MatchFound);
        let matches_seen: Vec<_> = drain_events(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::VoterMatched { voter_id } => Some(voter_id),
                _ => None,
            })
            .collect();
        assert_eq!(matches_seen, vec!["42".to_string(), "7".to_string()]);
    }

    #[test]
    fn test_match_supersedes_open_prompt() {
        let (mut machine, mut rx, _) = create_machine();

        machine.handle_line("New Voter Detected");
        drain_events(&mut rx);

        machine.handle_line("Voter Found: ID 5");

        assert_eq!(machine.state(), SessionState::MatchFound);
        let events = drain_events(&mut rx);
        assert!(events.contains(&SessionEvent::EnrollmentClosed {
            reason: EnrollmentClose::Superseded
        }));
        assert!(events.contains(&SessionEvent::VoterMatched {
            voter_id: "5".to_string()
        }));
    }

    #[test]
    fn test_link_loss_is_surfaced() {
        let (mut machine, mut rx, _) = create_machine();

        machine.handle_link_event(LinkEvent::Disconnected);

        assert!(drain_events(&mut rx).contains(&SessionEvent::LinkLost));
        assert_eq!(machine.state(), SessionState::Idle);
    }

    #[test]
    fn test_run_drives_full_vote_flow() {
        tokio_test::block_on(async {
            let (tx, mut rx) = broadcast::channel(32);
            let (commands, outbound) = command_channel();
            let mut machine = SessionMachine::new(
                tx,
                commands,
                vec!["A".to_string(), "B".to_string()],
                Duration::from_secs(30),
            );

            let (link_tx, link_rx) = mpsc::channel(8);
            let (cmd_tx, cmd_rx) = mpsc::channel(8);
            let controller = tokio::spawn(async move {
                machine.run(link_rx, cmd_rx).await;
                machine
            });

            link_tx
                .send(LinkEvent::Line("Voter Found: ID 42".to_string()))
                .await
                .unwrap();
            loop {
                if let SessionEvent::VoterMatched { voter_id } = rx.recv().await.unwrap() {
                    assert_eq!(voter_id, "42");
                    break;
                }
            }

            let (reply_tx, reply_rx) = oneshot::channel();
            cmd_tx
                .send(OperatorCommand {
                    action: OperatorAction::CastVote {
                        choice: "B".to_string(),
                    },
                    reply: reply_tx,
                })
                .await
                .unwrap();
            assert_eq!(reply_rx.await.unwrap(), CommandOutcome::Accepted);
            assert_eq!(outbound.try_recv().unwrap(), "B\n");

            drop(link_tx);
            drop(cmd_tx);
            let machine = controller.await.unwrap();
            assert_eq!(machine.state(), SessionState::AwaitingScan);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_enforces_enrollment_deadline() {
        let (tx, mut rx) = broadcast::channel(32);
        let (commands, _outbound) = command_channel();
        let mut machine = SessionMachine::new(
            tx,
            commands,
            vec!["A".to_string(), "B".to_string()],
            Duration::from_secs(30),
        );

        let (link_tx, link_rx) = mpsc::channel(8);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let controller = tokio::spawn(async move {
            machine.run(link_rx, cmd_rx).await;
            machine
        });

        link_tx
            .send(LinkEvent::Line("New Voter Detected".to_string()))
            .await
            .unwrap();
        loop {
            if matches!(rx.recv().await.unwrap(), SessionEvent::EnrollmentStarted) {
                break;
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(OperatorCommand {
                action: OperatorAction::SubmitName {
                    name: "Alice".to_string(),
                },
                reply: reply_tx,
            })
            .await
            .unwrap();
        assert_eq!(reply_rx.await.unwrap(), CommandOutcome::Accepted);

        tokio::time::advance(Duration::from_secs(31)).await;

        loop {
            if let SessionEvent::EnrollmentClosed { reason } = rx.recv().await.unwrap() {
                assert_eq!(reason, EnrollmentClose::TimedOut);
                break;
            }
        }

        drop(link_tx);
        drop(cmd_tx);
        let machine = controller.await.unwrap();
        assert_eq!(machine.state(), SessionState::Idle);
    }
}
