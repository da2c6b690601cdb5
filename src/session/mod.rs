//! Session controller module for the voting flow
//!
//! Provides an explicit state machine with five states:
//! - Idle: Default state, the next scan outcome is acted upon
//! - EnrollmentPrompt: A new voter was detected, the name prompt is open
//! - EnrollmentPending: The name went out, waiting for the scanner to arm
//! - MatchFound: A voter matched, vote controls are revealed
//! - AwaitingScan: An outcome was consumed, waiting for the scanner to re-arm

mod machine;

pub use machine::{CommandOutcome, OperatorAction, OperatorCommand, SessionMachine};
