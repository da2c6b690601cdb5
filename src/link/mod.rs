//! Peripheral link module for the scanner serial connection.
//!
//! Owns the port on a dedicated thread and translates the firmware's
//! line-oriented text protocol into typed events for the session
//! controller.

mod line;
mod reader;

pub use line::{classify, is_enroll_ready, Classification};
pub use reader::{command_channel, CommandSender, LinkEvent, PeripheralLink};
