//! IPC module for daemon-frontend communication

mod protocol;
mod server;

pub use server::Server;
