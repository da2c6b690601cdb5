//! Configuration loading and management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Serial device of the fingerprint scanner
    pub port_path: String,

    /// Baud rate of the scanner link
    pub baud_rate: u32,

    /// Read timeout of the scanner link; also bounds how long an
    /// outbound write can sit queued
    pub poll_interval: Duration,

    /// How long to wait for the scanner to arm after a name went out
    pub enroll_timeout: Duration,

    /// The ballot, in display order
    pub choices: Vec<String>,

    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("voteterm");

        let socket_path = data_dir.join("daemon.sock");

        let port_path =
            std::env::var("VOTETERM_PORT").unwrap_or_else(|_| "/dev/ttyUSB0".to_string());

        let baud_rate = parse_env("VOTETERM_BAUD", 9600)?;
        let poll_interval = Duration::from_millis(parse_env("VOTETERM_POLL_MS", 200)?);
        let enroll_timeout = Duration::from_secs(parse_env("VOTETERM_ENROLL_TIMEOUT_SECS", 30)?);

        let choices = match std::env::var("VOTETERM_CHOICES") {
            Ok(raw) => parse_choices(&raw)?,
            Err(_) => vec!["A".to_string(), "B".to_string()],
        };

        Ok(Self {
            port_path,
            baud_rate,
            poll_interval,
            enroll_timeout,
            choices,
            socket_path,
            data_dir,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

/// Read a numeric environment variable, falling back to a default when
/// it is unset. A set-but-garbled value is a startup error.
fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn parse_choices(raw: &str) -> Result<Vec<String>> {
    let choices: Vec<String> = raw
        .split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if choices.is_empty() {
        bail!("VOTETERM_CHOICES contains no usable entries: {raw:?}");
    }
    Ok(choices)
}
