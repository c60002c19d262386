//! Engine configuration, persisted as `$CP02_HOME/config.json`

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::{Backoff, ScanFilter};

/// `$CP02_HOME`, or `~/.cp02`
pub fn cp02_home() -> PathBuf {
    std::env::var("CP02_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".cp02")
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Durations are plain milliseconds so the file stays hand-editable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Advertised name prefix that marks a charger
    pub name_prefix: String,
    /// Name or address substring pinning the session to one charger
    pub target: Option<String>,
    /// Token to use instead of the stored one
    pub token: Option<u8>,
    /// Search for the token on connect when none is known
    pub auto_bruteforce: bool,

    pub scan_ms: u64,
    pub connect_timeout_ms: u64,
    pub backoff: BackoffKind,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_retries: u32,

    pub command_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub probe_delay_ms: u64,
    pub match_by_msg_id: bool,

    pub ports_poll_ms: u64,
    pub info_poll_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name_prefix: cp02_proto::ble::DEVICE_PREFIX.to_string(),
            target: None,
            token: None,
            auto_bruteforce: true,
            scan_ms: 5_000,
            connect_timeout_ms: 10_000,
            backoff: BackoffKind::Exponential,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            max_retries: 5,
            command_timeout_ms: 3_000,
            probe_timeout_ms: 300,
            probe_delay_ms: 20,
            match_by_msg_id: true,
            ports_poll_ms: 3_000,
            info_poll_ms: 30_000,
        }
    }
}

impl Config {
    /// The embedded gateway profile: fixed 5 s between reconnects
    pub fn gateway() -> Self {
        Self {
            backoff: BackoffKind::Fixed,
            backoff_base_ms: 5_000,
            backoff_max_ms: 5_000,
            ..Self::default()
        }
    }

    /// Load from `path`, falling back to defaults for a missing file or fields
    pub fn load(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(std::io::Error::other)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, data)
    }

    pub fn default_path() -> PathBuf {
        cp02_home().join("config.json")
    }

    pub fn tokens_path() -> PathBuf {
        cp02_home().join("tokens.json")
    }

    pub fn scan_filter(&self) -> ScanFilter {
        ScanFilter { name_prefix: self.name_prefix.clone(), target: self.target.clone() }
    }

    pub fn backoff(&self) -> Backoff {
        match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed(ms(self.backoff_base_ms)),
            BackoffKind::Exponential => Backoff::Exponential {
                base: ms(self.backoff_base_ms),
                max: ms(self.backoff_max_ms),
            },
        }
    }

    pub fn scan_duration(&self) -> Duration {
        ms(self.scan_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        ms(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        ms(self.command_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        ms(self.probe_timeout_ms)
    }

    pub fn probe_delay(&self) -> Duration {
        ms(self.probe_delay_ms)
    }

    pub fn ports_poll(&self) -> Duration {
        ms(self.ports_poll_ms)
    }

    pub fn info_poll(&self) -> Duration {
        ms(self.info_poll_ms)
    }
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
