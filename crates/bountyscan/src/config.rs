use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::controller::ScanSettings;
use crate::profile::CompletenessPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Scanner configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database holding face vectors and profiles.
    pub db_path: PathBuf,
    /// JSON file backing local session storage.
    pub session_path: PathBuf,
    /// Detection polling interval.
    pub tick_interval_ms: u64,
    /// Delay before a fatal scan error resets the session.
    pub reset_delay_ms: u64,
    pub profile_policy: CompletenessPolicy,
}

impl Config {
    /// Load configuration from `BOUNTY_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("bountyscan");

        let db_path = std::env::var("BOUNTY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("bounty.db"));
        let session_path = std::env::var("BOUNTY_SESSION_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("session.json"));

        let profile_policy = match std::env::var("BOUNTY_PROFILE_POLICY") {
            Ok(raw) => raw.parse().map_err(|message| ConfigError::Invalid {
                key: "BOUNTY_PROFILE_POLICY",
                message,
            })?,
            Err(_) => CompletenessPolicy::default(),
        };

        let tick_interval_ms = env_u64("BOUNTY_TICK_INTERVAL_MS", 100);
        if tick_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "BOUNTY_TICK_INTERVAL_MS",
                message: "must be greater than zero".into(),
            });
        }

        Ok(Self {
            db_path,
            session_path,
            tick_interval_ms,
            reset_delay_ms: env_u64("BOUNTY_RESET_DELAY_MS", 3000),
            profile_policy,
        })
    }

    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            reset_delay: Duration::from_millis(self.reset_delay_ms),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
