//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CourierError, CourierResult};

/// Exponential backoff parameters for outbox retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt, in milliseconds
    pub initial_millis: u64,
    /// Upper bound on the delay, in milliseconds
    pub max_millis: u64,
}

impl BackoffConfig {
    /// Delay before the next attempt, doubling per failure up to the cap.
    ///
    /// Zero attempts means the entry has never been tried: due immediately.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = attempts.saturating_sub(1).min(31);
        let delay = self
            .initial_millis
            .saturating_mul(1u64 << exponent)
            .min(self.max_millis);
        Duration::from_millis(delay)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_millis: 2_000,
            max_millis: 5 * 60_000,
        }
    }
}

/// Engine configuration.
///
/// Everything needed to run the engine: where state lives, where the relay
/// is, and the timing knobs for sessions, retries, and the watchdog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the ledger and key store
    pub data_dir: PathBuf,
    /// Relay base URL for the REST fallback (e.g. `https://relay.example`)
    pub relay_url: String,
    /// WebSocket URL for the live channel; derived from `relay_url` when
    /// unset
    pub relay_ws_url: Option<String>,
    /// Session key validity window, in milliseconds (default 7 days)
    pub session_validity_millis: i64,
    /// Retention of superseded keys for draining in-flight ciphertexts,
    /// in milliseconds (default 1 day)
    pub key_retention_millis: i64,
    /// Outbox retry backoff
    pub backoff: BackoffConfig,
    /// Live-channel receipt timeout, in milliseconds
    pub receipt_timeout_millis: u64,
    /// REST request timeout, in milliseconds
    pub request_timeout_millis: u64,
    /// Watchdog: an attempt older than this is forced back to backoff,
    /// in milliseconds
    pub watchdog_millis: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./courier-data"),
            relay_url: "http://127.0.0.1:8080".to_string(),
            relay_ws_url: None,
            session_validity_millis: 7 * 24 * 3600 * 1000,
            key_retention_millis: 24 * 3600 * 1000,
            backoff: BackoffConfig::default(),
            receipt_timeout_millis: 10_000,
            request_timeout_millis: 15_000,
            watchdog_millis: 60_000,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> CourierResult<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| CourierError::Corrupt(format!("config: {}", e)))
    }

    /// Save configuration as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> CourierResult<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| CourierError::Serialization(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// The live-channel URL: explicit, or derived from the REST base.
    pub fn ws_url(&self) -> String {
        match &self.relay_ws_url {
            Some(url) => url.clone(),
            None => {
                let base = self
                    .relay_url
                    .replacen("https://", "wss://", 1)
                    .replacen("http://", "ws://", 1);
                format!("{}/live", base.trim_end_matches('/'))
            }
        }
    }

    /// Live-channel receipt timeout as a `Duration`
    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.receipt_timeout_millis)
    }

    /// REST request timeout as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_millis)
    }
}
