//! TOML configuration for speedcheck.
//!
//! Every section falls back to compiled-in defaults, so an empty file (or no
//! file at all) yields a working configuration against public endpoints.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::throughput::http::MAX_UPLOAD_BYTES;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "SPEEDCHECK_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/speedcheck/speedcheck.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeedCheckConfig {
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub latency: LatencyConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SpeedCheckConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded speedcheck configuration");
        Ok(config)
    }

    /// Reject values that would make a run meaningless or unsafe to start.
    pub fn validate(&self) -> Result<()> {
        let payload = self.transfer.upload_payload_bytes;
        if payload == 0 {
            anyhow::bail!("transfer.upload_payload_bytes must be greater than 0");
        }
        if payload > MAX_UPLOAD_BYTES {
            anyhow::bail!(
                "transfer.upload_payload_bytes is {} but at most {} is allowed",
                payload,
                MAX_UPLOAD_BYTES
            );
        }
        Ok(())
    }

    /// Resolve the configuration, in order:
    /// 1. `explicit` (from `--config`); a failure here is an error.
    /// 2. The file named by `SPEEDCHECK_CONFIG`.
    /// 3. `/etc/speedcheck/speedcheck.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        Ok(Self::load_or_default())
    }

    /// Steps 2-4 of [`SpeedCheckConfig::resolve`]; never fails.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SPEEDCHECK_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Ordered fallback candidates per direction. Tried strictly left to right.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub download: Vec<String>,
    pub upload: Vec<String>,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            download: vec![
                "http://speedtest.tele2.net/10MB.zip".to_string(),
                "https://speed.hetzner.de/100MB.bin".to_string(),
                "http://ipv4.download.thinkbroadband.com/5MB.zip".to_string(),
            ],
            upload: vec![
                "http://speedtest.tele2.net/upload.php".to_string(),
                "http://httpbin.org/post".to_string(),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

/// Transfer attempt tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Upload body size in bytes.
    pub upload_payload_bytes: u64,
    /// Per-attempt timeout; an attempt silent for this long counts as failed.
    pub probe_timeout_sec: u64,
    /// Upper bound on waiting for the download before starting the upload.
    pub upload_start_ceiling_sec: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            upload_payload_bytes: 2_000_000,
            probe_timeout_sec: 120,
            upload_start_ceiling_sec: 60,
        }
    }
}

impl TransferConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_sec)
    }

    pub fn upload_start_ceiling(&self) -> Duration {
        Duration::from_secs(self.upload_start_ceiling_sec)
    }
}

// ---------------------------------------------------------------------------
// Latency
// ---------------------------------------------------------------------------

/// Latency target. The TCP fallback connects to `host:port`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            host: "8.8.8.8".to_string(),
            port: 53,
            timeout_ms: 3000,
        }
    }
}

impl LatencyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    /// Number of reports kept for `/speed-test/history`.
    pub history_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            history_size: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON log lines instead of the human format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
