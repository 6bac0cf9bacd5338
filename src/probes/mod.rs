use anyhow::Result;
use std::time::{Duration, SystemTime};
use thiserror::Error;

pub mod icmp;
pub mod latency;
pub mod tcp;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid probe target {0:?}")]
    InvalidTarget(String),

    #[error("failed to launch {tool}: {source}")]
    Launch {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeType {
    Icmp,
    Tcp,
}

impl std::fmt::Display for ProbeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeType::Icmp => write!(f, "icmp"),
            ProbeType::Tcp => write!(f, "tcp"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Measurement {
    pub probe_type: ProbeType,
    pub target: String,
    pub value: f64, // ms; -1.0 on failure
    pub unit: String,
    pub success: bool,
    pub timestamp: SystemTime,
}

impl Measurement {
    pub fn success(probe_type: ProbeType, target: &str, rtt_ms: f64) -> Self {
        Self {
            probe_type,
            target: target.to_string(),
            value: rtt_ms,
            unit: "ms".to_string(),
            success: true,
            timestamp: SystemTime::now(),
        }
    }

    pub fn failure(probe_type: ProbeType, target: &str) -> Self {
        Self {
            probe_type,
            target: target.to_string(),
            value: -1.0,
            unit: "ms".to_string(),
            success: false,
            timestamp: SystemTime::now(),
        }
    }
}

/// Trait for all active probes
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    /// Run the probe against a target.
    ///
    /// An unreachable target is a `Measurement` with `success == false`;
    /// `Err` means the probe could not run at all.
    async fn run(&self, target: &str, timeout: Duration) -> Result<Measurement>;
}

/// Reject anything that is not a plain host name or address literal.
pub(crate) fn validate_host(host: &str) -> Result<(), ProbeError> {
    if host.is_empty()
        || host.starts_with('-')
        || host
            .chars()
            .any(|c| !c.is_alphanumeric() && c != '.' && c != '-' && c != ':')
    {
        return Err(ProbeError::InvalidTarget(host.to_string()));
    }
    Ok(())
}
