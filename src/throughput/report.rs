//! Run outcome, unit conversion, and human-readable formatting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel latency for "neither probe tier reached the host".
pub const LATENCY_UNREACHABLE: i64 = -1;

/// Aggregate result of one run.
///
/// Rates are Mbps at two decimals, 0.0 when never measured. Latency is in
/// whole milliseconds, -1 when unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: i64,
}

impl Default for RunOutcome {
    fn default() -> Self {
        Self {
            download_mbps: 0.0,
            upload_mbps: 0.0,
            latency_ms: LATENCY_UNREACHABLE,
        }
    }
}

/// Convert bits/sec to Mbps rounded half-up at two decimals.
pub fn bits_to_mbps(bits_per_sec: f64) -> f64 {
    if !bits_per_sec.is_finite() || bits_per_sec <= 0.0 {
        return 0.0;
    }
    // Hundredths of a Mbps. f64::round is half away from zero, which is
    // half-up for the non-negative values that reach here.
    let hundredths = (bits_per_sec / 10_000.0).round();
    hundredths / 100.0
}

/// What the caller gets back: the outcome plus an optional failure reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedTestReport {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: RunOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SpeedTestReport {
    pub fn completed(outcome: RunOutcome) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            outcome,
            error: None,
        }
    }

    pub fn failed(outcome: RunOutcome, reason: String) -> Self {
        Self {
            error: Some(reason),
            ..Self::completed(outcome)
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

fn format_rate(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.2} Mbps", mbps)
    }
}

/// Format an outcome as a one-line summary.
pub fn format_summary(outcome: &RunOutcome) -> String {
    let latency = if outcome.latency_ms == LATENCY_UNREACHABLE {
        "unreachable".to_string()
    } else {
        format!("{} ms", outcome.latency_ms)
    };

    format!(
        "download: {}, upload: {}, latency: {}",
        format_rate(outcome.download_mbps),
        format_rate(outcome.upload_mbps),
        latency,
    )
}
