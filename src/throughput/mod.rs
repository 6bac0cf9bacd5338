//! Throughput testing engine: resilient download/upload runs over fallback
//! endpoint lists, followed by a latency measurement.

pub mod fallback;
pub mod http;
pub mod orchestrator;
pub mod report;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::SpeedCheckConfig;
use crate::probes::latency::LatencyProber;

use self::orchestrator::{Orchestrator, RunPlan};
use self::report::{RunOutcome, SpeedTestReport};

#[derive(Debug, Error)]
pub enum ThroughputError {
    #[error("invalid endpoint URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("transfer probe unavailable: {0}")]
    Unavailable(String),
}

/// Which half of a speed test an attempt or event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

/// One transfer to perform against a single candidate.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub direction: Direction,
    /// Upload body size; `None` lets the probe pick.
    pub payload_size: Option<u64>,
}

/// What a transfer probe reports back for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Advisory only.
    Progress { percent: f32 },
    Completion { bits_per_sec: f64 },
    Error { message: String },
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferEvent::Progress { .. })
    }
}

/// A [`TransferEvent`] stamped with the attempt that produced it.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub direction: Direction,
    pub attempt: u64,
    pub event: TransferEvent,
}

/// Reporting handle bound to a single attempt.
///
/// Sends never block. Once the run has finished the events are dropped.
/// The attempt's token is cancelled when the orchestrator stops caring about
/// it (superseded, concluded, or run over); transfers should stop then.
#[derive(Debug, Clone)]
pub struct EventSink {
    direction: Direction,
    attempt: u64,
    tx: mpsc::UnboundedSender<AttemptEvent>,
    cancel: CancellationToken,
}

impl EventSink {
    pub fn new(direction: Direction, attempt: u64, tx: mpsc::UnboundedSender<AttemptEvent>) -> Self {
        Self::with_cancel(direction, attempt, tx, CancellationToken::new())
    }

    pub fn with_cancel(
        direction: Direction,
        attempt: u64,
        tx: mpsc::UnboundedSender<AttemptEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            direction,
            attempt,
            tx,
            cancel,
        }
    }

    /// Resolves once this attempt has been abandoned.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn progress(&self, percent: f32) {
        self.send(TransferEvent::Progress { percent });
    }

    pub fn complete(&self, bits_per_sec: f64) {
        self.send(TransferEvent::Completion { bits_per_sec });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(TransferEvent::Error {
            message: message.into(),
        });
    }

    fn send(&self, event: TransferEvent) {
        let _ = self.tx.send(AttemptEvent {
            direction: self.direction,
            attempt: self.attempt,
            event,
        });
    }
}

/// The byte-moving capability the orchestrator drives.
///
/// `start_transfer` must return promptly; the transfer itself runs in the
/// background and reports through `sink`. An `Err` here is treated as an
/// immediate failure of the attempt.
pub trait TransferProbe: Send + Sync {
    fn start_transfer(&self, request: TransferRequest, sink: EventSink) -> Result<(), ThroughputError>;
}

/// Caller-facing speed test: configuration plus the collaborators it drives.
#[derive(Clone)]
pub struct SpeedTest {
    plan: RunPlan,
    probe: Arc<dyn TransferProbe>,
    latency: Arc<LatencyProber>,
}

impl SpeedTest {
    pub fn new(plan: RunPlan, probe: Arc<dyn TransferProbe>, latency: LatencyProber) -> Self {
        Self {
            plan,
            probe,
            latency: Arc::new(latency),
        }
    }

    /// Build a speed test with the HTTP transfer probe and the system latency probes.
    pub fn from_config(config: &SpeedCheckConfig) -> Result<Self, ThroughputError> {
        let probe = http::HttpTransferProbe::new(config.transfer.probe_timeout())?;
        let latency = LatencyProber::system(config.latency.port);
        Ok(Self::new(RunPlan::from_config(config), Arc::new(probe), latency))
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// Run one complete test. Never fails: an internal fault yields a zeroed
    /// outcome with the reason attached.
    pub async fn run_speed_test(&self) -> SpeedTestReport {
        self.run_speed_test_with_cancel(CancellationToken::new()).await
    }

    pub async fn run_speed_test_with_cancel(&self, cancel: CancellationToken) -> SpeedTestReport {
        let orchestrator = Orchestrator::new(
            self.plan.clone(),
            Arc::clone(&self.probe),
            Arc::clone(&self.latency),
        )
        .with_cancellation(cancel);

        match orchestrator.run().await {
            Ok(outcome) => {
                info!(
                    download_mbps = outcome.download_mbps,
                    upload_mbps = outcome.upload_mbps,
                    latency_ms = outcome.latency_ms,
                    "speed test finished"
                );
                SpeedTestReport::completed(outcome)
            }
            Err(e) => {
                error!(error = %e, "speed test aborted");
                SpeedTestReport::failed(RunOutcome::default(), format!("Test failed: {}", e))
            }
        }
    }
}
