//! Resilient run orchestration.
//!
//! One event loop owns every piece of run state. Transfer probes, attempt
//! watchdogs and the upload sequencer only enqueue messages, so the
//! "conclude each direction exactly once" rule is a plain flag check and
//! stale events are recognised by their attempt number.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fallback::EndpointList;
use super::report::{bits_to_mbps, RunOutcome};
use super::{AttemptEvent, Direction, EventSink, TransferEvent, TransferProbe, TransferRequest};
use crate::config::SpeedCheckConfig;
use crate::probes::latency::LatencyProber;

/// Faults that stop the orchestrator itself. Probe failures never end up here.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("transfer event channel closed unexpectedly")]
    ChannelClosed,

    #[error("upload sequencer task failed")]
    SequencerFailed,

    #[error("run cancelled")]
    Cancelled,
}

/// Static inputs of a run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub download_urls: Vec<String>,
    pub upload_urls: Vec<String>,
    pub upload_payload_bytes: Option<u64>,
    /// An attempt with no terminal event after this long counts as failed.
    pub probe_timeout: Duration,
    /// Longest wait for the download before the upload starts regardless.
    pub upload_start_ceiling: Duration,
    pub latency_host: String,
    pub latency_timeout: Duration,
}

impl RunPlan {
    pub fn from_config(config: &SpeedCheckConfig) -> Self {
        Self {
            download_urls: config.endpoints.download.clone(),
            upload_urls: config.endpoints.upload.clone(),
            upload_payload_bytes: Some(config.transfer.upload_payload_bytes),
            probe_timeout: config.transfer.probe_timeout(),
            upload_start_ceiling: config.transfer.upload_start_ceiling(),
            latency_host: config.latency.host.clone(),
            latency_timeout: config.latency.timeout(),
        }
    }
}

pub struct Orchestrator {
    plan: RunPlan,
    probe: Arc<dyn TransferProbe>,
    latency: Arc<LatencyProber>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(plan: RunPlan, probe: Arc<dyn TransferProbe>, latency: Arc<LatencyProber>) -> Self {
        Self {
            plan,
            probe,
            latency,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Drive download, then upload, then latency, and return the outcome.
    pub async fn run(self) -> Result<RunOutcome, OrchestratorError> {
        let (tx, mut events) = mpsc::unbounded_channel();
        let (download_done_tx, download_done_rx) = oneshot::channel();

        let mut run = RunState::new(&self.plan, self.probe.as_ref(), tx, self.cancel.clone());
        run.download_done = Some(download_done_tx);

        info!(
            download_candidates = self.plan.download_urls.len(),
            upload_candidates = self.plan.upload_urls.len(),
            "speed test run started"
        );

        run.begin(Direction::Download)?;

        let mut start_upload = spawn_sequencer(download_done_rx, self.plan.upload_start_ceiling);
        let mut upload_started = false;

        let result = loop {
            if run.remaining == 0 {
                break Ok(());
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break Err(OrchestratorError::Cancelled),

                signal = &mut start_upload, if !upload_started => {
                    upload_started = true;
                    match signal {
                        Ok(forced) => {
                            if forced {
                                warn!(
                                    ceiling_secs = self.plan.upload_start_ceiling.as_secs_f64(),
                                    "download still running at ceiling, abandoning it"
                                );
                                // Keeps whatever rate was set so far (none yet
                                // means 0); later download events are ignored.
                                let rate = run.download.rate_bps;
                                run.conclude(Direction::Download, rate);
                            }
                            if let Err(e) = run.begin(Direction::Upload) {
                                break Err(e);
                            }
                        }
                        Err(_) => break Err(OrchestratorError::SequencerFailed),
                    }
                }

                msg = events.recv() => match msg {
                    Some(ev) => {
                        if let Err(e) = run.on_event(ev) {
                            break Err(e);
                        }
                    }
                    None => break Err(OrchestratorError::ChannelClosed),
                },
            }
        };

        run.retire_attempts();
        result?;

        let mut outcome = run.outcome();
        let latency = self
            .latency
            .measure(&self.plan.latency_host, self.plan.latency_timeout)
            .await;
        outcome.latency_ms = latency.as_millis_or_sentinel();

        Ok(outcome)
    }
}

/// Waits for the download to conclude (or the ceiling) off the event loop.
/// Resolves to `true` when the ceiling forced the upload.
fn spawn_sequencer(download_done: oneshot::Receiver<()>, ceiling: Duration) -> oneshot::Receiver<bool> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let forced = tokio::time::timeout(ceiling, download_done).await.is_err();
        let _ = tx.send(forced);
    });
    rx
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Per-direction progress through one run.
#[derive(Debug)]
struct AttemptState {
    candidates: EndpointList,
    /// Sequence number of the attempt in flight; 0 before the first.
    attempt: u64,
    concluded: bool,
    rate_bps: Option<f64>,
    watchdog: Option<JoinHandle<()>>,
    /// Cancelled when the attempt in flight is abandoned.
    cancel: Option<CancellationToken>,
}

impl AttemptState {
    fn new(candidates: Vec<String>) -> Self {
        Self {
            candidates: EndpointList::new(candidates),
            attempt: 0,
            concluded: false,
            rate_bps: None,
            watchdog: None,
            cancel: None,
        }
    }

    /// Stop the attempt in flight: its watchdog and the transfer behind it.
    fn retire(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

struct RunState<'a> {
    plan: &'a RunPlan,
    probe: &'a dyn TransferProbe,
    tx: mpsc::UnboundedSender<AttemptEvent>,
    cancel: CancellationToken,
    next_attempt: u64,
    download: AttemptState,
    upload: AttemptState,
    /// Directions still awaiting conclusion.
    remaining: u8,
    download_done: Option<oneshot::Sender<()>>,
}

impl<'a> RunState<'a> {
    fn new(
        plan: &'a RunPlan,
        probe: &'a dyn TransferProbe,
        tx: mpsc::UnboundedSender<AttemptEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            plan,
            probe,
            tx,
            cancel,
            next_attempt: 1,
            download: AttemptState::new(plan.download_urls.clone()),
            upload: AttemptState::new(plan.upload_urls.clone()),
            remaining: 2,
            download_done: None,
        }
    }

    fn state(&mut self, direction: Direction) -> &mut AttemptState {
        match direction {
            Direction::Download => &mut self.download,
            Direction::Upload => &mut self.upload,
        }
    }

    /// Start a direction at its first candidate.
    fn begin(&mut self, direction: Direction) -> Result<(), OrchestratorError> {
        if self.state(direction).candidates.is_empty() {
            info!(%direction, "no candidates configured, skipping");
            self.conclude(direction, None);
            return Ok(());
        }
        self.launch_current(direction)
    }

    /// Launch against the cursor; start-time failures fall through to the
    /// next candidate immediately.
    fn launch_current(&mut self, direction: Direction) -> Result<(), OrchestratorError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            let Some(url) = self.state(direction).candidates.current().map(str::to_string) else {
                self.conclude(direction, None);
                return Ok(());
            };

            match self.launch(direction, url.clone()) {
                Ok(()) => return Ok(()),
                Err(reason) => {
                    warn!(%direction, %url, error = %reason, "could not start transfer");
                    if !self.advance_or_exhaust(direction) {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn launch(&mut self, direction: Direction, url: String) -> Result<(), String> {
        let attempt = self.next_attempt;
        self.next_attempt += 1;

        let attempt_cancel = self.cancel.child_token();
        let sink = EventSink::with_cancel(direction, attempt, self.tx.clone(), attempt_cancel.clone());
        let timeout = self.plan.probe_timeout;
        let watchdog_sink = sink.clone();

        {
            let state = self.state(direction);
            state.retire();
            state.attempt = attempt;
            state.cancel = Some(attempt_cancel);
            info!(
                %direction,
                %url,
                attempt,
                candidate = state.candidates.position() + 1,
                of = state.candidates.len(),
                "starting transfer"
            );
        }

        let request = TransferRequest {
            url,
            direction,
            payload_size: match direction {
                Direction::Download => None,
                Direction::Upload => self.plan.upload_payload_bytes,
            },
        };
        if let Err(e) = self.probe.start_transfer(request, sink) {
            self.state(direction).retire();
            return Err(e.to_string());
        }

        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            watchdog_sink.error(format!("no result within {:.1}s", timeout.as_secs_f64()));
        });
        self.state(direction).watchdog = Some(watchdog);
        Ok(())
    }

    /// Move to the next candidate, or conclude the direction with no rate.
    /// Returns whether a next candidate exists.
    fn advance_or_exhaust(&mut self, direction: Direction) -> bool {
        if self.state(direction).candidates.advance() {
            return true;
        }
        warn!(%direction, "all candidates failed");
        self.conclude(direction, None);
        false
    }

    fn on_event(&mut self, ev: AttemptEvent) -> Result<(), OrchestratorError> {
        let direction = ev.direction;
        {
            let state = self.state(direction);
            if state.concluded {
                debug!(%direction, attempt = ev.attempt, event = ?ev.event, "ignoring event for concluded direction");
                return Ok(());
            }
            if ev.attempt != state.attempt {
                debug!(%direction, attempt = ev.attempt, current = state.attempt, "ignoring event from superseded attempt");
                return Ok(());
            }
        }

        match ev.event {
            TransferEvent::Progress { percent } => {
                debug!(%direction, percent, "transfer progress");
            }
            TransferEvent::Completion { bits_per_sec } => {
                info!(%direction, mbps = bits_to_mbps(bits_per_sec), "transfer complete");
                self.conclude(direction, Some(bits_per_sec));
            }
            TransferEvent::Error { message } => {
                warn!(%direction, attempt = ev.attempt, error = %message, "transfer failed");
                self.state(direction).retire();
                if self.advance_or_exhaust(direction) {
                    self.launch_current(direction)?;
                }
            }
        }
        Ok(())
    }

    /// Mark a direction finished. Only the first call per direction counts.
    fn conclude(&mut self, direction: Direction, rate_bps: Option<f64>) -> bool {
        let state = self.state(direction);
        if state.concluded {
            return false;
        }
        state.concluded = true;
        state.rate_bps = rate_bps;
        state.retire();

        self.remaining = self.remaining.saturating_sub(1);
        info!(%direction, measured = rate_bps.is_some(), remaining = self.remaining, "direction concluded");

        if direction == Direction::Download {
            if let Some(done) = self.download_done.take() {
                let _ = done.send(());
            }
        }
        true
    }

    fn retire_attempts(&mut self) {
        self.download.retire();
        self.upload.retire();
    }

    fn outcome(&self) -> RunOutcome {
        RunOutcome {
            download_mbps: self.download.rate_bps.map(bits_to_mbps).unwrap_or(0.0),
            upload_mbps: self.upload.rate_bps.map(bits_to_mbps).unwrap_or(0.0),
            ..RunOutcome::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::{Measurement, Probe, ProbeType};
    use crate::throughput::ThroughputError;
    use std::sync::Mutex;

    /// Records starts but never reports anything on its own.
    #[derive(Default)]
    struct SilentProbe {
        started: Mutex<Vec<(Direction, String, u64)>>,
        sinks: Mutex<Vec<EventSink>>,
        reject: Vec<String>,
    }

    impl TransferProbe for SilentProbe {
        fn start_transfer(&self, request: TransferRequest, sink: EventSink) -> Result<(), ThroughputError> {
            if self.reject.contains(&request.url) {
                return Err(ThroughputError::InvalidUrl {
                    url: request.url,
                    reason: "rejected".into(),
                });
            }
            self.started
                .lock()
                .unwrap()
                .push((request.direction, request.url, sink.attempt()));
            self.sinks.lock().unwrap().push(sink);
            Ok(())
        }
    }

    struct Unreachable;

    #[async_trait::async_trait]
    impl Probe for Unreachable {
        async fn run(&self, target: &str, _timeout: Duration) -> anyhow::Result<Measurement> {
            Ok(Measurement::failure(ProbeType::Icmp, target))
        }
    }

    fn plan(download: &[&str], upload: &[&str]) -> RunPlan {
        RunPlan {
            download_urls: download.iter().map(|s| s.to_string()).collect(),
            upload_urls: upload.iter().map(|s| s.to_string()).collect(),
            upload_payload_bytes: Some(1024),
            probe_timeout: Duration::from_secs(60),
            upload_start_ceiling: Duration::from_secs(60),
            latency_host: "127.0.0.1".into(),
            latency_timeout: Duration::from_millis(10),
        }
    }

    fn event(direction: Direction, attempt: u64, event: TransferEvent) -> AttemptEvent {
        AttemptEvent {
            direction,
            attempt,
            event,
        }
    }

    fn error(msg: &str) -> TransferEvent {
        TransferEvent::Error {
            message: msg.into(),
        }
    }

    #[tokio::test]
    async fn test_exhaustion_concludes_once_with_no_rate() {
        let plan = plan(&["a", "b"], &["c"]);
        let probe = SilentProbe::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut run = RunState::new(&plan, &probe, tx, CancellationToken::new());

        run.begin(Direction::Download).unwrap();
        run.on_event(event(Direction::Download, 1, error("refused"))).unwrap();
        assert_eq!(run.remaining, 2);
        run.on_event(event(Direction::Download, 2, error("refused"))).unwrap();
        assert_eq!(run.remaining, 1);
        assert!(run.download.concluded);

        // Duplicate error and a late completion change nothing.
        run.on_event(event(Direction::Download, 2, error("refused"))).unwrap();
        run.on_event(event(Direction::Download, 2, TransferEvent::Completion { bits_per_sec: 1e9 }))
            .unwrap();
        assert_eq!(run.remaining, 1);
        assert_eq!(run.outcome().download_mbps, 0.0);
        assert_eq!(probe.started.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_list_concludes_without_probe() {
        let plan = plan(&[], &[]);
        let probe = SilentProbe::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut run = RunState::new(&plan, &probe, tx, CancellationToken::new());

        run.begin(Direction::Download).unwrap();
        run.begin(Direction::Upload).unwrap();
        assert_eq!(run.remaining, 0);
        assert!(probe.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_progress_never_changes_counter() {
        let plan = plan(&["a"], &[]);
        let probe = SilentProbe::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut run = RunState::new(&plan, &probe, tx, CancellationToken::new());

        run.begin(Direction::Download).unwrap();
        for p in [10.0, 50.0, 100.0] {
            run.on_event(event(Direction::Download, 1, TransferEvent::Progress { percent: p }))
                .unwrap();
        }
        assert_eq!(run.remaining, 2);
        assert!(!run.download.concluded);
    }

    #[tokio::test]
    async fn test_completion_is_recorded_once() {
        let plan = plan(&["a"], &["c"]);
        let probe = SilentProbe::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut run = RunState::new(&plan, &probe, tx, CancellationToken::new());

        run.begin(Direction::Download).unwrap();
        run.on_event(event(Direction::Download, 1, TransferEvent::Completion { bits_per_sec: 50_000_000.0 }))
            .unwrap();
        run.on_event(event(Direction::Download, 1, TransferEvent::Completion { bits_per_sec: 1.0 }))
            .unwrap();

        assert_eq!(run.remaining, 1);
        assert_eq!(run.outcome().download_mbps, 50.0);
        assert!(!run.conclude(Direction::Download, Some(2.0)));
        assert_eq!(run.remaining, 1);
    }

    #[tokio::test]
    async fn test_stale_attempt_events_are_ignored() {
        let plan = plan(&["a", "b", "c"], &[]);
        let probe = SilentProbe::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut run = RunState::new(&plan, &probe, tx, CancellationToken::new());

        run.begin(Direction::Download).unwrap();
        run.on_event(event(Direction::Download, 1, error("blocked"))).unwrap();
        // Attempt 1 is superseded by attempt 2 against "b".
        run.on_event(event(Direction::Download, 1, error("blocked again"))).unwrap();
        run.on_event(event(Direction::Download, 1, TransferEvent::Completion { bits_per_sec: 9e9 }))
            .unwrap();

        let started = probe.started.lock().unwrap();
        assert_eq!(started.len(), 2);
        assert_eq!(started[1].1, "b");
        assert!(!run.download.concluded);
        assert_eq!(run.download.candidates.position(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_attempts_are_cancelled() {
        let plan = plan(&["a", "b"], &["c"]);
        let probe = SilentProbe::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut run = RunState::new(&plan, &probe, tx, CancellationToken::new());

        run.begin(Direction::Download).unwrap();
        run.on_event(event(Direction::Download, 1, error("reset"))).unwrap();
        {
            let sinks = probe.sinks.lock().unwrap();
            assert!(sinks[0].is_cancelled());
            assert!(!sinks[1].is_cancelled());
        }

        run.on_event(event(Direction::Download, 2, TransferEvent::Completion { bits_per_sec: 1e6 }))
            .unwrap();
        assert!(probe.sinks.lock().unwrap()[1].is_cancelled());

        run.begin(Direction::Upload).unwrap();
        run.retire_attempts();
        assert!(probe.sinks.lock().unwrap()[2].is_cancelled());
    }

    #[tokio::test]
    async fn test_run_cancellation_reaches_attempts() {
        let plan = plan(&["a"], &[]);
        let probe = SilentProbe::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let mut run = RunState::new(&plan, &probe, tx, cancel.clone());

        run.begin(Direction::Download).unwrap();
        cancel.cancel();
        assert!(probe.sinks.lock().unwrap()[0].is_cancelled());
    }

    #[tokio::test]
    async fn test_start_failure_advances_immediately() {
        let plan = plan(&["bad", "worse", "good"], &[]);
        let probe = SilentProbe {
            reject: vec!["bad".into(), "worse".into()],
            ..Default::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut run = RunState::new(&plan, &probe, tx, CancellationToken::new());

        run.begin(Direction::Download).unwrap();
        let started = probe.started.lock().unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].1, "good");
        assert_eq!(run.remaining, 2);
    }

    #[tokio::test]
    async fn test_start_failure_on_every_candidate_exhausts() {
        let plan = plan(&["bad"], &[]);
        let probe = SilentProbe {
            reject: vec!["bad".into()],
            ..Default::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut run = RunState::new(&plan, &probe, tx, CancellationToken::new());

        run.begin(Direction::Download).unwrap();
        assert!(run.download.concluded);
        assert_eq!(run.remaining, 1);
    }

    #[tokio::test]
    async fn test_watchdog_turns_silence_into_fallback() {
        let mut p = plan(&["hangs", "also-hangs"], &[]);
        p.probe_timeout = Duration::from_millis(50);
        p.upload_start_ceiling = Duration::from_millis(50);
        let probe = Arc::new(SilentProbe::default());
        let latency = Arc::new(LatencyProber::new(Box::new(Unreachable), Box::new(Unreachable), 53));

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            Orchestrator::new(p, probe.clone(), latency).run(),
        )
        .await
        .expect("run did not finish")
        .unwrap();

        assert_eq!(outcome, RunOutcome::default());
        let started = probe.started.lock().unwrap();
        assert_eq!(started.len(), 2);
        assert_eq!(started[1].1, "also-hangs");
    }

    #[tokio::test]
    async fn test_cancellation_aborts_run() {
        let p = plan(&["hangs"], &["never"]);
        let probe = Arc::new(SilentProbe::default());
        let latency = Arc::new(LatencyProber::new(Box::new(Unreachable), Box::new(Unreachable), 53));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            Orchestrator::new(p, probe, latency)
                .with_cancellation(cancel.clone())
                .run(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(OrchestratorError::Cancelled)));
    }
}
