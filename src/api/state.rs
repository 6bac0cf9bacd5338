use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::throughput::report::SpeedTestReport;
use crate::throughput::SpeedTest;

#[derive(Clone)]
pub struct AppState {
    pub speed_test: SpeedTest,
    history: Arc<RwLock<VecDeque<SpeedTestReport>>>,
    history_size: usize,
    /// Held for the duration of a run; concurrent runs would skew each other.
    run_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(speed_test: SpeedTest, history_size: usize) -> Self {
        Self {
            speed_test,
            history: Arc::new(RwLock::new(VecDeque::with_capacity(history_size))),
            history_size: history_size.max(1),
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Run a speed test, waiting for any run already in progress.
    pub async fn run_exclusive(&self) -> SpeedTestReport {
        let _guard = self.run_lock.lock().await;
        let report = self.speed_test.run_speed_test().await;
        self.record(report.clone()).await;
        report
    }

    pub async fn record(&self, report: SpeedTestReport) {
        let mut history = self.history.write().await;
        history.push_front(report);
        history.truncate(self.history_size);
    }

    pub async fn latest(&self) -> Option<SpeedTestReport> {
        self.history.read().await.front().cloned()
    }

    /// Newest first.
    pub async fn history(&self) -> Vec<SpeedTestReport> {
        self.history.read().await.iter().cloned().collect()
    }
}
