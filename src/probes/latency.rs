//! Two-tier latency measurement: ICMP reachability first, TCP connect second.
//!
//! ICMP is often dropped by firewalls and NAT boxes while an outbound TCP
//! handshake to a well-known port almost always gets through.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::icmp::IcmpProbe;
use super::tcp::{target_for, TcpProbe};
use super::{Measurement, Probe};
use crate::throughput::report::LATENCY_UNREACHABLE;

/// Round-trip latency, or the fact that nothing answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Latency {
    Measured(u64),
    Unreachable,
}

impl Latency {
    /// Whole milliseconds, or -1 when unreachable.
    pub fn as_millis_or_sentinel(self) -> i64 {
        match self {
            Latency::Measured(ms) => i64::try_from(ms).unwrap_or(i64::MAX),
            Latency::Unreachable => LATENCY_UNREACHABLE,
        }
    }
}

pub struct LatencyProber {
    primary: Box<dyn Probe>,
    fallback: Box<dyn Probe>,
    port: u16,
}

impl LatencyProber {
    pub fn new(primary: Box<dyn Probe>, fallback: Box<dyn Probe>, port: u16) -> Self {
        Self {
            primary,
            fallback,
            port,
        }
    }

    /// System `ping` first, then a TCP connect to `port`.
    pub fn system(port: u16) -> Self {
        Self::new(Box::new(IcmpProbe), Box::new(TcpProbe), port)
    }

    /// Measure latency to `host`. Both tiers get the same `timeout`.
    pub async fn measure(&self, host: &str, timeout: Duration) -> Latency {
        if let Some(ms) = Self::attempt(self.primary.as_ref(), host, timeout, "reachability").await {
            info!(%host, latency_ms = ms, "latency measured via reachability probe");
            return Latency::Measured(ms);
        }

        let target = target_for(host, self.port);
        if let Some(ms) = Self::attempt(self.fallback.as_ref(), &target, timeout, "connect").await {
            info!(%target, latency_ms = ms, "latency measured via TCP connect");
            return Latency::Measured(ms);
        }

        warn!(%host, port = self.port, "latency target unreachable by both probe tiers");
        Latency::Unreachable
    }

    async fn attempt(probe: &dyn Probe, target: &str, timeout: Duration, tier: &str) -> Option<u64> {
        match probe.run(target, timeout).await {
            Ok(m) if m.success && m.value >= 0.0 => Some(to_millis(&m)),
            Ok(_) => {
                debug!(%target, %tier, "latency probe got no answer");
                None
            }
            Err(e) => {
                warn!(%target, %tier, error = %e, "latency probe could not run");
                None
            }
        }
    }
}

fn to_millis(m: &Measurement) -> u64 {
    m.value.round() as u64
}
