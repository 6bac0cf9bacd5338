//! TCP connection probe: time to complete a three-way handshake.

use super::{Measurement, Probe, ProbeType};
use anyhow::Result;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Connect-time probe. Targets are `host:port`.
pub struct TcpProbe;

#[async_trait::async_trait]
impl Probe for TcpProbe {
    async fn run(&self, target: &str, timeout: Duration) -> Result<Measurement> {
        let start = Instant::now();
        let result = tokio::time::timeout(timeout, TcpStream::connect(target)).await;
        let elapsed = start.elapsed();

        match result {
            Ok(Ok(_stream)) => Ok(Measurement::success(
                ProbeType::Tcp,
                target,
                elapsed.as_secs_f64() * 1000.0,
            )),
            Ok(Err(e)) => {
                debug!(%target, error = %e, "TCP connect failed");
                Ok(Measurement::failure(ProbeType::Tcp, target))
            }
            Err(_) => {
                debug!(%target, timeout_ms = timeout.as_millis() as u64, "TCP connect timed out");
                Ok(Measurement::failure(ProbeType::Tcp, target))
            }
        }
    }
}

/// Join a host and port, bracketing bare IPv6 literals.
pub fn target_for(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_target_for() {
        assert_eq!(target_for("8.8.8.8", 53), "8.8.8.8:53");
        assert_eq!(target_for("::1", 80), "[::1]:80");
        assert_eq!(target_for("[::1]", 80), "[::1]:80");
    }

    #[tokio::test]
    async fn test_connect_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let m = TcpProbe
            .run(&addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(m.success);
        assert!(m.value >= 0.0);
        assert_eq!(m.probe_type, ProbeType::Tcp);
    }

    #[tokio::test]
    async fn test_refused_connection_is_failure() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let m = TcpProbe
            .run(&addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!m.success);
        assert_eq!(m.value, -1.0);
    }
}
