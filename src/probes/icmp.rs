use super::{validate_host, Measurement, Probe, ProbeError, ProbeType};
use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Reachability probe: one ICMP echo through the system `ping` binary.
///
/// Avoids needing CAP_NET_RAW in-process. A missing binary surfaces as an
/// error so callers can fall back to another tier.
pub struct IcmpProbe;

#[async_trait::async_trait]
impl Probe for IcmpProbe {
    async fn run(&self, target: &str, timeout: Duration) -> Result<Measurement> {
        validate_host(target)?;

        // -W takes whole seconds on older iputils; the outer bound below
        // enforces the exact timeout.
        let wait_secs = timeout.as_secs_f64().ceil().max(1.0) as u64;

        let mut cmd = tokio::process::Command::new("ping");
        cmd.arg("-c")
            .arg("1")
            .arg("-W")
            .arg(wait_secs.to_string())
            .arg("-q")
            .arg(target)
            .kill_on_drop(true);

        let start = Instant::now();
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(res) => res.map_err(|source| ProbeError::Launch { tool: "ping", source })?,
            Err(_) => {
                debug!(%target, "ping timed out");
                return Ok(Measurement::failure(ProbeType::Icmp, target));
            }
        };
        let wall_ms = start.elapsed().as_secs_f64() * 1000.0;

        if !output.status.success() {
            debug!(%target, code = ?output.status.code(), "ping reported host unreachable");
            return Ok(Measurement::failure(ProbeType::Icmp, target));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let rtt_ms = extract_rtt(&stdout).unwrap_or_else(|| {
            warn!("Ping success but failed to parse RTT for {}", target);
            wall_ms
        });

        Ok(Measurement::success(ProbeType::Icmp, target, rtt_ms))
    }
}

fn extract_rtt(output: &str) -> Option<f64> {
    // "time=12.3 ms"
    if let Some(pos) = output.find("time=") {
        let rest = &output[pos + 5..];
        let end = rest.find(|c: char| c == ' ' || c == 'm').unwrap_or(rest.len());
        if let Ok(v) = rest[..end].parse::<f64>() {
            return Some(v);
        }
    }

    // "rtt min/avg/max/mdev = 14.188/14.188/14.188/0.000 ms"
    if let Some(pos) = output.find(" = ") {
        if output[..pos].contains("rtt") || output[..pos].contains("round-trip") {
            let parts: Vec<&str> = output[pos + 3..].split('/').collect();
            if parts.len() >= 2 {
                return parts[1].trim().parse::<f64>().ok(); // avg
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_rtt_time_field() {
        let out = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=14.2 ms";
        assert_eq!(extract_rtt(out), Some(14.2));
    }

    #[test]
    fn test_extract_rtt_summary_line() {
        let out = "--- 8.8.8.8 ping statistics ---\n\
                   1 packets transmitted, 1 received, 0% packet loss, time 0ms\n\
                   rtt min/avg/max/mdev = 14.188/15.500/16.000/0.000 ms\n";
        // "time 0ms" has no '=' so the summary line wins.
        assert_eq!(extract_rtt(out), Some(15.5));
    }

    #[test]
    fn test_extract_rtt_bsd_summary() {
        let out = "round-trip min/avg/max/stddev = 9.1/9.2/9.3/0.1 ms";
        assert_eq!(extract_rtt(out), Some(9.2));
    }

    #[test]
    fn test_extract_rtt_garbage() {
        assert_eq!(extract_rtt("no numbers here"), None);
    }

    #[tokio::test]
    async fn test_rejects_option_injection() {
        let err = IcmpProbe.run("-f", Duration::from_secs(1)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_sub_second_timeout_is_honoured() {
        // TEST-NET-1 never answers.
        let timeout = Duration::from_millis(200);
        let start = Instant::now();
        let result = IcmpProbe.run("192.0.2.1", timeout).await;
        let elapsed = start.elapsed();

        assert!(elapsed < timeout + Duration::from_millis(150), "took {:?}", elapsed);
        // No ping binary is an error; otherwise a failed measurement.
        if let Ok(m) = result {
            assert!(!m.success);
        }
    }
}
