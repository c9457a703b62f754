//! Reachability probes.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProbeOutcome {
    pub success: bool,
    pub latency: Option<Duration>,
}

impl ProbeOutcome {
    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn reachable(latency: Option<Duration>) -> Self {
        Self {
            success: true,
            latency,
        }
    }
}

/// Any failure (timeout, unresolvable host, spawn error) is an unreachable
/// outcome, never an error.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, endpoint: &str) -> ProbeOutcome;
}

/// One ICMP echo through the system `ping` binary.
#[derive(Debug, Clone)]
pub struct PingProber {
    timeout: Duration,
}

impl PingProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, endpoint: &str) -> ProbeOutcome {
        let wait_secs = self.timeout.as_secs().max(1);
        let mut cmd = Command::new("ping");
        cmd.arg("-n")
            .arg("-c")
            .arg("1")
            .arg("-W")
            .arg(wait_secs.to_string())
            .arg(endpoint)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // The process gets a small grace period past its own -W bound.
        let limit = self.timeout + Duration::from_secs(1);
        let output = match timeout(limit, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                tracing::warn!(endpoint, error=%err, "failed to run ping");
                return ProbeOutcome::unreachable();
            }
            Err(_) => {
                tracing::debug!(endpoint, "ping timed out");
                return ProbeOutcome::unreachable();
            }
        };

        if !output.status.success() {
            tracing::debug!(endpoint, code = ?output.status.code(), "ping got no reply");
            return ProbeOutcome::unreachable();
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let latency = parse_ping_latency(&stdout);
        if latency.is_some_and(|rtt| rtt > self.timeout) {
            return ProbeOutcome::unreachable();
        }
        ProbeOutcome::reachable(latency)
    }
}

/// Extracts the round trip from a reply line such as
/// `64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=23.4 ms`.
pub fn parse_ping_latency(output: &str) -> Option<Duration> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once("time=")?;
        let value = rest.split_whitespace().next()?;
        let ms = value.trim_end_matches("ms").parse::<f64>().ok()?;
        if !ms.is_finite() || ms < 0.0 {
            return None;
        }
        Some(Duration::from_nanos((ms * 1_000_000.0).round() as u64))
    })
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct FixedProber {
        outcomes: HashMap<String, ProbeOutcome>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl FixedProber {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(mut self, endpoint: &str, outcome: ProbeOutcome) -> Self {
            self.outcomes.insert(endpoint.to_string(), outcome);
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, endpoint: &str) -> ProbeOutcome {
            self.calls.lock().unwrap().push(endpoint.to_string());
            self.outcomes.get(endpoint).copied().unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_linux_ping_output() {
        let out = "PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.\n\
                   64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=23.4 ms\n\n\
                   --- 8.8.8.8 ping statistics ---\n";
        assert_eq!(parse_ping_latency(out), Some(Duration::from_micros(23_400)));
    }

    #[test]
    fn parses_busybox_style_output() {
        let out = "64 bytes from 10.0.0.1: seq=0 ttl=64 time=0.512 ms";
        assert_eq!(parse_ping_latency(out), Some(Duration::from_micros(512)));
    }

    #[test]
    fn missing_time_field_is_none() {
        assert_eq!(parse_ping_latency("1 packets transmitted, 0 received"), None);
        assert_eq!(parse_ping_latency("time=abc ms"), None);
    }

    #[tokio::test]
    async fn unresolvable_host_is_unreachable() {
        let prober = PingProber::new(Duration::from_secs(1));
        let outcome = prober.probe("host.invalid").await;
        assert_eq!(outcome, ProbeOutcome::unreachable());
    }
}
