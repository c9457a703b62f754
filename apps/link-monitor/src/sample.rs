use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A reading that can be spooled as one file and published as one message.
pub trait Sample: Serialize + DeserializeOwned {
    /// File name prefix; one prefix per storage root.
    const PREFIX: &'static str;

    fn timestamp(&self) -> DateTime<Utc>;
}

/// Sample timestamps carry whole seconds only, matching the file name codec.
pub fn sample_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSample {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "lu")]
    pub link_up: u8,
    #[serde(rename = "pg")]
    pub reachable_primary: u8,
    #[serde(rename = "po")]
    pub reachable_secondary: u8,
}

impl StatusSample {
    pub fn new(
        timestamp: DateTime<Utc>,
        link_up: bool,
        reachable_primary: bool,
        reachable_secondary: bool,
    ) -> Self {
        // No probe runs without a link, so reachability cannot outlive it.
        Self {
            timestamp,
            link_up: link_up as u8,
            reachable_primary: (link_up && reachable_primary) as u8,
            reachable_secondary: (link_up && reachable_secondary) as u8,
        }
    }

    pub fn link_failed(timestamp: DateTime<Utc>) -> Self {
        Self::new(timestamp, false, false, false)
    }
}

impl Sample for StatusSample {
    const PREFIX: &'static str = "status";

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Signal quality as reported by the modem's serving-cell query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadioMetrics {
    pub rsrq: f64,
    pub rsrp: f64,
    pub rssi: f64,
    pub snr: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioSample {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub metrics: RadioMetrics,
    pub latency_primary_ms: Option<f64>,
    pub latency_secondary_ms: Option<f64>,
}

impl RadioSample {
    pub fn new(
        timestamp: DateTime<Utc>,
        metrics: RadioMetrics,
        latency_primary: Option<Duration>,
        latency_secondary: Option<Duration>,
    ) -> Self {
        Self {
            timestamp,
            metrics,
            latency_primary_ms: latency_primary.map(duration_ms),
            latency_secondary_ms: latency_secondary.map(duration_ms),
        }
    }
}

impl Sample for RadioSample {
    const PREFIX: &'static str = "radio_status";

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

fn duration_ms(value: Duration) -> f64 {
    // Microsecond resolution keeps the JSON short and still below ping's own precision.
    (value.as_micros() as f64) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 9, 4, 0).unwrap()
    }

    #[test]
    fn link_down_forces_reachability_to_zero() {
        let sample = StatusSample::new(ts(), false, true, true);
        assert_eq!(sample.link_up, 0);
        assert_eq!(sample.reachable_primary, 0);
        assert_eq!(sample.reachable_secondary, 0);
        assert_eq!(sample, StatusSample::link_failed(ts()));
    }

    #[test]
    fn status_uses_compact_wire_keys() {
        let sample = StatusSample::new(ts(), true, true, false);
        let value = serde_json::to_value(&sample).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"ts": "2026-10-16T09:04:00Z", "lu": 1, "pg": 1, "po": 0})
        );
    }

    #[test]
    fn radio_serializes_flat_with_nullable_latency() {
        let metrics = RadioMetrics {
            rsrq: -11.0,
            rsrp: -95.0,
            rssi: -65.0,
            snr: 12.0,
        };
        let sample = RadioSample::new(ts(), metrics, Some(Duration::from_micros(48_250)), None);
        let value = serde_json::to_value(&sample).unwrap();
        assert_eq!(value["rsrp"], -95.0);
        assert_eq!(value["latency_primary_ms"], 48.25);
        assert!(value["latency_secondary_ms"].is_null());
    }

    #[test]
    fn sample_now_has_no_subseconds() {
        assert_eq!(sample_now().timestamp_subsec_nanos(), 0);
    }
}
