//! Serving-cell signal quality from the modem's engineering-mode query.
//!
//! The primary response is a positional CSV line, for the LTE layout:
//!
//! ```text
//! +QENG: "servingcell",<state>,"LTE",<duplex>,<mcc>,<mnc>,<cellid>,<pcid>,
//!        <earfcn>,<band>,<ul_bw>,<dl_bw>,<tac>,<rsrp>,<rsrq>,<rssi>,<sinr>,...
//! ```
//!
//! Positions the modem cannot fill are reported as `-`. Those may be
//! recovered from a secondary query answering `key: value unit` lines. Any
//! other deviation in shape drops the reading for the cycle.

use crate::error::{MonitorError, MonitorResult};
use crate::modem::ModemTransport;
use crate::sample::RadioMetrics;
use std::collections::HashMap;

pub const SERVING_CELL_PREFIX: &str = "+QENG:";
pub const MIN_SERVING_CELL_FIELDS: usize = 17;

const RSRP_POS: usize = 13;
const RSRQ_POS: usize = 14;
const RSSI_POS: usize = 15;
const SINR_POS: usize = 16;

#[derive(Debug, Clone)]
pub struct RadioReader {
    command: String,
    signal_command: Option<String>,
}

/// Positional metrics; `None` where the modem printed a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct PartialMetrics {
    rsrp: Option<f64>,
    rsrq: Option<f64>,
    rssi: Option<f64>,
    snr: Option<f64>,
}

impl PartialMetrics {
    fn complete(&self) -> Option<RadioMetrics> {
        Some(RadioMetrics {
            rsrq: self.rsrq?,
            rsrp: self.rsrp?,
            rssi: self.rssi?,
            snr: self.snr?,
        })
    }

    fn fill_from(&mut self, values: &HashMap<String, f64>) {
        let lookup = |keys: &[&str]| keys.iter().find_map(|key| values.get(*key).copied());
        self.rsrp = self.rsrp.or_else(|| lookup(&["rsrp"]));
        self.rsrq = self.rsrq.or_else(|| lookup(&["rsrq"]));
        self.rssi = self.rssi.or_else(|| lookup(&["rssi"]));
        self.snr = self.snr.or_else(|| lookup(&["sinr", "snr"]));
    }
}

impl RadioReader {
    pub fn new(command: impl Into<String>, signal_command: Option<String>) -> Self {
        Self {
            command: command.into(),
            signal_command,
        }
    }

    /// One reading, or `None` if anything about the exchange was off.
    pub async fn read<M: ModemTransport>(&self, modem: &mut M) -> Option<RadioMetrics> {
        match self.try_read(modem).await {
            Ok(metrics) => Some(metrics),
            Err(err) => {
                tracing::warn!(error = %err, "radio metrics unavailable this cycle");
                None
            }
        }
    }

    async fn try_read<M: ModemTransport>(&self, modem: &mut M) -> MonitorResult<RadioMetrics> {
        let response = modem.send(&self.command).await?;
        let mut partial = parse_serving_cell(&response)?;
        if let Some(metrics) = partial.complete() {
            return Ok(metrics);
        }

        let Some(signal_command) = &self.signal_command else {
            return Err(MonitorError::parse(
                "serving cell",
                "metric placeholders and no signal query configured",
            ));
        };
        let signal = modem.send(signal_command).await?;
        partial.fill_from(&parse_key_values(&signal));
        partial
            .complete()
            .ok_or_else(|| MonitorError::parse("signal query", "metrics still missing"))
    }
}

fn parse_serving_cell(response: &str) -> MonitorResult<PartialMetrics> {
    let line = response
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(SERVING_CELL_PREFIX))
        .ok_or_else(|| MonitorError::parse("serving cell", "no +QENG line"))?;

    let fields: Vec<&str> = line
        .split(',')
        .map(|field| field.trim().trim_matches('"'))
        .collect();
    if fields.len() < MIN_SERVING_CELL_FIELDS {
        return Err(MonitorError::parse(
            "serving cell",
            format!("{} fields, need {}", fields.len(), MIN_SERVING_CELL_FIELDS),
        ));
    }

    Ok(PartialMetrics {
        rsrp: metric_field(fields[RSRP_POS])?,
        rsrq: metric_field(fields[RSRQ_POS])?,
        rssi: metric_field(fields[RSSI_POS])?,
        snr: metric_field(fields[SINR_POS])?,
    })
}

/// `-` is a placeholder; anything else must be a finite number.
fn metric_field(raw: &str) -> MonitorResult<Option<f64>> {
    if raw == "-" || raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .map(Some)
        .ok_or_else(|| MonitorError::parse("serving cell field", raw.to_string()))
}

/// Parses `key: value unit` lines into lowercase keys; units are stripped.
pub fn parse_key_values(response: &str) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    for line in response.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(value) = strip_unit(rest) else {
            continue;
        };
        out.insert(key.trim().to_ascii_lowercase(), value);
    }
    out
}

fn strip_unit(raw: &str) -> Option<f64> {
    let token = raw.split_whitespace().next()?;
    let numeric = token.trim_end_matches(|c: char| c.is_ascii_alphabetic() || c == '%');
    numeric.parse::<f64>().ok().filter(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::fake::ScriptedModem;

    const QUERY: &str = "AT+QENG=\"servingcell\"";
    const SIGNAL: &str = "AT+QCSQ";

    const SERVING_CELL: &str = "\r\n+QENG: \"servingcell\",\"NOCONN\",\"LTE\",\"FDD\",440,10,1A2B3C4,123,1850,3,5,5,1234,-95,-11,-65,12,10,-,32\r\n\r\nOK\r\n";
    const SERVING_CELL_NO_SINR: &str = "\r\n+QENG: \"servingcell\",\"NOCONN\",\"LTE\",\"FDD\",440,10,1A2B3C4,123,1850,3,5,5,1234,-95,-11,-65,-,10,-,32\r\n\r\nOK\r\n";

    fn expected() -> RadioMetrics {
        RadioMetrics {
            rsrq: -11.0,
            rsrp: -95.0,
            rssi: -65.0,
            snr: 12.0,
        }
    }

    #[tokio::test]
    async fn reads_positional_metrics() {
        let mut modem = ScriptedModem::new().reply(QUERY, SERVING_CELL);
        let reader = RadioReader::new(QUERY, None);
        assert_eq!(reader.read(&mut modem).await, Some(expected()));
    }

    #[tokio::test]
    async fn missing_prefix_line_yields_none() {
        let mut modem =
            ScriptedModem::new().reply(QUERY, "\r\n+QCSQ: \"LTE\",-65,-95,120,-11\r\n\r\nOK\r\n");
        let reader = RadioReader::new(QUERY, None);
        assert_eq!(reader.read(&mut modem).await, None);

        let mut modem = ScriptedModem::new().reply(QUERY, "\r\nOK\r\n");
        assert_eq!(reader.read(&mut modem).await, None);
    }

    #[tokio::test]
    async fn short_line_yields_none_not_partial() {
        let mut modem =
            ScriptedModem::new().reply(QUERY, "+QENG: \"servingcell\",\"NOCONN\",\"LTE\",-95,-11\r\nOK\r\n");
        let reader = RadioReader::new(QUERY, None);
        assert_eq!(reader.read(&mut modem).await, None);
    }

    #[tokio::test]
    async fn non_numeric_metric_yields_none() {
        let bad = SERVING_CELL.replace("-95", "n/a");
        let mut modem = ScriptedModem::new().reply(QUERY, &bad);
        let reader = RadioReader::new(QUERY, None);
        assert_eq!(reader.read(&mut modem).await, None);
    }

    #[tokio::test]
    async fn non_finite_metric_yields_none() {
        let reader = RadioReader::new(QUERY, None);
        for bad in ["NaN", "inf", "-infinity"] {
            let line = SERVING_CELL.replace(",12,10,", &format!(",{bad},10,"));
            let mut modem = ScriptedModem::new().reply(QUERY, &line);
            assert_eq!(reader.read(&mut modem).await, None, "{bad}");
        }
    }

    #[tokio::test]
    async fn non_finite_signal_value_does_not_fill_placeholder() {
        let mut modem = ScriptedModem::new()
            .reply(QUERY, SERVING_CELL_NO_SINR)
            .reply(SIGNAL, "\r\nSINR: NaN dB\r\n\r\nOK\r\n");
        let reader = RadioReader::new(QUERY, Some(SIGNAL.to_string()));
        assert_eq!(reader.read(&mut modem).await, None);
    }

    #[tokio::test]
    async fn placeholder_filled_from_signal_query() {
        let mut modem = ScriptedModem::new()
            .reply(QUERY, SERVING_CELL_NO_SINR)
            .reply(SIGNAL, "\r\nRSRP: -96 dBm\r\nSINR: 12 dB\r\n\r\nOK\r\n");
        let reader = RadioReader::new(QUERY, Some(SIGNAL.to_string()));
        // Positional values win over the secondary query.
        assert_eq!(reader.read(&mut modem).await, Some(expected()));
        assert_eq!(modem.sent(), vec![QUERY, SIGNAL]);
    }

    #[tokio::test]
    async fn placeholder_without_signal_query_yields_none() {
        let mut modem = ScriptedModem::new().reply(QUERY, SERVING_CELL_NO_SINR);
        let reader = RadioReader::new(QUERY, None);
        assert_eq!(reader.read(&mut modem).await, None);
    }

    #[tokio::test]
    async fn modem_timeout_yields_none() {
        let mut modem = ScriptedModem::new();
        let reader = RadioReader::new(QUERY, None);
        assert_eq!(reader.read(&mut modem).await, None);
    }

    #[test]
    fn key_values_strip_units() {
        let values = parse_key_values("RSRQ: -11dB\r\nRSSI: -65 dBm\r\nSNR: 9.5 dB\r\nOK\r\nnoise");
        assert_eq!(values.get("rsrq"), Some(&-11.0));
        assert_eq!(values.get("rssi"), Some(&-65.0));
        assert_eq!(values.get("snr"), Some(&9.5));
        assert_eq!(values.len(), 3);
    }
}
