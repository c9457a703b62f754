//! AT-command request/response transport.

use crate::error::{MonitorError, MonitorResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

const READ_CHUNK: usize = 512;
const MAX_RESPONSE_BYTES: usize = 16 * 1024;

/// Sends one command line to the modem and returns the raw response text.
#[async_trait]
pub trait ModemTransport: Send {
    async fn send(&mut self, command: &str) -> MonitorResult<String>;
}

/// True when the response ends in a final `OK` result code.
pub fn is_ok(response: &str) -> bool {
    response.lines().any(|line| line.trim() == "OK")
}

fn is_final(response: &str) -> bool {
    response.lines().map(str::trim).any(|line| {
        line == "OK" || line == "ERROR" || line.starts_with("+CME ERROR") || line.starts_with("+CMS ERROR")
    })
}

/// Modem control port opened over a serial device (e.g. `/dev/ttyUSB2`).
pub struct SerialModem {
    device: String,
    baud: u32,
    timeout: Duration,
    port: Option<SerialStream>,
}

impl SerialModem {
    pub fn new(device: impl Into<String>, baud: u32, timeout: Duration) -> Self {
        Self {
            device: device.into(),
            baud,
            timeout,
            port: None,
        }
    }

    fn port(&mut self) -> MonitorResult<&mut SerialStream> {
        if self.port.is_none() {
            let port = tokio_serial::new(&self.device, self.baud)
                .open_native_async()
                .map_err(|err| MonitorError::transient("modem open", format!("{}: {err}", self.device)))?;
            tracing::debug!(device=%self.device, baud=self.baud, "modem port opened");
            self.port = Some(port);
        }
        // Populated above.
        self.port
            .as_mut()
            .ok_or_else(|| MonitorError::transient("modem open", "port unavailable"))
    }

    async fn exchange(&mut self, command: &str) -> MonitorResult<String> {
        let limit = self.timeout;
        let deadline = Instant::now() + limit;
        let port = self.port()?;

        port.write_all(format!("{command}\r").as_bytes())
            .await
            .map_err(|err| MonitorError::transient("modem write", err))?;

        let mut raw = Vec::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = match timeout_at(deadline, port.read(&mut buf)).await {
                Ok(Ok(0)) => return Err(MonitorError::transient("modem read", "port closed")),
                Ok(Ok(n)) => n,
                Ok(Err(err)) => return Err(MonitorError::transient("modem read", err)),
                Err(_) => {
                    return Err(MonitorError::transient(
                        "modem read",
                        format!("no final result for {command:?} within {limit:?}"),
                    ))
                }
            };
            raw.extend_from_slice(&buf[..n]);
            if raw.len() > MAX_RESPONSE_BYTES {
                return Err(MonitorError::parse("modem response", "response too large"));
            }
            let text = String::from_utf8_lossy(&raw);
            if is_final(&text) {
                return Ok(text.into_owned());
            }
        }
    }
}

#[async_trait]
impl ModemTransport for SerialModem {
    async fn send(&mut self, command: &str) -> MonitorResult<String> {
        let result = self.exchange(command).await;
        if let Err(err) = &result {
            // A wedged port is reopened on the next command.
            if err.is_transient() {
                self.port = None;
            }
            tracing::debug!(command, error=%err, "modem exchange failed");
        }
        result
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_result_detection() {
        assert!(is_final("AT+CPIN?\r\n+CPIN: READY\r\n\r\nOK\r\n"));
        assert!(is_final("\r\nERROR\r\n"));
        assert!(is_final("\r\n+CME ERROR: 10\r\n"));
        assert!(!is_final("AT+CPIN?\r\n+CPIN: READY\r\n"));
        // "OK" inside an information line is not a result code.
        assert!(!is_final("+COPS: 0,0,\"OK MOBILE\"\r\n"));
    }

    #[test]
    fn ok_requires_a_bare_ok_line() {
        assert!(is_ok("\r\nOK\r\n"));
        assert!(!is_ok("\r\nERROR\r\n"));
        assert!(!is_ok("+CPIN: NOT OK\r\n"));
    }
}
