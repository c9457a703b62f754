use crate::error::{MonitorError, MonitorResult};
use crate::modem::{is_ok, ModemTransport};
use std::time::Duration;

const CMD_ECHO: &str = "AT";
const CMD_RADIO_ON: &str = "AT+CFUN=1";
const CMD_RADIO_OFF: &str = "AT+CFUN=0";
const CMD_SIM_STATUS: &str = "AT+CPIN?";
const CMD_ATTACH_STATUS: &str = "AT+CGATT?";
const CMD_ATTACH: &str = "AT+CGATT=1";

/// Step of the bring-up sequence, used to label failures in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStep {
    RadioOn,
    Sim,
    AttachQuery,
    Attach,
}

impl LinkStep {
    fn as_str(self) -> &'static str {
        match self {
            LinkStep::RadioOn => "radio_on",
            LinkStep::Sim => "sim",
            LinkStep::AttachQuery => "attach_query",
            LinkStep::Attach => "attach",
        }
    }
}

/// Owns the modem and drives radio on / SIM check / packet attach / radio off.
pub struct LinkController<M> {
    modem: M,
    settle: Duration,
}

impl<M: ModemTransport> LinkController<M> {
    pub fn new(modem: M, settle: Duration) -> Self {
        Self { modem, settle }
    }

    /// Shared access for components that query the modem while the link is up.
    pub fn modem(&mut self) -> &mut M {
        &mut self.modem
    }

    /// Brings the link up. Every step is verified; the first failure ends
    /// the attempt and is logged with its step name. A radio that was
    /// switched on before the failure is switched off again.
    pub async fn connect(&mut self) -> bool {
        match self.bring_up().await {
            Ok(()) => {
                tracing::info!("cellular link up");
                true
            }
            Err((step, err)) => {
                tracing::warn!(step = step.as_str(), error = %err, "cellular link bring-up failed");
                if step != LinkStep::RadioOn {
                    self.disconnect().await;
                }
                false
            }
        }
    }

    /// Best effort; never fails the caller.
    pub async fn disconnect(&mut self) {
        match self.modem.send(CMD_RADIO_OFF).await {
            Ok(response) if is_ok(&response) => tracing::debug!("radio deactivated"),
            Ok(response) => {
                tracing::warn!(response = %response.trim(), "radio deactivate not acknowledged")
            }
            Err(err) => tracing::warn!(error = %err, "radio deactivate failed"),
        }
    }

    /// `AT` echo test used by the watchdog.
    pub async fn check_alive(&mut self) -> bool {
        match self.modem.send(CMD_ECHO).await {
            Ok(response) => is_ok(&response),
            Err(err) => {
                tracing::warn!(error = %err, "modem liveness check failed");
                false
            }
        }
    }

    async fn bring_up(&mut self) -> Result<(), (LinkStep, MonitorError)> {
        self.expect_ok(CMD_RADIO_ON)
            .await
            .map_err(|err| (LinkStep::RadioOn, err))?;

        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        let sim = self
            .modem
            .send(CMD_SIM_STATUS)
            .await
            .map_err(|err| (LinkStep::Sim, err))?;
        if !sim_ready(&sim) {
            return Err((
                LinkStep::Sim,
                MonitorError::parse("sim status", sim.trim().to_string()),
            ));
        }

        let attach = self
            .modem
            .send(CMD_ATTACH_STATUS)
            .await
            .map_err(|err| (LinkStep::AttachQuery, err))?;
        match attach_state(&attach) {
            Some(true) => Ok(()),
            Some(false) => {
                tracing::debug!("packet context not attached; attaching");
                self.expect_ok(CMD_ATTACH)
                    .await
                    .map_err(|err| (LinkStep::Attach, err))
            }
            None => Err((
                LinkStep::AttachQuery,
                MonitorError::parse("attach status", attach.trim().to_string()),
            )),
        }
    }

    async fn expect_ok(&mut self, command: &'static str) -> MonitorResult<()> {
        let response = self.modem.send(command).await?;
        if is_ok(&response) {
            Ok(())
        } else {
            Err(MonitorError::parse("acknowledgement", format!("{command}: {}", response.trim())))
        }
    }
}

fn sim_ready(response: &str) -> bool {
    response
        .lines()
        .filter_map(|line| line.trim().strip_prefix("+CPIN:"))
        .any(|status| status.trim() == "READY")
}

/// `+CGATT: 1` → attached, `+CGATT: 0` → detached, anything else unknown.
fn attach_state(response: &str) -> Option<bool> {
    let value = response
        .lines()
        .find_map(|line| line.trim().strip_prefix("+CGATT:"))?;
    match value.trim() {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}
