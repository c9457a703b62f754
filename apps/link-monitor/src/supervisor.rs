use crate::config::Config;
use crate::cycle::PollingCycle;
use crate::error::{MonitorError, MonitorResult};
use crate::modem::ModemTransport;
use crate::probe::Prober;
use crate::publish::{BrokerConnector, Publisher};
use crate::sample::{RadioSample, StatusSample};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;

/// Counts consecutive failed liveness checks.
#[derive(Debug, Clone)]
pub struct Watchdog {
    threshold: u32,
    failures: u32,
}

impl Watchdog {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records one check. Returns true exactly when the threshold is
    /// reached; the count starts over afterwards.
    pub fn record(&mut self, alive: bool) -> bool {
        if alive {
            self.failures = 0;
            return false;
        }
        self.failures += 1;
        if self.failures >= self.threshold {
            self.failures = 0;
            return true;
        }
        false
    }
}

/// Remainder of `period` after `elapsed`, never negative.
pub fn remaining_sleep(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

pub struct Supervisor<M, P, C> {
    cycle: PollingCycle<M, P>,
    publisher: Publisher<C>,
    watchdog: Watchdog,
    restart_command: Vec<String>,
    status_staging: PathBuf,
    radio_staging: PathBuf,
    status_topic: String,
    radio_topic: String,
    poll_interval: Duration,
    publish_interval: Duration,
    last_publish: Instant,
}

impl<M: ModemTransport, P: Prober, C: BrokerConnector> Supervisor<M, P, C> {
    pub fn new(config: &Config, cycle: PollingCycle<M, P>, publisher: Publisher<C>) -> Self {
        Self {
            cycle,
            publisher,
            watchdog: Watchdog::new(config.watchdog_failures),
            restart_command: config.restart_command.clone(),
            status_staging: config.status_staging_dir.clone(),
            radio_staging: config.radio_staging_dir.clone(),
            status_topic: config.status_topic.clone(),
            radio_topic: config.radio_topic.clone(),
            poll_interval: config.poll_interval,
            publish_interval: config.publish_interval,
            last_publish: Instant::now(),
        }
    }

    /// Runs until a fatal error. Each iteration sleeps only what is left
    /// of the poll interval.
    pub async fn run(&mut self) -> MonitorResult<()> {
        tracing::info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            publish_interval_secs = self.publish_interval.as_secs(),
            "supervisor started"
        );
        loop {
            let started = Instant::now();
            self.iterate(started).await?;
            let pause = remaining_sleep(self.poll_interval, started.elapsed());
            if pause.is_zero() {
                tracing::warn!(elapsed_ms = started.elapsed().as_millis() as u64, "poll overran its interval");
            }
            tokio::time::sleep(pause).await;
        }
    }

    /// One iteration: watchdog, poll, a publish attempt when due, link down.
    pub async fn iterate(&mut self, started: Instant) -> MonitorResult<()> {
        let alive = self.cycle.check_alive().await;
        if self.watchdog.record(alive) {
            tracing::error!(command = ?self.restart_command, "modem unresponsive; issuing restart");
            run_restart(&self.restart_command).await?;
        } else if !alive {
            tracing::warn!(failures = self.watchdog.failures(), "modem liveness check failed");
        }

        let outcome = self.cycle.poll().await;

        // The broker is only reachable over the cellular link, so a due
        // publish drains staging before the link is torn down.
        if started.saturating_duration_since(self.last_publish) >= self.publish_interval {
            if outcome.link_up {
                self.publish_staged(started).await;
            } else {
                tracing::warn!("publish due but link is down; deferring to next poll");
            }
        }

        if outcome.link_up {
            self.cycle.teardown().await;
        }
        Ok(())
    }

    async fn publish_staged(&mut self, started: Instant) {
        let status_ok = self
            .publisher
            .publish::<StatusSample>(&self.status_staging, &self.status_topic)
            .await;
        let radio_ok = self
            .publisher
            .publish::<RadioSample>(&self.radio_staging, &self.radio_topic)
            .await;
        tracing::info!(status = status_ok, radio = radio_ok, "publish attempt finished");
        if status_ok {
            self.last_publish = started;
        }
    }
}

/// Runs the corrective restart command. Failing to run it is fatal so the
/// service manager gets to restart the process instead.
pub async fn run_restart(command: &[String]) -> MonitorResult<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| MonitorError::Fatal("restart command is empty".to_string()))?;
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|err| MonitorError::Fatal(format!("failed to run {program}: {err}")))?;
    if !status.success() {
        return Err(MonitorError::Fatal(format!(
            "restart command {program} exited with {status}"
        )));
    }
    Ok(())
}
