use crate::config::Config;
use crate::link::LinkController;
use crate::modem::ModemTransport;
use crate::probe::{ProbeOutcome, Prober};
use crate::radio::RadioReader;
use crate::sample::{sample_now, RadioSample, Sample, StatusSample};
use crate::store;
use std::path::{Path, PathBuf};

/// Log root and staging root for one sample kind.
#[derive(Debug, Clone)]
pub struct RootPair {
    pub log: PathBuf,
    pub staging: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub link_up: bool,
    pub status: StatusSample,
    pub radio: Option<RadioSample>,
}

/// One poll: link up, probe, radio read, persist, prune; link down on `teardown`.
pub struct PollingCycle<M, P> {
    link: LinkController<M>,
    prober: P,
    radio: RadioReader,
    primary_host: String,
    secondary_host: String,
    status_roots: RootPair,
    radio_roots: RootPair,
    retention_days: u32,
}

impl<M: ModemTransport, P: Prober> PollingCycle<M, P> {
    pub fn new(config: &Config, link: LinkController<M>, prober: P, radio: RadioReader) -> Self {
        Self {
            link,
            prober,
            radio,
            primary_host: config.primary_host.clone(),
            secondary_host: config.mqtt_host.clone(),
            status_roots: RootPair {
                log: config.status_log_dir.clone(),
                staging: config.status_staging_dir.clone(),
            },
            radio_roots: RootPair {
                log: config.radio_log_dir.clone(),
                staging: config.radio_staging_dir.clone(),
            },
            retention_days: config.retention_days,
        }
    }

    pub async fn check_alive(&mut self) -> bool {
        self.link.check_alive().await
    }

    /// Link up, measure, persist, prune. A link that came up is left up so
    /// the caller can use it before `teardown`.
    pub async fn poll(&mut self) -> CycleOutcome {
        let timestamp = sample_now();

        let outcome = if self.link.connect().await {
            self.measure(timestamp).await
        } else {
            CycleOutcome {
                link_up: false,
                status: StatusSample::link_failed(timestamp),
                radio: None,
            }
        };

        tracing::info!(
            ts = %timestamp,
            link_up = outcome.status.link_up,
            reachable_primary = outcome.status.reachable_primary,
            reachable_secondary = outcome.status.reachable_secondary,
            radio = outcome.radio.is_some(),
            "poll complete"
        );

        persist(&outcome.status, &self.status_roots);
        if let Some(radio) = &outcome.radio {
            persist(radio, &self.radio_roots);
        }

        for root in [
            &self.status_roots.log,
            &self.status_roots.staging,
            &self.radio_roots.log,
            &self.radio_roots.staging,
        ] {
            prune_root(root, self.retention_days);
        }

        outcome
    }

    pub async fn teardown(&mut self) {
        self.link.disconnect().await;
    }

    async fn measure(&mut self, timestamp: chrono::DateTime<chrono::Utc>) -> CycleOutcome {
        let primary = self.prober.probe(&self.primary_host).await;
        let secondary = self.prober.probe(&self.secondary_host).await;
        log_probe(&self.primary_host, primary);
        log_probe(&self.secondary_host, secondary);

        // Read on the live link, before teardown.
        let metrics = self.radio.read(self.link.modem()).await;

        CycleOutcome {
            link_up: true,
            status: StatusSample::new(timestamp, true, primary.success, secondary.success),
            radio: metrics
                .map(|m| RadioSample::new(timestamp, m, primary.latency, secondary.latency)),
        }
    }
}

fn log_probe(endpoint: &str, outcome: ProbeOutcome) {
    tracing::debug!(
        endpoint,
        success = outcome.success,
        latency_ms = outcome.latency.map(|d| d.as_secs_f64() * 1000.0),
        "probe"
    );
}

/// Each root is written independently so one full disk does not cost the other copy.
fn persist<S: Sample>(sample: &S, roots: &RootPair) {
    for root in [&roots.log, &roots.staging] {
        if let Err(err) = store::save(sample, root) {
            tracing::error!(prefix = S::PREFIX, root=%root.display(), error=%err, "failed to persist sample");
        }
    }
}

fn prune_root(root: &Path, retention_days: u32) {
    match store::prune(root, retention_days) {
        Ok(report) if report.deleted > 0 || report.unparsed > 0 => {
            tracing::info!(
                root = %root.display(),
                deleted = report.deleted,
                kept = report.kept,
                unparsed = report.unparsed,
                "retention prune"
            );
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(root=%root.display(), error=%err, "retention prune failed"),
    }
}
