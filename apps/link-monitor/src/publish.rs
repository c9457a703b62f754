//! Drains a staging root to the broker.
//!
//! A batch is every sample currently staged (optionally only the trailing
//! window). Files are removed only after the broker has acknowledged every
//! message of the batch; a single failure leaves the whole batch staged
//! for the next attempt.

use crate::config::Config;
use crate::error::{MonitorError, MonitorResult};
use crate::sample::Sample;
use crate::store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::path::Path;
use std::time::Duration;
use tokio::time::timeout;

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    type Session: BrokerSession;

    async fn connect(&self) -> MonitorResult<Self::Session>;
}

#[async_trait]
pub trait BrokerSession: Send {
    /// Returns once the broker acknowledged the message.
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> MonitorResult<()>;

    async fn disconnect(&mut self);
}

pub struct Publisher<C> {
    connector: C,
    window: Option<Duration>,
}

impl<C: BrokerConnector> Publisher<C> {
    pub fn new(connector: C, window: Option<Duration>) -> Self {
        Self { connector, window }
    }

    /// Publishes the staged samples of kind `S` under `root` to `topic`.
    /// Returns true only if every sample was acknowledged and removed.
    pub async fn publish<S: Sample>(&self, root: &Path, topic: &str) -> bool {
        let mut batch = match store::list::<S>(root) {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!(root=%root.display(), error=%err, "failed to list staged samples");
                return false;
            }
        };

        if let Some(cutoff) = self.window.and_then(|window| window_cutoff(Utc::now(), window)) {
            batch.retain(|(sample, _)| sample.timestamp() >= cutoff);
        }

        let mut session = match self.connector.connect().await {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(topic, error=%err, pending = batch.len(), "broker unreachable; keeping staged samples");
                return false;
            }
        };

        let delivered = deliver(&mut session, topic, &batch).await;
        let committed = match delivered {
            Ok(()) => {
                let paths: Vec<_> = batch.iter().map(|(_, path)| path.clone()).collect();
                match store::remove_all(&paths) {
                    Ok(()) => {
                        tracing::info!(topic, published = batch.len(), "staged samples published and removed");
                        true
                    }
                    Err(err) => {
                        // Delivered but still staged: they will be sent again.
                        tracing::error!(topic, error=%err, "failed to remove published samples");
                        false
                    }
                }
            }
            Err(err) => {
                tracing::error!(topic, error=%err, pending = batch.len(), "publish batch failed; samples kept for retry");
                false
            }
        };

        session.disconnect().await;
        tracing::debug!(topic, "broker session closed");
        committed
    }
}

/// Oldest timestamp inside `window`. A window reaching past the
/// representable range covers everything, so no cutoff applies.
fn window_cutoff(now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    let span = chrono::Duration::from_std(window).ok()?;
    now.checked_sub_signed(span)
}

async fn deliver<S: Sample, B: BrokerSession>(
    session: &mut B,
    topic: &str,
    batch: &[(S, std::path::PathBuf)],
) -> MonitorResult<()> {
    for (sample, path) in batch {
        let payload =
            serde_json::to_vec(sample).map_err(|err| MonitorError::parse("sample", err))?;
        // The whole batch is resent next time, so stop at the first miss.
        session.publish(topic, payload).await.map_err(|err| {
            tracing::warn!(path=%path.display(), error=%err, "sample not acknowledged");
            err
        })?;
    }
    Ok(())
}

/// MQTT broker reached through `rumqttc`, one session per drain.
pub struct MqttConnector {
    host: String,
    port: u16,
    client_id: String,
    username: Option<String>,
    password: Option<String>,
    keepalive: Duration,
    ack_timeout: Duration,
}

impl MqttConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            client_id: config.mqtt_client_id.clone(),
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            keepalive: config.mqtt_keepalive,
            ack_timeout: config.mqtt_ack_timeout,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keepalive);
        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }
}

pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    ack_timeout: Duration,
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    type Session = MqttSession;

    async fn connect(&self) -> MonitorResult<MqttSession> {
        let (client, mut eventloop) = AsyncClient::new(self.options(), 16);

        let connack = timeout(self.ack_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => return Ok(ack),
                    Ok(_) => {}
                    Err(err) => return Err(err),
                }
            }
        })
        .await;

        match connack {
            Ok(Ok(ack)) if ack.code == ConnectReturnCode::Success => {
                tracing::debug!(host=%self.host, port=self.port, "MQTT connected");
                Ok(MqttSession {
                    client,
                    eventloop,
                    ack_timeout: self.ack_timeout,
                })
            }
            Ok(Ok(ack)) => Err(MonitorError::transient(
                "broker connect",
                format!("refused: {:?}", ack.code),
            )),
            Ok(Err(err)) => Err(MonitorError::transient("broker connect", err)),
            Err(_) => Err(MonitorError::transient("broker connect", "no CONNACK before timeout")),
        }
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> MonitorResult<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| MonitorError::transient("publish", err))?;

        let eventloop = &mut self.eventloop;
        let acked = timeout(self.ack_timeout, async {
            let mut pkid = None;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Publish(id))) => pkid = Some(id),
                    Ok(Event::Incoming(Incoming::PubAck(ack))) if pkid == Some(ack.pkid) => {
                        return Ok(())
                    }
                    Ok(_) => {}
                    Err(err) => return Err(err),
                }
            }
        })
        .await;

        match acked {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(MonitorError::transient("publish ack", err)),
            Err(_) => Err(MonitorError::transient("publish ack", "no PUBACK before timeout")),
        }
    }

    async fn disconnect(&mut self) {
        if let Err(err) = self.client.disconnect().await {
            tracing::debug!(error=%err, "MQTT disconnect request failed");
            return;
        }
        let eventloop = &mut self.eventloop;
        let _ = timeout(DISCONNECT_GRACE, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeBroker;
    use super::*;
    use crate::sample::{RadioMetrics, RadioSample, StatusSample};
    use chrono::{DateTime, SubsecRound};
    use tempfile::TempDir;

    fn staged(dir: &Path, minutes_ago: i64) -> std::path::PathBuf {
        let ts: DateTime<Utc> = (Utc::now() - chrono::Duration::minutes(minutes_ago)).trunc_subsecs(0);
        store::save(&StatusSample::new(ts, true, true, false), dir).unwrap()
    }

    #[tokio::test]
    async fn partial_ack_keeps_every_file() {
        let dir = TempDir::new().unwrap();
        let files: Vec<_> = (1..=3).map(|m| staged(dir.path(), m)).collect();
        let broker = FakeBroker::acking(2);
        let publisher = Publisher::new(broker.clone(), None);

        assert!(!publisher.publish::<StatusSample>(dir.path(), "devices/x/data").await);
        assert!(files.iter().all(|f| f.exists()));
        let log = broker.log.lock().unwrap();
        assert_eq!(log.delivered.len(), 2);
        assert_eq!(log.disconnects, 1);
    }

    #[tokio::test]
    async fn empty_staging_connects_and_succeeds() {
        let dir = TempDir::new().unwrap();
        let broker = FakeBroker::default();
        let publisher = Publisher::new(broker.clone(), None);

        assert!(publisher.publish::<StatusSample>(dir.path(), "devices/x/data").await);
        let log = broker.log.lock().unwrap();
        assert_eq!(log.connects, 1);
        assert_eq!(log.disconnects, 1);
        assert!(log.delivered.is_empty());
    }

    #[tokio::test]
    async fn unreachable_broker_deletes_nothing() {
        let dir = TempDir::new().unwrap();
        let file = staged(dir.path(), 1);
        let publisher = Publisher::new(FakeBroker::unreachable(), None);

        assert!(!publisher.publish::<StatusSample>(dir.path(), "devices/x/data").await);
        assert!(file.exists());
    }

    #[tokio::test]
    async fn full_ack_removes_files_and_sends_in_order() {
        let dir = TempDir::new().unwrap();
        let files: Vec<_> = [5, 3, 1].iter().map(|m| staged(dir.path(), *m)).collect();
        let broker = FakeBroker::default();
        let publisher = Publisher::new(broker.clone(), None);

        assert!(publisher.publish::<StatusSample>(dir.path(), "devices/x/data").await);
        assert!(files.iter().all(|f| !f.exists()));

        let log = broker.log.lock().unwrap();
        let sent: Vec<StatusSample> = log
            .delivered
            .iter()
            .map(|(topic, body)| {
                assert_eq!(topic, "devices/x/data");
                serde_json::from_slice(body).unwrap()
            })
            .collect();
        assert_eq!(sent.len(), 3);
        assert!(sent.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn payload_matches_file_body() {
        let dir = TempDir::new().unwrap();
        let ts = Utc::now().trunc_subsecs(0);
        let sample = RadioSample::new(
            ts,
            RadioMetrics {
                rsrq: -12.0,
                rsrp: -101.0,
                rssi: -70.0,
                snr: 4.5,
            },
            Some(Duration::from_millis(80)),
            None,
        );
        let path = store::save(&sample, dir.path()).unwrap();
        let body = std::fs::read(&path).unwrap();
        let broker = FakeBroker::default();
        let publisher = Publisher::new(broker.clone(), None);

        assert!(publisher.publish::<RadioSample>(dir.path(), "devices/x/radio").await);
        assert_eq!(broker.log.lock().unwrap().delivered[0].1, body);
    }

    #[tokio::test]
    async fn window_limits_batch_and_leaves_older_files() {
        let dir = TempDir::new().unwrap();
        let old = staged(dir.path(), 120);
        let recent = staged(dir.path(), 2);
        let broker = FakeBroker::default();
        let publisher = Publisher::new(broker.clone(), Some(Duration::from_secs(30 * 60)));

        assert!(publisher.publish::<StatusSample>(dir.path(), "devices/x/data").await);
        assert!(old.exists());
        assert!(!recent.exists());
        assert_eq!(broker.log.lock().unwrap().delivered.len(), 1);
    }

    #[test]
    fn oversized_window_has_no_cutoff() {
        let now = Utc::now();
        assert_eq!(window_cutoff(now, Duration::from_secs(u64::MAX)), None);
        assert_eq!(
            window_cutoff(now, Duration::from_secs(60)),
            Some(now - chrono::Duration::seconds(60))
        );
    }

    #[tokio::test]
    async fn oversized_window_drains_everything() {
        let dir = TempDir::new().unwrap();
        let files: Vec<_> = [600, 5].iter().map(|m| staged(dir.path(), *m)).collect();
        let broker = FakeBroker::default();
        let publisher = Publisher::new(broker.clone(), Some(Duration::from_secs(u64::MAX)));

        assert!(publisher.publish::<StatusSample>(dir.path(), "devices/x/data").await);
        assert!(files.iter().all(|f| !f.exists()));
        assert_eq!(broker.log.lock().unwrap().delivered.len(), 2);
    }

    #[tokio::test]
    async fn missing_root_is_a_failed_attempt() {
        let dir = TempDir::new().unwrap();
        let broker = FakeBroker::default();
        let publisher = Publisher::new(broker.clone(), None);
        assert!(!publisher.publish::<StatusSample>(&dir.path().join("gone"), "t").await);
        assert_eq!(broker.log.lock().unwrap().connects, 0);
    }
}
