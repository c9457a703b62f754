use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub device_id: String,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive: Duration,
    pub mqtt_ack_timeout: Duration,
    pub status_topic: String,
    pub radio_topic: String,

    pub primary_host: String,

    pub status_log_dir: PathBuf,
    pub status_staging_dir: PathBuf,
    pub radio_log_dir: PathBuf,
    pub radio_staging_dir: PathBuf,

    pub modem_device: String,
    pub modem_baud: u32,
    pub modem_timeout: Duration,
    pub settle_interval: Duration,
    pub radio_command: String,
    pub signal_command: Option<String>,

    pub probe_timeout: Duration,
    pub poll_interval: Duration,
    pub publish_interval: Duration,
    pub publish_window: Option<Duration>,
    pub retention_days: u32,

    pub watchdog_failures: u32,
    pub restart_command: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // A missing .env is the normal case on the device.
        let _ = dotenvy::dotenv();

        let device_id = env_string("LINK_MONITOR_DEVICE_ID", Some("unknown-device".to_string()))?;
        let mqtt_url = env_string(
            "LINK_MONITOR_MQTT_URL",
            Some("mqtt://127.0.0.1:1883".to_string()),
        )?;
        let mqtt_username = env_optional("LINK_MONITOR_MQTT_USERNAME");
        let mqtt_password = env_optional("LINK_MONITOR_MQTT_PASSWORD");

        let url = Url::parse(&mqtt_url).context("invalid LINK_MONITOR_MQTT_URL")?;
        let mqtt_host = url
            .host_str()
            .ok_or_else(|| anyhow!("LINK_MONITOR_MQTT_URL missing host"))?
            .to_string();
        let mqtt_port = url.port().unwrap_or(1883);

        let mqtt_client_id = env_string(
            "LINK_MONITOR_MQTT_CLIENT_ID",
            Some(format!("link-monitor-{}", device_id)),
        )?;
        let mqtt_keepalive =
            Duration::from_secs(env_u64("LINK_MONITOR_MQTT_KEEPALIVE_SECS", Some(60))?);
        let mqtt_ack_timeout =
            Duration::from_secs(env_u64("LINK_MONITOR_MQTT_ACK_TIMEOUT_SECS", Some(10))?);

        let status_topic = env_string(
            "LINK_MONITOR_TOPIC",
            Some(format!("devices/{}/data", device_id)),
        )?;
        let radio_topic = env_string(
            "LINK_MONITOR_RADIO_TOPIC",
            Some(format!("devices/{}/radio", device_id)),
        )?;

        let primary_host = env_string("LINK_MONITOR_PRIMARY_HOST", Some("8.8.8.8".to_string()))?;

        let data_dir = PathBuf::from(env_string("LINK_MONITOR_DATA_DIR", Some("data".to_string()))?);

        let modem_device = env_string("LINK_MONITOR_MODEM_DEVICE", Some("/dev/ttyUSB2".to_string()))?;
        let modem_baud = u32::try_from(env_u64("LINK_MONITOR_MODEM_BAUD", Some(115_200))?)
            .context("invalid LINK_MONITOR_MODEM_BAUD")?;
        let modem_timeout =
            Duration::from_secs(env_u64("LINK_MONITOR_MODEM_TIMEOUT_SECS", Some(5))?);
        let settle_interval = Duration::from_secs(env_u64("LINK_MONITOR_SETTLE_SECS", Some(5))?);
        let radio_command = env_string(
            "LINK_MONITOR_RADIO_COMMAND",
            Some("AT+QENG=\"servingcell\"".to_string()),
        )?;
        let signal_command = env_optional("LINK_MONITOR_SIGNAL_COMMAND");

        let probe_timeout =
            Duration::from_secs(env_u64("LINK_MONITOR_PROBE_TIMEOUT_SECS", Some(5))?);
        let poll_interval =
            Duration::from_secs(env_u64("LINK_MONITOR_POLL_INTERVAL_SECS", Some(60))?);
        let publish_interval =
            Duration::from_secs(env_u64("LINK_MONITOR_PUBLISH_INTERVAL_SECS", Some(300))?);

        let publish_window = match env_optional("LINK_MONITOR_PUBLISH_WINDOW_SECS") {
            Some(raw) => {
                let secs = raw
                    .parse::<u64>()
                    .context("invalid LINK_MONITOR_PUBLISH_WINDOW_SECS")?;
                Some(Duration::from_secs(secs))
            }
            None => None,
        };

        let retention_days = u32::try_from(env_u64("LINK_MONITOR_RETENTION_DAYS", Some(7))?)
            .context("invalid LINK_MONITOR_RETENTION_DAYS")?;
        let watchdog_failures =
            u32::try_from(env_u64("LINK_MONITOR_WATCHDOG_FAILURES", Some(3))?)
                .context("invalid LINK_MONITOR_WATCHDOG_FAILURES")?;

        let restart_command = split_command(&env_string(
            "LINK_MONITOR_RESTART_COMMAND",
            Some("sudo reboot".to_string()),
        )?);
        if restart_command.is_empty() {
            return Err(anyhow!("LINK_MONITOR_RESTART_COMMAND is empty"));
        }

        Ok(Self {
            device_id,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_keepalive,
            mqtt_ack_timeout,
            status_topic,
            radio_topic,
            primary_host,
            status_log_dir: data_dir.join("network_log"),
            status_staging_dir: data_dir.join("mqtt_network_data"),
            radio_log_dir: data_dir.join("radio_log"),
            radio_staging_dir: data_dir.join("mqtt_radio_data"),
            modem_device,
            modem_baud,
            modem_timeout,
            settle_interval,
            radio_command,
            signal_command,
            probe_timeout,
            poll_interval,
            publish_interval,
            publish_window,
            retention_days,
            watchdog_failures,
            restart_command,
        })
    }

    /// Every storage root, in the order they are bootstrapped and pruned.
    pub fn storage_roots(&self) -> [&PathBuf; 4] {
        [
            &self.status_log_dir,
            &self.status_staging_dir,
            &self.radio_log_dir,
            &self.radio_staging_dir,
        ]
    }
}

fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
pub(crate) fn test_config(data_dir: &std::path::Path) -> Config {
    Config {
        device_id: "8988228066605205172".to_string(),
        mqtt_host: "127.0.0.1".to_string(),
        mqtt_port: 1883,
        mqtt_username: None,
        mqtt_password: None,
        mqtt_client_id: "link-monitor-test".to_string(),
        mqtt_keepalive: Duration::from_secs(60),
        mqtt_ack_timeout: Duration::from_secs(1),
        status_topic: "devices/test/data".to_string(),
        radio_topic: "devices/test/radio".to_string(),
        primary_host: "8.8.8.8".to_string(),
        status_log_dir: data_dir.join("network_log"),
        status_staging_dir: data_dir.join("mqtt_network_data"),
        radio_log_dir: data_dir.join("radio_log"),
        radio_staging_dir: data_dir.join("mqtt_radio_data"),
        modem_device: "/dev/null".to_string(),
        modem_baud: 115_200,
        modem_timeout: Duration::from_secs(1),
        settle_interval: Duration::from_millis(0),
        radio_command: "AT+QENG=\"servingcell\"".to_string(),
        signal_command: None,
        probe_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_secs(60),
        publish_interval: Duration::from_secs(300),
        publish_window: None,
        retention_days: 7,
        watchdog_failures: 3,
        restart_command: vec!["true".to_string()],
    }
}
