use crate::aggregate::{
    AggregationPolicy, DEFAULT_MAX_HISTORY_POINTS, DEFAULT_RETENTION, DEFAULT_STATS_WINDOW,
    DEFAULT_UPDATE_INTERVAL,
};
use crate::alert::Thresholds;
use crate::coordinator::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_LEASE_TIMEOUT, DEFAULT_TAKEOVER_POLL_INTERVAL,
};
use crate::ingest::{SourceConfig, SourceKind, DEFAULT_SEED};
use crate::store::DEFAULT_QUOTA_BYTES;
use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_DEMO_SENSOR_COUNT: u32 = 8;
const DEFAULT_HTTP_BIND: &str = "127.0.0.1:9120";
const DEFAULT_TOPIC_PREFIX: &str = "smoke";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastMode {
    Mqtt,
    Local,
    Off,
}

impl FromStr for BroadcastMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(Self::Mqtt),
            "local" => Ok(Self::Local),
            "off" | "poll" | "none" => Ok(Self::Off),
            other => Err(anyhow!("unknown broadcast mode {other:?}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub instance_id: String,
    pub store_dir: Option<PathBuf>,
    pub store_quota_bytes: usize,
    pub sources: Vec<SourceConfig>,
    pub demo_sensor_count: u32,
    pub demo_seed: u64,
    pub poll_interval_ms: u64,
    pub http_timeout_ms: u64,
    pub mqtt_stale_after_secs: u64,
    pub lease_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub takeover_poll_interval_ms: u64,
    pub follower_poll_interval_ms: u64,
    pub series_interval_secs: u64,
    pub series_retention_secs: u64,
    pub stats_window_secs: u64,
    pub max_history_points: usize,
    pub warning_threshold: f64,
    pub danger_threshold: f64,
    pub alert_cooldown_secs: u64,
    pub alert_webhook_url: Option<String>,
    pub alert_sound_command: Option<String>,
    pub mqtt_enabled: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub broadcast: BroadcastMode,
    pub http_bind: String,
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let instance_id = Uuid::new_v4().to_string();
        Self {
            mqtt_client_id: format!("smoke-telemetry-{instance_id}"),
            instance_id,
            store_dir: None,
            store_quota_bytes: DEFAULT_QUOTA_BYTES,
            sources: Vec::new(),
            demo_sensor_count: DEFAULT_DEMO_SENSOR_COUNT,
            demo_seed: DEFAULT_SEED,
            poll_interval_ms: 2_000,
            http_timeout_ms: 5_000,
            mqtt_stale_after_secs: 60,
            lease_timeout_ms: DEFAULT_LEASE_TIMEOUT.as_millis() as u64,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            takeover_poll_interval_ms: DEFAULT_TAKEOVER_POLL_INTERVAL.as_millis() as u64,
            follower_poll_interval_ms: 1_000,
            series_interval_secs: DEFAULT_UPDATE_INTERVAL.as_secs(),
            series_retention_secs: DEFAULT_RETENTION.as_secs(),
            stats_window_secs: DEFAULT_STATS_WINDOW.as_secs(),
            max_history_points: DEFAULT_MAX_HISTORY_POINTS,
            warning_threshold: Thresholds::default().warning,
            danger_threshold: Thresholds::default().danger,
            alert_cooldown_secs: 30,
            alert_webhook_url: None,
            alert_sound_command: None,
            mqtt_enabled: false,
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            mqtt_keepalive_secs: 30,
            broadcast: BroadcastMode::Local,
            http_bind: DEFAULT_HTTP_BIND.to_string(),
            otlp_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    sources: Option<Vec<SourceConfig>>,
    #[serde(default)]
    warning_threshold: Option<f64>,
    #[serde(default)]
    danger_threshold: Option<f64>,
    #[serde(default)]
    alert_webhook_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_topic_prefix: Option<String>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

/// Setup-file values apply only where the matching env var is unset.
fn apply_setup_overrides(
    config: &mut Config,
    overrides: SetupConfigOverrides,
    env_allows: impl Fn(&str) -> bool,
) {
    let trimmed = |value: Option<String>| {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    if let Some(sources) = overrides.sources {
        if config.sources.is_empty() {
            config.sources = sources;
        }
    }
    if env_allows("SMOKE_WARNING_THRESHOLD") {
        if let Some(value) = overrides.warning_threshold.filter(|v| v.is_finite()) {
            config.warning_threshold = value;
        }
    }
    if env_allows("SMOKE_DANGER_THRESHOLD") {
        if let Some(value) = overrides.danger_threshold.filter(|v| v.is_finite()) {
            config.danger_threshold = value;
        }
    }
    if env_allows("SMOKE_ALERT_WEBHOOK_URL") {
        if let Some(url) = trimmed(overrides.alert_webhook_url) {
            config.alert_webhook_url = Some(url);
        }
    }
    if env_allows("SMOKE_MQTT_HOST") {
        if let Some(host) = trimmed(overrides.mqtt_host) {
            config.mqtt_host = host;
        }
    }
    if env_allows("SMOKE_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_allows("SMOKE_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username {
            config.mqtt_username = trimmed(Some(username));
        }
    }
    if env_allows("SMOKE_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password {
            config.mqtt_password = trimmed(Some(password));
        }
    }
    if env_allows("SMOKE_MQTT_TOPIC_PREFIX") {
        if let Some(prefix) = trimmed(overrides.mqtt_topic_prefix) {
            config.mqtt_topic_prefix = prefix;
        }
    }
}

fn load_sources_file(path: &Path) -> Result<Vec<SourceConfig>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read sources file {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse sources file {}", path.display()))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_optional(key) {
        Some(value) => value
            .parse::<T>()
            .map_err(|err| anyhow!("invalid {key}: {err}")),
        None => Ok(default),
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_optional(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let defaults = Self::default();

        let instance_id = env_optional("SMOKE_INSTANCE_ID").unwrap_or(defaults.instance_id);
        let sources = match env_optional("SMOKE_SOURCES_PATH") {
            Some(path) => load_sources_file(Path::new(&path))?,
            None => Vec::new(),
        };

        let mut config = Self {
            mqtt_client_id: env_optional("SMOKE_MQTT_CLIENT_ID")
                .unwrap_or_else(|| format!("smoke-telemetry-{instance_id}")),
            instance_id,
            store_dir: env_optional("SMOKE_STORE_DIR").map(PathBuf::from),
            store_quota_bytes: env_parse("SMOKE_STORE_QUOTA_BYTES", defaults.store_quota_bytes)?,
            sources,
            demo_sensor_count: env_parse("SMOKE_DEMO_SENSOR_COUNT", defaults.demo_sensor_count)?,
            demo_seed: env_parse("SMOKE_DEMO_SEED", defaults.demo_seed)?,
            poll_interval_ms: env_parse("SMOKE_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            http_timeout_ms: env_parse("SMOKE_HTTP_TIMEOUT_MS", defaults.http_timeout_ms)?,
            mqtt_stale_after_secs: env_parse(
                "SMOKE_MQTT_STALE_AFTER_SECS",
                defaults.mqtt_stale_after_secs,
            )?,
            lease_timeout_ms: env_parse("SMOKE_LEASE_TIMEOUT_MS", defaults.lease_timeout_ms)?,
            heartbeat_interval_ms: env_parse(
                "SMOKE_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            )?,
            takeover_poll_interval_ms: env_parse(
                "SMOKE_TAKEOVER_POLL_INTERVAL_MS",
                defaults.takeover_poll_interval_ms,
            )?,
            follower_poll_interval_ms: env_parse(
                "SMOKE_FOLLOWER_POLL_INTERVAL_MS",
                defaults.follower_poll_interval_ms,
            )?,
            series_interval_secs: env_parse(
                "SMOKE_SERIES_INTERVAL_SECS",
                defaults.series_interval_secs,
            )?,
            series_retention_secs: env_parse(
                "SMOKE_SERIES_RETENTION_SECS",
                defaults.series_retention_secs,
            )?,
            stats_window_secs: env_parse("SMOKE_STATS_WINDOW_SECS", defaults.stats_window_secs)?,
            max_history_points: env_parse(
                "SMOKE_MAX_HISTORY_POINTS",
                defaults.max_history_points,
            )?,
            warning_threshold: env_parse("SMOKE_WARNING_THRESHOLD", defaults.warning_threshold)?,
            danger_threshold: env_parse("SMOKE_DANGER_THRESHOLD", defaults.danger_threshold)?,
            alert_cooldown_secs: env_parse(
                "SMOKE_ALERT_COOLDOWN_SECS",
                defaults.alert_cooldown_secs,
            )?,
            alert_webhook_url: env_optional("SMOKE_ALERT_WEBHOOK_URL"),
            alert_sound_command: env_optional("SMOKE_ALERT_SOUND_COMMAND"),
            mqtt_enabled: defaults.mqtt_enabled,
            mqtt_host: env_optional("SMOKE_MQTT_HOST").unwrap_or(defaults.mqtt_host),
            mqtt_port: env_parse("SMOKE_MQTT_PORT", defaults.mqtt_port)?,
            mqtt_username: env_optional("SMOKE_MQTT_USERNAME"),
            mqtt_password: env_optional("SMOKE_MQTT_PASSWORD"),
            mqtt_topic_prefix: env_optional("SMOKE_MQTT_TOPIC_PREFIX")
                .unwrap_or(defaults.mqtt_topic_prefix),
            mqtt_keepalive_secs: env_parse(
                "SMOKE_MQTT_KEEPALIVE_SECS",
                defaults.mqtt_keepalive_secs,
            )?,
            broadcast: defaults.broadcast,
            http_bind: env_optional("SMOKE_HTTP_BIND").unwrap_or(defaults.http_bind),
            otlp_endpoint: env_optional("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(path) = env_optional("SMOKE_SETUP_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                if let Some(overrides) = load_setup_config_overrides(&path) {
                    apply_setup_overrides(&mut config, overrides, |key| {
                        env_optional(key).is_none()
                    });
                }
            }
        }

        // MQTT defaults on when any source needs the broker.
        config.mqtt_enabled = env_bool("SMOKE_MQTT_ENABLED").unwrap_or_else(|| {
            config
                .sources
                .iter()
                .any(|source| source.enabled && matches!(source.kind, SourceKind::Mqtt { .. }))
        });
        config.broadcast = match env_optional("SMOKE_BROADCAST") {
            Some(value) => value.parse()?,
            None if config.mqtt_enabled => BroadcastMode::Mqtt,
            None => BroadcastMode::Local,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("SMOKE_POLL_INTERVAL_MS", self.poll_interval_ms),
            ("SMOKE_HTTP_TIMEOUT_MS", self.http_timeout_ms),
            ("SMOKE_LEASE_TIMEOUT_MS", self.lease_timeout_ms),
            ("SMOKE_HEARTBEAT_INTERVAL_MS", self.heartbeat_interval_ms),
            ("SMOKE_TAKEOVER_POLL_INTERVAL_MS", self.takeover_poll_interval_ms),
            ("SMOKE_FOLLOWER_POLL_INTERVAL_MS", self.follower_poll_interval_ms),
            ("SMOKE_SERIES_RETENTION_SECS", self.series_retention_secs),
            ("SMOKE_STATS_WINDOW_SECS", self.stats_window_secs),
        ];
        for (key, value) in nonzero {
            if value == 0 {
                bail!("{key} must be greater than zero");
            }
        }
        if self.max_history_points == 0 {
            bail!("SMOKE_MAX_HISTORY_POINTS must be greater than zero");
        }
        if self.heartbeat_interval_ms >= self.lease_timeout_ms {
            bail!(
                "heartbeat interval ({}ms) must be shorter than the lease timeout ({}ms)",
                self.heartbeat_interval_ms,
                self.lease_timeout_ms
            );
        }
        if !self.warning_threshold.is_finite() || !self.danger_threshold.is_finite() {
            bail!("alert thresholds must be finite");
        }
        if self.warning_threshold > self.danger_threshold {
            bail!(
                "warning threshold ({}) must not exceed danger threshold ({})",
                self.warning_threshold,
                self.danger_threshold
            );
        }
        if self.broadcast == BroadcastMode::Mqtt && !self.mqtt_enabled {
            bail!("SMOKE_BROADCAST=mqtt requires SMOKE_MQTT_ENABLED");
        }
        Ok(())
    }

    /// Enabled configured sources, or one simulated demo source when none are.
    pub fn active_sources(&self) -> Vec<SourceConfig> {
        let enabled: Vec<SourceConfig> = self
            .sources
            .iter()
            .filter(|source| source.enabled)
            .cloned()
            .collect();
        if enabled.is_empty() {
            return vec![SourceConfig::demo(self.demo_sensor_count, self.demo_seed)];
        }
        enabled
    }

    pub fn mqtt_source_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .active_sources()
            .iter()
            .filter_map(|source| source.mqtt_topic().map(str::to_string))
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    pub fn snapshot_topic(&self) -> String {
        format!("{}/snapshot", self.mqtt_topic_prefix.trim_end_matches('/'))
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            warning: self.warning_threshold,
            danger: self.danger_threshold,
        }
    }

    pub fn aggregation_policy(&self) -> AggregationPolicy {
        AggregationPolicy {
            update_interval: Duration::from_secs(self.series_interval_secs),
            retention: Duration::from_secs(self.series_retention_secs),
            stats_window: Duration::from_secs(self.stats_window_secs),
            max_history_points: self.max_history_points,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn mqtt_stale_after(&self) -> Duration {
        Duration::from_secs(self.mqtt_stale_after_secs)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn takeover_poll_interval(&self) -> Duration {
        Duration::from_millis(self.takeover_poll_interval_ms)
    }

    pub fn follower_poll_interval(&self) -> Duration {
        Duration::from_millis(self.follower_poll_interval_ms)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }
}
